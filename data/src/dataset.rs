use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use burn::data::dataset::Dataset;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{DataError, image_to_chw};

const EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "webp"];

#[derive(Clone, Debug)]
pub struct ImageItem {
    /// `[3, resolution, resolution]` in `[-1, 1]`, flattened.
    pub pixels: Vec<f32>,
    /// First sub-directory below the dataset root; `None` for root-level images.
    pub class: Option<String>,
}

#[derive(Clone, Debug)]
struct Entry {
    path: PathBuf,
    class: Option<String>,
}

/// Images discovered under a root directory.
#[derive(Clone, Debug)]
pub struct ImageFolderDataset {
    entries: Vec<Entry>,
    resolution: usize,
    center_crop: bool,
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

impl ImageFolderDataset {
    /// Walk `root` in sorted order; files that fail to decode are skipped, so
    /// every index below `len()` yields an item.
    pub fn new(root: &Path, resolution: usize, center_crop: bool) -> Result<Self, DataError> {
        if !root.is_dir() {
            return Err(DataError::MissingDirectory(root.to_path_buf()));
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| DataError::Walk {
                path: root.to_path_buf(),
                message: e.to_string(),
            })?;
            let path = entry.path();
            if !entry.file_type().is_file() || !is_image(path) {
                continue;
            }
            if let Err(e) = image::open(path) {
                warn!("Skipping unreadable image {}: {e}", path.display());
                continue;
            }

            let rel = path.strip_prefix(root).unwrap_or(path);
            let class = (rel.components().count() > 1)
                .then(|| rel.components().next())
                .flatten()
                .map(|c| c.as_os_str().to_string_lossy().into_owned());
            entries.push(Entry {
                path: path.to_path_buf(),
                class,
            });
        }

        if entries.is_empty() {
            return Err(DataError::Empty(root.to_path_buf()));
        }

        let dataset = Self {
            entries,
            resolution,
            center_crop,
        };
        info!(
            "Found {} images in {} ({} classes)",
            dataset.entries.len(),
            root.display(),
            dataset.class_names().len()
        );
        Ok(dataset)
    }

    /// Sorted distinct class names.
    #[must_use]
    pub fn class_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| e.class.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    #[must_use]
    pub fn resolution(&self) -> usize {
        self.resolution
    }
}

impl Dataset<ImageItem> for ImageFolderDataset {
    fn get(&self, index: usize) -> Option<ImageItem> {
        let entry = self.entries.get(index)?;
        debug!("Decoding {}", entry.path.display());
        match image::open(&entry.path) {
            Ok(img) => Some(ImageItem {
                pixels: image_to_chw(&img, self.resolution, self.center_crop),
                class: entry.class.clone(),
            }),
            Err(e) => {
                error!("Failed to decode {}: {e}", entry.path.display());
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    fn write_png(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(6, 6, Rgb([10, 20, 30])).save(path).unwrap();
    }

    #[test]
    fn test_discovery_and_classes() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("cat/a.png"));
        write_png(&dir.path().join("cat/nested/b.png"));
        write_png(&dir.path().join("dog/c.png"));
        write_png(&dir.path().join("root.png"));
        std::fs::write(dir.path().join("notes.txt"), "not an image").unwrap();
        std::fs::write(dir.path().join("dog/broken.png"), "garbage").unwrap();

        let dataset = ImageFolderDataset::new(dir.path(), 4, true).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.class_names(), vec!["cat", "dog"]);

        let classes: Vec<_> = (0..dataset.len())
            .map(|i| dataset.get(i).unwrap().class)
            .collect();
        assert_eq!(
            classes,
            vec![
                Some("cat".to_string()),
                Some("cat".to_string()),
                Some("dog".to_string()),
                None
            ]
        );
        assert_eq!(dataset.get(0).unwrap().pixels.len(), 3 * 4 * 4);
    }

    #[test]
    fn test_truncated_image_skipped_at_discovery() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("cat/a.png"));
        write_png(&dir.path().join("cat/b.png"));
        // Signature and IHDR survive, pixel data does not.
        let bytes = std::fs::read(dir.path().join("cat/b.png")).unwrap();
        std::fs::write(dir.path().join("cat/b.png"), &bytes[..40]).unwrap();
        assert!(image::image_dimensions(dir.path().join("cat/b.png")).is_ok());

        let dataset = ImageFolderDataset::new(dir.path(), 4, false).unwrap();
        assert_eq!(dataset.len(), 1);
        assert!((0..dataset.len()).all(|i| dataset.get(i).is_some()));
    }

    #[test]
    fn test_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageFolderDataset::new(&dir.path().join("nope"), 4, true),
            Err(DataError::MissingDirectory(_))
        ));
        assert!(matches!(
            ImageFolderDataset::new(dir.path(), 4, true),
            Err(DataError::Empty(_))
        ));
    }
}
