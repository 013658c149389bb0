use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("dataset directory {0} does not exist")]
    MissingDirectory(PathBuf),
    #[error("no readable images found under {0}")]
    Empty(PathBuf),
    #[error("failed to walk {path}: {message}")]
    Walk { path: PathBuf, message: String },
    #[error("failed to write image {path}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
}
