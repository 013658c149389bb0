use burn::{prelude::Backend, tensor::Tensor};
use image::{DynamicImage, RgbImage, imageops::FilterType};

/// Crop, resize and normalize to `[-1, 1]` in CHW order.
#[must_use]
pub fn image_to_chw(img: &DynamicImage, resolution: usize, center_crop: bool) -> Vec<f32> {
    let img = if center_crop {
        let (w, h) = (img.width(), img.height());
        let side = w.min(h);
        img.crop_imm((w - side) / 2, (h - side) / 2, side, side)
    } else {
        img.clone()
    };
    let size = resolution as u32;
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();

    let plane = resolution * resolution;
    let mut out = vec![0.0; 3 * plane];
    for (i, pixel) in rgb.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = f32::from(pixel[c]) / 127.5 - 1.0;
        }
    }
    out
}

/// Convert a `[n, 3, h, w]` tensor in `[-1, 1]` to RGB images.
pub fn tensor_to_images<B: Backend>(images: Tensor<B, 4>) -> Vec<RgbImage> {
    let [n, channels, h, w] = images.dims();
    let values: Vec<f32> = images
        .clamp(-1.0, 1.0)
        .add_scalar(1.0)
        .mul_scalar(127.5)
        .into_data()
        .convert::<f32>()
        .to_vec()
        .unwrap_or_default();
    if values.len() != n * channels * h * w {
        return Vec::new();
    }

    let plane = h * w;
    (0..n)
        .map(|k| {
            let base = k * channels * plane;
            RgbImage::from_fn(w as u32, h as u32, |x, y| {
                let i = y as usize * w + x as usize;
                let px = |c: usize| values[base + c.min(channels - 1) * plane + i].round() as u8;
                image::Rgb([px(0), px(1), px(2)])
            })
        })
        .collect()
}
