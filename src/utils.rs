use crate::error::{Result, TrainError};
use burn::prelude::*;
use image::{GenericImage, Rgb, RgbImage};
use std::path::Path;

/// Map [-1, 1] normalized values back to [0, 1].
pub fn scale_back(value: f32) -> f32 {
    (value + 1.0) * 0.5
}

/// Convert a BCHW tensor in [-1, 1] to a vector of RGB images.
pub fn tensor_to_images<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<RgbImage>> {
    let [batch, channels, height, width] = tensor.dims();
    if channels != 3 {
        return Err(TrainError::Tensor(format!(
            "expected 3 channels for images, got {channels}"
        )));
    }

    let values = tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|err| TrainError::Tensor(format!("failed to read tensor data as f32: {err:?}")))?;
    let hw = height * width;
    let mut images = Vec::with_capacity(batch);

    for b in 0..batch {
        let base = b * channels * hw;
        let mut img = RgbImage::new(width as u32, height as u32);
        for (x, y, pixel) in img.enumerate_pixels_mut() {
            let idx = y as usize * width + x as usize;
            let channel = |c: usize| (scale_back(values[base + c * hw + idx]).clamp(0.0, 1.0) * 255.0) as u8;
            *pixel = Rgb([channel(0), channel(1), channel(2)]);
        }
        images.push(img);
    }

    Ok(images)
}

/// Concatenate images horizontally.
pub fn concat_images_horiz(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(TrainError::Tensor("no images to concatenate".to_string()));
    }
    let height = images[0].height();
    let total_width: u32 = images.iter().map(|img| img.width()).sum();
    let mut out = RgbImage::new(total_width, height);

    let mut offset_x = 0;
    for img in images {
        out.copy_from(img, offset_x, 0)?;
        offset_x += img.width();
    }

    Ok(out)
}

/// Stack images vertically.
pub fn stack_images_vert(images: &[RgbImage]) -> Result<RgbImage> {
    if images.is_empty() {
        return Err(TrainError::Tensor("no images to stack".to_string()));
    }
    let width = images[0].width();
    let total_height: u32 = images.iter().map(|img| img.height()).sum();
    let mut out = RgbImage::new(width, total_height);

    let mut offset_y = 0;
    for img in images {
        out.copy_from(img, 0, offset_y)?;
        offset_y += img.height();
    }

    Ok(out)
}

/// Save an image, creating the parent directory first. The format follows the extension.
pub fn save_image(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    image.save(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn converts_normalized_tensor_to_pixels() {
        let device = Default::default();
        let tensor = Tensor::<TestBackend, 4>::ones([2, 3, 2, 3], &device).neg();

        let images = tensor_to_images(tensor).unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(images[0].dimensions(), (3, 2));
        assert_eq!(images[0].get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn layouts_grow_along_their_axis() {
        let a = RgbImage::new(2, 3);
        let b = RgbImage::new(2, 3);

        assert_eq!(concat_images_horiz(&[a.clone(), b.clone()]).unwrap().dimensions(), (4, 3));
        assert_eq!(stack_images_vert(&[a, b]).unwrap().dimensions(), (2, 6));
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let tensor = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 2], &Default::default());
        assert!(tensor_to_images(tensor).is_err());
    }
}
