//! Image ↔ tensor conversion for the generation pipeline.
//!
//! Tensors are NHWC `[batch, height, width, channels]` f32 arrays, the
//! layout the converted graph consumes. Pixels are normalized to `[0, 1]`
//! on the way in; the generator produces values centered on `[-1, 1]`,
//! remapped back before encoding.

use anyhow::{bail, Result};
use image::RgbImage;
use ndarray::Array4;

/// Decode an 8-bit RGB image into a normalized `[1, h, w, 3]` tensor.
pub fn image_to_tensor(img: &RgbImage) -> Array4<f32> {
    let (width, height) = img.dimensions();
    let mut tensor = Array4::zeros((1, height as usize, width as usize, 3));
    for (x, y, pixel) in img.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    tensor
}

/// Render a `[1, h, w, 3]` tensor of `[0, 1]` values back into an RGB image.
///
/// Values outside `[0, 1]` are clamped rather than wrapped.
pub fn tensor_to_image(tensor: &Array4<f32>) -> Result<RgbImage> {
    let shape = tensor.shape();
    let (batch, height, width, channels) = (shape[0], shape[1], shape[2], shape[3]);
    if batch != 1 || channels != 3 {
        bail!("expected a [1, h, w, 3] tensor, got {shape:?}");
    }

    let img = RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let mut pixel = [0u8; 3];
        for (c, value) in pixel.iter_mut().enumerate() {
            let v = tensor[[0, y as usize, x as usize, c]].clamp(0.0, 1.0);
            *value = (v * 255.0).round() as u8;
        }
        image::Rgb(pixel)
    });

    Ok(img)
}

/// Remap generator output from `[-1, 1]` to `[0, 1]`.
pub fn remap_generator_output(mut tensor: Array4<f32>) -> Array4<f32> {
    tensor.mapv_inplace(|v| (v + 1.0) / 2.0);
    tensor
}

/// Dimensions after scaling so the larger side equals `target_long_side`,
/// preserving aspect ratio. Both results are rounded and kept at least 1.
pub fn scaled_size(width: u32, height: u32, target_long_side: u32) -> (u32, u32) {
    let factor = u32::max(width, height) as f64 / target_long_side as f64;
    let scaled_w = ((width as f64 / factor).round() as u32).max(1);
    let scaled_h = ((height as f64 / factor).round() as u32).max(1);
    (scaled_w, scaled_h)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x * 17 % 256) as u8, (y * 31 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn image_to_tensor_is_nhwc_and_normalized() {
        let mut img = RgbImage::new(2, 3);
        img.put_pixel(1, 2, image::Rgb([255, 128, 0]));

        let tensor = image_to_tensor(&img);
        assert_eq!(tensor.shape(), &[1, 3, 2, 3]);
        assert_eq!(tensor[[0, 2, 1, 0]], 1.0);
        assert!((tensor[[0, 2, 1, 1]] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 2, 1, 2]], 0.0);
    }

    #[test]
    fn tensor_image_roundtrip_preserves_pixels() {
        let img = gradient_image(5, 4);
        let restored = tensor_to_image(&image_to_tensor(&img)).expect("valid tensor");
        assert_eq!(restored, img);
    }

    #[test]
    fn tensor_to_image_rejects_bad_shapes() {
        let batched = Array4::<f32>::zeros((2, 4, 4, 3));
        let err = tensor_to_image(&batched).err().expect("should fail");
        assert!(err.to_string().contains("[1, h, w, 3]"));

        let single_channel = Array4::<f32>::zeros((1, 4, 4, 1));
        assert!(tensor_to_image(&single_channel).is_err());
    }

    #[test]
    fn tensor_to_image_clamps_out_of_range_values() {
        let mut tensor = Array4::<f32>::zeros((1, 1, 2, 3));
        tensor[[0, 0, 0, 0]] = -0.5;
        tensor[[0, 0, 1, 0]] = 1.5;

        let img = tensor_to_image(&tensor).expect("valid tensor");
        assert_eq!(img.get_pixel(0, 0)[0], 0);
        assert_eq!(img.get_pixel(1, 0)[0], 255);
    }

    #[test]
    fn remap_centers_generator_range_on_unit_interval() {
        let mut tensor = Array4::<f32>::zeros((1, 1, 3, 3));
        tensor[[0, 0, 0, 0]] = -1.0;
        tensor[[0, 0, 1, 0]] = 0.0;
        tensor[[0, 0, 2, 0]] = 1.0;

        let remapped = remap_generator_output(tensor);
        assert_eq!(remapped[[0, 0, 0, 0]], 0.0);
        assert_eq!(remapped[[0, 0, 1, 0]], 0.5);
        assert_eq!(remapped[[0, 0, 2, 0]], 1.0);
    }

    #[test]
    fn scaled_size_targets_the_long_side() {
        assert_eq!(scaled_size(200, 100, 100), (100, 50));
        assert_eq!(scaled_size(100, 200, 100), (50, 100));
        assert_eq!(scaled_size(500, 500, 250), (250, 250));
    }

    #[test]
    fn scaled_size_rounds_and_keeps_dimensions_positive() {
        // 3:1000 aspect ratio: the short side rounds but never reaches zero.
        assert_eq!(scaled_size(1000, 3, 100), (100, 1));
        // Upscaling works the same way.
        assert_eq!(scaled_size(50, 25, 100), (100, 50));
    }
}
