//! Turns uploaded image bytes into the normalized input tensor the network was
//! trained on.

use crate::error::PredictError;
use image::{imageops::FilterType, RgbImage};
use tch::Tensor;

/// Side length of the square network input
pub const IMAGE_SIZE: u32 = 224;

/// ImageNet channel statistics used at training time
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode any supported image format and drop it to 8 bit RGB. Alpha is
/// discarded, grayscale and palette images are expanded.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Stretch `image` to `IMAGE_SIZE` x `IMAGE_SIZE` and normalize it into a
/// channel-major buffer of `3 * IMAGE_SIZE * IMAGE_SIZE` floats
pub fn normalize(image: &RgbImage) -> Vec<f32> {
    let resized = image::imageops::resize(image, IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle);
    let plane = (IMAGE_SIZE * IMAGE_SIZE) as usize;

    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in resized.enumerate_pixels() {
        let offset = (y * IMAGE_SIZE + x) as usize;
        for c in 0..3 {
            let value = f32::from(pixel[c]) / 255.0;
            data[c * plane + offset] = (value - MEAN[c]) / STD[c];
        }
    }
    data
}

/// Decode, resize and normalize an image into a `[1, 3, 224, 224]` tensor
pub fn preprocess(bytes: &[u8]) -> Result<Tensor, PredictError> {
    let image = decode_rgb(bytes)?;
    let size = i64::from(IMAGE_SIZE);
    Ok(Tensor::from_slice(&normalize(&image)).view([1, 3, size, size]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test;
    use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};

    fn bounds() -> (f32, f32) {
        let lo = (0..3)
            .map(|c| (0.0 - MEAN[c]) / STD[c])
            .fold(f32::INFINITY, f32::min);
        let hi = (0..3)
            .map(|c| (1.0 - MEAN[c]) / STD[c])
            .fold(f32::NEG_INFINITY, f32::max);
        (lo, hi)
    }

    #[test]
    fn test_shape_for_any_resolution() {
        for (w, h) in [(1, 1), (17, 300), (224, 224), (640, 480)] {
            let tensor = preprocess(&test::png_bytes(w, h)).unwrap();
            assert_eq!(tensor.size(), vec![1, 3, 224, 224]);
        }
    }

    #[test]
    fn test_values_within_normalized_range() {
        let (lo, hi) = bounds();
        let data = normalize(&decode_rgb(&test::png_bytes(97, 53)).unwrap());
        assert_eq!(data.len(), 3 * 224 * 224);
        assert!(data.iter().all(|v| *v >= lo - 1e-5 && *v <= hi + 1e-5));
    }

    #[test]
    fn test_channel_normalization() {
        let white = RgbImage::from_pixel(8, 8, image::Rgb([255, 255, 255]));
        let data = normalize(&white);
        let plane = 224 * 224;
        for c in 0..3 {
            let expected = (1.0 - MEAN[c]) / STD[c];
            assert!((data[c * plane] - expected).abs() < 1e-5);
            assert!((data[c * plane + plane - 1] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_channel_major_layout() {
        // pure red: only the first plane is at its maximum
        let red = RgbImage::from_pixel(4, 4, image::Rgb([255, 0, 0]));
        let data = normalize(&red);
        let plane = 224 * 224;
        assert!((data[0] - (1.0 - MEAN[0]) / STD[0]).abs() < 1e-5);
        assert!((data[plane] - (0.0 - MEAN[1]) / STD[1]).abs() < 1e-5);
        assert!((data[2 * plane] - (0.0 - MEAN[2]) / STD[2]).abs() < 1e-5);
    }

    #[test]
    fn test_grayscale_and_alpha_become_rgb() {
        let gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(5, 5, Luma([128])));
        let rgb = decode_rgb(&test::encode_png(&gray)).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [128, 128, 128]);

        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(5, 5, Rgba([10, 20, 30, 0])));
        let rgb = decode_rgb(&test::encode_png(&rgba)).unwrap();
        assert_eq!(rgb.get_pixel(4, 4).0, [10, 20, 30]);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = preprocess(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PredictError::Decode(_)));
    }

    #[test]
    fn test_deterministic() {
        let bytes = test::png_bytes(300, 200);
        let a = normalize(&decode_rgb(&bytes).unwrap());
        let b = normalize(&decode_rgb(&bytes).unwrap());
        assert_eq!(a, b);
    }
}
