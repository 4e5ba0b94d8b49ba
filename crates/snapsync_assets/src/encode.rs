//! Deterministic downscale-then-encode for photo payloads.

use crate::error::AssetResult;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageOutputFormat};
use std::io::Cursor;

/// Linear scale applied to both dimensions before encoding.
pub const PHOTO_SCALE: f64 = 0.5;

/// Dimensions after the fixed downscale. Never zero.
pub fn scaled_dimensions(width: u32, height: u32) -> (u32, u32) {
    let scale = |v: u32| ((f64::from(v) * PHOTO_SCALE).floor() as u32).max(1);
    (scale(width), scale(height))
}

/// Downscales `image` by [`PHOTO_SCALE`] with a linear filter and encodes
/// the result as PNG.
///
/// The same input always yields the same bytes.
///
/// # Errors
///
/// Returns an error if PNG encoding fails.
pub fn encode_photo(image: &DynamicImage) -> AssetResult<Vec<u8>> {
    let (width, height) = image.dimensions();
    let (target_w, target_h) = scaled_dimensions(width, height);
    let scaled = DynamicImage::ImageRgba8(imageops::resize(
        image,
        target_w,
        target_h,
        FilterType::Triangle,
    ));

    let mut png = Vec::new();
    scaled.write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)?;
    tracing::debug!(
        from = ?(width, height),
        to = ?(target_w, target_h),
        bytes = png.len(),
        "encoded photo"
    );
    Ok(png)
}

/// Decodes an image in any supported format, then [`encode_photo`]s it.
///
/// # Errors
///
/// Returns an error if `bytes` is not a supported image.
pub fn encode_photo_bytes(bytes: &[u8]) -> AssetResult<Vec<u8>> {
    encode_photo(&decode_asset(bytes)?)
}

/// Decodes a stored asset.
///
/// # Errors
///
/// Returns an error if `bytes` is not a supported image.
pub fn decode_asset(bytes: &[u8]) -> AssetResult<DynamicImage> {
    Ok(image::load_from_memory(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgba([255, 255, 255, 255])
            } else {
                Rgba([0, 0, 0, 255])
            }
        }))
    }

    #[test]
    fn halves_dimensions() {
        assert_eq!(scaled_dimensions(640, 480), (320, 240));
        assert_eq!(scaled_dimensions(5, 3), (2, 1));
        assert_eq!(scaled_dimensions(1, 1), (1, 1));
    }

    #[test]
    fn encoded_photo_is_half_size_png() {
        let png = encode_photo(&checkerboard(8, 6)).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(decode_asset(&png).unwrap().dimensions(), (4, 3));
    }

    #[test]
    fn encoding_is_deterministic() {
        let image = checkerboard(9, 7);
        assert_eq!(encode_photo(&image).unwrap(), encode_photo(&image).unwrap());
    }

    #[test]
    fn encodes_from_bytes() {
        let mut source = Vec::new();
        checkerboard(10, 10)
            .write_to(&mut Cursor::new(&mut source), ImageOutputFormat::Png)
            .unwrap();
        let png = encode_photo_bytes(&source).unwrap();
        assert_eq!(decode_asset(&png).unwrap().dimensions(), (5, 5));
    }

    #[test]
    fn rejects_garbage() {
        assert!(decode_asset(b"not an image").is_err());
        assert!(encode_photo_bytes(&[]).is_err());
    }
}
