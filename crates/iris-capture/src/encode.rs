use image::{
    codecs::jpeg::JpegEncoder, imageops::FilterType, ColorType, DynamicImage, ImageBuffer, Rgba,
};
use iris_types::{frame::RawImage, Result};

use crate::capture_error;

/// Encodes RGBA pixels as JPEG, downscaling so the longest edge fits `max_edge`.
///
/// Returns the payload and the encoded dimensions.
pub fn encode_jpeg(raw: RawImage, quality: u8, max_edge: u32) -> Result<(Vec<u8>, u32, u32)> {
    let (width, height) = (raw.width, raw.height);
    let Some(buffer) = ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, raw.data) else {
        return Err(capture_error(format!(
            "pixel buffer does not match {width}x{height}"
        )));
    };

    let mut image = DynamicImage::ImageRgba8(buffer);
    if width.max(height) > max_edge {
        image = image.resize(max_edge, max_edge, FilterType::Triangle);
    }
    let rgb = image.to_rgb8();

    let mut payload = Vec::new();
    JpegEncoder::new_with_quality(&mut payload, quality.clamp(1, 100))
        .encode(rgb.as_raw(), rgb.width(), rgb.height(), ColorType::Rgb8)
        .map_err(|err| capture_error(format!("jpeg encode failed: {err}")))?;
    Ok((payload, rgb.width(), rgb.height()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatched_buffer_is_a_capture_error() {
        let raw = RawImage::from_rgba(4, 4, vec![0; 10]);
        let err = encode_jpeg(raw, 80, 640).unwrap_err();
        assert!(matches!(err, iris_types::IrisError::Capture(_)));
    }

    #[test]
    fn lower_quality_yields_smaller_payload() {
        let pixels: Vec<u8> = (0..64 * 64)
            .flat_map(|i| {
                let v = ((i * 37) % 251) as u8;
                [v, v.wrapping_mul(3), v.wrapping_add(91), 255]
            })
            .collect();
        let (high, _, _) = encode_jpeg(RawImage::from_rgba(64, 64, pixels.clone()), 95, 640).unwrap();
        let (low, w, h) = encode_jpeg(RawImage::from_rgba(64, 64, pixels), 10, 640).unwrap();
        assert_eq!((w, h), (64, 64));
        assert!(low.len() < high.len());
    }
}
