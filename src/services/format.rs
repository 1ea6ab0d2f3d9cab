//! Output format handling service
//!
//! Encoding of composites and masks, kept apart from the removal pipeline so
//! both the HTTP layer and the job queue share one set of rules.

use crate::{
    config::OutputFormat,
    error::{BgRemovalError, Result},
};
use base64::Engine as _;
use image::{codecs::jpeg::JpegEncoder, GrayImage, ImageFormat, Rgb, RgbImage, RgbaImage};
use std::io::Cursor;

/// JPEG quality used for flattened composites
pub const JPEG_QUALITY: u8 = 95;

/// Service for handling output format conversions
pub struct OutputFormatHandler;

impl OutputFormatHandler {
    /// Encode an RGBA composite
    ///
    /// PNG keeps the alpha channel. JPEG has none, so the composite is
    /// blended onto opaque white first.
    ///
    /// # Errors
    /// Encoder failures.
    pub fn encode(rgba_image: &RgbaImage, format: OutputFormat) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        match format {
            OutputFormat::Png => rgba_image.write_to(&mut out, ImageFormat::Png)?,
            OutputFormat::Jpeg => {
                let flattened = Self::flatten_on_white(rgba_image);
                JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY).encode_image(&flattened)?;
            },
        }
        Ok(out.into_inner())
    }

    /// Encode a mask as single-channel PNG
    ///
    /// # Errors
    /// Encoder failures.
    pub fn encode_mask(mask: &GrayImage) -> Result<Vec<u8>> {
        let mut out = Cursor::new(Vec::new());
        mask.write_to(&mut out, ImageFormat::Png)?;
        Ok(out.into_inner())
    }

    /// Alpha-blend onto white, dropping the alpha channel
    #[must_use]
    pub fn flatten_on_white(rgba_image: &RgbaImage) -> RgbImage {
        let (width, height) = rgba_image.dimensions();
        let mut rgb_image = RgbImage::new(width, height);
        for (src, dst) in rgba_image.pixels().zip(rgb_image.pixels_mut()) {
            let alpha = u32::from(src[3]);
            let blend = |c: u8| ((u32::from(c) * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
            *dst = Rgb([blend(src[0]), blend(src[1]), blend(src[2])]);
        }
        rgb_image
    }

    /// File extension for a format (without the dot)
    #[must_use]
    pub fn get_extension(format: OutputFormat) -> &'static str {
        match format {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
        }
    }

    /// Content type for binary responses
    #[must_use]
    pub fn mime_type(format: OutputFormat) -> &'static str {
        match format {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
        }
    }

    /// Check if a format supports transparency (alpha channel)
    #[must_use]
    pub fn supports_transparency(format: OutputFormat) -> bool {
        match format {
            OutputFormat::Png => true,
            OutputFormat::Jpeg => false,
        }
    }
}

/// Standard base64 text for binary payloads
#[must_use]
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a base64 payload, accepting a `data:<mime>;base64,` prefix
///
/// # Errors
/// `Decode` when the payload is empty or not valid base64.
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>> {
    let data = match payload.split_once(',') {
        Some((_, data)) => data,
        None => payload,
    };
    let data = data.trim();
    if data.is_empty() {
        return Err(BgRemovalError::decode("Empty base64 payload"));
    }
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| BgRemovalError::decode(format!("Invalid base64 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn test_flatten_on_white() {
        let mut img = RgbaImage::new(3, 1);
        img.put_pixel(0, 0, Rgba([10, 20, 30, 255]));
        img.put_pixel(1, 0, Rgba([10, 20, 30, 0]));
        img.put_pixel(2, 0, Rgba([0, 0, 0, 128]));

        let flat = OutputFormatHandler::flatten_on_white(&img);
        assert_eq!(flat.get_pixel(0, 0), &Rgb([10, 20, 30]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([255, 255, 255]));
        assert_eq!(flat.get_pixel(2, 0), &Rgb([127, 127, 127]));
    }

    #[test]
    fn test_png_keeps_alpha() {
        let img = RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 40]));
        let bytes = OutputFormatHandler::encode(&img, OutputFormat::Png).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgba8();
        assert_eq!(decoded.get_pixel(2, 2)[3], 40);
    }

    #[test]
    fn test_jpeg_is_opaque_rgb() {
        let img = RgbaImage::from_pixel(8, 8, Rgba([0, 0, 0, 0]));
        let bytes = OutputFormatHandler::encode(&img, OutputFormat::Jpeg).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&bytes).unwrap().to_rgb8();
        assert!(decoded.get_pixel(4, 4)[0] > 245);
    }

    #[test]
    fn test_extension_and_mime() {
        assert_eq!(OutputFormatHandler::get_extension(OutputFormat::Jpeg), "jpg");
        assert_eq!(OutputFormatHandler::mime_type(OutputFormat::Png), "image/png");
        assert!(!OutputFormatHandler::supports_transparency(OutputFormat::Jpeg));
    }

    #[test]
    fn test_base64_data_url_prefix_stripped() {
        let encoded = encode_base64(b"hello");
        assert_eq!(decode_base64_payload(&encoded).unwrap(), b"hello");
        let with_prefix = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_base64_payload(&with_prefix).unwrap(), b"hello");
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        assert!(matches!(
            decode_base64_payload("not base64!!"),
            Err(BgRemovalError::Decode(_))
        ));
        assert!(matches!(
            decode_base64_payload("data:image/png;base64,"),
            Err(BgRemovalError::Decode(_))
        ));
    }
}
