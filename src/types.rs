//! Core types for background removal operations

use crate::{
    config::OutputFormat,
    error::{BgRemovalError, Result},
    services::format::OutputFormatHandler,
};
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Result of a background removal operation
#[derive(Debug, Clone)]
pub struct RemovalResult {
    /// Original pixels with the mask as alpha, always the original size
    pub composite: RgbaImage,

    /// Mask used for the composite, kept only when the caller asked for it
    pub mask: Option<SegmentationMask>,

    /// Processing metadata
    pub timings: ProcessingTimings,
}

impl RemovalResult {
    /// Width and height of the composite
    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.composite.dimensions()
    }

    /// Encode the composite in `format` (JPEG is flattened onto white)
    pub fn encode(&self, format: OutputFormat) -> Result<Vec<u8>> {
        OutputFormatHandler::encode(&self.composite, format)
    }

    /// Encode the mask as a grayscale PNG
    ///
    /// # Errors
    /// No mask was kept, or PNG encoding failed.
    pub fn encode_mask(&self) -> Result<Vec<u8>> {
        let mask = self
            .mask
            .as_ref()
            .ok_or_else(|| BgRemovalError::processing("Result carries no mask"))?;
        mask.to_png_bytes()
    }

    /// Encode and write the composite to `path`
    pub fn save<P: AsRef<Path>>(&self, path: P, format: OutputFormat) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.encode(format)?;
        std::fs::write(path, bytes)
            .map_err(|e| BgRemovalError::file_io_error("write result", path, &e))
    }
}

/// Single-channel 8-bit mask, same size as the original image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMask {
    /// Row-major intensities, 255 = foreground
    pub data: Vec<u8>,

    /// Mask dimensions (width, height)
    pub dimensions: (u32, u32),
}

impl SegmentationMask {
    /// Create a new segmentation mask
    #[must_use]
    pub fn new(data: Vec<u8>, dimensions: (u32, u32)) -> Self {
        Self { data, dimensions }
    }

    /// Create mask from a grayscale image
    #[must_use]
    pub fn from_image(image: GrayImage) -> Self {
        let dimensions = image.dimensions();
        Self::new(image.into_raw(), dimensions)
    }

    /// Check that `data` holds exactly one byte per pixel
    ///
    /// # Errors
    /// `Processing` when the buffer is shorter or longer than `width * height`.
    pub fn validate(&self) -> Result<()> {
        let (width, height) = self.dimensions;
        let expected = width as usize * height as usize;
        if self.data.len() == expected {
            Ok(())
        } else {
            Err(BgRemovalError::processing(format!(
                "Mask holds {} bytes, {width}x{height} needs {expected}",
                self.data.len()
            )))
        }
    }

    /// Convert mask to a grayscale image
    pub fn to_image(&self) -> Result<GrayImage> {
        self.validate()?;
        let (width, height) = self.dimensions;
        GrayImage::from_raw(width, height, self.data.clone())
            .ok_or_else(|| BgRemovalError::processing("Mask data does not match its dimensions"))
    }

    /// Encode as grayscale PNG
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        OutputFormatHandler::encode_mask(&self.to_image()?)
    }

    /// Get mask statistics
    #[must_use]
    pub fn statistics(&self) -> MaskStatistics {
        let total_pixels = self.data.len();
        let foreground_pixels = self.data.iter().filter(|&&x| x > 127).count();
        let foreground_ratio = if total_pixels == 0 {
            0.0
        } else {
            foreground_pixels as f32 / total_pixels as f32
        };

        MaskStatistics {
            total_pixels,
            foreground_pixels,
            background_pixels: total_pixels - foreground_pixels,
            foreground_ratio,
        }
    }
}

/// Statistics about a segmentation mask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub foreground_pixels: usize,
    pub background_pixels: usize,
    pub foreground_ratio: f32,
}

/// Timing breakdown for one removal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingTimings {
    /// Resize and normalization
    pub preprocessing_ms: u64,

    /// Waiting for an inference slot plus the model run
    pub inference_ms: u64,

    /// Sigmoid, resize and alpha compositing
    pub postprocessing_ms: u64,

    /// End-to-end time inside the service
    pub total_ms: u64,
}

impl ProcessingTimings {
    /// Share of the total spent in the model
    #[must_use]
    pub fn inference_ratio(&self) -> f64 {
        if self.total_ms == 0 {
            0.0
        } else {
            self.inference_ms as f64 / self.total_ms as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_mask_image_conversion() {
        let img = GrayImage::from_fn(4, 3, |x, _| Luma([if x < 2 { 0 } else { 255 }]));
        let mask = SegmentationMask::from_image(img.clone());
        assert_eq!(mask.dimensions, (4, 3));
        assert_eq!(mask.to_image().unwrap(), img);

        let stats = mask.statistics();
        assert_eq!(stats.total_pixels, 12);
        assert_eq!(stats.foreground_pixels, 6);
        assert!((stats.foreground_ratio - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_mask_with_wrong_length_rejected() {
        let long = SegmentationMask::new(vec![0; 5], (2, 2));
        assert!(matches!(long.to_image(), Err(BgRemovalError::Processing(_))));

        let short = SegmentationMask::new(vec![0; 3], (2, 2));
        assert!(short.validate().is_err());
        assert!(short.to_png_bytes().is_err());

        assert!(SegmentationMask::new(vec![0; 4], (2, 2)).validate().is_ok());
    }

    #[test]
    fn test_encode_mask_requires_mask() {
        let result = RemovalResult {
            composite: RgbaImage::new(2, 2),
            mask: None,
            timings: ProcessingTimings::default(),
        };
        assert!(result.encode_mask().is_err());
        assert_eq!(result.dimensions(), (2, 2));
    }

    #[test]
    fn test_inference_ratio() {
        let timings = ProcessingTimings {
            inference_ms: 30,
            total_ms: 120,
            ..ProcessingTimings::default()
        };
        assert!((timings.inference_ratio() - 0.25).abs() < f64::EPSILON);
        assert_eq!(ProcessingTimings::default().inference_ratio(), 0.0);
    }
}
