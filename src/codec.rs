//! Image pre- and post-processing around the segmentation model
//!
//! Every operation returns a new buffer; inputs are never modified.
//!
//! - [`ImageCodec::preprocess`] stretches the image to the model resolution
//!   (no letterboxing) and normalizes it into an NCHW tensor.
//! - [`ImageCodec::postprocess_mask`] squashes the model's score map with a
//!   sigmoid and resizes it back to the original size with a bilinear filter.
//! - [`ImageCodec::composite`] uses the mask as the alpha channel.
//!
//! The codec never chooses between model outputs: it receives the single
//! authoritative map selected by [`ModelHandle::segment`](crate::provider::ModelHandle::segment).

use crate::{
    error::{BgRemovalError, Result},
    models::PreprocessingConfig,
    types::SegmentationMask,
};
use image::{imageops::FilterType, DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::{Array4, ArrayView2, Axis};

/// Filter used for every resize in the pipeline
const RESIZE_FILTER: FilterType = FilterType::Triangle;

/// Pre- and post-processing for one model geometry
#[derive(Debug, Clone, Default)]
pub struct ImageCodec {
    preprocessing: PreprocessingConfig,
}

impl ImageCodec {
    #[must_use]
    pub fn new(preprocessing: PreprocessingConfig) -> Self {
        Self { preprocessing }
    }

    /// Model input size as `(width, height)`
    #[must_use]
    pub fn target_size(&self) -> (u32, u32) {
        let [height, width] = self.preprocessing.target_size;
        (width, height)
    }

    /// Decode encoded image bytes
    ///
    /// # Errors
    /// `Decode` for empty, truncated or unrecognized input.
    pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(BgRemovalError::decode("Empty image payload"));
        }
        image::load_from_memory(bytes).map_err(|e| BgRemovalError::decode(e.to_string()))
    }

    /// Convert an image into a normalized `(1, 3, H, W)` tensor
    ///
    /// # Errors
    /// Zero-sized input.
    #[allow(clippy::cast_possible_truncation)]
    pub fn preprocess(&self, image: &DynamicImage) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(BgRemovalError::decode("Image has zero width or height"));
        }
        let (width, height) = self.target_size();
        let rgb = image.to_rgb8();
        let resized = if rgb.dimensions() == (width, height) {
            rgb
        } else {
            image::imageops::resize(&rgb, width, height, RESIZE_FILTER)
        };
        Ok(self.to_tensor(&resized))
    }

    fn to_tensor(&self, rgb: &RgbImage) -> Array4<f32> {
        let (width, height) = rgb.dimensions();
        let mean = self.preprocessing.normalization_mean;
        let std = self.preprocessing.normalization_std;
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in rgb.enumerate_pixels() {
            let (x, y) = (x as usize, y as usize);
            for c in 0..3 {
                tensor[[0, c, y, x]] = (f32::from(pixel[c]) / 255.0 - mean[c]) / std[c];
            }
        }
        tensor
    }

    /// Turn a raw score map into an 8-bit mask of `original_size`
    ///
    /// Accepts the `(1, 1, H, W)` map produced by the model.
    ///
    /// # Errors
    /// - More than one batch entry or channel
    /// - Zero-sized map or target
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn postprocess_mask(
        &self,
        scores: &Array4<f32>,
        original_size: (u32, u32),
    ) -> Result<SegmentationMask> {
        let (batch, channels, height, width) = scores.dim();
        if batch != 1 || channels != 1 || height == 0 || width == 0 {
            return Err(BgRemovalError::processing(format!(
                "Expected a (1, 1, H, W) score map, got {:?}",
                scores.dim()
            )));
        }
        let (out_width, out_height) = original_size;
        if out_width == 0 || out_height == 0 {
            return Err(BgRemovalError::processing("Mask target size is empty"));
        }

        let plane: ArrayView2<f32> = scores.index_axis(Axis(0), 0).index_axis_move(Axis(0), 0);
        let intensities: Vec<u8> = plane
            .iter()
            .map(|&score| (sigmoid(score) * 255.0) as u8)
            .collect();
        let small = GrayImage::from_raw(width as u32, height as u32, intensities)
            .ok_or_else(|| BgRemovalError::internal("Score map size overflow"))?;

        let mask = if small.dimensions() == original_size {
            small
        } else {
            image::imageops::resize(&small, out_width, out_height, RESIZE_FILTER)
        };
        Ok(SegmentationMask::from_image(mask))
    }

    /// Original image with the mask as its alpha channel
    ///
    /// # Errors
    /// Mask and image sizes differ, or the mask buffer is the wrong length.
    pub fn composite(original: &DynamicImage, mask: &SegmentationMask) -> Result<RgbaImage> {
        mask.validate()?;
        let dimensions = (original.width(), original.height());
        if mask.dimensions != dimensions {
            return Err(BgRemovalError::processing(format!(
                "Mask {:?} does not match image {:?}",
                mask.dimensions, dimensions
            )));
        }
        let mut rgba = original.to_rgba8();
        for (pixel, &alpha) in rgba.pixels_mut().zip(mask.data.iter()) {
            pixel[3] = alpha;
        }
        Ok(rgba)
    }
}

#[inline]
fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}
