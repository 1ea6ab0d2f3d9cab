//! Inference backend abstraction
//!
//! The segmentation model is an opaque capability: a normalized `(1, 3, H, W)`
//! tensor goes in, one or more per-pixel score maps come out. Backends walk
//! through the same three load phases the [`ModelProvider`](crate::provider::ModelProvider)
//! reports progress for: [`prepare`](InferenceBackend::prepare) (architecture),
//! [`bind_weights`](InferenceBackend::bind_weights) (strict weight load) and
//! [`activate`](InferenceBackend::activate) (compute target, inference mode).

use crate::{
    config::ModelConfig,
    error::{BgRemovalError, Result},
    models::ModelDescriptor,
};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

/// Execution context a loaded model is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeTarget {
    Cpu,
    Cuda,
    CoreMl,
}

impl ComputeTarget {
    /// True for anything other than the general-purpose processor
    #[must_use]
    pub fn is_accelerator(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl std::fmt::Display for ComputeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

/// Which output tensor of a multi-head model carries the final mask
///
/// Deep-supervision architectures such as `BiRefNet` (RMBG-2.0) emit their
/// intermediate predictions first and the refined full-resolution map last,
/// so [`OutputHead::Last`] is the default. Swapping in a model with a
/// different head order means changing this value in its descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputHead {
    First,
    #[default]
    Last,
}

/// Every output tensor produced by one inference call, in emission order
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    heads: Vec<Array4<f32>>,
}

impl SegmentationOutput {
    /// Wrap the output tensors of one run
    ///
    /// # Errors
    /// No tensors were produced.
    pub fn new(heads: Vec<Array4<f32>>) -> Result<Self> {
        if heads.is_empty() {
            return Err(BgRemovalError::inference("Model produced no output tensors"));
        }
        Ok(Self { heads })
    }

    /// Number of output tensors
    #[must_use]
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Take the authoritative score map
    ///
    /// # Errors
    /// Empty output (unreachable through [`SegmentationOutput::new`]).
    pub fn select(mut self, head: OutputHead) -> Result<Array4<f32>> {
        let selected = match head {
            OutputHead::Last => self.heads.pop(),
            OutputHead::First => {
                if self.heads.is_empty() {
                    None
                } else {
                    Some(self.heads.swap_remove(0))
                }
            },
        };
        selected.ok_or_else(|| BgRemovalError::inference("No output tensor to select"))
    }
}

/// Trait for inference backends
///
/// Implementations are not expected to be reentrant: the provider keeps every
/// instance behind its own mutex.
pub trait InferenceBackend: Send + std::fmt::Debug {
    /// Short engine name for logs and health output
    fn name(&self) -> &'static str;

    /// Instantiate the model architecture: resolve execution providers,
    /// threading and input geometry from the descriptor and config.
    ///
    /// # Errors
    /// Invalid configuration for this engine.
    fn prepare(&mut self, descriptor: &ModelDescriptor, config: &ModelConfig) -> Result<()>;

    /// Load weight bytes into the prepared architecture
    ///
    /// Loading is strict: a graph that cannot run on the declared input
    /// geometry, or whose authoritative output is not a single-channel map,
    /// is rejected.
    ///
    /// # Errors
    /// - `prepare` was not called
    /// - Corrupt weights or shape mismatch
    fn bind_weights(&mut self, weights: &[u8]) -> Result<()>;

    /// Move the model to its compute target and switch to inference mode
    ///
    /// Returns the target actually in use, which may be the CPU when an
    /// accelerator was requested but is unavailable.
    ///
    /// # Errors
    /// Weights were never bound.
    fn activate(&mut self) -> Result<ComputeTarget>;

    /// Run inference on the input tensor
    ///
    /// # Errors
    /// - Backend not activated
    /// - Engine failures
    fn infer(&mut self, input: &Array4<f32>) -> Result<SegmentationOutput>;

    /// Ready for `infer`
    fn is_ready(&self) -> bool;
}

/// Check the geometry of a freshly bound model's authoritative output
///
/// # Errors
/// `ModelLoad` when the map is not `(1, 1, H, W)` with non-zero spatial size.
pub fn verify_output_geometry(output: SegmentationOutput, head: OutputHead) -> Result<()> {
    let heads = output.len();
    let map = output.select(head)?;
    let (batch, channels, height, width) = map.dim();
    if batch != 1 || channels != 1 || height == 0 || width == 0 {
        return Err(BgRemovalError::model_load(format!(
            "Weights do not match the expected architecture: output {:?} of {heads} head(s), expected (1, 1, H, W)",
            map.dim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(value: f32, size: usize) -> Array4<f32> {
        Array4::from_elem((1, 1, size, size), value)
    }

    #[test]
    fn test_select_last_head_by_default() {
        let output = SegmentationOutput::new(vec![head(1.0, 4), head(2.0, 8), head(3.0, 16)]).unwrap();
        assert_eq!(output.len(), 3);
        let map = output.select(OutputHead::default()).unwrap();
        assert_eq!(map.dim(), (1, 1, 16, 16));
        assert!(map.iter().all(|&v| (v - 3.0).abs() < f32::EPSILON));
    }

    #[test]
    fn test_select_first_head() {
        let output = SegmentationOutput::new(vec![head(1.0, 4), head(2.0, 8)]).unwrap();
        let map = output.select(OutputHead::First).unwrap();
        assert_eq!(map.dim(), (1, 1, 4, 4));
    }

    #[test]
    fn test_empty_output_rejected() {
        assert!(SegmentationOutput::new(Vec::new()).is_err());
    }

    #[test]
    fn test_verify_output_geometry() {
        let good = SegmentationOutput::new(vec![head(0.0, 8)]).unwrap();
        assert!(verify_output_geometry(good, OutputHead::Last).is_ok());

        let rgb = SegmentationOutput::new(vec![Array4::zeros((1, 3, 8, 8))]).unwrap();
        let err = verify_output_geometry(rgb, OutputHead::Last).unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad(_)));
    }

    #[test]
    fn test_compute_target_display() {
        assert_eq!(ComputeTarget::Cpu.to_string(), "cpu");
        assert_eq!(ComputeTarget::Cuda.to_string(), "cuda");
        assert!(ComputeTarget::CoreMl.is_accelerator());
        assert!(!ComputeTarget::Cpu.is_accelerator());
    }
}
