//! Tract backend
//!
//! Pure Rust inference: no native runtime to ship, CPU only. Tract checks the
//! declared input shape against the graph while optimizing, so a weight file
//! that does not fit the descriptor fails during `bind_weights`.

use crate::backends::into_array4;
use crate::config::ModelConfig;
use crate::error::{BgRemovalError, Result};
use crate::inference::{
    verify_output_geometry, ComputeTarget, InferenceBackend, OutputHead, SegmentationOutput,
};
use crate::models::ModelDescriptor;
use instant::Instant;
use ndarray::Array4;
use tract_onnx::prelude::*;

/// Type alias for the optimized, runnable Tract plan
type TractModel = RunnableModel<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Tract backend for running background removal models using pure Rust inference
#[derive(Debug, Default)]
pub struct TractBackend {
    input_shape: Option<(usize, usize, usize, usize)>,
    output_head: OutputHead,
    model: Option<TractModel>,
    active: bool,
}

impl TractBackend {
    /// Create an unloaded backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn run(model: &TractModel, input: &Array4<f32>) -> Result<SegmentationOutput> {
        let outputs = model
            .run(tvec![Tensor::from(input.clone()).into()])
            .map_err(|e| BgRemovalError::inference(format!("Tract inference failed: {e}")))?;

        let mut heads = Vec::with_capacity(outputs.len());
        for output in outputs {
            let tensor = output.into_arc_tensor();
            let view = tensor.to_array_view::<f32>().map_err(|e| {
                BgRemovalError::inference(format!("Failed to convert output tensor: {e}"))
            })?;
            let shape = view.shape().to_vec();
            heads.push(into_array4(&shape, view.iter().copied().collect())?);
        }
        SegmentationOutput::new(heads)
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn prepare(&mut self, descriptor: &ModelDescriptor, config: &ModelConfig) -> Result<()> {
        if config.intra_threads > 0 {
            log::debug!("Tract ignores the thread count setting ({})", config.intra_threads);
        }
        self.input_shape = Some(descriptor.input_shape());
        self.output_head = descriptor.output_head;
        Ok(())
    }

    fn bind_weights(&mut self, weights: &[u8]) -> Result<()> {
        let (n, c, h, w) = self
            .input_shape
            .ok_or_else(|| BgRemovalError::model_load("Tract backend was not prepared"))?;

        let start = Instant::now();
        let model = onnx()
            .model_for_read(&mut std::io::Cursor::new(weights))
            .map_err(|e| BgRemovalError::model_load(format!("Failed to read ONNX model: {e}")))?
            .with_input_fact(0, f32::fact([n, c, h, w]).into())
            .map_err(|e| {
                BgRemovalError::model_load(format!("Input shape {:?} rejected: {e}", (n, c, h, w)))
            })?
            .into_optimized()
            .map_err(|e| BgRemovalError::model_load(format!("Failed to optimize model: {e}")))?
            .into_runnable()
            .map_err(|e| {
                BgRemovalError::model_load(format!("Failed to create runnable model: {e}"))
            })?;

        let probe = Array4::<f32>::zeros((n, c, h, w));
        let output = Self::run(&model, &probe)
            .map_err(|e| BgRemovalError::model_load(format!("Probe inference failed: {e}")))?;
        verify_output_geometry(output, self.output_head)?;

        log::info!(
            "Tract model bound in {}ms ({:.1} MB)",
            start.elapsed().as_millis(),
            weights.len() as f64 / (1024.0 * 1024.0)
        );
        self.model = Some(model);
        Ok(())
    }

    fn activate(&mut self) -> Result<ComputeTarget> {
        if self.model.is_none() {
            return Err(BgRemovalError::model_load("Tract weights were never bound"));
        }
        self.active = true;
        Ok(ComputeTarget::Cpu)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<SegmentationOutput> {
        if !self.active {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| BgRemovalError::inference("Tract model not initialized"))?;

        let start = Instant::now();
        let output = Self::run(model, input)?;
        log::debug!("Tract inference completed in {}ms", start.elapsed().as_millis());
        Ok(output)
    }

    fn is_ready(&self) -> bool {
        self.active
    }
}
