//! ONNX Runtime backend
//!
//! Runs the exported segmentation graph through ONNX Runtime with CUDA,
//! `CoreML` or CPU execution providers.

use crate::backends::into_array4;
use crate::config::{ExecutionProvider, ModelConfig};
use crate::error::{BgRemovalError, Result};
use crate::inference::{
    verify_output_geometry, ComputeTarget, InferenceBackend, OutputHead, SegmentationOutput,
};
use crate::models::ModelDescriptor;
use ndarray::Array4;
use ort::execution_providers::{
    CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider as OrtExecutionProvider,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::time::Instant;

/// Session settings resolved by `prepare`
#[derive(Debug, Clone, Copy)]
struct SessionPlan {
    target: ComputeTarget,
    intra_threads: usize,
    inter_threads: usize,
    input_shape: (usize, usize, usize, usize),
    output_head: OutputHead,
}

/// ONNX Runtime backend for running background removal models
#[derive(Debug, Default)]
pub struct OnnxBackend {
    plan: Option<SessionPlan>,
    session: Option<Session>,
    active: bool,
}

impl OnnxBackend {
    /// Create an unloaded backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// CUDA execution provider usable in this process
    #[must_use]
    pub fn cuda_available() -> bool {
        OrtExecutionProvider::is_available(&CUDAExecutionProvider::default()).unwrap_or(false)
    }

    /// `CoreML` execution provider usable in this process
    #[must_use]
    pub fn coreml_available() -> bool {
        OrtExecutionProvider::is_available(&CoreMLExecutionProvider::default()).unwrap_or(false)
    }

    /// Map the requested provider to what this machine can actually run
    fn resolve_target(requested: ExecutionProvider) -> ComputeTarget {
        match requested {
            ExecutionProvider::Auto => {
                if Self::cuda_available() {
                    log::info!("CUDA execution provider is available and will be used");
                    ComputeTarget::Cuda
                } else if Self::coreml_available() {
                    log::info!("CoreML execution provider is available and will be used");
                    ComputeTarget::CoreMl
                } else {
                    log::info!("No hardware acceleration available, using CPU");
                    ComputeTarget::Cpu
                }
            },
            ExecutionProvider::Cuda => {
                if Self::cuda_available() {
                    ComputeTarget::Cuda
                } else {
                    log::warn!(
                        "CUDA execution provider requested but not available, falling back to CPU"
                    );
                    ComputeTarget::Cpu
                }
            },
            ExecutionProvider::CoreMl => {
                if Self::coreml_available() {
                    ComputeTarget::CoreMl
                } else {
                    log::warn!(
                        "CoreML execution provider requested but not available, falling back to CPU"
                    );
                    ComputeTarget::Cpu
                }
            },
            ExecutionProvider::Cpu => ComputeTarget::Cpu,
        }
    }

    fn build_session(plan: &SessionPlan, weights: &[u8]) -> Result<Session> {
        let mut builder = Session::builder()
            .map_err(|e| load_err("Failed to create session builder", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_err("Failed to set optimization level", e))?;

        builder = match plan.target {
            ComputeTarget::Cuda => builder
                .with_execution_providers([CUDAExecutionProvider::default().build()])
                .map_err(|e| load_err("Failed to set CUDA execution provider", e))?,
            ComputeTarget::CoreMl => builder
                .with_execution_providers([CoreMLExecutionProvider::default()
                    .with_subgraphs(true)
                    .build()])
                .map_err(|e| load_err("Failed to set CoreML execution provider", e))?,
            ComputeTarget::Cpu => builder,
        };

        builder
            .with_parallel_execution(true)
            .map_err(|e| load_err("Failed to enable parallel execution", e))?
            .with_intra_threads(plan.intra_threads)
            .map_err(|e| load_err("Failed to set intra threads", e))?
            .with_inter_threads(plan.inter_threads)
            .map_err(|e| load_err("Failed to set inter threads", e))?
            .commit_from_memory(weights)
            .map_err(|e| load_err("Failed to create session from weights", e))
    }

    fn run(session: &mut Session, input: &Array4<f32>) -> Result<SegmentationOutput> {
        let input_value = Value::from_array(input.clone()).map_err(|e| {
            BgRemovalError::processing(format!("Failed to convert input tensor: {e}"))
        })?;

        let outputs = session
            .run(ort::inputs![input_value])
            .map_err(|e| BgRemovalError::inference(format!("ONNX inference failed: {e}")))?;

        // Output order follows the graph declaration
        let names: Vec<String> = outputs.keys().map(|k| k.to_string()).collect();
        let mut heads = Vec::with_capacity(names.len());
        for name in &names {
            let tensor = outputs
                .get(name.as_str())
                .ok_or_else(|| BgRemovalError::inference(format!("Output '{name}' missing")))?
                .try_extract_array::<f32>()
                .map_err(|e| {
                    BgRemovalError::inference(format!("Failed to extract output '{name}': {e}"))
                })?;
            let shape = tensor.shape().to_vec();
            heads.push(into_array4(&shape, tensor.iter().copied().collect())?);
        }

        SegmentationOutput::new(heads)
    }
}

fn load_err<E: std::fmt::Display>(what: &str, e: E) -> BgRemovalError {
    BgRemovalError::model_load(format!("{what}: {e}"))
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn prepare(&mut self, descriptor: &ModelDescriptor, config: &ModelConfig) -> Result<()> {
        let cores = std::thread::available_parallelism()
            .map(std::num::NonZero::get)
            .unwrap_or(8);

        let plan = SessionPlan {
            target: Self::resolve_target(config.execution_provider),
            intra_threads: if config.intra_threads > 0 {
                config.intra_threads
            } else {
                cores
            },
            inter_threads: if config.inter_threads > 0 {
                config.inter_threads
            } else {
                (cores / 4).max(1)
            },
            input_shape: descriptor.input_shape(),
            output_head: descriptor.output_head,
        };

        log::debug!(
            "ONNX session plan: target={}, {} intra / {} inter threads, input {:?}",
            plan.target,
            plan.intra_threads,
            plan.inter_threads,
            plan.input_shape
        );
        self.plan = Some(plan);
        Ok(())
    }

    fn bind_weights(&mut self, weights: &[u8]) -> Result<()> {
        let plan = self
            .plan
            .ok_or_else(|| BgRemovalError::model_load("ONNX backend was not prepared"))?;

        let start = Instant::now();
        let mut session = Self::build_session(&plan, weights)?;

        // Strict load: the graph must accept the declared input geometry and
        // produce a single-channel map.
        let probe = Array4::<f32>::zeros(plan.input_shape);
        let output = Self::run(&mut session, &probe).map_err(|e| {
            BgRemovalError::model_load(format!(
                "Weights do not accept input {:?}: {e}",
                plan.input_shape
            ))
        })?;
        verify_output_geometry(output, plan.output_head)?;

        log::info!(
            "ONNX weights bound in {:.0}ms ({:.1} MB)",
            start.elapsed().as_secs_f64() * 1000.0,
            weights.len() as f64 / (1024.0 * 1024.0)
        );
        self.session = Some(session);
        Ok(())
    }

    fn activate(&mut self) -> Result<ComputeTarget> {
        let plan = self
            .plan
            .ok_or_else(|| BgRemovalError::model_load("ONNX backend was not prepared"))?;
        if self.session.is_none() {
            return Err(BgRemovalError::model_load("ONNX weights were never bound"));
        }
        // Sessions are inference-only; providers were attached at commit time.
        self.active = true;
        log::info!("Active execution provider: {}", plan.target);
        Ok(plan.target)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<SegmentationOutput> {
        if !self.active {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BgRemovalError::internal("ONNX session not initialized"))?;

        let start = Instant::now();
        let output = Self::run(session, input)?;
        log::debug!(
            "ONNX inference: {:.2}ms, {} output(s)",
            start.elapsed().as_secs_f64() * 1000.0,
            output.len()
        );
        Ok(output)
    }

    fn is_ready(&self) -> bool {
        self.active
    }
}
