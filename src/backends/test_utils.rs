//! Mock backend and fixtures for exercising the pipeline without real weights
//!
//! The mock emits a deterministic score map: strong foreground logits inside
//! a centered ellipse, strong background logits elsewhere. Extra heads (when
//! configured) are all-background so that picking the wrong head is visible
//! in the composite.

use crate::{
    backends::BackendFactory,
    config::{BackendType, ModelConfig},
    download::WeightsFetcher,
    error::{BgRemovalError, Result},
    inference::{ComputeTarget, InferenceBackend, SegmentationOutput},
    models::{ModelDescriptor, CONFIG_FILE},
};
use async_trait::async_trait;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array4;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Logit magnitude used for the mock mask
pub const MOCK_LOGIT: f32 = 8.0;

/// Weight bytes the mock refuses to bind
pub const CORRUPT_WEIGHTS: &[u8] = b"corrupt-weights";

/// How the mock should behave
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub fail_prepare: bool,
    pub fail_infer: bool,
    /// Additional all-background heads emitted before the real one
    pub extra_heads: usize,
    /// Sleep inside every `infer` call
    pub infer_delay: Duration,
    /// Target reported by `activate`
    pub target: Option<ComputeTarget>,
}

/// Counters shared by every mock created from one factory
#[derive(Debug, Default)]
pub struct MockStats {
    calls: Mutex<Vec<String>>,
    created: AtomicUsize,
    inferences: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockStats {
    /// Method names in call order
    pub fn call_history(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Backends created so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Completed or running `infer` calls
    pub fn inferences(&self) -> usize {
        self.inferences.load(Ordering::SeqCst)
    }

    /// Highest number of `infer` calls observed running at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn record(&self, method: &str) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(method.to_string());
        }
    }
}

/// Mock inference backend
#[derive(Debug)]
pub struct MockBackend {
    behavior: MockBehavior,
    stats: Arc<MockStats>,
    input_shape: Option<(usize, usize, usize, usize)>,
    bound: bool,
    active: bool,
}

impl MockBackend {
    #[must_use]
    pub fn new(behavior: MockBehavior, stats: Arc<MockStats>) -> Self {
        Self {
            behavior,
            stats,
            input_shape: None,
            bound: false,
            active: false,
        }
    }

    /// Ellipse of foreground logits covering the middle of the frame
    #[must_use]
    pub fn ellipse_logits(height: usize, width: usize) -> Array4<f32> {
        let cy = height as f32 / 2.0;
        let cx = width as f32 / 2.0;
        let ry = (height as f32 / 3.0).max(1.0);
        let rx = (width as f32 / 3.0).max(1.0);
        Array4::from_shape_fn((1, 1, height, width), |(_, _, y, x)| {
            let dy = (y as f32 + 0.5 - cy) / ry;
            let dx = (x as f32 + 0.5 - cx) / rx;
            if dx * dx + dy * dy <= 1.0 {
                MOCK_LOGIT
            } else {
                -MOCK_LOGIT
            }
        })
    }
}

impl InferenceBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn prepare(&mut self, descriptor: &ModelDescriptor, _config: &ModelConfig) -> Result<()> {
        self.stats.record("prepare");
        if self.behavior.fail_prepare {
            return Err(BgRemovalError::model_load("Mock architecture failed"));
        }
        self.input_shape = Some(descriptor.input_shape());
        Ok(())
    }

    fn bind_weights(&mut self, weights: &[u8]) -> Result<()> {
        self.stats.record("bind_weights");
        if self.input_shape.is_none() {
            return Err(BgRemovalError::model_load("Mock backend was not prepared"));
        }
        if weights.is_empty() || weights.starts_with(CORRUPT_WEIGHTS) {
            return Err(BgRemovalError::model_load(
                "size mismatch for decoder.conv.weight",
            ));
        }
        self.bound = true;
        Ok(())
    }

    fn activate(&mut self) -> Result<ComputeTarget> {
        self.stats.record("activate");
        if !self.bound {
            return Err(BgRemovalError::model_load("Mock weights were never bound"));
        }
        self.active = true;
        Ok(self.behavior.target.unwrap_or(ComputeTarget::Cpu))
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<SegmentationOutput> {
        self.stats.record("infer");
        if !self.active {
            return Err(BgRemovalError::internal("Backend not initialized"));
        }

        let running = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(running, Ordering::SeqCst);
        self.stats.inferences.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.infer_delay.is_zero() {
            std::thread::sleep(self.behavior.infer_delay);
        }
        self.stats.active.fetch_sub(1, Ordering::SeqCst);

        if self.behavior.fail_infer {
            return Err(BgRemovalError::inference("Mock inference failed"));
        }

        let (_, _, height, width) = input.dim();
        let mut heads: Vec<Array4<f32>> = (0..self.behavior.extra_heads)
            .map(|_| Array4::from_elem((1, 1, height, width), -MOCK_LOGIT))
            .collect();
        heads.push(Self::ellipse_logits(height, width));
        SegmentationOutput::new(heads)
    }

    fn is_ready(&self) -> bool {
        self.active
    }
}

/// Factory handing out mocks that share one [`MockStats`]
#[derive(Debug, Clone, Default)]
pub struct MockBackendFactory {
    pub behavior: MockBehavior,
    pub stats: Arc<MockStats>,
}

impl MockBackendFactory {
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            stats: Arc::new(MockStats::default()),
        }
    }
}

impl BackendFactory for MockBackendFactory {
    fn create_backend(&self, _backend_type: BackendType) -> Result<Box<dyn InferenceBackend>> {
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockBackend::new(
            self.behavior.clone(),
            Arc::clone(&self.stats),
        )))
    }

    fn available_backends(&self) -> Vec<BackendType> {
        vec![BackendType::Onnx, BackendType::Tract]
    }
}

/// Fetcher that writes a small model directory instead of downloading
#[derive(Debug, Default)]
pub struct OfflineFetcher {
    pub fail: bool,
    fetches: AtomicUsize,
}

impl OfflineFetcher {
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of fetch calls served
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WeightsFetcher for OfflineFetcher {
    async fn fetch_config(&self, _repo_id: &str, dest: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(BgRemovalError::network_error(
                "Failed to download config.json",
                "connection refused",
            ));
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join(CONFIG_FILE), MOCK_CONFIG)?;
        Ok(())
    }

    async fn fetch_weights(&self, _repo_id: &str, weights_file: &str, dest: &Path) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let path = dest.join(weights_file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, b"mock-weights")?;
        Ok(())
    }
}

const MOCK_CONFIG: &str = r#"{"architectures": ["BiRefNet"], "model_type": "SwinTransformer"}"#;

/// Preprocessor override that keeps mock inference cheap
const MOCK_PREPROCESSOR: &str = r#"{"size": {"height": 64, "width": 64}}"#;

/// Write a complete model directory (64x64 input) with the given weight bytes
///
/// # Panics
/// Filesystem errors.
pub fn write_model_dir(dir: &Path, weights: &[u8]) {
    std::fs::create_dir_all(dir.join("onnx")).expect("create model dir");
    std::fs::write(dir.join(CONFIG_FILE), MOCK_CONFIG).expect("write config");
    std::fs::write(dir.join(crate::models::PREPROCESSOR_FILE), MOCK_PREPROCESSOR)
        .expect("write preprocessor config");
    std::fs::write(dir.join("onnx/model.onnx"), weights).expect("write weights");
}

/// Opaque RGB test image with a gradient
#[must_use]
pub fn test_image(width: u32, height: u32) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width.max(1)) as u8, (y * 255 / height.max(1)) as u8, 128])
    });
    DynamicImage::ImageRgb8(img)
}

/// Encode [`test_image`] as PNG
///
/// # Panics
/// Encoding errors.
#[must_use]
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    test_image(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}
