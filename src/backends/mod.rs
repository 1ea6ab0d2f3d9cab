//! Backend implementations for different inference engines
//!
//! - ONNX Runtime backend (GPU acceleration via CUDA / `CoreML`)
//! - Tract backend (pure Rust, CPU only)

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "tract")]
pub mod tract;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;

#[cfg(feature = "onnx")]
pub use self::onnx::OnnxBackend;

#[cfg(feature = "tract")]
pub use self::tract::TractBackend;

use crate::{
    config::{BackendType, ExecutionProvider},
    error::{BgRemovalError, Result},
    inference::InferenceBackend,
};

/// Creates fresh, unloaded backend instances
///
/// The provider asks for one instance per inference slot.
pub trait BackendFactory: Send + Sync + std::fmt::Debug {
    /// Create a backend instance of the specified type
    ///
    /// # Errors
    /// The backend type was not compiled in.
    fn create_backend(&self, backend_type: BackendType) -> Result<Box<dyn InferenceBackend>>;

    /// Backend types this factory can create
    fn available_backends(&self) -> Vec<BackendType>;
}

/// Factory for the backends enabled through cargo features
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBackendFactory;

impl BackendFactory for DefaultBackendFactory {
    fn create_backend(&self, backend_type: BackendType) -> Result<Box<dyn InferenceBackend>> {
        match backend_type {
            #[cfg(feature = "onnx")]
            BackendType::Onnx => Ok(Box::new(OnnxBackend::new())),
            #[cfg(feature = "tract")]
            BackendType::Tract => Ok(Box::new(TractBackend::new())),
            #[allow(unreachable_patterns)]
            other => Err(BgRemovalError::invalid_config(format!(
                "Backend '{other}' is not compiled in; enable the '{other}' feature"
            ))),
        }
    }

    fn available_backends(&self) -> Vec<BackendType> {
        let mut backends = Vec::new();
        #[cfg(feature = "onnx")]
        backends.push(BackendType::Onnx);
        #[cfg(feature = "tract")]
        backends.push(BackendType::Tract);
        backends
    }
}

/// Reshape a flat engine output into NCHW
///
/// `(C, H, W)` and `(H, W)` outputs gain leading unit dimensions.
#[allow(dead_code)]
pub(crate) fn into_array4(shape: &[usize], data: Vec<f32>) -> Result<ndarray::Array4<f32>> {
    let dims = match *shape {
        [n, c, h, w] => (n, c, h, w),
        [c, h, w] => (1, c, h, w),
        [h, w] => (1, 1, h, w),
        _ => {
            return Err(BgRemovalError::inference(format!(
                "Expected 2D to 4D output tensor, got shape {shape:?}"
            )))
        },
    };
    ndarray::Array4::from_shape_vec(dims, data)
        .map_err(|e| BgRemovalError::inference(format!("Failed to reshape output tensor: {e}")))
}

/// One backend/provider combination and whether it can run here
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub backend: BackendType,
    pub provider: ExecutionProvider,
    pub available: bool,
    pub description: &'static str,
}

/// Whether a CUDA device is usable by the ONNX backend
#[must_use]
pub fn cuda_available() -> bool {
    #[cfg(feature = "onnx")]
    {
        OnnxBackend::cuda_available()
    }
    #[cfg(not(feature = "onnx"))]
    {
        false
    }
}

/// Every provider combination compiled into this build
#[must_use]
pub fn list_providers() -> Vec<ProviderInfo> {
    let mut providers = Vec::new();

    #[cfg(feature = "onnx")]
    {
        let cuda = OnnxBackend::cuda_available();
        let coreml = OnnxBackend::coreml_available();
        providers.push(ProviderInfo {
            backend: BackendType::Onnx,
            provider: ExecutionProvider::Auto,
            available: true,
            description: "ONNX Runtime with the best available provider",
        });
        providers.push(ProviderInfo {
            backend: BackendType::Onnx,
            provider: ExecutionProvider::Cpu,
            available: true,
            description: "ONNX Runtime CPU execution",
        });
        providers.push(ProviderInfo {
            backend: BackendType::Onnx,
            provider: ExecutionProvider::Cuda,
            available: cuda,
            description: "NVIDIA GPU acceleration (requires CUDA toolkit)",
        });
        providers.push(ProviderInfo {
            backend: BackendType::Onnx,
            provider: ExecutionProvider::CoreMl,
            available: coreml,
            description: "Apple Silicon acceleration (macOS only)",
        });
    }

    #[cfg(feature = "tract")]
    providers.push(ProviderInfo {
        backend: BackendType::Tract,
        provider: ExecutionProvider::Cpu,
        available: true,
        description: "Pure Rust CPU inference",
    });

    providers
}
