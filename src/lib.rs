#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

//! # nobg
//!
//! Background removal as a library, an HTTP service and a batch tool.
//!
//! A single segmentation model is loaded once through [`ModelProvider`] and
//! shared by every consumer:
//!
//! - [`RemovalService`] turns image bytes into a transparent cutout, either
//!   one at a time or as a zip archive for a batch
//! - [`JobQueue`] processes local files sequentially with status tracking
//!   and retry
//! - [`server::ServiceToggle`] starts and stops the HTTP endpoints
//!   (`/health`, `/remove-bg`, `/remove-bg-base64`) while the model stays
//!   loaded
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nobg::{ModelConfig, ModelProvider, OutputFormat, RemovalService};
//! use nobg::services::progress::ConsoleProgressReporter;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let provider = ModelProvider::new(ModelConfig::from_env()?)?;
//! let handle = provider.acquire(&ConsoleProgressReporter).await?;
//!
//! let service = RemovalService::new(handle);
//! let result = service.remove_one(std::fs::read("photo.jpg")?, false).await?;
//! result.save("photo_no_bg.png", OutputFormat::Png)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! - `onnx` (default): ONNX Runtime backend with CUDA and `CoreML` providers
//! - `tract` (default): pure Rust CPU backend
//! - `cli` (default): the `nobg` binary, progress bars and subscriber setup
//! - `webp-support` (default): WebP uploads
//! - `tracing-json`, `tracing-files`: extra log outputs for the binary
//! - `test-helpers`: mock backends for downstream tests

pub mod backends;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod codec;
pub mod config;
pub mod download;
pub mod error;
pub mod inference;
pub mod models;
pub mod provider;
pub mod queue;
pub mod server;
pub mod service;
pub mod services;
pub mod tracing_config;
pub mod types;

pub use backends::{cuda_available, list_providers, BackendFactory, DefaultBackendFactory};
pub use cache::{format_size, CachedModelInfo, ModelCache};
pub use codec::ImageCodec;
pub use config::{
    BackendType, ExecutionProvider, ModelConfig, OutputFormat, ServerConfig, DEFAULT_MODEL_ID,
};
pub use download::{ModelDownloader, WeightsFetcher};
pub use error::{BgRemovalError, Result};
pub use inference::{ComputeTarget, InferenceBackend, OutputHead};
pub use models::{ModelDescriptor, PreprocessingConfig, WeightsSource};
pub use provider::{ModelHandle, ModelProvider};
pub use queue::{JobItem, JobQueue, JobStatus, QueueEvent, QueueProgress};
pub use service::{BatchArchive, BatchItem, RemovalService, SingleEncoding, SingleResponse};
pub use services::format::OutputFormatHandler;
pub use services::progress::{LoadProgress, LoadStage, ProgressReporter};
pub use types::{ProcessingTimings, RemovalResult, SegmentationMask};

#[cfg(feature = "cli")]
pub use tracing_config::{init_cli_tracing, TracingConfig, TracingFormat, TracingOutput};
