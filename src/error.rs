//! Error types for background removal operations

use std::fmt;
use thiserror::Error;

/// Result type alias for background removal operations
pub type Result<T> = std::result::Result<T, BgRemovalError>;

/// Error type shared by the model provider, codec, service, queue and toggle
#[derive(Error, Debug)]
pub enum BgRemovalError {
    /// Input/output errors (file not found, permission denied, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image encoding errors raised by the `image` crate
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// Any stage of the model load sequence failed
    #[error("Model load failed: {0}")]
    ModelLoad(String),

    /// Input bytes are not a decodable image
    #[error("Could not decode image: {0}")]
    Decode(String),

    /// Requested output encoding is not recognized
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// `ServiceToggle::start` on a running service
    #[error("Service is already running")]
    AlreadyRunning,

    /// Operation needs a running service
    #[error("Service is not running")]
    NotRunning,

    /// No model handle has been acquired yet
    #[error("Model not ready")]
    ModelNotReady,

    /// Backend inference errors
    #[error("Inference error: {0}")]
    Inference(String),

    /// Invalid configuration or parameters
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Model download failures
    #[error("Network error: {0}")]
    Network(String),

    /// Pre/post-processing failures
    #[error("Processing error: {0}")]
    Processing(String),

    /// Inference did not finish within the configured bound
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Job status change not permitted by the queue state machine
    #[error("Invalid job transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::queue::JobStatus,
        to: crate::queue::JobStatus,
    },

    /// Queue list mutation attempted while a run is active
    #[error("Queue is busy processing")]
    QueueBusy,

    /// Unknown job id
    #[error("Job not found: {0}")]
    JobNotFound(uuid::Uuid),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BgRemovalError {
    /// Create a new model load error
    pub fn model_load<S: Into<String>>(msg: S) -> Self {
        Self::ModelLoad(msg.into())
    }

    /// Create a new decode error
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new invalid configuration error
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a new unsupported format error
    pub fn unsupported_format<S: Into<String>>(format: S) -> Self {
        Self::UnsupportedFormat(format.into())
    }

    /// Create a new processing error
    pub fn processing<S: Into<String>>(msg: S) -> Self {
        Self::Processing(msg.into())
    }

    /// Create a new inference error
    pub fn inference<S: Into<String>>(msg: S) -> Self {
        Self::Inference(msg.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a network error carrying the underlying cause
    pub fn network_error<S: Into<String>, E: fmt::Display>(context: S, error: E) -> Self {
        Self::Network(format!("{}: {}", context.into(), error))
    }

    /// Create file I/O error with operation context
    pub fn file_io_error<P: AsRef<std::path::Path>>(
        operation: &str,
        path: P,
        error: &std::io::Error,
    ) -> Self {
        Self::Io(std::io::Error::new(
            error.kind(),
            format!(
                "Failed to {} '{}': {}",
                operation,
                path.as_ref().display(),
                error
            ),
        ))
    }

    /// Fold any error raised during the load sequence into `ModelLoad`,
    /// keeping the causal message.
    #[must_use]
    pub fn into_model_load(self, stage: &str) -> Self {
        match self {
            Self::ModelLoad(msg) => Self::ModelLoad(msg),
            other => Self::ModelLoad(format!("{stage}: {other}")),
        }
    }

    /// True for failures caused by the caller's input rather than the service
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Decode(_) | Self::UnsupportedFormat(_) | Self::InvalidConfig(_)
        )
    }
}
