//! Configuration types for the model provider and the HTTP service

use crate::error::{BgRemovalError, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default HuggingFace repository for the segmentation model
pub const DEFAULT_MODEL_ID: &str = "briaai/RMBG-2.0";

/// Default service name reported by the root endpoint
pub const DEFAULT_PROJECT_NAME: &str = "RMBG-2.0 Service";

/// Execution provider options for ONNX Runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionProvider {
    /// Auto-detect best available provider (CUDA > `CoreML` > CPU)
    #[default]
    Auto,
    /// CPU execution (always available)
    Cpu,
    /// NVIDIA CUDA GPU acceleration
    Cuda,
    /// Apple Silicon acceleration
    CoreMl,
}

impl std::fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
            Self::CoreMl => write!(f, "coreml"),
        }
    }
}

impl FromStr for ExecutionProvider {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "coreml" => Ok(Self::CoreMl),
            other => Err(BgRemovalError::invalid_config(format!(
                "Unknown execution provider: {other}. Supported: auto, cpu, cuda, coreml"
            ))),
        }
    }
}

/// Inference engine used to run the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// ONNX Runtime (GPU capable)
    Onnx,
    /// Tract (pure Rust, CPU only)
    Tract,
}

impl Default for BackendType {
    fn default() -> Self {
        if cfg!(feature = "onnx") {
            Self::Onnx
        } else {
            Self::Tract
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Onnx => write!(f, "onnx"),
            Self::Tract => write!(f, "tract"),
        }
    }
}

impl FromStr for BackendType {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onnx" => Ok(Self::Onnx),
            "tract" => Ok(Self::Tract),
            other => Err(BgRemovalError::invalid_config(format!(
                "Unknown backend: {other}. Supported backends: onnx, tract"
            ))),
        }
    }
}

/// Output image format for removal results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// PNG with alpha channel transparency
    #[default]
    Png,
    /// JPEG, flattened onto white
    Jpeg,
}

impl OutputFormat {
    /// Parse a request parameter (`png`, `jpeg` or `jpg`, any case)
    ///
    /// # Errors
    /// `UnsupportedFormat` for anything else.
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            other => Err(BgRemovalError::unsupported_format(format!(
                "'{other}' (supported: png, jpeg, jpg)"
            ))),
        }
    }

    /// Name reported back to clients in JSON responses
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpeg",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = BgRemovalError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Settings that drive model acquisition and inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// HuggingFace repository id (`owner/name`)
    pub model_id: String,

    /// Explicit directory holding bundled weights (skips the search path)
    pub bundled_dir: Option<PathBuf>,

    /// Override for the download cache root
    pub cache_dir: Option<PathBuf>,

    /// Requested execution provider
    pub execution_provider: ExecutionProvider,

    /// Inference engine
    pub backend: BackendType,

    /// Weight precision variant: `fp32` or `fp16`
    pub variant: String,

    /// Number of intra-op threads for inference (0 = auto)
    pub intra_threads: usize,

    /// Number of inter-op threads for inference (0 = auto)
    pub inter_threads: usize,

    /// Independent inference slots; 1 serializes every call
    pub pool_size: usize,

    /// Bearer token for gated repositories
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            bundled_dir: None,
            cache_dir: None,
            execution_provider: ExecutionProvider::default(),
            backend: BackendType::default(),
            variant: "fp32".to_string(),
            intra_threads: 0,
            inter_threads: 0,
            pool_size: 1,
            hf_token: None,
        }
    }
}

impl ModelConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder::default()
    }

    /// Build a configuration from `NOBG_*` environment variables
    ///
    /// `CUDA_VISIBLE_DEVICES` selects CUDA when no provider is set explicitly.
    ///
    /// # Errors
    /// Any variable that fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(id) = env_var("NOBG_MODEL_ID") {
            config.model_id = id;
        }
        config.bundled_dir = env_var("NOBG_MODEL_DIR").map(PathBuf::from);
        config.cache_dir = env_var("NOBG_CACHE_DIR").map(PathBuf::from);
        config.execution_provider = match env_var("NOBG_EXECUTION_PROVIDER") {
            Some(value) => value.parse()?,
            None if env_var("CUDA_VISIBLE_DEVICES").is_some() => ExecutionProvider::Cuda,
            None => ExecutionProvider::Auto,
        };
        if let Some(value) = env_var("NOBG_BACKEND") {
            config.backend = value.parse()?;
        }
        if let Some(value) = env_var("NOBG_VARIANT") {
            config.variant = value;
        }
        if let Some(value) = env_var("NOBG_THREADS") {
            let threads = parse_number("NOBG_THREADS", &value)?;
            config.intra_threads = threads;
            config.inter_threads = threads;
        }
        if let Some(value) = env_var("NOBG_POOL_SIZE") {
            config.pool_size = parse_number("NOBG_POOL_SIZE", &value)?;
        }
        config.hf_token = env_var("HF_TOKEN");

        config.validate()?;
        Ok(config)
    }

    /// Repository name without the owner, used for bundled directory lookup
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model_id
            .rsplit_once('/')
            .map_or(self.model_id.as_str(), |(_, name)| name)
    }

    /// Relative path of the ONNX file for the configured variant
    #[must_use]
    pub fn weights_file(&self) -> &'static str {
        if self.variant == "fp16" {
            "onnx/model_fp16.onnx"
        } else {
            "onnx/model.onnx"
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    /// - Empty or malformed model id
    /// - Unknown variant
    /// - Zero pool size
    pub fn validate(&self) -> Result<()> {
        if self.model_id.trim().is_empty() || !self.model_id.contains('/') {
            return Err(BgRemovalError::invalid_config(format!(
                "Model id must look like 'owner/name', got '{}'",
                self.model_id
            )));
        }
        if self.variant != "fp32" && self.variant != "fp16" {
            return Err(BgRemovalError::invalid_config(format!(
                "Unknown weights variant '{}'. Supported: fp32, fp16",
                self.variant
            )));
        }
        if self.pool_size == 0 {
            return Err(BgRemovalError::invalid_config(
                "Inference pool size must be at least 1",
            ));
        }
        if self.backend == BackendType::Tract
            && !matches!(
                self.execution_provider,
                ExecutionProvider::Auto | ExecutionProvider::Cpu
            )
        {
            return Err(BgRemovalError::invalid_config(format!(
                "Tract only supports the cpu provider, got '{}'",
                self.execution_provider
            )));
        }
        Ok(())
    }
}

/// Builder for `ModelConfig`
#[derive(Debug, Default)]
pub struct ModelConfigBuilder {
    config: ModelConfig,
}

impl ModelConfigBuilder {
    /// Set the model repository id
    #[must_use]
    pub fn model_id<S: Into<String>>(mut self, model_id: S) -> Self {
        self.config.model_id = model_id.into();
        self
    }

    /// Use weights from this directory instead of searching
    #[must_use]
    pub fn bundled_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.bundled_dir = Some(dir.into());
        self
    }

    /// Override the download cache root
    #[must_use]
    pub fn cache_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.config.cache_dir = Some(dir.into());
        self
    }

    /// Set execution provider
    #[must_use]
    pub fn execution_provider(mut self, provider: ExecutionProvider) -> Self {
        self.config.execution_provider = provider;
        self
    }

    /// Set inference engine
    #[must_use]
    pub fn backend(mut self, backend: BackendType) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set weights variant (`fp32` / `fp16`)
    #[must_use]
    pub fn variant<S: Into<String>>(mut self, variant: S) -> Self {
        self.config.variant = variant.into();
        self
    }

    /// Use the same thread count for intra and inter op parallelism
    #[must_use]
    pub fn num_threads(mut self, threads: usize) -> Self {
        self.config.intra_threads = threads;
        self.config.inter_threads = threads;
        self
    }

    /// Set the number of inference slots
    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Token for gated HuggingFace repositories
    #[must_use]
    pub fn hf_token(mut self, token: Option<String>) -> Self {
        self.config.hf_token = token;
        self
    }

    /// Build and validate
    ///
    /// # Errors
    /// See [`ModelConfig::validate`].
    pub fn build(self) -> Result<ModelConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings for the HTTP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: String,
    /// TCP port (0 picks a free port)
    pub port: u16,
    /// Largest accepted request body in bytes
    pub max_upload_bytes: usize,
    /// Upper bound for one inference call; `None` waits indefinitely
    pub inference_timeout: Option<Duration>,
    /// Name reported by the root endpoint
    pub project_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_upload_bytes: 64 * 1024 * 1024,
            inference_timeout: Some(Duration::from_secs(120)),
            project_name: DEFAULT_PROJECT_NAME.to_string(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration builder
    #[must_use]
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    /// Build a configuration from `NOBG_*` environment variables
    ///
    /// # Errors
    /// Any variable that fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(host) = env_var("NOBG_HOST") {
            config.host = host;
        }
        if let Some(value) = env_var("NOBG_PORT") {
            config.port = value.parse().map_err(|e| {
                BgRemovalError::invalid_config(format!("NOBG_PORT '{value}': {e}"))
            })?;
        }
        if let Some(value) = env_var("NOBG_MAX_UPLOAD_MB") {
            config.max_upload_bytes = parse_number("NOBG_MAX_UPLOAD_MB", &value)? * 1024 * 1024;
        }
        if let Some(value) = env_var("NOBG_INFERENCE_TIMEOUT_SECS") {
            let secs = parse_number("NOBG_INFERENCE_TIMEOUT_SECS", &value)?;
            config.inference_timeout = (secs > 0).then(|| Duration::from_secs(secs as u64));
        }
        if let Some(name) = env_var("NOBG_PROJECT_NAME") {
            config.project_name = name;
        }
        config.validate()?;
        Ok(config)
    }

    /// Socket address to bind
    ///
    /// # Errors
    /// Host is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| {
                BgRemovalError::invalid_config(format!(
                    "Invalid bind address {}:{}: {e}",
                    self.host, self.port
                ))
            })
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    /// - Unparseable bind address
    /// - Zero upload limit
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.max_upload_bytes == 0 {
            return Err(BgRemovalError::invalid_config(
                "Upload limit must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Builder for `ServerConfig`
#[derive(Debug, Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    #[must_use]
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.config.host = host.into();
        self
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    #[must_use]
    pub fn max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    #[must_use]
    pub fn inference_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.inference_timeout = timeout;
        self
    }

    #[must_use]
    pub fn project_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.project_name = name.into();
        self
    }

    /// Build and validate
    ///
    /// # Errors
    /// See [`ServerConfig::validate`].
    pub fn build(self) -> Result<ServerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|e| BgRemovalError::invalid_config(format!("{name} '{value}': {e}")))
}
