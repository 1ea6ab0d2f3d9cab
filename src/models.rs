//! Model metadata and weight-source resolution
//!
//! A model directory follows the `HuggingFace` layout:
//! `config.json`, an optional `preprocessor_config.json`, and the ONNX graph
//! under `onnx/`. Directories are looked up in two tiers: a bundled copy next
//! to the executable (or an explicit override), then the download cache.

use crate::{
    cache::ModelCache,
    config::ModelConfig,
    error::{BgRemovalError, Result},
    inference::OutputHead,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration file that must accompany the weights
pub const CONFIG_FILE: &str = "config.json";

/// Optional file overriding input geometry and normalization
pub const PREPROCESSOR_FILE: &str = "preprocessor_config.json";

/// Input geometry and normalization for the preprocessing stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    /// `[height, width]` of the model input
    pub target_size: [u32; 2],
    /// Per-channel mean in the `[0, 1]` range
    pub normalization_mean: [f32; 3],
    /// Per-channel standard deviation in the `[0, 1]` range
    pub normalization_std: [f32; 3],
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            target_size: [1024, 1024],
            normalization_mean: [0.485, 0.456, 0.406],
            normalization_std: [0.229, 0.224, 0.225],
        }
    }
}

impl PreprocessingConfig {
    /// Read overrides from a `preprocessor_config.json` document
    ///
    /// Missing keys keep their defaults. Mean/std given on the 0-255 scale
    /// are converted to the `[0, 1]` range.
    ///
    /// # Errors
    /// Present but malformed values.
    pub fn from_huggingface(preprocessor: &serde_json::Value) -> Result<Self> {
        let mut config = Self::default();

        if let Some(size) = preprocessor.get("size") {
            config.target_size = parse_size(size)?;
        }
        if let Some(mean) = preprocessor.get("image_mean") {
            config.normalization_mean = parse_triplet("image_mean", mean)?;
        }
        if let Some(std) = preprocessor.get("image_std") {
            config.normalization_std = parse_triplet("image_std", std)?;
        }
        if config.normalization_std.iter().any(|s| *s <= 0.0) {
            return Err(BgRemovalError::invalid_config(
                "image_std values must be positive",
            ));
        }
        Ok(config)
    }
}

fn parse_size(size: &serde_json::Value) -> Result<[u32; 2]> {
    let to_u32 = |v: Option<u64>, what: &str| -> Result<u32> {
        v.and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                BgRemovalError::invalid_config(format!("Invalid {what} in preprocessor size"))
            })
    };

    if let Some(edge) = size.as_u64() {
        let edge = to_u32(Some(edge), "size")?;
        return Ok([edge, edge]);
    }
    let height = to_u32(size.get("height").and_then(serde_json::Value::as_u64), "height")?;
    let width = to_u32(size.get("width").and_then(serde_json::Value::as_u64), "width")?;
    Ok([height, width])
}

fn parse_triplet(key: &str, value: &serde_json::Value) -> Result<[f32; 3]> {
    let values: Vec<f64> = value
        .as_array()
        .ok_or_else(|| BgRemovalError::invalid_config(format!("{key} must be an array")))?
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| BgRemovalError::invalid_config(format!("{key} must be numeric")))
        })
        .collect::<Result<_>>()?;

    let [a, b, c] = values.as_slice() else {
        return Err(BgRemovalError::invalid_config(format!(
            "{key} must have exactly 3 values"
        )));
    };
    let scale = if [a, b, c].iter().any(|v| **v > 1.0) {
        255.0
    } else {
        1.0
    };
    Ok([(a / scale) as f32, (b / scale) as f32, (c / scale) as f32])
}

/// Everything the pipeline needs to know about a model besides its weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Repository id, reported by the health endpoint
    pub model_id: String,
    /// Architecture name from `config.json`, when declared
    pub architecture: Option<String>,
    pub preprocessing: PreprocessingConfig,
    /// Which output tensor is authoritative
    pub output_head: OutputHead,
}

impl ModelDescriptor {
    /// Descriptor with default geometry for `model_id`
    #[must_use]
    pub fn new<S: Into<String>>(model_id: S) -> Self {
        Self {
            model_id: model_id.into(),
            architecture: None,
            preprocessing: PreprocessingConfig::default(),
            output_head: OutputHead::Last,
        }
    }

    /// Read `config.json` (required) and `preprocessor_config.json` (optional)
    /// from a model directory
    ///
    /// # Errors
    /// - Missing or unparseable `config.json`
    /// - Malformed preprocessor values
    pub fn from_model_dir(model_id: &str, dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let config = read_json(&config_path)?;

        let preprocessor_path = dir.join(PREPROCESSOR_FILE);
        let preprocessing = if preprocessor_path.exists() {
            PreprocessingConfig::from_huggingface(&read_json(&preprocessor_path)?)?
        } else {
            PreprocessingConfig::default()
        };

        let architecture = config
            .get("architectures")
            .and_then(serde_json::Value::as_array)
            .and_then(|a| a.first())
            .and_then(serde_json::Value::as_str)
            .or_else(|| config.get("model_type").and_then(serde_json::Value::as_str))
            .map(str::to_string);

        Ok(Self {
            model_id: model_id.to_string(),
            architecture,
            preprocessing,
            output_head: OutputHead::Last,
        })
    }

    /// NCHW input shape with a batch of one
    #[must_use]
    pub fn input_shape(&self) -> (usize, usize, usize, usize) {
        let [height, width] = self.preprocessing.target_size;
        (1, 3, height as usize, width as usize)
    }
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = fs::read_to_string(path)
        .map_err(|e| BgRemovalError::file_io_error("read model configuration", path, &e))?;
    serde_json::from_str(&content).map_err(|e| {
        BgRemovalError::invalid_config(format!("Failed to parse {}: {e}", path.display()))
    })
}

/// Where the weights for this process come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightsSource {
    /// Shipped alongside the application
    Bundled(PathBuf),
    /// Downloaded by an earlier run
    Cached(PathBuf),
    /// Must be fetched from the repository into `dest`
    Remote { repo_url: String, dest: PathBuf },
}

impl WeightsSource {
    /// Pick the weight source for `config`: bundled, then cached, then remote
    #[must_use]
    pub fn resolve(config: &ModelConfig, cache: &ModelCache) -> Self {
        let weights_file = config.weights_file();

        for candidate in bundled_search_paths(config) {
            if is_complete_model_dir(&candidate, weights_file) {
                return Self::Bundled(candidate);
            }
        }

        let model_id = ModelCache::repo_to_model_id(&config.model_id);
        let cached = cache.get_model_path(&model_id);
        if is_complete_model_dir(&cached, weights_file) {
            return Self::Cached(cached);
        }

        Self::Remote {
            repo_url: format!("https://huggingface.co/{}", config.model_id),
            dest: cached,
        }
    }

    /// Directory the model files live in (or will, once fetched)
    #[must_use]
    pub fn model_dir(&self) -> &Path {
        match self {
            Self::Bundled(dir) | Self::Cached(dir) => dir,
            Self::Remote { dest, .. } => dest,
        }
    }

    /// True when loading needs network access
    #[must_use]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

impl std::fmt::Display for WeightsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bundled(dir) => write!(f, "bundled weights at {}", dir.display()),
            Self::Cached(dir) => write!(f, "cached weights at {}", dir.display()),
            Self::Remote { repo_url, .. } => write!(f, "network fetch from {repo_url}"),
        }
    }
}

/// Candidate directories for bundled weights, in priority order
#[must_use]
pub fn bundled_search_paths(config: &ModelConfig) -> Vec<PathBuf> {
    if let Some(dir) = &config.bundled_dir {
        return vec![dir.clone()];
    }

    let name = config.model_name();
    let mut paths = Vec::new();
    if let Some(exe_dir) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        paths.push(exe_dir.join("models").join(name));
        paths.push(exe_dir.join("..").join("Resources").join("models").join(name));
    }
    paths.push(PathBuf::from("models").join(name));
    paths
}

/// A directory is usable when it has `config.json` and the weights file
#[must_use]
pub fn is_complete_model_dir(dir: &Path, weights_file: &str) -> bool {
    dir.join(CONFIG_FILE).is_file() && dir.join(weights_file).is_file()
}
