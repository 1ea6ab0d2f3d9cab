//! Download cache for model weights
//!
//! Downloaded repositories live under an XDG-compliant cache directory, one
//! sub-directory per repository. There is no invalidation policy: a complete
//! directory is reused as-is until removed.

use crate::config::ModelConfig;
use crate::error::{BgRemovalError, Result};
use crate::models::{is_complete_model_dir, CONFIG_FILE};
use std::fs;
use std::path::{Path, PathBuf};

/// Information about a cached model
#[derive(Debug, Clone)]
pub struct CachedModelInfo {
    /// Cache-safe identifier (`owner--name`)
    pub model_id: String,
    /// Path to the cached model directory
    pub path: PathBuf,
    /// ONNX variants present (`fp32`, `fp16`)
    pub variants: Vec<String>,
    /// Size of the directory in bytes
    pub size_bytes: u64,
}

/// Model cache manager
#[derive(Debug, Clone)]
pub struct ModelCache {
    cache_dir: PathBuf,
}

impl ModelCache {
    /// Create a cache rooted at the default location
    ///
    /// - `$NOBG_CACHE_DIR/models` when set
    /// - otherwise `<platform cache dir>/nobg/models`
    ///
    /// # Errors
    /// - Failed to determine or create the cache directory
    pub fn new() -> Result<Self> {
        Self::with_custom_cache_dir(&Self::default_cache_dir()?)
    }

    /// Create the cache a model configuration asks for
    ///
    /// # Errors
    /// See [`ModelCache::new`].
    pub fn for_config(config: &ModelConfig) -> Result<Self> {
        match &config.cache_dir {
            Some(dir) => Self::with_custom_cache_dir(&dir.join("models")),
            None => Self::new(),
        }
    }

    /// Create a cache rooted at `cache_dir`
    ///
    /// # Errors
    /// - Failed to create the directory
    pub fn with_custom_cache_dir(cache_dir: &Path) -> Result<Self> {
        if !cache_dir.exists() {
            fs::create_dir_all(cache_dir).map_err(|e| {
                BgRemovalError::file_io_error("create cache directory", cache_dir, &e)
            })?;
        }
        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    fn default_cache_dir() -> Result<PathBuf> {
        if let Ok(cache_override) = std::env::var("NOBG_CACHE_DIR") {
            return Ok(PathBuf::from(cache_override).join("models"));
        }

        Ok(dirs::cache_dir()
            .ok_or_else(|| {
                BgRemovalError::invalid_config(
                    "Failed to determine cache directory. Set NOBG_CACHE_DIR environment variable.",
                )
            })?
            .join("nobg")
            .join("models"))
    }

    /// Convert a repository id into a filesystem-safe identifier
    ///
    /// ```
    /// use nobg::cache::ModelCache;
    ///
    /// assert_eq!(ModelCache::repo_to_model_id("briaai/RMBG-2.0"), "briaai--RMBG-2.0");
    /// ```
    #[must_use]
    pub fn repo_to_model_id(repo_id: &str) -> String {
        repo_id
            .trim_matches('/')
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c.to_string(),
                '/' => "--".to_string(),
                _ => "_".to_string(),
            })
            .collect()
    }

    /// Check whether a complete copy of the model is cached
    #[must_use]
    pub fn is_model_cached(&self, model_id: &str, weights_file: &str) -> bool {
        is_complete_model_dir(&self.get_model_path(model_id), weights_file)
    }

    /// Path to a cached model directory (may not exist)
    #[must_use]
    pub fn get_model_path(&self, model_id: &str) -> PathBuf {
        self.cache_dir.join(model_id)
    }

    /// List cached models, sorted by id
    ///
    /// # Errors
    /// - Failed to read the cache directory
    pub fn scan_cached_models(&self) -> Result<Vec<CachedModelInfo>> {
        let mut models = Vec::new();
        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            BgRemovalError::file_io_error("read cache directory", &self.cache_dir, &e)
        })?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() || !path.join(CONFIG_FILE).is_file() {
                continue;
            }
            let variants: Vec<String> = [("onnx/model.onnx", "fp32"), ("onnx/model_fp16.onnx", "fp16")]
                .iter()
                .filter(|(file, _)| path.join(file).is_file())
                .map(|(_, variant)| (*variant).to_string())
                .collect();
            if variants.is_empty() {
                continue;
            }
            models.push(CachedModelInfo {
                model_id: entry.file_name().to_string_lossy().into_owned(),
                size_bytes: directory_size(&path)?,
                path,
                variants,
            });
        }

        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        Ok(models)
    }

    /// Remove one cached model; returns whether it existed
    ///
    /// # Errors
    /// - Failed to remove the directory
    pub fn clear_specific_model(&self, model_id: &str) -> Result<bool> {
        let path = self.get_model_path(model_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&path)
            .map_err(|e| BgRemovalError::file_io_error("remove cached model", &path, &e))?;
        tracing::info!(model_id, "Removed cached model");
        Ok(true)
    }

    /// Root directory of this cache
    #[must_use]
    pub fn get_current_cache_dir(&self) -> &Path {
        &self.cache_dir
    }
}

fn directory_size(dir: &Path) -> Result<u64> {
    let mut total = 0;
    let entries =
        fs::read_dir(dir).map_err(|e| BgRemovalError::file_io_error("read directory", dir, &e))?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += directory_size(&path)?;
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Human-readable byte size
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS.get(unit).copied().unwrap_or("GB"))
    }
}
