//! Model downloading from `HuggingFace` repositories
//!
//! Files are streamed to a `.part` sibling and renamed into place once
//! complete, so an interrupted download never looks like a usable cache entry.

use crate::config::ModelConfig;
use crate::error::{BgRemovalError, Result};
use crate::models::{CONFIG_FILE, PREPROCESSOR_FILE};
use async_trait::async_trait;
use futures_util::stream::TryStreamExt;
#[cfg(feature = "cli")]
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::io::StreamReader;

const HF_BASE: &str = "https://huggingface.co/";

/// Network tier of the weight lookup
///
/// The provider only talks to this trait, so tests can substitute an
/// offline fetcher.
#[async_trait]
pub trait WeightsFetcher: Send + Sync {
    /// Fetch `config.json` (required) and `preprocessor_config.json`
    /// (when the repository has one) into `dest`
    async fn fetch_config(&self, repo_id: &str, dest: &Path) -> Result<()>;

    /// Fetch the ONNX graph `weights_file` into `dest`
    async fn fetch_weights(&self, repo_id: &str, weights_file: &str, dest: &Path) -> Result<()>;
}

/// Progress bar abstraction that works with and without CLI features
#[derive(Debug)]
pub enum ProgressIndicator {
    #[cfg(feature = "cli")]
    Indicatif(ProgressBar),
    NoOp,
}

impl ProgressIndicator {
    /// Byte progress bar when the CLI is compiled in and `visible` is set
    #[must_use]
    pub fn bytes(visible: bool) -> Self {
        #[cfg(feature = "cli")]
        {
            if visible {
                let pb = ProgressBar::new(0);
                if let Ok(style) = ProgressStyle::default_bar().template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                ) {
                    pb.set_style(style.progress_chars("#>-"));
                }
                return Self::Indicatif(pb);
            }
        }
        let _ = visible;
        Self::NoOp
    }

    pub fn set_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }

    pub fn set_length(&self, len: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_length(len),
            Self::NoOp => {
                let _ = len;
            },
        }
    }

    pub fn set_position(&self, pos: u64) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.set_position(pos),
            Self::NoOp => {
                let _ = pos;
            },
        }
    }

    pub fn finish_with_message(&self, msg: String) {
        match self {
            #[cfg(feature = "cli")]
            Self::Indicatif(pb) => pb.finish_with_message(msg),
            Self::NoOp => {
                let _ = msg;
            },
        }
    }
}

/// Model downloader backed by `reqwest`
#[derive(Debug)]
pub struct ModelDownloader {
    client: Client,
    token: Option<String>,
    progress: ProgressIndicator,
}

impl ModelDownloader {
    /// Create a downloader without progress output
    ///
    /// # Errors
    /// - Failed to create HTTP client
    pub fn new(token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .user_agent(concat!("nobg/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BgRemovalError::network_error("Failed to create HTTP client", e))?;

        Ok(Self {
            client,
            token,
            progress: ProgressIndicator::NoOp,
        })
    }

    /// Downloader configured from a model config (token taken from it)
    ///
    /// # Errors
    /// See [`ModelDownloader::new`].
    pub fn for_config(config: &ModelConfig) -> Result<Self> {
        Self::new(config.hf_token.clone())
    }

    /// Show a byte progress bar while fetching weights
    #[must_use]
    pub fn with_progress(mut self, visible: bool) -> Self {
        self.progress = ProgressIndicator::bytes(visible);
        self
    }

    /// Fetch config and weights for `config` into `dest`
    ///
    /// # Errors
    /// Any network or filesystem failure.
    pub async fn download_model(&self, config: &ModelConfig, dest: &Path) -> Result<()> {
        self.fetch_config(&config.model_id, dest).await?;
        self.fetch_weights(&config.model_id, config.weights_file(), dest)
            .await?;
        self.progress
            .finish_with_message(format!("Downloaded {}", config.model_id));
        Ok(())
    }

    fn file_url(repo_id: &str, file: &str) -> String {
        format!("{HF_BASE}{repo_id}/resolve/main/{file}")
    }

    /// Download a single file; `Ok(false)` when the server reports 404
    async fn download_file(&self, url: &str, local_path: &Path, track: bool) -> Result<bool> {
        tracing::debug!(url, path = %local_path.display(), "Downloading");

        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| BgRemovalError::file_io_error("create directory", parent, &e))?;
        }

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BgRemovalError::network_error(format!("Failed to download {url}"), e))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BgRemovalError::network_error(
                    format!("Access denied for {url}"),
                    "repository is gated; set HF_TOKEN",
                ));
            },
            status if !status.is_success() => {
                return Err(BgRemovalError::network_error(
                    format!("HTTP error for {url}"),
                    status,
                ));
            },
            _ => {},
        }

        let total_size = response.content_length();
        if track {
            if let Some(total) = total_size {
                self.progress.set_length(total);
            }
        }

        let part_path = part_path(local_path);
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .map_err(|e| BgRemovalError::file_io_error("create file", &part_path, &e))?;

        let mut stream = StreamReader::new(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );

        let mut downloaded = 0u64;
        let mut buffer = vec![0; 64 * 1024];
        loop {
            let bytes_read = stream
                .read(&mut buffer)
                .await
                .map_err(|e| BgRemovalError::network_error("Failed to read download stream", e))?;
            if bytes_read == 0 {
                break;
            }
            file.write_all(buffer.get(..bytes_read).unwrap_or(&[]))
                .await
                .map_err(|e| BgRemovalError::file_io_error("write to file", &part_path, &e))?;
            downloaded += bytes_read as u64;
            if track {
                self.progress.set_position(downloaded);
            }
        }

        file.flush()
            .await
            .map_err(|e| BgRemovalError::file_io_error("flush file", &part_path, &e))?;
        drop(file);

        fs::rename(&part_path, local_path)
            .map_err(|e| BgRemovalError::file_io_error("move download into place", local_path, &e))?;

        tracing::debug!(bytes = downloaded, path = %local_path.display(), "Download complete");
        Ok(true)
    }
}

#[async_trait]
impl WeightsFetcher for ModelDownloader {
    async fn fetch_config(&self, repo_id: &str, dest: &Path) -> Result<()> {
        let url = Self::file_url(repo_id, CONFIG_FILE);
        if !self.download_file(&url, &dest.join(CONFIG_FILE), false).await? {
            return Err(BgRemovalError::network_error(
                format!("Repository {repo_id} has no {CONFIG_FILE}"),
                StatusCode::NOT_FOUND,
            ));
        }

        let url = Self::file_url(repo_id, PREPROCESSOR_FILE);
        if !self
            .download_file(&url, &dest.join(PREPROCESSOR_FILE), false)
            .await?
        {
            tracing::debug!(repo_id, "No {PREPROCESSOR_FILE}, using default preprocessing");
        }
        Ok(())
    }

    async fn fetch_weights(&self, repo_id: &str, weights_file: &str, dest: &Path) -> Result<()> {
        let url = Self::file_url(repo_id, weights_file);
        self.progress.set_message(format!("Downloading {weights_file}"));
        if !self.download_file(&url, &dest.join(weights_file), true).await? {
            return Err(BgRemovalError::network_error(
                format!("Repository {repo_id} has no {weights_file}"),
                StatusCode::NOT_FOUND,
            ));
        }
        Ok(())
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

/// SHA-256 of a file as lowercase hex
///
/// # Errors
/// - Failed to read the file
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .map_err(|e| BgRemovalError::file_io_error("open file for hashing", path, &e))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| BgRemovalError::file_io_error("hash file", path, &e))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a file against an expected SHA-256 digest
///
/// # Errors
/// - Failed to read the file
pub fn verify_file_integrity(path: &Path, expected: &str) -> Result<bool> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(true)
    } else {
        tracing::warn!(
            path = %path.display(),
            expected,
            actual,
            "File integrity check failed"
        );
        Ok(false)
    }
}

/// Validate a `HuggingFace` repository id (`owner/name`)
///
/// # Errors
/// Anything not shaped like `owner/name`.
pub fn validate_repo_id(repo_id: &str) -> Result<()> {
    let parts: Vec<&str> = repo_id.split('/').collect();
    match parts.as_slice() {
        [owner, name] if !owner.is_empty() && !name.is_empty() => Ok(()),
        _ => Err(BgRemovalError::invalid_config(format!(
            "Invalid HuggingFace repository id: '{repo_id}'. Expected owner/name"
        ))),
    }
}
