//! Removal orchestration for single images and batches
//!
//! [`RemovalService`] wraps a loaded [`ModelHandle`] and runs
//! decode → preprocess → inference → mask → composite off the async threads.
//! It also owns the response contracts: the single-image result (binary or
//! base64, mask forces base64) and the batch archive.

use crate::{
    codec::ImageCodec,
    config::OutputFormat,
    error::{BgRemovalError, Result},
    provider::ModelHandle,
    services::format::{encode_base64, OutputFormatHandler},
    types::{ProcessingTimings, RemovalResult},
};
use image::DynamicImage;
use instant::Instant;
use serde::Serialize;
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

/// Prefix of composite entries and filenames
pub const RESULT_PREFIX: &str = "no_bg_";
/// Prefix of mask entries
pub const MASK_PREFIX: &str = "mask_";

/// How a single-image result should be serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleEncoding {
    /// Raw image bytes, unless a mask was requested
    Binary,
    /// Always the JSON/base64 form
    Base64,
}

/// Serialized single-image result
#[derive(Debug, Clone, PartialEq)]
pub enum SingleResponse {
    /// Encoded image with its content type
    Binary {
        bytes: Vec<u8>,
        content_type: &'static str,
    },
    /// Text-safe form
    Encoded(EncodedResult),
}

/// Base64 payload of a single-image result
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncodedResult {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<String>,
    pub format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// One named input of a batch
#[derive(Debug, Clone)]
pub struct BatchItem {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl BatchItem {
    pub fn new<S: Into<String>>(name: S, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

/// An input that did not make it into the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedItem {
    pub name: String,
    pub reason: String,
}

/// Zip archive produced by [`RemovalService::remove_batch`]
#[derive(Debug, Clone)]
pub struct BatchArchive {
    pub bytes: Vec<u8>,
    /// Entry names in archive order
    pub entries: Vec<String>,
    pub processed: usize,
    pub skipped: Vec<SkippedItem>,
}

/// Background removal against one loaded model
#[derive(Debug, Clone)]
pub struct RemovalService {
    handle: ModelHandle,
    codec: ImageCodec,
    inference_timeout: Option<Duration>,
}

impl RemovalService {
    #[must_use]
    pub fn new(handle: ModelHandle) -> Self {
        let codec = ImageCodec::new(handle.descriptor().preprocessing);
        Self {
            handle,
            codec,
            inference_timeout: None,
        }
    }

    /// Bound every removal by `timeout`
    ///
    /// An expired removal reports `Timeout`; the blocked inference finishes
    /// in the background and its result is discarded.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.inference_timeout = timeout;
        self
    }

    #[must_use]
    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Remove the background from a decoded image on the calling thread
    ///
    /// # Errors
    /// Inference or postprocessing failures.
    pub fn remove_one_blocking(&self, image: &DynamicImage, want_mask: bool) -> Result<RemovalResult> {
        let start = Instant::now();
        let original_size = (image.width(), image.height());

        let tensor = self.codec.preprocess(image)?;
        let preprocessing_ms = start.elapsed().as_millis() as u64;

        let inference_start = Instant::now();
        let scores = self.handle.segment(&tensor)?;
        let inference_ms = inference_start.elapsed().as_millis() as u64;

        let post_start = Instant::now();
        let mask = self.codec.postprocess_mask(&scores, original_size)?;
        let composite = ImageCodec::composite(image, &mask)?;
        let postprocessing_ms = post_start.elapsed().as_millis() as u64;

        let timings = ProcessingTimings {
            preprocessing_ms,
            inference_ms,
            postprocessing_ms,
            total_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            width = original_size.0,
            height = original_size.1,
            foreground = mask.statistics().foreground_ratio,
            inference_share = timings.inference_ratio(),
            total_ms = timings.total_ms,
            "Removed background"
        );

        Ok(RemovalResult {
            composite,
            mask: want_mask.then_some(mask),
            timings,
        })
    }

    /// Decode `bytes` and remove the background off the async threads
    ///
    /// # Errors
    /// - `Decode` for unreadable input
    /// - `Timeout` when the configured bound expires
    /// - Inference failures
    pub async fn remove_one(&self, bytes: Vec<u8>, want_mask: bool) -> Result<RemovalResult> {
        let service = self.clone();
        self.run_bounded(move || {
            let image = ImageCodec::decode(&bytes)?;
            service.remove_one_blocking(&image, want_mask)
        })
        .await
    }

    /// Process one upload and serialize it per the single-image contract
    ///
    /// A requested mask always yields the encoded form; `filename` is only
    /// reported there.
    ///
    /// # Errors
    /// See [`RemovalService::remove_one`]; encoder failures.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn remove_single(
        &self,
        bytes: Vec<u8>,
        want_mask: bool,
        format: OutputFormat,
        encoding: SingleEncoding,
        source_name: Option<&str>,
    ) -> Result<SingleResponse> {
        let result = self.remove_one(bytes, want_mask).await?;
        let encoded = run_blocking(move || {
            let image = result.encode(format)?;
            let mask = if want_mask {
                Some(result.encode_mask()?)
            } else {
                None
            };
            Ok((image, mask))
        })
        .await?;

        match (encoded, encoding) {
            ((bytes, None), SingleEncoding::Binary) => Ok(SingleResponse::Binary {
                bytes,
                content_type: OutputFormatHandler::mime_type(format),
            }),
            ((bytes, mask), _) => Ok(SingleResponse::Encoded(EncodedResult {
                result: encode_base64(&bytes),
                mask: mask.as_deref().map(encode_base64),
                format: format.as_str(),
                filename: source_name.map(|name| result_name(name, format)),
            })),
        }
    }

    /// Process a batch in input order into a Deflate zip
    ///
    /// Items that fail (decode, inference) are skipped and logged; the call
    /// itself only fails when the archive cannot be written.
    ///
    /// # Errors
    /// Archive encoding failures.
    #[instrument(skip_all, fields(items = items.len(), format = format.as_str()))]
    pub async fn remove_batch(
        &self,
        items: Vec<BatchItem>,
        want_mask: bool,
        format: OutputFormat,
    ) -> Result<BatchArchive> {
        let start = Instant::now();
        let mut names = UniqueNames::default();
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        let mut skipped = Vec::new();
        let mut processed = 0;

        for item in items {
            let outcome = match self.remove_one(item.bytes, want_mask).await {
                Ok(result) => {
                    run_blocking(move || {
                        let image = result.encode(format)?;
                        let mask = if want_mask {
                            Some(result.encode_mask()?)
                        } else {
                            None
                        };
                        Ok((image, mask))
                    })
                    .await
                },
                Err(e) => Err(e),
            };

            match outcome {
                Ok((image, mask)) => {
                    let stem = names.claim(&base_name(&item.name));
                    files.push((
                        format!("{RESULT_PREFIX}{stem}.{}", OutputFormatHandler::get_extension(format)),
                        image,
                    ));
                    if let Some(mask) = mask {
                        files.push((format!("{MASK_PREFIX}{stem}.png"), mask));
                    }
                    processed += 1;
                },
                Err(e) => {
                    warn!(name = %item.name, error = %e, "Skipping batch item");
                    skipped.push(SkippedItem {
                        name: item.name,
                        reason: e.to_string(),
                    });
                },
            }
        }

        let entries: Vec<String> = files.iter().map(|(name, _)| name.clone()).collect();
        let bytes = run_blocking(move || write_zip(&files)).await?;
        info!(
            processed,
            skipped = skipped.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Batch complete"
        );

        Ok(BatchArchive {
            bytes,
            entries,
            processed,
            skipped,
        })
    }

    async fn run_bounded<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.inference_timeout {
            Some(limit) => tokio::time::timeout(limit, run_blocking(f))
                .await
                .map_err(|_| BgRemovalError::Timeout(limit))?,
            None => run_blocking(f).await,
        }
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BgRemovalError::internal(format!("Processing task failed: {e}")))?
}

fn write_zip(files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (name, data) in files {
        zip.start_file(name.as_str(), options)
            .map_err(|e| BgRemovalError::processing(format!("Failed to add {name} to archive: {e}")))?;
        zip.write_all(data)?;
    }
    let cursor = zip
        .finish()
        .map_err(|e| BgRemovalError::processing(format!("Failed to finish archive: {e}")))?;
    Ok(cursor.into_inner())
}

/// File stem of an upload name, without any directory part
#[must_use]
pub fn base_name(name: &str) -> String {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    if stem.is_empty() {
        "image".to_string()
    } else {
        stem.to_string()
    }
}

/// `no_bg_<stem>.<ext>` for an upload name
#[must_use]
pub fn result_name(name: &str, format: OutputFormat) -> String {
    format!(
        "{RESULT_PREFIX}{}.{}",
        base_name(name),
        OutputFormatHandler::get_extension(format)
    )
}

/// Hands out stems that are unique within one archive
#[derive(Debug, Default)]
struct UniqueNames {
    used: HashSet<String>,
}

impl UniqueNames {
    fn claim(&mut self, stem: &str) -> String {
        let mut candidate = stem.to_string();
        let mut n = 1;
        while !self.used.insert(candidate.clone()) {
            candidate = format!("{stem}_{n}");
            n += 1;
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{
        png_bytes, write_model_dir, MockBackendFactory, MockBehavior, OfflineFetcher,
    };
    use crate::cache::ModelCache;
    use crate::config::ModelConfig;
    use crate::provider::ModelProvider;
    use crate::services::progress::NoOpProgressReporter;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn service(behavior: MockBehavior) -> (TempDir, RemovalService) {
        let dir = TempDir::new().unwrap();
        write_model_dir(&dir.path().join("model"), b"weights");
        let config = ModelConfig::builder()
            .bundled_dir(dir.path().join("model"))
            .cache_dir(dir.path().join("cache"))
            .build()
            .unwrap();
        let provider = ModelProvider::with_components(
            config.clone(),
            Arc::new(MockBackendFactory::new(behavior)),
            Arc::new(OfflineFetcher::default()),
            ModelCache::for_config(&config).unwrap(),
        )
        .unwrap();
        let handle = provider.acquire(&NoOpProgressReporter).await.unwrap();
        (dir, RemovalService::new(handle))
    }

    fn zip_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_composite_keeps_original_size() {
        let (_dir, service) = service(MockBehavior::default()).await;
        let result = service.remove_one(png_bytes(120, 45), true).await.unwrap();
        assert_eq!(result.dimensions(), (120, 45));
        let mask = result.mask.unwrap();
        assert_eq!(mask.dimensions, (120, 45));

        let alphas: Vec<u8> = result.composite.pixels().map(|p| p[3]).collect();
        assert!(alphas.iter().any(|&a| a > 200));
        assert!(alphas.iter().any(|&a| a < 50));
    }

    #[tokio::test]
    async fn test_multi_head_uses_last_output() {
        let (_dir, service) = service(MockBehavior {
            extra_heads: 2,
            ..MockBehavior::default()
        })
        .await;
        let result = service.remove_one(png_bytes(64, 64), false).await.unwrap();
        assert!(result.mask.is_none());
        assert!(result.composite.get_pixel(32, 32)[3] > 200);
    }

    #[tokio::test]
    async fn test_corrupt_input_is_decode_error() {
        let (_dir, service) = service(MockBehavior::default()).await;
        let err = service.remove_one(b"garbage".to_vec(), false).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::Decode(_)));
    }

    #[tokio::test]
    async fn test_single_binary_and_mask_forces_encoded() {
        let (_dir, service) = service(MockBehavior::default()).await;

        let binary = service
            .remove_single(png_bytes(20, 20), false, OutputFormat::Png, SingleEncoding::Binary, Some("cat.png"))
            .await
            .unwrap();
        assert!(matches!(
            binary,
            SingleResponse::Binary { content_type: "image/png", .. }
        ));

        let with_mask = service
            .remove_single(png_bytes(20, 20), true, OutputFormat::Jpeg, SingleEncoding::Binary, Some("cat.png"))
            .await
            .unwrap();
        match with_mask {
            SingleResponse::Encoded(encoded) => {
                assert!(encoded.mask.is_some());
                assert_eq!(encoded.format, "jpeg");
                assert_eq!(encoded.filename.as_deref(), Some("no_bg_cat.jpg"));
            },
            SingleResponse::Binary { .. } => panic!("mask must force the encoded form"),
        }
    }

    #[tokio::test]
    async fn test_batch_skips_failures_in_order() {
        let (_dir, service) = service(MockBehavior::default()).await;
        let items = vec![
            BatchItem::new("b.png", png_bytes(16, 16)),
            BatchItem::new("broken.png", b"nope".to_vec()),
            BatchItem::new("a.jpg", png_bytes(10, 12)),
        ];
        let archive = service.remove_batch(items, true, OutputFormat::Png).await.unwrap();

        assert_eq!(archive.processed, 2);
        assert_eq!(archive.skipped.len(), 1);
        assert_eq!(archive.skipped[0].name, "broken.png");
        assert_eq!(
            zip_names(&archive.bytes),
            vec!["no_bg_b.png", "mask_b.png", "no_bg_a.png", "mask_a.png"]
        );
        assert_eq!(zip_names(&archive.bytes), archive.entries);
    }

    #[tokio::test]
    async fn test_batch_survives_inference_failures() {
        let (_dir, service) = service(MockBehavior {
            fail_infer: true,
            ..MockBehavior::default()
        })
        .await;
        let items = vec![
            BatchItem::new("one.png", png_bytes(8, 8)),
            BatchItem::new("two.png", png_bytes(8, 8)),
        ];
        let archive = service.remove_batch(items, true, OutputFormat::Png).await.unwrap();

        assert_eq!(archive.processed, 0);
        let skipped: Vec<&str> = archive.skipped.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(skipped, vec!["one.png", "two.png"]);
        assert!(archive.skipped.iter().all(|s| s.reason.contains("Mock inference failed")));
        assert!(archive.entries.is_empty());
        assert!(zip_names(&archive.bytes).is_empty());

        let err = service.remove_one(png_bytes(8, 8), false).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::Inference(_)));
    }

    #[tokio::test]
    async fn test_batch_names_are_unique() {
        let (_dir, service) = service(MockBehavior::default()).await;
        let items = vec![
            BatchItem::new("x/photo.png", png_bytes(8, 8)),
            BatchItem::new("y/photo.png", png_bytes(8, 8)),
        ];
        let archive = service.remove_batch(items, false, OutputFormat::Jpeg).await.unwrap();
        assert_eq!(zip_names(&archive.bytes), vec!["no_bg_photo.jpg", "no_bg_photo_1.jpg"]);
    }

    #[tokio::test]
    async fn test_timeout_reported() {
        let (_dir, service) = service(MockBehavior {
            infer_delay: Duration::from_millis(300),
            ..MockBehavior::default()
        })
        .await;
        let service = service.with_timeout(Some(Duration::from_millis(20)));
        let err = service.remove_one(png_bytes(8, 8), false).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::Timeout(_)));
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("photo.final.png"), "photo.final");
        assert_eq!(base_name("dir/sub\\img.jpeg"), "img");
        assert_eq!(base_name(""), "image");
        assert_eq!(result_name("cat.webp", OutputFormat::Png), "no_bg_cat.png");
    }
}
