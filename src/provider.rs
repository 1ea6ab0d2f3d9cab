//! Model provider: loads the segmentation model exactly once
//!
//! The first [`ModelProvider::acquire`] runs the five-stage load sequence and
//! reports progress; concurrent callers wait on the same load and every later
//! caller gets the cached [`ModelHandle`]. A failed load is not remembered,
//! so the next `acquire` starts over.

use crate::{
    backends::{BackendFactory, DefaultBackendFactory},
    cache::ModelCache,
    config::ModelConfig,
    download::{ModelDownloader, WeightsFetcher},
    error::{BgRemovalError, Result},
    inference::{ComputeTarget, InferenceBackend},
    models::{ModelDescriptor, WeightsSource},
    services::progress::{LoadProgress, LoadStage, ProgressReporter},
    tracing_config::spans,
};
use instant::Instant;
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::Instrument;

/// A loaded, inference-ready model
///
/// Cheap to clone; every clone refers to the same loaded instances. Calls to
/// [`ModelHandle::segment`] are serialized per instance, so with a pool size
/// of one at most one inference runs at a time.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    descriptor: ModelDescriptor,
    target: ComputeTarget,
    backend_name: &'static str,
    slots: Vec<Mutex<Box<dyn InferenceBackend>>>,
    next_slot: AtomicUsize,
}

impl ModelHandle {
    fn new(
        descriptor: ModelDescriptor,
        target: ComputeTarget,
        backends: Vec<Box<dyn InferenceBackend>>,
    ) -> Result<Self> {
        let backend_name = backends
            .first()
            .map(|b| b.name())
            .ok_or_else(|| BgRemovalError::model_load("No inference instances were created"))?;
        Ok(Self {
            inner: Arc::new(HandleInner {
                descriptor,
                target,
                backend_name,
                slots: backends.into_iter().map(Mutex::new).collect(),
                next_slot: AtomicUsize::new(0),
            }),
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.inner.descriptor
    }

    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.inner.descriptor.model_id
    }

    /// Where inference runs
    #[must_use]
    pub fn compute_target(&self) -> ComputeTarget {
        self.inner.target
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.inner.backend_name
    }

    /// Number of independently loaded instances
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.slots.len()
    }

    /// True when both handles come from the same load
    #[must_use]
    pub fn same_model(&self, other: &ModelHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the model and return the authoritative score map `(1, 1, H, W)`
    ///
    /// Blocks the calling thread for the duration of inference; call it from
    /// `spawn_blocking` or a worker thread.
    ///
    /// # Errors
    /// - Engine failures
    /// - A previous inference panicked while holding the slot
    pub fn segment(&self, input: &Array4<f32>) -> Result<Array4<f32>> {
        let index = self.inner.next_slot.fetch_add(1, Ordering::Relaxed) % self.inner.slots.len();
        let mut backend = self.inner.slots[index]
            .lock()
            .map_err(|_| BgRemovalError::internal("Inference slot poisoned by an earlier panic"))?;
        let output = backend.infer(input)?;
        if output.len() > 1 {
            log::trace!(
                "Model produced {} heads, using {:?}",
                output.len(),
                self.inner.descriptor.output_head
            );
        }
        output.select(self.inner.descriptor.output_head)
    }
}

/// Owns the one-time model load
#[derive(Clone)]
pub struct ModelProvider {
    inner: Arc<ProviderInner>,
}

struct ProviderInner {
    config: ModelConfig,
    factory: Arc<dyn BackendFactory>,
    fetcher: Arc<dyn WeightsFetcher>,
    cache: ModelCache,
    load_lock: tokio::sync::Mutex<()>,
    handle: OnceLock<ModelHandle>,
}

impl std::fmt::Debug for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelProvider")
            .field("model_id", &self.inner.config.model_id)
            .field("factory", &self.inner.factory)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl ModelProvider {
    /// Provider with the compiled-in backends and the `HuggingFace` downloader
    ///
    /// # Errors
    /// - Invalid configuration
    /// - Cache directory cannot be created
    /// - HTTP client cannot be built
    pub fn new(config: ModelConfig) -> Result<Self> {
        let cache = ModelCache::for_config(&config)?;
        let fetcher = ModelDownloader::for_config(&config)?;
        Self::with_components(config, Arc::new(DefaultBackendFactory), Arc::new(fetcher), cache)
    }

    /// Provider with explicit backend factory, fetcher and cache
    ///
    /// # Errors
    /// Invalid configuration.
    pub fn with_components(
        config: ModelConfig,
        factory: Arc<dyn BackendFactory>,
        fetcher: Arc<dyn WeightsFetcher>,
        cache: ModelCache,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ProviderInner {
                config,
                factory,
                fetcher,
                cache,
                load_lock: tokio::sync::Mutex::new(()),
                handle: OnceLock::new(),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.inner.config
    }

    /// The loaded handle, if a load has completed
    #[must_use]
    pub fn ready_handle(&self) -> Option<ModelHandle> {
        self.inner.handle.get().cloned()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.handle.get().is_some()
    }

    /// Return the loaded model, loading it first if needed
    ///
    /// Progress is reported only by the call that performs the load. Callers
    /// arriving while a load is in flight wait for it and share its handle.
    ///
    /// # Errors
    /// `ModelLoad` carrying the cause of whichever stage failed.
    pub async fn acquire(&self, reporter: &dyn ProgressReporter) -> Result<ModelHandle> {
        if let Some(handle) = self.ready_handle() {
            return Ok(handle);
        }

        let _guard = self.inner.load_lock.lock().await;
        if let Some(handle) = self.ready_handle() {
            return Ok(handle);
        }

        let config = &self.inner.config;
        let span = spans::model_loading(&config.model_id, &config.backend.to_string());
        let handle = self.load(reporter).instrument(span).await?;
        let _ = self.inner.handle.set(handle.clone());
        Ok(handle)
    }

    async fn load(&self, reporter: &dyn ProgressReporter) -> Result<ModelHandle> {
        let start = Instant::now();
        let config = &self.inner.config;
        let source = WeightsSource::resolve(config, &self.inner.cache);
        let remote = source.is_remote();
        log::info!("Loading model '{}' from {}", config.model_id, source);

        let report =
            |stage: LoadStage| reporter.report_progress(LoadProgress::new(stage, remote, start));
        let fail = |stage: LoadStage, e: BgRemovalError| {
            let e = e.into_model_load(stage.message(false).trim_end_matches('.'));
            reporter.report_error(stage, &e.to_string());
            e
        };
        let dir = source.model_dir().to_path_buf();

        report(LoadStage::Configuration);
        if remote {
            self.inner
                .fetcher
                .fetch_config(&config.model_id, &dir)
                .await
                .map_err(|e| fail(LoadStage::Configuration, e))?;
        }
        let descriptor = ModelDescriptor::from_model_dir(&config.model_id, &dir)
            .map_err(|e| fail(LoadStage::Configuration, e))?;

        report(LoadStage::LocateWeights);
        let weights_file = config.weights_file();
        if remote {
            self.inner
                .fetcher
                .fetch_weights(&config.model_id, weights_file, &dir)
                .await
                .map_err(|e| fail(LoadStage::LocateWeights, e))?;
        }
        let weights_path = dir.join(weights_file);
        let weights = tokio::fs::read(&weights_path).await.map_err(|e| {
            fail(
                LoadStage::LocateWeights,
                BgRemovalError::file_io_error("read model weights", &weights_path, &e),
            )
        })?;

        report(LoadStage::Architecture);
        let factory = Arc::clone(&self.inner.factory);
        let pool_size = config.pool_size.max(1);
        let (backend_type, prepare_config, prepare_descriptor) =
            (config.backend, config.clone(), descriptor.clone());
        let backends = run_blocking(move || {
            (0..pool_size)
                .map(|_| {
                    let mut backend = factory.create_backend(backend_type)?;
                    backend.prepare(&prepare_descriptor, &prepare_config)?;
                    Ok(backend)
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| fail(LoadStage::Architecture, e))?;

        report(LoadStage::BindWeights);
        let mut backends = run_blocking(move || {
            let mut backends = backends;
            for backend in &mut backends {
                backend.bind_weights(&weights)?;
            }
            Ok(backends)
        })
        .await
        .map_err(|e| fail(LoadStage::BindWeights, e))?;

        report(LoadStage::Transfer);
        let (backends, target) = run_blocking(move || {
            let mut target = ComputeTarget::Cpu;
            for (i, backend) in backends.iter_mut().enumerate() {
                let active = backend.activate()?;
                if i == 0 {
                    target = active;
                } else if active != target {
                    log::warn!("Inference instance {i} landed on {active}, first instance on {target}");
                }
            }
            Ok((backends, target))
        })
        .await
        .map_err(|e| fail(LoadStage::Transfer, e))?;

        let handle =
            ModelHandle::new(descriptor, target, backends).map_err(|e| fail(LoadStage::Transfer, e))?;
        report(LoadStage::Ready);
        log::info!(
            "Model '{}' ready on {} ({} instance(s), {}ms)",
            handle.model_id(),
            target,
            handle.pool_size(),
            start.elapsed().as_millis()
        );
        Ok(handle)
    }
}

/// Run a blocking load step on the blocking pool
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BgRemovalError::internal(format!("Load task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::test_utils::{
        write_model_dir, MockBackendFactory, MockBehavior, OfflineFetcher, CORRUPT_WEIGHTS,
    };
    use crate::services::progress::{ChannelProgressReporter, NoOpProgressReporter};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        factory: MockBackendFactory,
        fetcher: Arc<OfflineFetcher>,
        provider: ModelProvider,
    }

    fn fixture(behavior: MockBehavior, bundled_weights: Option<&[u8]>, fetcher: OfflineFetcher) -> Fixture {
        let dir = TempDir::new().unwrap();
        let bundled = dir.path().join("bundled");
        if let Some(weights) = bundled_weights {
            write_model_dir(&bundled, weights);
        }
        let config = ModelConfig::builder()
            .bundled_dir(&bundled)
            .cache_dir(dir.path().join("cache"))
            .build()
            .unwrap();
        let cache = ModelCache::for_config(&config).unwrap();
        let factory = MockBackendFactory::new(behavior);
        let fetcher = Arc::new(fetcher);
        let provider = ModelProvider::with_components(
            config,
            Arc::new(factory.clone()),
            Arc::clone(&fetcher) as Arc<dyn WeightsFetcher>,
            cache,
        )
        .unwrap();
        Fixture {
            _dir: dir,
            factory,
            fetcher,
            provider,
        }
    }

    #[tokio::test]
    async fn test_acquire_reports_every_stage() {
        let fx = fixture(MockBehavior::default(), Some(b"weights"), OfflineFetcher::default());
        let (reporter, mut rx) = ChannelProgressReporter::channel(16);

        let handle = fx.provider.acquire(&reporter).await.unwrap();
        assert_eq!(handle.compute_target(), ComputeTarget::Cpu);
        assert_eq!(handle.descriptor().preprocessing.target_size, [64, 64]);
        drop(reporter);

        let mut updates = Vec::new();
        while let Some(update) = rx.recv().await {
            updates.push(update);
        }
        let fractions: Vec<f32> = updates.iter().map(|u| u.fraction).collect();
        assert_eq!(fractions, vec![0.1, 0.3, 0.5, 0.7, 0.9, 1.0]);
        assert_eq!(updates[0].message, "Loading configuration...");
        assert_eq!(updates.last().unwrap().message, "Ready!");
        assert_eq!(fx.fetcher.fetches(), 0);
    }

    #[tokio::test]
    async fn test_acquire_is_idempotent() {
        let fx = fixture(MockBehavior::default(), Some(b"weights"), OfflineFetcher::default());
        let first = fx.provider.acquire(&NoOpProgressReporter).await.unwrap();

        let (reporter, mut rx) = ChannelProgressReporter::channel(16);
        let second = fx.provider.acquire(&reporter).await.unwrap();
        drop(reporter);

        assert!(first.same_model(&second));
        assert!(rx.recv().await.is_none());
        assert_eq!(fx.factory.stats.created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_loads_once() {
        let fx = fixture(MockBehavior::default(), Some(b"weights"), OfflineFetcher::default());
        let a = fx.provider.clone();
        let b = fx.provider.clone();
        let (ha, hb) = tokio::join!(
            async move { a.acquire(&NoOpProgressReporter).await },
            async move { b.acquire(&NoOpProgressReporter).await }
        );
        assert!(ha.unwrap().same_model(&hb.unwrap()));
        assert_eq!(fx.factory.stats.created(), 1);
    }

    #[tokio::test]
    async fn test_remote_source_uses_fetcher() {
        let fx = fixture(MockBehavior::default(), None, OfflineFetcher::default());
        let (reporter, mut rx) = ChannelProgressReporter::channel(16);
        fx.provider.acquire(&reporter).await.unwrap();
        drop(reporter);

        assert_eq!(fx.fetcher.fetches(), 2);
        assert_eq!(rx.recv().await.unwrap().message, "Downloading configuration...");
        assert_eq!(rx.recv().await.unwrap().message, "Downloading model weights...");
    }

    #[tokio::test]
    async fn test_network_failure_is_model_load_and_retryable() {
        let fx = fixture(MockBehavior::default(), None, OfflineFetcher::failing());
        let err = fx.provider.acquire(&NoOpProgressReporter).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad(_)));
        assert!(err.to_string().contains("connection refused"));
        assert!(!fx.provider.is_ready());

        let again = fx.provider.acquire(&NoOpProgressReporter).await.unwrap_err();
        assert!(matches!(again, BgRemovalError::ModelLoad(_)));
        assert_eq!(fx.fetcher.fetches(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_weights_fail_at_bind_stage() {
        let fx = fixture(MockBehavior::default(), Some(CORRUPT_WEIGHTS), OfflineFetcher::default());
        let (reporter, mut rx) = ChannelProgressReporter::channel(16);
        let err = fx.provider.acquire(&reporter).await.unwrap_err();
        drop(reporter);

        assert!(matches!(err, BgRemovalError::ModelLoad(_)));
        assert!(err.to_string().contains("size mismatch"));
        let mut last = None;
        while let Some(update) = rx.recv().await {
            last = Some(update.stage);
        }
        assert_eq!(last, Some(LoadStage::BindWeights));
    }

    #[tokio::test]
    async fn test_architecture_failure_is_model_load() {
        let fx = fixture(
            MockBehavior {
                fail_prepare: true,
                ..MockBehavior::default()
            },
            Some(b"weights"),
            OfflineFetcher::default(),
        );
        let err = fx.provider.acquire(&NoOpProgressReporter).await.unwrap_err();
        assert!(matches!(err, BgRemovalError::ModelLoad(_)));
        assert!(fx.provider.ready_handle().is_none());
    }

    #[tokio::test]
    async fn test_segment_selects_last_head() {
        let fx = fixture(
            MockBehavior {
                extra_heads: 3,
                ..MockBehavior::default()
            },
            Some(b"weights"),
            OfflineFetcher::default(),
        );
        let handle = fx.provider.acquire(&NoOpProgressReporter).await.unwrap();
        let map = handle.segment(&Array4::zeros((1, 3, 64, 64))).unwrap();
        assert_eq!(map.dim(), (1, 1, 64, 64));
        assert!(map[[0, 0, 32, 32]] > 0.0);
    }

    #[tokio::test]
    async fn test_pool_creates_one_instance_per_slot() {
        let dir = TempDir::new().unwrap();
        write_model_dir(&dir.path().join("m"), b"weights");
        let config = ModelConfig::builder()
            .bundled_dir(dir.path().join("m"))
            .cache_dir(dir.path().join("cache"))
            .pool_size(3)
            .build()
            .unwrap();
        let factory = MockBackendFactory::default();
        let provider = ModelProvider::with_components(
            config.clone(),
            Arc::new(factory.clone()),
            Arc::new(OfflineFetcher::default()),
            ModelCache::for_config(&config).unwrap(),
        )
        .unwrap();

        let handle = provider.acquire(&NoOpProgressReporter).await.unwrap();
        assert_eq!(handle.pool_size(), 3);
        assert_eq!(factory.stats.created(), 3);
        for _ in 0..6 {
            handle.segment(&Array4::zeros((1, 3, 64, 64))).unwrap();
        }
        assert_eq!(factory.stats.inferences(), 6);
    }
}
