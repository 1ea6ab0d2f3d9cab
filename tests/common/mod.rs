//! Shared setup for integration tests: a provider backed by mock inference

#![allow(dead_code)]

use nobg::backends::test_utils::{
    write_model_dir, MockBackendFactory, MockBehavior, MockStats, OfflineFetcher,
};
use nobg::services::progress::NoOpProgressReporter;
use nobg::{ModelCache, ModelConfig, ModelHandle, ModelProvider};
use std::sync::Arc;
use tempfile::TempDir;

/// Provider with bundled mock weights, not yet loaded
pub fn provider(behavior: MockBehavior) -> (TempDir, ModelProvider) {
    let (dir, provider, _stats) = provider_with_stats(behavior);
    (dir, provider)
}

/// Like [`provider`], also returning the counters of every mock it creates
pub fn provider_with_stats(behavior: MockBehavior) -> (TempDir, ModelProvider, Arc<MockStats>) {
    let factory = MockBackendFactory::new(behavior);
    let stats = Arc::clone(&factory.stats);
    let dir = TempDir::new().unwrap();
    write_model_dir(&dir.path().join("model"), b"mock-weights");
    let config = ModelConfig::builder()
        .bundled_dir(dir.path().join("model"))
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();
    let provider = ModelProvider::with_components(
        config.clone(),
        Arc::new(factory),
        Arc::new(OfflineFetcher::default()),
        ModelCache::for_config(&config).unwrap(),
    )
    .unwrap();
    (dir, provider, stats)
}

/// Provider that has finished loading, plus its handle
pub async fn loaded(behavior: MockBehavior) -> (TempDir, ModelProvider, ModelHandle) {
    let (dir, provider) = provider(behavior);
    let handle = provider.acquire(&NoOpProgressReporter).await.unwrap();
    (dir, provider, handle)
}
