use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nobg::backends::test_utils::{
    png_bytes, test_image, write_model_dir, MockBackend, MockBackendFactory, MockBehavior,
    OfflineFetcher,
};
use nobg::services::progress::NoOpProgressReporter;
use nobg::{ImageCodec, ModelCache, ModelConfig, ModelProvider, OutputFormat, RemovalService};
use std::sync::Arc;
use tokio::runtime::Runtime;

const SIZES: [(u32, u32); 3] = [(320, 240), (1280, 720), (2048, 1536)];

fn benchmark_preprocess(c: &mut Criterion) {
    let codec = ImageCodec::default();
    let mut group = c.benchmark_group("preprocess");
    group.sample_size(20);

    for (width, height) in SIZES {
        let image = test_image(width, height);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{height}")),
            &image,
            |b, image| b.iter(|| codec.preprocess(black_box(image))),
        );
    }
    group.finish();
}

fn benchmark_postprocess(c: &mut Criterion) {
    let codec = ImageCodec::default();
    let scores = MockBackend::ellipse_logits(1024, 1024);
    let mut group = c.benchmark_group("postprocess_mask");
    group.sample_size(20);

    for (width, height) in SIZES {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{width}x{height}")),
            &(width, height),
            |b, &size| b.iter(|| codec.postprocess_mask(black_box(&scores), size)),
        );
    }
    group.finish();
}

fn benchmark_composite_and_encode(c: &mut Criterion) {
    let codec = ImageCodec::default();
    let image = test_image(1280, 720);
    let mask = codec
        .postprocess_mask(&MockBackend::ellipse_logits(1024, 1024), (1280, 720))
        .unwrap();

    c.bench_function("composite_1280x720", |b| {
        b.iter(|| ImageCodec::composite(black_box(&image), black_box(&mask)))
    });

    let composite = ImageCodec::composite(&image, &mask).unwrap();
    let mut group = c.benchmark_group("encode_1280x720");
    group.sample_size(10);
    for format in [OutputFormat::Png, OutputFormat::Jpeg] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format.as_str()),
            &format,
            |b, &format| b.iter(|| nobg::OutputFormatHandler::encode(black_box(&composite), format)),
        );
    }
    group.finish();
}

fn benchmark_remove_one(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = tempfile::TempDir::new().unwrap();
    write_model_dir(&dir.path().join("model"), b"bench-weights");
    let config = ModelConfig::builder()
        .bundled_dir(dir.path().join("model"))
        .cache_dir(dir.path().join("cache"))
        .build()
        .unwrap();
    let provider = ModelProvider::with_components(
        config.clone(),
        Arc::new(MockBackendFactory::new(MockBehavior::default())),
        Arc::new(OfflineFetcher::default()),
        ModelCache::for_config(&config).unwrap(),
    )
    .unwrap();
    let handle = rt.block_on(provider.acquire(&NoOpProgressReporter)).unwrap();
    let service = RemovalService::new(handle);
    let input = png_bytes(640, 480);

    c.bench_function("remove_one_mock_640x480", |b| {
        b.iter(|| rt.block_on(service.remove_one(black_box(input.clone()), false)))
    });
}

criterion_group!(
    benches,
    benchmark_preprocess,
    benchmark_postprocess,
    benchmark_composite_and_encode,
    benchmark_remove_one
);
criterion_main!(benches);
