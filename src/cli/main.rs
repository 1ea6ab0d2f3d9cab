//! `nobg` command-line tool
//!
//! Subcommands:
//! - `serve`: load the model, then expose the HTTP endpoints
//! - `process`: run local files through the job queue
//! - `download`: fetch the model into the cache without processing
//! - `providers`: show which backends and execution providers work here
//! - `cache`: list or clear cached models

use super::config::CliConfigBuilder;
use crate::{
    backends::{cuda_available, list_providers, DefaultBackendFactory},
    cache::{format_size, ModelCache},
    config::ModelConfig,
    download::{sha256_file, verify_file_integrity, ModelDownloader},
    provider::{ModelHandle, ModelProvider},
    queue::{JobQueue, JobStatus, QueueEvent, RunHandle},
    server::ServiceToggle,
    service::RemovalService,
    services::progress::{LoadProgress, LoadStage, ProgressReporter},
    tracing_config::{TracingConfig, TracingFormat},
};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};

const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "bmp", "tiff", "tif"];

/// Background removal service and batch tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(name = "nobg")]
pub struct Cli {
    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log format: console or compact (json with the tracing-json feature)
    #[arg(long, global = true, default_value = "console")]
    pub log_format: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load the model and serve the HTTP API
    Serve {
        #[command(flatten)]
        model: ModelArgs,
        #[command(flatten)]
        server: ServeArgs,
    },
    /// Remove backgrounds from local files
    Process(ProcessArgs),
    /// Download the model into the cache
    Download {
        #[command(flatten)]
        model: ModelArgs,
        /// Expected SHA-256 of the weights file
        #[arg(long, value_name = "HEX")]
        sha256: Option<String>,
    },
    /// Show backend and execution provider availability
    Providers,
    /// Inspect or clear the model cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
        /// Use a custom cache directory
        #[arg(long, value_name = "PATH")]
        cache_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cached models
    List,
    /// Remove a cached model, or every cached model with --all
    Clear {
        /// Repository id of the model to remove
        #[arg(long, conflicts_with = "all")]
        model: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Print the cache directory
    Dir,
}

/// Model selection shared by every command that loads weights
#[derive(Args, Debug, Default, Clone)]
pub struct ModelArgs {
    /// HuggingFace repository id [env: NOBG_MODEL_ID]
    #[arg(short, long)]
    pub model: Option<String>,

    /// Directory holding bundled weights [env: NOBG_MODEL_DIR]
    #[arg(long, value_name = "PATH")]
    pub model_dir: Option<PathBuf>,

    /// Download cache root [env: NOBG_CACHE_DIR]
    #[arg(long, value_name = "PATH")]
    pub cache_dir: Option<PathBuf>,

    /// Inference engine: onnx or tract [env: NOBG_BACKEND]
    #[arg(long)]
    pub backend: Option<String>,

    /// Execution provider: auto, cpu, cuda, coreml [env: NOBG_EXECUTION_PROVIDER]
    #[arg(short, long)]
    pub execution_provider: Option<String>,

    /// Weights variant: fp32 or fp16 [env: NOBG_VARIANT]
    #[arg(long)]
    pub variant: Option<String>,

    /// Inference threads, 0 for automatic [env: NOBG_THREADS]
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Independent inference instances [env: NOBG_POOL_SIZE]
    #[arg(long)]
    pub pool_size: Option<usize>,
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// Bind host [env: NOBG_HOST]
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port [env: NOBG_PORT]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Upload size limit in MiB [env: NOBG_MAX_UPLOAD_MB]
    #[arg(long)]
    pub max_upload_mb: Option<usize>,

    /// Per-request inference bound in seconds, 0 disables [env: NOBG_INFERENCE_TIMEOUT_SECS]
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Name reported by `GET /` [env: NOBG_PROJECT_NAME]
    #[arg(long)]
    pub project_name: Option<String>,

    /// Read start/stop/status/quit commands from stdin
    #[arg(long)]
    pub interactive: bool,
}

#[derive(Args, Debug)]
pub struct ProcessArgs {
    /// Image files, directories or glob patterns
    #[arg(value_name = "INPUT", required = true)]
    pub inputs: Vec<String>,

    /// Directory results are exported to
    #[arg(short, long, value_name = "DIR", default_value = "nobg-output")]
    pub output: PathBuf,

    /// Descend into subdirectories
    #[arg(short, long)]
    pub recursive: bool,

    /// Only take files whose name matches (e.g. "*.jpg")
    #[arg(long)]
    pub pattern: Option<String>,

    /// Re-run failed items up to this many times
    #[arg(long, default_value_t = 0)]
    pub retry: u32,

    #[command(flatten)]
    pub model: ModelArgs,
}

/// Entry point used by the `nobg` binary
pub async fn main() -> Result<()> {
    let cli = Cli::parse();

    let format = TracingFormat::parse(&cli.log_format)
        .with_context(|| format!("Unknown log format '{}'", cli.log_format))?;
    let _guard = TracingConfig::new()
        .with_verbosity(cli.verbose)
        .with_format(format)
        .with_session_id(uuid::Uuid::new_v4().to_string())
        .init()?;

    match cli.command {
        Command::Serve { model, server } => serve(&model, &server).await,
        Command::Process(args) => process(&args).await,
        Command::Download { model, sha256 } => download(&model, sha256.as_deref()).await,
        Command::Providers => {
            show_providers();
            Ok(())
        },
        Command::Cache { action, cache_dir } => manage_cache(&action, cache_dir.as_deref()),
    }
}

/// Renders model load progress on a percentage bar
struct LoadBar {
    bar: ProgressBar,
}

impl LoadBar {
    fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }
}

impl ProgressReporter for LoadBar {
    fn report_progress(&self, update: LoadProgress) {
        self.bar.set_position((f64::from(update.fraction) * 100.0).round() as u64);
        if update.stage == LoadStage::Ready {
            self.bar
                .finish_with_message(format!("{} ({} ms)", update.message, update.elapsed_ms));
        } else {
            self.bar.set_message(update.message);
        }
    }

    fn report_error(&self, stage: LoadStage, error: &str) {
        self.bar.abandon_with_message(format!("Failed at {stage:?}: {error}"));
    }
}

fn build_provider(config: ModelConfig) -> Result<ModelProvider> {
    let cache = ModelCache::for_config(&config)?;
    let fetcher = ModelDownloader::for_config(&config)?.with_progress(true);
    Ok(ModelProvider::with_components(
        config,
        Arc::new(DefaultBackendFactory),
        Arc::new(fetcher),
        cache,
    )?)
}

async fn load_model(args: &ModelArgs) -> Result<(ModelProvider, ModelHandle)> {
    let config = CliConfigBuilder::model_config(args)?;
    let provider = build_provider(config)?;
    let handle = provider
        .acquire(&LoadBar::new())
        .await
        .context("Could not load the segmentation model")?;
    log::info!(
        "Model {} ready on {} ({} backend)",
        handle.model_id(),
        handle.compute_target(),
        handle.backend_name()
    );
    Ok((provider, handle))
}

async fn serve(model: &ModelArgs, args: &ServeArgs) -> Result<()> {
    let server_config = CliConfigBuilder::server_config(args)?;
    let (provider, _handle) = load_model(model).await?;
    let toggle = ServiceToggle::new(provider, server_config);

    let addr = toggle.start().await?;
    println!("Serving on http://{addr} (Ctrl-C to exit)");

    if args.interactive {
        run_console(&toggle).await?;
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    toggle.stop().await?;
    println!("Stopped");
    Ok(())
}

/// Line-oriented control of a running toggle
async fn run_console(toggle: &ServiceToggle) -> Result<()> {
    println!("Commands: start, stop, status, quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };

        match line.trim() {
            "start" => match toggle.start().await {
                Ok(addr) => println!("Serving on http://{addr}"),
                Err(e) => println!("{e}"),
            },
            "stop" => {
                toggle.stop().await?;
                println!("Stopped");
            },
            "status" => match toggle.local_addr().await {
                Ok(addr) => println!("Running on http://{addr}"),
                Err(_) => println!("Stopped"),
            },
            "quit" | "exit" => return Ok(()),
            "" => {},
            other => println!("Unknown command '{other}'"),
        }
    }
}

/// Join the queue worker without parking a runtime thread
async fn wait_for_worker(run: RunHandle) -> Result<()> {
    tokio::task::spawn_blocking(move || run.join())
        .await
        .context("Queue worker task failed")??;
    Ok(())
}

async fn process(args: &ProcessArgs) -> Result<()> {
    let files = collect_inputs(&args.inputs, args.recursive, args.pattern.as_deref())?;
    if files.is_empty() {
        bail!("No supported image files found in the provided inputs");
    }
    log::info!("Found {} image file(s) to process", files.len());

    let (_provider, handle) = load_model(&args.model).await?;
    let (queue, mut events) = JobQueue::new(RemovalService::new(handle))?;
    queue.add_files(files.iter().cloned())?;

    let start = Instant::now();
    let bar = ProgressBar::new(files.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
    {
        bar.set_style(style.progress_chars("#>-"));
    }

    let mut attempts_left = args.retry;
    loop {
        let run = queue.start()?;
        while let Some(event) = events.recv().await {
            match event {
                QueueEvent::StatusChanged { id, status, error } => {
                    let name = queue.get(id).map(|item| item.name()).unwrap_or_default();
                    match (status, error) {
                        (JobStatus::Processing, _) => bar.set_message(name),
                        (JobStatus::Error, Some(error)) => {
                            bar.println(format!("failed: {name}: {error}"));
                        },
                        _ => {},
                    }
                },
                QueueEvent::Progress(progress) => bar.set_position(progress.done as u64),
                QueueEvent::RunFinished(progress) => {
                    bar.set_message(progress.to_string());
                    break;
                },
                QueueEvent::RunStarted { .. } => {},
            }
        }
        wait_for_worker(run).await?;

        let failed = queue
            .snapshot()?
            .iter()
            .filter(|item| item.status == JobStatus::Error)
            .count();
        if failed == 0 || attempts_left == 0 {
            break;
        }
        attempts_left -= 1;
        log::warn!("Retrying {failed} failed item(s)");
        queue.retry_failed()?;
    }
    bar.finish();

    let written = queue.export(&args.output)?;
    let progress = queue.progress()?;
    println!(
        "{progress} in {:.1}s, results in {}",
        start.elapsed().as_secs_f64(),
        args.output.display()
    );
    log::debug!("Exported {} file(s)", written.len());

    if progress.is_complete() {
        Ok(())
    } else {
        bail!("{} of {} item(s) failed", progress.total - progress.done, progress.total)
    }
}

async fn download(args: &ModelArgs, expected_sha256: Option<&str>) -> Result<()> {
    let config = CliConfigBuilder::model_config(args)?;
    let cache = ModelCache::for_config(&config)?;
    let model_id = ModelCache::repo_to_model_id(&config.model_id);
    let dest = cache.get_model_path(&model_id);

    if cache.is_model_cached(&model_id, config.weights_file()) {
        println!("{} is already cached", config.model_id);
    } else {
        ModelDownloader::for_config(&config)?
            .with_progress(true)
            .download_model(&config, &dest)
            .await?;
        println!("Downloaded {} to {}", config.model_id, dest.display());
    }

    let weights = dest.join(config.weights_file());
    match expected_sha256 {
        Some(expected) => {
            if !verify_file_integrity(&weights, expected)? {
                bail!("{} does not match the expected SHA-256", weights.display());
            }
            println!("Verified {}", weights.display());
        },
        None => println!("sha256 {}", sha256_file(&weights)?),
    }
    Ok(())
}

fn show_providers() {
    let cpu_count = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1);
    println!("System: {cpu_count} CPU cores, CUDA available: {}", cuda_available());
    println!();
    for info in list_providers() {
        let status = if info.available { "available" } else { "not available" };
        println!(
            "  {:<6} {:<7} {:<14} {}",
            info.backend.to_string(),
            info.provider.to_string(),
            status,
            info.description
        );
    }
}

fn manage_cache(action: &CacheAction, cache_dir: Option<&Path>) -> Result<()> {
    let cache = match cache_dir {
        Some(dir) => ModelCache::with_custom_cache_dir(dir)?,
        None => ModelCache::new()?,
    };

    match action {
        CacheAction::Dir => println!("{}", cache.get_current_cache_dir().display()),
        CacheAction::List => {
            let models = cache.scan_cached_models()?;
            if models.is_empty() {
                println!("No cached models in {}", cache.get_current_cache_dir().display());
            }
            for model in models {
                println!(
                    "  {:<32} {:<10} {}",
                    model.model_id,
                    format_size(model.size_bytes),
                    model.variants.join(", ")
                );
            }
        },
        CacheAction::Clear { model, all } => {
            let targets: Vec<String> = match (model, all) {
                (Some(model), _) => vec![ModelCache::repo_to_model_id(model)],
                (None, true) => cache
                    .scan_cached_models()?
                    .into_iter()
                    .map(|m| m.model_id)
                    .collect(),
                (None, false) => bail!("Pass --model <id> or --all"),
            };
            for target in targets {
                if cache.clear_specific_model(&target)? {
                    println!("Removed {target}");
                } else {
                    println!("{target} is not cached");
                }
            }
        },
    }
    Ok(())
}

/// Expand files, directories and glob patterns into a sorted file list
fn collect_inputs(inputs: &[String], recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        let path = Path::new(input);
        if path.is_dir() {
            files.extend(find_image_files(path, recursive, pattern)?);
        } else if path.is_file() {
            files.push(path.to_path_buf());
        } else if input.contains(['*', '?', '[']) {
            for entry in glob::glob(input).with_context(|| format!("Invalid glob '{input}'"))? {
                let entry = entry?;
                if entry.is_file() && is_image_file(&entry) {
                    files.push(entry);
                }
            }
        } else {
            bail!("Input not found: {input}");
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

fn find_image_files(dir: &Path, recursive: bool, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let walker = walkdir::WalkDir::new(dir).max_depth(if recursive { usize::MAX } else { 1 });
    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type().is_file() && is_image_file(path) && matches_pattern(path, pattern) {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

fn matches_pattern(path: &Path, pattern: Option<&str>) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    glob::Pattern::new(pattern).is_ok_and(|p| p.matches(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_worker_join_keeps_runtime_responsive() {
        use crate::backends::test_utils::{
            png_bytes, write_model_dir, MockBackendFactory, MockBehavior, OfflineFetcher,
        };
        use crate::services::progress::NoOpProgressReporter;

        let dir = TempDir::new().unwrap();
        write_model_dir(&dir.path().join("model"), b"weights");
        let config = ModelConfig::builder()
            .bundled_dir(dir.path().join("model"))
            .cache_dir(dir.path().join("cache"))
            .build()
            .unwrap();
        let provider = ModelProvider::with_components(
            config.clone(),
            Arc::new(MockBackendFactory::new(MockBehavior {
                infer_delay: std::time::Duration::from_millis(150),
                ..MockBehavior::default()
            })),
            Arc::new(OfflineFetcher::default()),
            ModelCache::for_config(&config).unwrap(),
        )
        .unwrap();
        let handle = provider.acquire(&NoOpProgressReporter).await.unwrap();

        let input = dir.path().join("slow.png");
        fs::write(&input, png_bytes(16, 16)).unwrap();
        let (queue, _events) = JobQueue::new(RemovalService::new(handle)).unwrap();
        queue.add_files([input]).unwrap();
        let run = queue.start().unwrap();

        // On a single-threaded runtime the timer only fires mid-run if the
        // join does not hold the thread
        let (joined, seen_running) = tokio::join!(wait_for_worker(run), async {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            queue.is_running()
        });
        joined.unwrap();
        assert!(seen_running);
        assert!(!queue.is_running());
    }

    #[test]
    fn test_is_image_file() {
        assert!(is_image_file(Path::new("a.JPG")));
        assert!(is_image_file(Path::new("dir/b.webp")));
        assert!(!is_image_file(Path::new("c.gif")));
        assert!(!is_image_file(Path::new("noext")));
    }

    #[test]
    fn test_matches_pattern() {
        assert!(matches_pattern(Path::new("x/photo.jpg"), Some("*.jpg")));
        assert!(!matches_pattern(Path::new("x/photo.png"), Some("*.jpg")));
        assert!(matches_pattern(Path::new("x/photo.png"), None));
    }

    #[test]
    fn test_collect_inputs_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.png"), b"x").unwrap();
        fs::write(dir.path().join("a.jpg"), b"x").unwrap();
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/c.png"), b"x").unwrap();

        let root = dir.path().to_string_lossy().to_string();
        let flat = collect_inputs(&[root.clone()], false, None).unwrap();
        let names: Vec<_> = flat
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);

        let deep = collect_inputs(&[root.clone()], true, Some("*.png")).unwrap();
        assert_eq!(deep.len(), 2);

        let globbed = collect_inputs(&[format!("{root}/*.png")], false, None).unwrap();
        assert_eq!(globbed.len(), 1);
    }

    #[test]
    fn test_missing_input_is_an_error() {
        assert!(collect_inputs(&["/definitely/not/here.png".to_string()], false, None).is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["nobg", "-v", "serve", "--port", "9000", "--backend", "tract"])
            .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Serve { model, server } => {
                assert_eq!(server.port, Some(9000));
                assert_eq!(model.backend.as_deref(), Some("tract"));
            },
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["nobg", "process", "a.png", "-o", "out", "--retry", "2"])
            .unwrap();
        match cli.command {
            Command::Process(args) => {
                assert_eq!(args.inputs, vec!["a.png"]);
                assert_eq!(args.output, PathBuf::from("out"));
                assert_eq!(args.retry, 2);
            },
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from(["nobg", "download", "--variant", "fp16", "--sha256", "ab12"])
            .unwrap();
        match cli.command {
            Command::Download { model, sha256 } => {
                assert_eq!(model.variant.as_deref(), Some("fp16"));
                assert_eq!(sha256.as_deref(), Some("ab12"));
            },
            other => panic!("unexpected command {other:?}"),
        }

        assert!(Cli::try_parse_from(["nobg", "process"]).is_err());
    }
}
