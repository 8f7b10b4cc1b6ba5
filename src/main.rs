//! CLI entry point for the BRT capture pipeline.
//!
//! Provides subcommands for the scheduled capture loop, a single end-to-end
//! capture, an offline run on synthetic data, storage inspection and
//! connectivity checks, re-uploading a retained artifact, and running the
//! downstream transformations by hand.

use anyhow::{Context, Result, bail};
use brt_pipeline::buffer::{AggregationBuffer, Artifact, SILVER_DIR};
use brt_pipeline::config::{PipelineConfig, StorageBackend};
use brt_pipeline::downstream::{DbtRunner, DownstreamReport, DownstreamTrigger};
use brt_pipeline::feed::{FeedSource, HttpFeed};
use brt_pipeline::fetch::BasicClient;
use brt_pipeline::mock::MockFeed;
use brt_pipeline::orchestrator::{Orchestrator, TickOutcome};
use brt_pipeline::output::read_artifact;
use brt_pipeline::publish::{PublishOutcome, Publisher};
use brt_pipeline::retry::RetryPolicy;
use brt_pipeline::storage::{ArtifactStore, LocalStore, S3Store, Uploader};
use clap::{Parser, Subcommand};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "brt_pipeline")]
#[command(about = "Capture BRT vehicle positions, aggregate, upload and transform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the feed on a fixed interval until Ctrl+C
    Run {
        /// Number of non-empty polls per artifact (overrides AGGREGATION_MINUTES)
        #[arg(short, long)]
        window_size: Option<usize>,

        /// Seconds between polls (overrides RUN_INTERVAL_SECONDS)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Capture once, write an artifact, upload it and run the transformations
    Once {
        /// Skip the downstream transformations
        #[arg(long, default_value_t = false)]
        no_transform: bool,
    },
    /// Re-upload an artifact kept on disk after a failed upload
    Upload {
        /// Path to the local CSV artifact
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Run the downstream transformations without a new upload
    Transform,
    /// Push synthetic BRT data through buffer, flush, upload and transform
    Mock {
        /// Polls per artifact (defaults to the configured window size)
        #[arg(short, long)]
        polls: Option<usize>,

        /// Vehicles per BRT corridor in each poll
        #[arg(short, long, default_value_t = 20)]
        vehicles: usize,

        /// Seed for reproducible data
        #[arg(long)]
        seed: Option<u64>,

        /// Storage folder for the mock artifact
        #[arg(long, default_value = "brt-data-test")]
        folder: String,

        /// Skip the downstream transformations
        #[arg(long, default_value_t = false)]
        no_transform: bool,
    },
    /// List artifacts in storage
    List {
        /// Only report local artifacts that never reached storage
        #[arg(long, default_value_t = false)]
        missing: bool,
    },
    /// Check that the feed and the object store are reachable
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _file_guard = init_tracing()?;

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env().context("invalid configuration")?;

    match cli.command {
        Commands::Run {
            window_size,
            interval,
        } => {
            if let Some(window_size) = window_size {
                if window_size == 0 {
                    bail!("--window-size must be at least 1");
                }
                config.window_size = window_size;
            }
            if let Some(interval) = interval {
                if interval == 0 {
                    bail!("--interval must be at least 1 second");
                }
                config.interval = Duration::from_secs(interval);
            }
            run(&config).await?;
        }
        Commands::Once { no_transform } => {
            once(&config, !no_transform).await?;
        }
        Commands::Upload { path } => {
            upload(&config, &path).await?;
        }
        Commands::Transform => {
            let report = build_trigger(&config).run_sequence().await;
            ensure_downstream_success(&report)?;
        }
        Commands::Mock {
            polls,
            vehicles,
            seed,
            folder,
            no_transform,
        } => {
            config.storage.folder = folder;
            if let Some(polls) = polls {
                if polls == 0 {
                    bail!("--polls must be at least 1");
                }
                config.window_size = polls;
            }
            mock(&config, vehicles, seed.unwrap_or_else(rand::random), !no_transform).await?;
        }
        Commands::List { missing } => {
            list(&config, missing).await?;
        }
        Commands::Check => {
            check(&config).await?;
        }
    }

    Ok(())
}

/// Logging setup: colored stderr + JSON rolling log file.
fn init_tracing() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/brt_pipeline.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("brt_pipeline.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    Ok(file_guard)
}

/// Runs the capture loop until Ctrl+C (or SIGTERM on unix).
#[tracing::instrument(skip(config), fields(window = config.window_size, interval_secs = config.interval.as_secs()))]
async fn run(config: &PipelineConfig) -> Result<()> {
    let feed = build_feed(config)?;
    let buffer = Arc::new(
        AggregationBuffer::new(config.window_size, &config.data_dir)
            .with_context(|| format!("failed to prepare {}", config.data_dir.display()))?,
    );
    let publisher = build_publisher(config, config.downstream.enabled).await;
    let orchestrator = Orchestrator::new(feed, buffer, fetch_retry(config));

    info!(feed_url = %config.feed_url, folder = %config.storage.folder, "Press Ctrl+C to stop");
    let summary = orchestrator
        .run(publisher, config.interval, shutdown_signal())
        .await;

    if summary.uploads_failed > 0 {
        warn!(
            uploads_failed = summary.uploads_failed,
            data_dir = %config.data_dir.display(),
            "Some artifacts were not uploaded; re-upload them with `brt_pipeline upload <PATH>`"
        );
    }
    Ok(())
}

/// Single capture with a window of one, flushed and published immediately.
async fn once(config: &PipelineConfig, transform: bool) -> Result<()> {
    let feed = build_feed(config)?;
    let buffer = Arc::new(AggregationBuffer::new(1, &config.data_dir)?);
    let mut orchestrator = Orchestrator::new(feed, buffer, fetch_retry(config));

    let artifact = match orchestrator.tick().await {
        TickOutcome::Flushed(artifact) => artifact,
        TickOutcome::FetchFailed { error, attempts, .. } => {
            bail!("capture failed after {attempts} attempt(s): {error}")
        }
        TickOutcome::EmptyPoll => bail!("feed returned no vehicles"),
        TickOutcome::FlushFailed(e) => return Err(e).context("failed to write artifact"),
        other => bail!("unexpected tick outcome: {other:?}"),
    };
    info!(path = %artifact.path.display(), rows = artifact.row_count, "Artifact written");

    publish_once(config, &artifact, transform).await
}

async fn publish_once(config: &PipelineConfig, artifact: &Artifact, transform: bool) -> Result<()> {
    let publisher = build_publisher(config, transform && config.downstream.enabled).await;
    match publisher.publish(artifact).await {
        PublishOutcome::Uploaded {
            reference,
            downstream,
        } => {
            info!(uri = %reference, rows = artifact.row_count, "Capture uploaded");
            if let Some(report) = downstream {
                ensure_downstream_success(&report)?;
            }
            Ok(())
        }
        PublishOutcome::UploadFailed(e) => Err(e).context(format!(
            "upload failed, artifact kept at {}",
            artifact.path.display()
        )),
    }
}

/// Offline end-to-end run: one full window of synthetic polls, written under
/// `<DATA_DIR>/mock` so it never mixes with real artifacts.
#[tracing::instrument(skip(config), fields(window = config.window_size, folder = %config.storage.folder))]
async fn mock(config: &PipelineConfig, vehicles: usize, seed: u64, transform: bool) -> Result<()> {
    if vehicles == 0 {
        bail!("--vehicles must be at least 1");
    }
    let feed = MockFeed::new(vehicles, seed);
    info!(seed, vehicles_per_poll = feed.vehicles_per_poll(), "Generating mock BRT data");

    let data_dir = config.data_dir.join("mock");
    let buffer = Arc::new(
        AggregationBuffer::new(config.window_size, &data_dir)
            .with_context(|| format!("failed to prepare {}", data_dir.display()))?,
    );
    let mut orchestrator = Orchestrator::new(feed, buffer, RetryPolicy::none());

    let mut artifact = None;
    for poll in 1..=config.window_size {
        match orchestrator.tick().await {
            TickOutcome::Flushed(flushed) => {
                artifact = Some(flushed);
                break;
            }
            TickOutcome::Buffered(status) => {
                info!(poll, batches = status.batch_count, target = status.target_batch_count, "Mock poll buffered");
            }
            TickOutcome::FlushFailed(e) => return Err(e).context("failed to write mock artifact"),
            other => bail!("unexpected tick outcome: {other:?}"),
        }
    }
    let Some(artifact) = artifact else {
        bail!("window did not complete after {} polls", config.window_size);
    };
    info!(path = %artifact.path.display(), rows = artifact.row_count, "Mock artifact written");

    publish_once(config, &artifact, transform).await?;

    let objects = build_uploader(config).await.list(&config.storage.folder).await?;
    if !objects.iter().any(|o| o.key.ends_with(&artifact.file_name)) {
        bail!("{} not found in storage after upload", artifact.file_name);
    }
    info!(objects = objects.len(), folder = %config.storage.folder, "Mock artifact verified in storage");
    Ok(())
}

/// Logs stored artifacts, or with `missing` the local ones still waiting for
/// a re-upload.
async fn list(config: &PipelineConfig, missing: bool) -> Result<()> {
    let uploader = build_uploader(config).await;
    let folder = &config.storage.folder;

    if missing {
        let artifact_dir = config.data_dir.join(SILVER_DIR);
        let paths = uploader
            .missing(&artifact_dir, folder)
            .await
            .with_context(|| format!("failed to compare {} with storage", artifact_dir.display()))?;
        for path in &paths {
            warn!(path = %path.display(), "Not in storage; re-upload with `brt_pipeline upload <PATH>`");
        }
        info!(missing = paths.len(), %folder, "Missing artifacts");
        return Ok(());
    }

    let objects = uploader.list(folder).await.context("failed to list storage")?;
    for object in &objects {
        info!(key = %object.key, bytes = object.size, "Stored artifact");
    }
    info!(count = objects.len(), %folder, "Listed storage");
    Ok(())
}

/// Polls the feed once and lists the storage folder.
async fn check(config: &PipelineConfig) -> Result<()> {
    let mut failures = 0;

    let feed = build_feed(config)?;
    match feed.poll().await {
        Ok(records) => info!(url = %feed.url(), vehicles = records.len(), "Feed reachable"),
        Err(e) => {
            failures += 1;
            error!(url = %feed.url(), error = %e, "Feed not reachable");
        }
    }

    match build_uploader(config).await.list(&config.storage.folder).await {
        Ok(objects) => info!(folder = %config.storage.folder, objects = objects.len(), "Storage reachable"),
        Err(e) => {
            failures += 1;
            error!(folder = %config.storage.folder, error = %e, "Storage not reachable");
        }
    }

    if failures > 0 {
        bail!("{failures} connectivity check(s) failed");
    }
    Ok(())
}

async fn upload(config: &PipelineConfig, path: &Path) -> Result<()> {
    let rows = read_artifact(path)
        .with_context(|| format!("{} is not a readable artifact", path.display()))?
        .len();
    let uploader = build_uploader(config).await;
    let reference = uploader.upload(path, &config.storage.folder).await?;
    info!(uri = %reference, rows, "Artifact uploaded");
    Ok(())
}

fn build_feed(config: &PipelineConfig) -> Result<HttpFeed<BasicClient>> {
    let client = BasicClient::with_timeouts(config.fetch_timeout, CONNECT_TIMEOUT)
        .context("failed to build HTTP client")?;
    Ok(HttpFeed::new(client, &config.feed_url))
}

fn fetch_retry(config: &PipelineConfig) -> RetryPolicy {
    RetryPolicy::fixed(config.fetch_retries, config.fetch_retry_delay)
}

async fn build_store(config: &PipelineConfig) -> Arc<dyn ArtifactStore> {
    let storage = &config.storage;
    match &storage.backend {
        StorageBackend::S3 { bucket } => {
            info!(bucket = %bucket, folder = %storage.folder, "S3 upload enabled");
            Arc::new(
                S3Store::from_env(
                    bucket.clone(),
                    storage.endpoint_url.as_deref(),
                    storage.credentials_profile.as_deref(),
                )
                .await,
            )
        }
        StorageBackend::Local { root } => {
            info!(root = %root.display(), folder = %storage.folder, "Local object store enabled");
            Arc::new(LocalStore::new(root.clone()))
        }
    }
}

async fn build_uploader(config: &PipelineConfig) -> Uploader {
    let storage = &config.storage;
    let retry = RetryPolicy::exponential(
        storage.retries,
        storage.retry_delay,
        storage.retry_delay.saturating_mul(4),
    );
    Uploader::new(build_store(config).await, retry, storage.timeout)
}

async fn build_publisher(config: &PipelineConfig, with_trigger: bool) -> Publisher {
    let publisher = Publisher::new(build_uploader(config).await, &config.storage.folder);
    if with_trigger {
        publisher.with_trigger(build_trigger(config))
    } else {
        publisher
    }
}

fn build_trigger(config: &PipelineConfig) -> DownstreamTrigger {
    let downstream = &config.downstream;
    let mut runner = DbtRunner::new(&downstream.command, &downstream.project_dir)
        .profiles_dir(&downstream.profiles_dir)
        .generate_docs(downstream.generate_docs)
        .timeout(downstream.timeout)
        .env("STORAGE_FOLDER", &config.storage.folder);
    if let Some(project) = &downstream.warehouse_project_id {
        runner = runner.env("WAREHOUSE_PROJECT_ID", project);
    }
    if let StorageBackend::S3 { bucket } = &config.storage.backend {
        runner = runner.env("STORAGE_BUCKET", bucket);
    }
    DownstreamTrigger::new(Arc::new(runner))
}

fn ensure_downstream_success(report: &DownstreamReport) -> Result<()> {
    for (step, status) in &report.steps {
        info!(%step, ?status, "Downstream step result");
    }
    if !report.is_success() {
        bail!("downstream transformations failed");
    }
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
