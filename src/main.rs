use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use viztel::analysis::DiagnosisEngine;
use viztel::api::health::HealthMetrics;
use viztel::api::{ApiServer, AppState};
use viztel::config::Config;
use viztel::service::TelemetryService;
use viztel::store::{self, FrameStore, StoreKey};
use viztel::telemetry::exporter::{FrameExporter, StoreExporter};
use viztel::telemetry::frame::Frame;
use viztel::telemetry::http::HttpExporter;
use viztel::telemetry::{replay, TelemetryRuntime};

/// Behavioral telemetry aggregation and anomaly diagnosis.
#[derive(Parser)]
#[command(name = "viztel", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the ingestion and diagnosis HTTP server.
    Serve,

    /// Diagnose a JSONL frame dump offline and print the report.
    Diagnose {
        /// File with one frame per line.
        #[arg(long)]
        frames: PathBuf,

        /// Scenario id to stamp on the report.
        #[arg(long, default_value = "offline")]
        scenario: String,
    },

    /// Replay a recorded JSONL sample log through the producer runtime.
    Replay {
        /// File with one sample per line.
        #[arg(long)]
        samples: PathBuf,

        /// User the frames are stored under.
        #[arg(long, default_value = "anonymous")]
        user: String,

        /// Also index frames under this scenario.
        #[arg(long)]
        scenario: Option<String>,

        /// Playback speed multiplier.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = cli.command {
        println!("viztel {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let level = cfg.effective_log_level(cli.log_level.as_deref());
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async {
        match cli.command {
            Command::Serve => serve(cfg).await,
            Command::Diagnose { frames, scenario } => diagnose(&cfg, &frames, &scenario),
            Command::Replay {
                samples,
                user,
                scenario,
                speed,
            } => run_replay(cfg, &samples, &user, scenario.as_deref(), speed).await,
            Command::Version => Ok(()),
        }
    })
}

async fn serve(cfg: Config) -> Result<()> {
    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        instance = %cfg.meta_client_name,
        "starting viztel",
    );

    let metrics = Arc::new(HealthMetrics::new().context("creating health metrics")?);
    let store = store::open(&cfg.store)?;
    let engine = DiagnosisEngine::new(&cfg.analysis, &cfg.topology);
    let service = TelemetryService::new(store, engine).with_metrics(Arc::clone(&metrics));

    let state = AppState {
        service: Arc::new(service),
        metrics,
    };
    let server = ApiServer::bind(&cfg.server.addr, state).await?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    server.run(cancel).await?;
    tracing::info!("viztel stopped");
    Ok(())
}

fn diagnose(cfg: &Config, path: &Path, scenario: &str) -> Result<()> {
    let frames = read_frames(path)?;
    anyhow::ensure!(!frames.is_empty(), "no frames in {}", path.display());

    let engine = DiagnosisEngine::new(&cfg.analysis, &cfg.topology);
    let report = engine.diagnose(scenario, &frames);
    let out = serde_json::to_string_pretty(&report).context("encoding report")?;
    println!("{out}");
    Ok(())
}

async fn run_replay(
    cfg: Config,
    path: &Path,
    user: &str,
    scenario: Option<&str>,
    speed: f64,
) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let samples = replay::read_samples(BufReader::new(file))?;

    let store = store::open(&cfg.store)?;
    let mut runtime = TelemetryRuntime::new(cfg.channel.clone());
    runtime.add_exporter(FrameExporter::Store(StoreExporter::new(
        Arc::clone(&store),
        user,
        scenario,
    )));
    if cfg.export.http.enabled {
        runtime.add_exporter(FrameExporter::Http(HttpExporter::new(
            cfg.export.http.clone(),
        )));
    }

    let ctx = CancellationToken::new();
    runtime.start(ctx.clone()).await?;

    let interrupt = CancellationToken::new();
    tokio::spawn(shutdown_signal(interrupt.clone()));
    let pushed = replay::replay(&runtime, &samples, speed, &interrupt).await;

    ctx.cancel();
    runtime.wait_for_shutdown().await;

    let stored = store
        .range(&StoreKey::stream(user))
        .context("reading replayed stream")?
        .len();
    tracing::info!(samples = pushed, frames = stored, user, "replay complete");
    Ok(())
}

/// Reads one frame per non-blank line.
fn read_frames(path: &Path) -> Result<Vec<Frame>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut frames = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let frame = Frame::from_json(&line)
            .with_context(|| format!("parsing frame on line {}", idx + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

/// Cancels `cancel` on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        tracing::info!("received SIGINT, shutting down");
    }

    cancel.cancel();
}
