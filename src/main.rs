use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use taskpulse::config::Config;
use taskpulse::export::api;
use taskpulse::export::health::HealthMetrics;
use taskpulse::upstream;
use taskpulse::worker::DataWorker;

/// Background refresh worker for warehouse task dashboards.
#[derive(Parser)]
#[command(name = "taskpulse", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
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

    if let Some(Command::Version) = &cli.command {
        println!("taskpulse {}", version::full());
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting taskpulse",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

    let client = create_upstream_client(&cfg, Arc::clone(&health))?;
    tracing::info!(url = client.url(), "upstream configured");

    let worker = DataWorker::new(client, &cfg.refresh).with_health(Arc::clone(&health));

    health
        .start(api::router(worker.snapshots()))
        .await
        .context("starting health metrics server")?;

    worker.start();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    worker.stop().await?;
    health.stop().await?;

    tracing::info!("taskpulse stopped");

    Ok(())
}

/// Create the upstream client with a metrics callback.
fn create_upstream_client(cfg: &Config, health: Arc<HealthMetrics>) -> Result<upstream::Client> {
    let client = upstream::Client::new(&cfg.upstream).context("creating upstream client")?;

    Ok(client.with_metrics(Box::new(move |status, duration| {
        health
            .upstream_requests
            .with_label_values(&[status])
            .inc();
        health
            .upstream_request_duration
            .observe(duration.as_secs_f64());
    })))
}
