use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use civis_git_upload::{BackgroundRunner, GitCli, HttpTransport, RequestMode, Settings};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Agentless,
    EvpProxy,
}

impl From<Mode> for RequestMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Agentless => RequestMode::AgentlessEvents,
            Mode::EvpProxy => RequestMode::EvpProxyEvents,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "civis-git-upload")]
#[command(about = "Upload missing git history to the CI visibility backend")]
struct Args {
    /// Repository to upload from (defaults to the current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Override the request mode from configuration
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Repository URL to report instead of the `origin` remote
    #[arg(long)]
    repository_url: Option<String>,

    /// Seconds to wait for the upload before giving up on it
    #[arg(long)]
    timeout: Option<u64>,

    /// Per-request HTTP timeout in seconds
    #[arg(long, default_value = "15")]
    request_timeout: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::load().context("Failed to load configuration")?;
    if let Some(mode) = args.mode {
        settings.mode = mode.into();
    }
    if let Some(url) = args.repository_url {
        settings.repository_url = Some(url);
    }
    settings.validate()?;

    tracing::info!(
        mode = ?settings.mode,
        base_url = %settings.base_url(),
        "Starting git metadata upload"
    );

    let transport = HttpTransport::new(Duration::from_secs(args.request_timeout))?;
    let mut runner = BackgroundRunner::new(settings, Arc::new(transport), Arc::new(GitCli::default()));
    runner.start(args.cwd)?;

    match runner.shutdown(args.timeout.map(Duration::from_secs)) {
        Some(outcome) if outcome.is_failure() => {
            tracing::warn!("git metadata upload did not complete: {:?}", outcome)
        }
        Some(outcome) => tracing::info!("git metadata upload outcome: {:?}", outcome),
        None => tracing::warn!("git metadata upload did not finish in time"),
    }

    Ok(())
}
