//! # Airwave
//!
//! Headless reference host for the Airwave playback engine. Plays a scripted
//! radio playlist against the simulated media backend, optionally injecting
//! load failures and stalls, and reports session diagnostics as it goes.

mod scenario;
mod settings;

use std::path::PathBuf;
use std::time::Duration;

use airwave_core::{CrossfadeMode, NetworkClass, PlatformCapabilities};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use scenario::ScenarioOptions;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Network {
    Broadband,
    Cellular,
    Slow,
}

impl From<Network> for NetworkClass {
    fn from(network: Network) -> Self {
        match network {
            Network::Broadband => Self::Broadband,
            Network::Cellular => Self::Cellular,
            Network::Slow => Self::Slow,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Crossfade {
    Overlap,
    Sequential,
    None,
}

impl From<Crossfade> for CrossfadeMode {
    fn from(mode: Crossfade) -> Self {
        match mode {
            Crossfade::Overlap => Self::Overlap,
            Crossfade::Sequential => Self::Sequential,
            Crossfade::None => Self::None,
        }
    }
}

/// Command-line arguments for airwave
#[derive(Parser, Debug)]
#[command(name = "airwave")]
#[command(about = "Drive an Airwave playback session through a scripted playlist")]
#[command(version)]
struct Args {
    /// JSON engine configuration (defaults to the platform config directory)
    #[arg(short, long, env = "AIRWAVE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of tracks in the playlist
    #[arg(short, long, default_value_t = 3, value_parser = clap::value_parser!(u16).range(1..))]
    tracks: u16,

    /// Length of each track in seconds
    #[arg(long, default_value_t = 20.0)]
    track_seconds: f64,

    /// Override the configured crossfade mode
    #[arg(long, value_enum)]
    crossfade: Option<Crossfade>,

    /// Override the configured crossfade duration
    #[arg(long)]
    crossfade_ms: Option<u64>,

    /// Network class reported by the platform probe
    #[arg(long, value_enum, default_value_t = Network::Broadband)]
    network: Network,

    /// Platform enforces a conservative buffer ceiling
    #[arg(long)]
    constrained: bool,

    /// Advertise adaptive variants for every track
    #[arg(long)]
    adaptive: bool,

    /// Fail this many load attempts with network errors before succeeding
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    /// Freeze playback this many seconds into the run
    #[arg(long)]
    stall_at: Option<f64>,

    /// How long an injected stall lasts, in seconds
    #[arg(long, default_value_t = 6.0)]
    stall_for: f64,

    /// Backend pump period in milliseconds
    #[arg(long, default_value_t = 100)]
    tick_ms: u64,

    /// Diagnostics report period in milliseconds
    #[arg(long, default_value_t = 1000)]
    report_ms: u64,

    /// Print diagnostics as JSON lines on stdout
    #[arg(long)]
    json: bool,

    /// Seed retry jitter for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
}

fn seconds(value: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("Invalid {what}: {value}"))
}

impl Args {
    fn options(&self) -> Result<ScenarioOptions> {
        let mut capabilities = PlatformCapabilities::new(self.network.into());
        if self.constrained {
            capabilities = capabilities.constrained();
        }
        Ok(ScenarioOptions {
            tracks: usize::from(self.tracks),
            track_length: seconds(self.track_seconds, "track length")?,
            capabilities,
            adaptive: self.adaptive,
            fail_first: self.fail_first,
            stall_at: self.stall_at.map(|at| seconds(at, "stall start")).transpose()?,
            stall_for: seconds(self.stall_for, "stall length")?,
            tick: Duration::from_millis(self.tick_ms.max(10)),
            report_every: Duration::from_millis(self.report_ms.max(100)),
            json: self.json,
            seed: self.seed,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON diagnostics own stdout
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "airwave=info,airwave_engine=debug".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting Airwave v{}", env!("CARGO_PKG_VERSION"));

    let mut config = settings::load(args.config.as_deref())?;
    if let Some(mode) = args.crossfade {
        config.crossfade_mode = mode.into();
    }
    if let Some(ms) = args.crossfade_ms {
        config.crossfade_duration_ms = ms;
    }
    config.validate().context("Invalid engine configuration")?;

    let options = args.options()?;
    let json = options.json;
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let outcome = scenario::run(config, options, shutdown).await?;
    if json {
        println!("{}", serde_json::to_string(&outcome.snapshot)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&outcome.snapshot)?);
    }
    info!(
        "Played {} track(s), final state {}",
        outcome.played, outcome.snapshot.state
    );
    Ok(())
}
