//! CLI entry point for relaycast
//!
//! Parses command line arguments, initializes logging and runs the daemon
//! until Ctrl-C, or probes the transcoder's capabilities.

use clap::{Parser, Subcommand};
use relaycast::config::{ConfigError, LogFormat, LoggingConfig};
use relaycast::{BundledBinaries, CapabilityDetector, Daemon, DaemonConfig};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// relaycast - publish local media files to an RTSP relay with ffmpeg
#[derive(Parser, Debug)]
#[command(name = "relaycastd")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon until interrupted
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "relaycast.toml")]
        config: PathBuf,

        /// Do not start the relay server on startup
        #[arg(long, default_value = "false")]
        no_relay: bool,
    },
    /// Scan the transcoder for encoders and print the result as JSON
    Probe {
        /// Path to the configuration file
        #[arg(short, long, default_value = "relaycast.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Run { config, no_relay } => run(&config, no_relay).await,
        Command::Probe { config } => probe(&config).await,
    }
}

fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let config = DaemonConfig::load_or_default(path)?;
    init_logging(&config.logging);
    Ok(config)
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {}", e);
    }
}

async fn run(config_path: &Path, no_relay: bool) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    info!(config = %config_path.display(), "relaycast starting");

    let daemon = match Daemon::new(config).await {
        Ok(daemon) => Arc::new(daemon),
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    let _event_log = daemon.start_event_log();

    if !no_relay {
        match daemon.start_relay().await {
            Ok(status) => info!(state = status.state.as_str(), pid = ?status.pid, "relay server launched"),
            Err(e) => warn!(error = %e, "relay server not started"),
        }
    }

    let api = if daemon.config.api.enabled {
        Some(daemon.start_api_server())
    } else {
        None
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("interrupt received");

    if let Some(api) = api {
        api.abort();
    }
    daemon.shutdown().await;
    ExitCode::SUCCESS
}

async fn probe(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config {}: {}", config_path.display(), e);
            return ExitCode::FAILURE;
        }
    };

    let binaries = Arc::new(BundledBinaries::from_config(&config.paths));
    let snapshot = CapabilityDetector::new(binaries).scan(true).await;

    match serde_json::to_string_pretty(snapshot.as_ref()) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Failed to encode capabilities: {}", e);
            return ExitCode::FAILURE;
        }
    }

    if snapshot.available {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
