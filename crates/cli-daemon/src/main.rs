//! CLI entry point for relaycast
//!
//! Parses command line arguments, sets up logging and runs the daemon.

use clap::Parser;
use relaycast::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// relaycast - live channels and share-gated media delivery
#[derive(Parser, Debug)]
#[command(name = "relaycast")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (encoder, work dir, web_path). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relaycast=info")),
        )
        .init();

    let args = Args::parse();
    info!(config = %args.config.display(), "relaycast starting");

    let daemon_result = if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Config::load(&args.config)
            .map_err(Into::into)
            .and_then(Daemon::new_without_checks)
    } else {
        Daemon::new(&args.config)
    };

    match daemon_result {
        Ok(daemon) => {
            if let Err(e) = daemon.run().await {
                error!(error = %e, "daemon error");
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to initialize daemon");
            ExitCode::FAILURE
        }
    }
}
