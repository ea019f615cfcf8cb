//! Daemon entry point.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal initialization failure,
//! 2 on invalid configuration.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use raceftpd::config::ConfigError;
use raceftpd::runtime::{self, SnapshotCell};
use raceftpd::tcp::{self, FtpServer};

#[derive(Parser)]
#[command(name = "raceftpd", version, about = "Managed FTP(S) daemon for file distribution sites")]
struct Cli {
    /// Path to the JSON configuration file; generated if missing.
    config: PathBuf,

    /// Validate the configuration and exit.
    #[arg(long)]
    check_config: bool,

    /// Build the runtime snapshot but do not accept connections.
    #[arg(long)]
    no_listen: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let snapshot = match runtime::load(&cli.config) {
        Ok(snapshot) => snapshot,
        Err(e @ ConfigError::Invalid(_)) | Err(e @ ConfigError::Parse { .. }) => {
            error!("invalid configuration: {}", e);
            return ExitCode::from(2);
        }
        Err(e) => {
            error!("cannot initialize: {}", e);
            return ExitCode::from(1);
        }
    };

    if cli.check_config {
        info!("configuration {} is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }
    if cli.no_listen {
        info!("snapshot built, not listening (--no-listen)");
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("cannot start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async move {
        let grace = std::time::Duration::from_secs(snapshot.config.server.shutdown_grace_secs);
        let snapshots = Arc::new(SnapshotCell::new(Arc::new(snapshot)));
        let server = match FtpServer::bind(snapshots).await {
            Ok(server) => server,
            Err(e) => {
                error!("cannot bind listener: {}", e);
                return ExitCode::from(1);
            }
        };

        tokio::select! {
            result = server.handle_forever() => {
                if let Err(e) = result {
                    error!("listener failed: {}", e);
                    return ExitCode::from(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                tcp::shutdown(&server, grace).await;
            }
        }
        ExitCode::SUCCESS
    })
}
