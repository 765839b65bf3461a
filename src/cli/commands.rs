//! CLI command implementations

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::args::Command;
use super::bench::{self, BenchOptions};
use super::errors::CliResult;
use crate::config::{LoggingConfig, RelayConfig};
use crate::context::Relay;
use crate::durable_log::LogBackend;
use crate::http_server::HttpServer;
use crate::observability::init_logging;

/// Dispatch a parsed command
pub async fn run_command(command: Command) -> CliResult<()> {
    match command {
        Command::Serve { config } => serve(config.as_deref()).await,
        Command::Bench {
            url,
            api_key,
            users,
            messages,
            max_retries,
        } => {
            init_logging(&LoggingConfig::default())?;
            let report = bench::run(BenchOptions {
                url,
                api_key,
                users,
                messages,
                max_retries,
            })
            .await?;
            print!("{}", report);
            Ok(())
        }
    }
}

/// Load configuration, start the relay and serve until Ctrl-C
pub async fn serve(config_path: Option<&Path>) -> CliResult<()> {
    let config = RelayConfig::load(config_path)?;
    init_logging(&config.logging)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config_path,
        "Starting streamrelay"
    );

    let backend = LogBackend::open(&config.durable_log)?;
    let relay = Relay::start(config, backend);
    let server = HttpServer::new(Arc::clone(&relay));

    // Close subscribers first so upgraded connections do not hold up the drain
    let stopping = Arc::clone(&relay);
    let served = server
        .start(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            stopping.shutdown().await;
        })
        .await;

    relay.shutdown().await;
    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Cannot listen for Ctrl-C; serving until killed");
        std::future::pending::<()>().await;
    }
}
