//! # spot-runner
//!
//! Main entry point for the spot price relay.
//!
//! Loads a JSON configuration file, applies credential overrides from the
//! environment, connects the cTrader session and serves WebSocket clients
//! until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! spot-runner config/relay.example.json --log-level info
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use spot_relay::{RelayServer, transport};
use spot_upstream::{UpstreamSession, ctrader::CTraderProvider};
use tracing::{error, info, warn};

/// How long to wait for the relay actor to close everything on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Spot Price Relay.
#[derive(Parser)]
#[command(name = "spot-runner", about = "Real-time spot price relay")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output (overrides `module.log_path`).
    #[arg(long)]
    log_dir: Option<String>,

    /// Client listen address (overrides `relay.listen_addr`).
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (logging needs the module name and log path)
    let mut config = spot_core::config::load_config(&cli.config)?;
    config.apply_env_overrides()?;
    if let Some(addr) = cli.listen {
        config.relay.listen_addr = addr;
    }

    // 2. Initialize logging
    let module_name = config.module_name();
    let log_dir = cli.log_dir.or_else(|| config.log_path());
    spot_core::logging::init_logging(
        &cli.log_level,
        log_dir.as_deref(),
        &module_name,
        config.module.log_format,
    );

    info!(
        "spot-runner starting, config={}, log_level={}",
        cli.config.display(),
        cli.log_level
    );
    config.validate()?;
    info!(
        "upstream {} account={} directory_mode={:?}",
        config.upstream.ws_url(),
        config.upstream.account_id,
        config.upstream.directory_mode
    );

    // 3. Build the session and the relay actor
    let provider = CTraderProvider::new(&config.upstream);
    let session = UpstreamSession::new(Box::new(provider), config.upstream.clone());
    let (server, relay) = RelayServer::new(session, &config.relay, &config.reconnect);
    let mut actor = tokio::spawn(server.run());

    // 4. Start the client listener
    let listener = transport::bind(&config.relay.listen_addr).await?;
    let mut acceptor = tokio::spawn(transport::serve(listener, relay.clone()));

    info!("relay running, press Ctrl+C to stop");

    // 5. Wait for shutdown signal (or an unexpected actor or listener exit)
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutdown signal received");
        }
        _ = &mut actor => {
            error!("relay actor exited unexpectedly");
            acceptor.abort();
            return Ok(());
        }
        _ = &mut acceptor => {
            error!("client listener exited unexpectedly, shutting down");
        }
    }

    // 6. Stop accepting, then let the actor close upstream and clients
    acceptor.abort();
    if let Err(e) = relay.shutdown().await {
        warn!("relay already stopped: {e}");
    }
    if tokio::time::timeout(SHUTDOWN_GRACE, actor).await.is_err() {
        warn!("relay did not stop within {SHUTDOWN_GRACE:?}");
    }

    info!("spot-runner stopped, goodbye");
    Ok(())
}
