//! RFID presence monitor
//!
//! Polls a fixed RFID reader over TCP, tracks when each tag was last seen and
//! serves the active/missing view over HTTP and a WebSocket stream.
//!
//! Module structure:
//! - `domain/` - Core presence types (TagId, ConnectionState, snapshots)
//! - `io/` - External interfaces (reader, simulator, name store, HTTP API)
//! - `services/` - Presence tracking, control commands, snapshot publishing
//! - `infra/` - Infrastructure (Config, Metrics)

use anyhow::Context;
use clap::Parser;
use presence_monitor::infra::{Config, Metrics};
use presence_monitor::io::{
    start_api_server, ApiContext, CachedNameStore, DefaultLinkFactory, SqliteNameStore,
};
use presence_monitor::services::{ControlSurface, PresencePublisher, PresenceTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// RFID presence monitor - active/missing asset tracking for one reader
#[derive(Parser, Debug)]
#[command(name = "presence-monitor", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,

    /// Generate tags from the built-in simulator instead of a reader
    #[arg(long)]
    simulation: bool,

    /// Start polling immediately instead of waiting for POST /start
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default: INFO, use RUST_LOG=debug for per-cycle visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = env!("GIT_HASH"), "presence-monitor starting");

    let args = Args::parse();

    let mut config = Config::load_from_path(&args.config);
    if args.simulation {
        config = config.with_simulation(true);
    }
    if args.autostart {
        config = config.with_autostart(true);
    }

    info!(
        config_file = %config.config_file(),
        reader_address = %config.reader_address(),
        reader_port = %config.reader_port(),
        missing_timeout_s = %config.missing_timeout_secs(),
        simulation = %config.simulation(),
        autostart = %config.autostart(),
        api_port = %config.server_port(),
        store_path = %config.store_path(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let names = Arc::new(CachedNameStore::new(
        SqliteNameStore::open(config.store_path())
            .with_context(|| format!("Failed to open name store {}", config.store_path()))?,
    ));
    let metrics = Arc::new(Metrics::new());
    let tracker = Arc::new(PresenceTracker::new(
        config.monitor_settings(),
        config.monitor_timings(),
        names.clone(),
        Arc::new(DefaultLinkFactory::new(config.poll_command())),
        metrics.clone(),
    ));

    // Periodic metrics summary (0 disables)
    let metrics_interval = config.metrics_interval_secs();
    if metrics_interval > 0 {
        let metrics_clone = metrics.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
            interval.tick().await;
            loop {
                interval.tick().await;
                metrics_clone.report().log();
            }
        });
    }

    if config.autostart() {
        tracker.start(None).await;
    }

    let control = ControlSurface::new(tracker.clone(), names);
    let publisher = PresencePublisher::new(tracker.clone(), config.publish_interval());
    let ctx = Arc::new(ApiContext::new(control, publisher));

    let bind_address = config.bind_address().to_string();
    let api_port = config.server_port();
    let api_shutdown = shutdown_rx.clone();
    let mut api = tokio::spawn(async move {
        if let Err(e) = start_api_server(&bind_address, api_port, ctx, api_shutdown).await {
            error!(error = %format!("{e:#}"), "api_server_error");
        }
    });

    // Run until Ctrl+C or the API server exits on its own
    let api_exited = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown_signal_received");
            false
        }
        _ = &mut api => {
            error!("api_server_exited");
            true
        }
    };
    let _ = shutdown_tx.send(true);

    tracker.stop().await;
    if !api_exited {
        let _ = tokio::time::timeout(Duration::from_secs(1), api).await;
    }

    info!("presence-monitor shutdown complete");
    Ok(())
}
