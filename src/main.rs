//! Link Sync GW
//!
//! Bridges tempo, beats and phase between a Pro DJ Link network and an Ableton
//! Link session through the Carabiner daemon.

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use link_sync_gw::config::{watcher::ConfigWatcher, AppConfig};
use link_sync_gw::{cli, ConnectionStatus, SimulatedNetwork, SyncBridge, SyncMode};

/// Link Sync GW - keep DJ Link and Ableton Link in time
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Carabiner port, overriding the configuration file
    #[arg(short, long)]
    port: Option<u16>,

    /// Connect to Carabiner at startup
    #[arg(long)]
    connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(&args.log_level)?;

    info!("Starting Link Sync GW v{}...", env!("CARGO_PKG_VERSION"));

    // A missing file means defaults and no hot reload
    let (config_watcher, mut config) = if Path::new(&args.config).exists() {
        let (watcher, config) = ConfigWatcher::new(args.config.clone()).await?;
        info!("Configuration loaded from {} with hot-reload enabled", args.config);
        (Some(watcher), (*config).clone())
    } else {
        warn!("Configuration file {} not found, using defaults", args.config);
        (None, AppConfig::default())
    };
    if let Some(port) = args.port {
        config.carabiner.port = port;
    }

    let network = Arc::new(SimulatedNetwork::new(
        config.network.device_number,
        config.network.initial_bpm,
    ));
    let events = network.subscribe();
    let metronome = Arc::clone(&network).spawn_metronome();

    let bridge = SyncBridge::new(config.to_bridge_options(), network);
    bridge.subscribe_connection_status(Arc::new(|status| match status {
        ConnectionStatus::Connected { port } => info!("Carabiner connected on port {}", port),
        ConnectionStatus::Disconnected => info!("Carabiner disconnected"),
    }));

    let reconciler = bridge.spawn_reconciler();
    let pump = bridge.spawn_event_pump(events);

    if args.connect || config.carabiner.auto_connect {
        start_sync(&bridge, config.sync.mode).await;
    }

    let repl = {
        let bridge = bridge.clone();
        let runtime = tokio::runtime::Handle::current();
        tokio::task::spawn_blocking(move || cli::run_repl(bridge, runtime))
    };

    run_app(&bridge, config_watcher, args.port, repl, shutdown_signal()).await;

    info!("Shutting down...");
    bridge.shutdown();
    reconciler.abort();
    pump.abort();
    metronome.abort();
    info!("Link Sync GW shutdown complete");
    Ok(())
}

/// Connect and request the configured sync mode
async fn start_sync(bridge: &SyncBridge, mode: SyncMode) {
    if !bridge.connect().await || mode == SyncMode::Off {
        return;
    }
    match bridge.set_sync_mode(mode) {
        Ok(granted) => info!("Sync mode {}", granted),
        Err(e) => warn!("Could not enter {} sync: {}", mode, e),
    }
}

async fn run_app(
    bridge: &SyncBridge,
    mut config_watcher: Option<ConfigWatcher>,
    port_override: Option<u16>,
    mut repl: tokio::task::JoinHandle<Result<()>>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            // Handle config reload
            Some(new_config) = next_config(&mut config_watcher) => {
                apply_runtime_config(bridge, &new_config, port_override);
            }

            result = &mut repl => {
                match result {
                    Ok(Ok(())) => info!("Console closed"),
                    Ok(Err(e)) => warn!("Console failed: {:#}", e),
                    Err(e) => warn!("Console task failed: {}", e),
                }
                break;
            }

            _ = &mut shutdown => {
                break;
            }
        }
    }
}

async fn next_config(watcher: &mut Option<ConfigWatcher>) -> Option<AppConfig> {
    match watcher {
        Some(watcher) => watcher.next_config().await,
        None => std::future::pending().await,
    }
}

/// Apply the settings that may change while running
///
/// A port given on the command line wins over the file.
fn apply_runtime_config(bridge: &SyncBridge, config: &AppConfig, port_override: Option<u16>) {
    let current = bridge.state();
    if config.carabiner.latency_ms != current.latency_ms {
        bridge.set_latency(config.carabiner.latency_ms);
    }
    if config.carabiner.align_to_bar != current.align_to_bar {
        bridge.set_align_to_bar(config.carabiner.align_to_bar);
    }
    let port = port_override.unwrap_or(config.carabiner.port);
    if port != current.port {
        if let Err(e) = bridge.set_port(port) {
            warn!(
                "⚠️  Keeping Carabiner port {}: {}",
                current.port, e
            );
        }
    }
    info!("✅ Configuration applied");
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
