//! Configuration file watcher for hot-reload support
//!
//! Only latency, bar alignment and the Carabiner port can change at runtime;
//! the gateway decides what to apply from each reloaded `AppConfig`.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppConfig;

/// Wait for editors to finish writing before re-reading
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Watches the config file and yields each valid new version
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<AppConfig>,
}

impl ConfigWatcher {
    /// Load `config_path` and start watching it
    pub async fn new(config_path: String) -> Result<(Self, Arc<AppConfig>)> {
        let initial_config = AppConfig::load(&config_path)
            .await
            .context("Failed to load initial config")?;

        let (tx, rx) = mpsc::channel(10);
        // notify calls back on its own thread, outside the runtime
        let runtime = Handle::current();
        let path = config_path.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) if is_content_change(&event.kind) => {
                    debug!("Config file changed: {:?}", event.paths);
                    runtime.spawn(reload(path.clone(), tx.clone()));
                },
                Ok(_) => {},
                Err(e) => error!("Config watch error: {}", e),
            }
        })?;

        watcher
            .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch config file: {}", config_path))?;
        info!("👀 Watching {} for changes", config_path);

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            Arc::new(initial_config),
        ))
    }

    /// Next reloaded configuration, or None once the watcher is gone
    pub async fn next_config(&mut self) -> Option<AppConfig> {
        self.rx.recv().await
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Modify(_) | EventKind::Create(_))
}

async fn reload(path: String, tx: mpsc::Sender<AppConfig>) {
    tokio::time::sleep(SETTLE_DELAY).await;

    match AppConfig::load(&path).await {
        Ok(config) => {
            info!("📝 Configuration reloaded");
            if tx.send(config).await.is_err() {
                debug!("Config reload dropped, nobody is listening");
            }
        },
        Err(e) => warn!("⚠️  Keeping previous config, reload failed: {:#}", e),
    }
}
