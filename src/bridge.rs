//! The sync bridge handle
//!
//! `SyncBridge` is a cheap-to-clone handle around the shared state. Its
//! behavior is spread over several modules, each adding an `impl SyncBridge`
//! block: connection lifecycle in `carabiner::connection`, tempo in
//! `sync::tempo`, alignment in `sync::align`, sync modes in `sync::mode` and
//! the periodic poller in `sync::reconcile`.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::carabiner::ConnectionState;
use crate::error::{BridgeError, Result};
use crate::network::DeviceNetwork;
use crate::status::{ConnectionStatus, Diagnostic, DiagnosticCallback, StatusCallback};
use crate::sync::hysteresis::CommandHysteresis;
use crate::sync::{DeviceView, SyncMode};

/// Static settings for a bridge instance
#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    /// Bounds each socket read so the reader can notice it was superseded
    pub read_timeout: Duration,
    /// How long a fresh connection may go without a status message
    pub watchdog: Duration,
    pub latency_ms: i64,
    pub align_to_bar: bool,
    pub poll_interval: Duration,
    /// Phase probes go out on every Nth reconciliation tick
    pub phase_probe_every: u64,
    pub sync_hysteresis: Duration,
    pub master_hysteresis: Duration,
    /// Pause before re-requesting status after a master handoff
    pub status_refresh_delay: Duration,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17000,
            connect_timeout: Duration::from_millis(5000),
            read_timeout: Duration::from_millis(2000),
            watchdog: Duration::from_millis(1000),
            latency_ms: 1,
            align_to_bar: false,
            poll_interval: Duration::from_millis(100),
            phase_probe_every: 2,
            sync_hysteresis: Duration::from_millis(250),
            master_hysteresis: Duration::from_millis(300),
            status_refresh_delay: Duration::from_millis(50),
        }
    }
}

/// Snapshot of the bridge for display
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeStatus {
    pub connected: bool,
    pub port: u16,
    pub latency_ms: i64,
    pub align_to_bar: bool,
    pub link_bpm: Option<f64>,
    pub link_peers: Option<i64>,
    pub target_bpm: Option<f64>,
    pub sync_mode: SyncMode,
    pub link_sync: bool,
    pub link_master: bool,
}

pub(crate) struct BridgeInner {
    pub(crate) options: BridgeOptions,
    pub(crate) network: Arc<dyn DeviceNetwork>,
    pub(crate) state: Mutex<ConnectionState>,
    pub(crate) hysteresis: CommandHysteresis,
    /// Last flags rendered per player
    pub(crate) views: Mutex<BTreeMap<u8, DeviceView>>,
    pub(crate) status_callbacks: RwLock<Vec<StatusCallback>>,
    pub(crate) diagnostic_callbacks: RwLock<Vec<DiagnosticCallback>>,
    pub(crate) shutdown_flag: AtomicBool,
}

/// Tempo, beat and phase bridge between DJ Link and an Ableton Link session
#[derive(Clone)]
pub struct SyncBridge {
    pub(crate) inner: Arc<BridgeInner>,
}

impl SyncBridge {
    pub fn new(options: BridgeOptions, network: Arc<dyn DeviceNetwork>) -> Self {
        let state = ConnectionState::new(options.port, options.latency_ms, options.align_to_bar);
        let hysteresis = CommandHysteresis::new(options.sync_hysteresis, options.master_hysteresis);
        Self {
            inner: Arc::new(BridgeInner {
                options,
                network,
                state: Mutex::new(state),
                hysteresis,
                views: Mutex::new(BTreeMap::new()),
                status_callbacks: RwLock::new(Vec::new()),
                diagnostic_callbacks: RwLock::new(Vec::new()),
                shutdown_flag: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.inner.options
    }

    pub(crate) fn network(&self) -> &dyn DeviceNetwork {
        self.inner.network.as_ref()
    }

    pub fn state(&self) -> BridgeStatus {
        let state = self.inner.state.lock();
        BridgeStatus {
            connected: state.is_connected(),
            port: state.port,
            latency_ms: state.latency_ms,
            align_to_bar: state.align_to_bar,
            link_bpm: state.link_bpm,
            link_peers: state.link_peers,
            target_bpm: state.target_bpm,
            sync_mode: state.sync_mode,
            link_sync: state.link_sync,
            link_master: state.link_master,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().is_connected()
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.inner.state.lock().sync_mode
    }

    pub fn link_bpm(&self) -> Option<f64> {
        self.inner.state.lock().link_bpm
    }

    pub fn link_peers(&self) -> Option<i64> {
        self.inner.state.lock().link_peers
    }

    pub fn target_bpm(&self) -> Option<f64> {
        self.inner.state.lock().target_bpm
    }

    /// Change the Carabiner port; only allowed while disconnected
    pub fn set_port(&self, port: u16) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.is_connected() {
            return Err(BridgeError::AlreadyConnected);
        }
        state.port = port;
        info!("Carabiner port set to {}", port);
        Ok(())
    }

    /// Set the latency (ms) between DJ Link beat packets and actual beats
    pub fn set_latency(&self, latency_ms: i64) {
        self.inner.state.lock().latency_ms = latency_ms;
        info!("Latency set to {}ms", latency_ms);
    }

    /// Align at the bar level instead of the beat level
    pub fn set_align_to_bar(&self, align: bool) {
        self.inner.state.lock().align_to_bar = align;
        info!("Bar alignment {}", if align { "enabled" } else { "disabled" });
    }

    /// Subscribe to connection status changes
    pub fn subscribe_connection_status(&self, callback: StatusCallback) {
        self.inner.status_callbacks.write().push(callback);
    }

    /// Subscribe to user-visible diagnostics
    pub fn subscribe_diagnostics(&self, callback: DiagnosticCallback) {
        self.inner.diagnostic_callbacks.write().push(callback);
    }

    pub(crate) fn emit_status(&self, status: ConnectionStatus) {
        for callback in self.inner.status_callbacks.read().iter() {
            callback(status.clone());
        }
    }

    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        warn!("{}", diagnostic);
        for callback in self.inner.diagnostic_callbacks.read().iter() {
            callback(diagnostic.clone());
        }
    }
}
