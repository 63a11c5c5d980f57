//! Shared connection state
//!
//! One record per process. The reader task, the reconciliation loop and operator
//! commands all update it, always through short critical sections on the
//! bridge's mutex and never across I/O.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::network::TimelineSnapshot;
use crate::sync::SyncMode;

/// Outstanding `beat-at-time` request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatProbe {
    /// Latency-adjusted timestamp sent to Carabiner
    pub when: i64,
    /// Beat within bar (1-4) of the DJ Link beat that triggered the probe, when bar-aligning
    pub beat_within_bar: Option<u8>,
}

/// Outstanding `phase-at-time` request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseProbe {
    pub when: i64,
    /// Virtual player timeline at the moment the probe was sent
    pub snapshot: TimelineSnapshot,
}

#[derive(Debug)]
pub struct ConnectionState {
    /// Outgoing command channel to the writer task, present only while connected
    pub socket: Option<mpsc::UnboundedSender<Bytes>>,
    /// Incremented on every successful connect
    pub generation: u64,

    pub port: u16,
    pub latency_ms: i64,
    pub align_to_bar: bool,

    pub link_bpm: Option<f64>,
    pub link_peers: Option<i64>,
    /// Tempo we are forcing on the Link session, only while it follows DJ Link
    pub target_bpm: Option<f64>,

    pub pending_beat_probe: Option<BeatProbe>,
    pub pending_phase_probe: Option<PhaseProbe>,

    pub sync_mode: SyncMode,
    /// Operator wants Link to follow the DJ Link master
    pub link_sync: bool,
    /// The virtual player is tempo master, driven by Link
    pub link_master: bool,
    /// Tempo and beat listeners are relaying DJ Link into Link
    pub following_network: bool,
}

impl ConnectionState {
    pub fn new(port: u16, latency_ms: i64, align_to_bar: bool) -> Self {
        Self {
            socket: None,
            generation: 0,
            port,
            latency_ms,
            align_to_bar,
            link_bpm: None,
            link_peers: None,
            target_bpm: None,
            pending_beat_probe: None,
            pending_phase_probe: None,
            sync_mode: SyncMode::Off,
            link_sync: false,
            link_master: false,
            following_network: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// True while `generation` is the live connection
    pub fn is_current(&self, generation: u64) -> bool {
        self.socket.is_some() && self.generation == generation
    }

    /// Reset everything learned from the daemon
    pub fn clear_link_state(&mut self) {
        self.socket = None;
        self.link_bpm = None;
        self.link_peers = None;
        self.pending_beat_probe = None;
        self.pending_phase_probe = None;
    }
}
