//! DJ Link network capabilities
//!
//! The bridge never talks to the Pro DJ Link network directly. Device discovery,
//! status packets and the virtual player's timeline live in an external library;
//! the bridge only sees them through the `DeviceNetwork` trait, injected at
//! construction time.

use anyhow::Result;
use serde::Serialize;

pub mod sim;

pub use sim::SimulatedNetwork;

/// Point-in-time view of the virtual player's playback timeline
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelineSnapshot {
    /// Position within the current beat, in [0, 1)
    pub beat_phase: f64,
    /// Position within the current bar, in [0, 1)
    pub bar_phase: f64,
    /// Length of one beat in milliseconds
    pub beat_interval_ms: f64,
    /// Length of one bar in milliseconds
    pub bar_interval_ms: f64,
}

impl TimelineSnapshot {
    /// Build a snapshot for a timeline at `beat` (zero-based, fractional) and `bpm`
    pub fn at_beat(beat: f64, bpm: f64) -> Self {
        let beat_interval_ms = 60_000.0 / bpm;
        Self {
            beat_phase: beat.rem_euclid(1.0),
            bar_phase: (beat / 4.0).rem_euclid(1.0),
            beat_interval_ms,
            bar_interval_ms: beat_interval_ms * 4.0,
        }
    }
}

/// Live sync/master flags of one player on the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceState {
    pub number: u8,
    pub synced: bool,
    pub tempo_master: bool,
}

/// Notifications from the DJ Link network
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    /// The network's master tempo changed
    MasterTempoChanged { bpm: f64 },
    /// A player announced a beat
    Beat {
        device: u8,
        /// When the beat packet arrived, in microseconds on the shared clock
        timestamp_us: i64,
        /// 1-4
        beat_within_bar: u8,
        /// The sending player is the current tempo master
        from_master: bool,
    },
}

/// Capabilities the bridge consumes from the DJ Link network
///
/// Implementations must be cheap to call; the bridge invokes them from the
/// reader task, the reconciliation loop and operator commands.
pub trait DeviceNetwork: Send + Sync {
    /// Is the virtual player online on the network?
    fn is_online(&self) -> bool;

    /// Player number used by the virtual player
    fn device_number(&self) -> u8;

    /// Is the virtual player currently tempo master?
    fn is_tempo_master(&self) -> bool;

    /// Is the virtual player sending real status packets (required to become master)?
    fn is_sending_status(&self) -> bool;

    /// Tempo of the current network master, if there is one
    fn master_tempo(&self) -> Option<f64>;

    /// Current time in microseconds on the clock Carabiner also uses
    fn now_micros(&self) -> i64;

    /// Snapshot of the virtual player's timeline at this instant
    fn timeline_snapshot(&self) -> TimelineSnapshot;

    /// Live flags of every known player, including the virtual one
    fn devices(&self) -> Vec<DeviceState>;

    /// Set the virtual player's tempo
    fn set_tempo(&self, bpm: f64);

    /// Ask the virtual player to become tempo master
    fn become_tempo_master(&self) -> Result<()>;

    /// Start or stop the virtual player
    fn set_playing(&self, playing: bool);

    /// Shift the virtual player's timeline by `ms` milliseconds
    fn adjust_playback_position(&self, ms: i64);

    /// Send a sync on/off command to a player
    fn send_sync_command(&self, device: u8, synced: bool) -> Result<()>;

    /// Tell a player to become tempo master
    fn send_master_command(&self, device: u8) -> Result<()>;
}
