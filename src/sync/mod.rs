//! Tempo, beat and phase synchronization between DJ Link and Link
//!
//! - `tempo`: keeps the two tempos reconciled
//! - `align`: beat and phase corrections
//! - `mode`: the Off/Triggers/Passive/Full state machine and master handoff
//! - `hysteresis`: suppression windows for just-issued commands
//! - `reconcile`: the periodic poller tying it together

pub mod align;
pub mod hysteresis;
pub mod mode;
pub mod reconcile;
pub mod tempo;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use hysteresis::CommandHysteresis;
pub use tempo::valid_tempo;

/// How far the bridge is allowed to drive the two timing domains
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// No synchronization
    #[default]
    Off,
    /// Only external triggers toggle whether Link follows DJ Link
    Triggers,
    /// Link may follow DJ Link; the virtual player never becomes master
    Passive,
    /// Either side may lead
    Full,
}

impl SyncMode {
    /// Modes in which Link may be tied to the DJ Link master
    pub fn is_bidirectional(self) -> bool {
        matches!(self, SyncMode::Passive | SyncMode::Full)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncMode::Off => "Off",
            SyncMode::Triggers => "Triggers",
            SyncMode::Passive => "Passive",
            SyncMode::Full => "Full",
        })
    }
}

impl FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(SyncMode::Off),
            "triggers" => Ok(SyncMode::Triggers),
            "passive" => Ok(SyncMode::Passive),
            "full" => Ok(SyncMode::Full),
            other => Err(format!("unknown sync mode '{}'", other)),
        }
    }
}

/// Flags last rendered for one player
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceView {
    pub synced: bool,
    pub master: bool,
}
