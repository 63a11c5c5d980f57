//! Link Sync GW
//!
//! Keeps a Pro DJ Link network and an Ableton Link session in tempo, beat and
//! phase agreement, talking to Link through the Carabiner daemon.

pub mod bridge;
pub mod carabiner;
pub mod cli;
pub mod config;
pub mod error;
pub mod network;
pub mod status;
pub mod sync;

pub use bridge::{BridgeOptions, BridgeStatus, SyncBridge};
pub use error::{BridgeError, Result};
pub use network::{DeviceNetwork, DeviceState, LocalEvent, SimulatedNetwork, TimelineSnapshot};
pub use status::{ConnectionStatus, Diagnostic};
pub use sync::{valid_tempo, DeviceView, SyncMode};
