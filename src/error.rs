//! Error types for the sync bridge
//!
//! Connection and validation failures are reported synchronously to the caller.
//! Protocol errors and stale responses never surface here: the reader task logs
//! them and keeps going.

use thiserror::Error;

/// Errors returned by bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A command was issued without an active Carabiner connection
    #[error("no active Carabiner connection")]
    NotConnected,

    /// The connection settings cannot change while a connection is open
    #[error("cannot change connection settings while connected to Carabiner")]
    AlreadyConnected,

    /// Tempo outside the range Ableton Link supports
    #[error("tempo {0} is outside the supported range (20.0, 999.0)")]
    InvalidTempo(f64),

    /// The virtual player is not online on the DJ Link network
    #[error("the virtual player is not online on the DJ Link network")]
    Offline,

    /// The operation is only available in Full sync mode
    #[error("operation requires Full sync mode")]
    RequiresFullSync,

    /// The operation needs a sync mode other than Off
    #[error("sync mode is Off")]
    SyncOff,

    /// A command to the DJ Link network failed
    #[error("DJ Link command failed: {0:#}")]
    Device(#[from] anyhow::Error),
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
