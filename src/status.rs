//! Connection status and user-visible diagnostics
//!
//! The GUI layer (or the console) subscribes with callbacks; the bridge calls
//! them whenever the Carabiner connection changes or something the operator
//! should hear about happens.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::sync::SyncMode;

/// Connection status of the Carabiner link
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConnectionStatus {
    /// Connected to the daemon
    Connected { port: u16 },
    /// No connection
    Disconnected,
}

/// Something the operator should be told about
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The TCP connection could not be opened
    ConnectFailed { port: u16, reason: String },
    /// Connected, but no status arrived in time: not Carabiner, or not responding
    Rejected { port: u16 },
    /// The daemon closed the connection
    UnexpectedDisconnect,
    /// A sync mode was refused
    SyncModeRejected { requested: SyncMode, reason: String },
    /// Full sync was requested but only Passive could be granted
    SyncModeDegraded { requested: SyncMode, granted: SyncMode },
    /// The virtual player dropped off the network while sync was active
    WentOffline,
    /// Carabiner did not understand one of our commands
    Unsupported { command: String },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ConnectFailed { port, reason } => write!(
                f,
                "Unable to connect to Carabiner on port {}: {}. Make sure it is running.",
                port, reason
            ),
            Diagnostic::Rejected { port } => write!(
                f,
                "Did not receive a status response from port {}; the connection was rejected. \
                 Is Carabiner really running there?",
                port
            ),
            Diagnostic::UnexpectedDisconnect => {
                f.write_str("Carabiner unexpectedly closed the connection.")
            },
            Diagnostic::SyncModeRejected { requested, reason } => {
                write!(f, "Cannot use {} sync: {}.", requested, reason)
            },
            Diagnostic::SyncModeDegraded { requested, granted } => write!(
                f,
                "{} sync requires the virtual player to send status packets; using {} sync instead.",
                requested, granted
            ),
            Diagnostic::WentOffline => {
                f.write_str("The virtual player went offline; sync has been turned off.")
            },
            Diagnostic::Unsupported { command } => write!(
                f,
                "Carabiner does not support the {} command; please upgrade it.",
                command
            ),
        }
    }
}

/// Callback invoked on connection status changes
pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Callback invoked with each diagnostic
pub type DiagnosticCallback = Arc<dyn Fn(Diagnostic) + Send + Sync>;
