//! Carabiner connection management
//!
//! Handles the TCP connection lifecycle: connect with timeout, the per-connection
//! reader and writer tasks, the startup watchdog, and teardown. Every connection
//! gets a new generation number; tasks spawned for an older generation notice
//! the mismatch and stop without touching state.

use bytes::{Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use super::codec::{self, CarabinerCodec, Command, Message};
use crate::bridge::SyncBridge;
use crate::error::{BridgeError, Result};
use crate::status::{ConnectionStatus, Diagnostic};
use crate::sync::SyncMode;

const READ_BUFFER_SIZE: usize = 1024;

impl SyncBridge {
    /// Connect to Carabiner on the configured host and port
    ///
    /// Returns true if a connection is active afterwards. Failures are reported
    /// as diagnostics.
    pub async fn connect(&self) -> bool {
        let port = {
            let state = self.inner.state.lock();
            if state.is_connected() {
                return true;
            }
            state.port
        };
        let options = &self.inner.options;
        info!("🔗 Connecting to Carabiner at {}:{}", options.host, port);

        let connecting = TcpStream::connect((options.host.as_str(), port));
        let stream = match timeout(options.connect_timeout, connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.report(Diagnostic::ConnectFailed {
                    port,
                    reason: e.to_string(),
                });
                return false;
            },
            Err(_) => {
                self.report(Diagnostic::ConnectFailed {
                    port,
                    reason: format!("timed out after {}ms", options.connect_timeout.as_millis()),
                });
                return false;
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on Carabiner socket: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let generation = {
            let mut state = self.inner.state.lock();
            if state.is_connected() {
                // Another caller connected while we were waiting
                debug!("Dropping redundant Carabiner connection");
                return true;
            }
            state.clear_link_state();
            state.generation += 1;
            state.socket = Some(tx);
            state.generation
        };

        tokio::spawn(run_writer(generation, rx, write_half));
        tokio::spawn(self.clone().run_reader(generation, read_half));
        tokio::spawn(self.clone().run_watchdog(generation));

        info!("✅ Connected to Carabiner (generation {})", generation);
        self.emit_status(ConnectionStatus::Connected { port });

        if let Err(e) = self.send(Command::Version) {
            debug!("Could not request Carabiner version: {}", e);
        }
        true
    }

    /// Close the connection, if any, and turn sync off
    ///
    /// Safe to call at any time; does nothing when disconnected.
    pub fn disconnect(&self) {
        self.disconnect_where(None);
    }

    /// Disconnect only if `generation` is still the live connection
    pub(crate) fn disconnect_generation(&self, generation: u64) {
        self.disconnect_where(Some(generation));
    }

    fn disconnect_where(&self, generation: Option<u64>) {
        let previous_mode = {
            let mut state = self.inner.state.lock();
            if !state.is_connected() {
                return;
            }
            if generation.is_some_and(|g| g != state.generation) {
                return;
            }
            state.clear_link_state();
            std::mem::replace(&mut state.sync_mode, SyncMode::Off)
        };

        self.leave_sync_mode(previous_mode);
        info!("🔌 Disconnected from Carabiner");
        self.emit_status(ConnectionStatus::Disconnected);
    }

    /// Send a command to Carabiner
    pub fn send(&self, command: Command) -> Result<()> {
        self.send_checked(None, command)
    }

    /// Send a command, but only while `generation` (if given) is the live connection
    pub(crate) fn send_checked(&self, generation: Option<u64>, command: Command) -> Result<()> {
        let state = self.inner.state.lock();
        let socket = state.socket.as_ref().ok_or(BridgeError::NotConnected)?;
        if generation.is_some_and(|g| g != state.generation) {
            return Err(BridgeError::NotConnected);
        }
        debug!("→ Carabiner: {}", command);
        socket
            .send(codec::encode(&command))
            .map_err(|_| BridgeError::NotConnected)
    }

    pub(crate) fn is_current_generation(&self, generation: u64) -> bool {
        self.inner.state.lock().is_current(generation)
    }

    async fn run_reader(self, generation: u64, mut reader: OwnedReadHalf) {
        let read_timeout = self.inner.options.read_timeout;
        let mut codec = CarabinerCodec;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            if !self.is_current_generation(generation) {
                debug!("Carabiner reader for generation {} superseded", generation);
                break;
            }

            buf.reserve(READ_BUFFER_SIZE);
            match timeout(read_timeout, reader.read_buf(&mut buf)).await {
                Err(_) => {
                    trace!("Carabiner read timed out, rechecking connection");
                },
                Ok(Ok(0)) => {
                    self.handle_peer_closed(generation);
                    break;
                },
                Ok(Ok(n)) => {
                    trace!("← Carabiner: {} bytes", n);
                    loop {
                        match codec.decode(&mut buf) {
                            Ok(Some(message)) => self.dispatch(generation, message),
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Carabiner protocol error: {}", e);
                                break;
                            },
                        }
                    }
                },
                Ok(Err(e)) if is_connection_lost(e.kind()) => {
                    debug!("Carabiner connection lost: {}", e);
                    self.handle_peer_closed(generation);
                    break;
                },
                Ok(Err(e)) => {
                    if !self.is_current_generation(generation) {
                        break;
                    }
                    warn!("Error reading from Carabiner: {}", e);
                },
            }
        }
    }

    fn handle_peer_closed(&self, generation: u64) {
        if self.is_current_generation(generation) {
            self.report(Diagnostic::UnexpectedDisconnect);
            self.disconnect_generation(generation);
        }
    }

    /// Tear down a connection that never produced a status message
    async fn run_watchdog(self, generation: u64) {
        sleep(self.inner.options.watchdog).await;

        let silent_port = {
            let state = self.inner.state.lock();
            (state.is_current(generation) && state.link_bpm.is_none()).then_some(state.port)
        };
        if let Some(port) = silent_port {
            self.report(Diagnostic::Rejected { port });
            self.disconnect_generation(generation);
        }
    }

    fn dispatch(&self, generation: u64, message: Message) {
        trace!(?message, "Carabiner message");
        match message {
            Message::Status { bpm, peers } => self.handle_status(generation, bpm, peers),
            Message::BeatAtTime { beat, when } => self.handle_beat_at_time(generation, beat, when),
            Message::PhaseAtTime { phase, when } => {
                self.handle_phase_at_time(generation, phase, when)
            },
            Message::Version(version) => {
                if supports_full_protocol(&version) {
                    info!("Carabiner version {}", version);
                } else {
                    warn!(
                        "Carabiner version {} is too old for beat alignment, please upgrade to 1.1 or later",
                        version
                    );
                }
            },
            Message::Unsupported { command } => {
                if self.is_current_generation(generation) {
                    self.report(Diagnostic::Unsupported { command });
                }
            },
            Message::Unrecognized { raw } => {
                warn!("Unrecognized message from Carabiner: {}", raw);
            },
        }
    }
}

/// Carabiner 1.1 added the probe commands
fn supports_full_protocol(version: &str) -> bool {
    let mut parts = version.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    (major, minor) >= (1, 1)
}

fn is_connection_lost(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe
    )
}

async fn run_writer(
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: OwnedWriteHalf,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Failed to write to Carabiner (generation {}): {}", generation, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
    debug!("Carabiner writer for generation {} closed", generation);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeOptions;
    use crate::network::SimulatedNetwork;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn bridge_on(port: u16) -> SyncBridge {
        let options = BridgeOptions {
            port,
            ..BridgeOptions::default()
        };
        SyncBridge::new(options, Arc::new(SimulatedNetwork::new(5, 120.0)))
    }

    #[test]
    fn test_version_check() {
        assert!(supports_full_protocol("1.1.0"));
        assert!(supports_full_protocol("1.2"));
        assert!(supports_full_protocol("2.0.1"));
        assert!(!supports_full_protocol("1.0.9"));
        assert!(!supports_full_protocol("garbage"));
    }

    #[test]
    fn test_send_without_connection_fails() {
        let bridge = bridge_on(17000);
        assert!(matches!(
            bridge.send(Command::Status),
            Err(BridgeError::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let bridge = bridge_on(17000);
        bridge.disconnect();
        bridge.disconnect();
        assert!(!bridge.is_connected());
        assert_eq!(bridge.sync_mode(), SyncMode::Off);
    }

    #[tokio::test]
    async fn test_connect_refused_reports_diagnostic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bridge = bridge_on(port);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bridge.subscribe_diagnostics(Arc::new(move |d| sink.lock().push(d)));

        assert!(!bridge.connect().await);
        assert!(!bridge.is_connected());
        assert!(matches!(
            seen.lock().as_slice(),
            [Diagnostic::ConnectFailed { port: p, .. }] if *p == port
        ));
    }

    #[tokio::test]
    async fn test_port_locked_while_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let bridge = bridge_on(port);

        assert!(bridge.connect().await);
        let (_socket, _) = listener.accept().await.unwrap();
        assert!(matches!(
            bridge.set_port(1234),
            Err(BridgeError::AlreadyConnected)
        ));

        bridge.disconnect();
        assert!(bridge.set_port(1234).is_ok());
    }
}
