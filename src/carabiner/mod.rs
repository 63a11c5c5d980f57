//! Carabiner client: wire codec, shared connection state and connection lifecycle

pub mod codec;
pub mod connection;
pub mod state;

pub use codec::{CarabinerCodec, Command, Message, BAR_QUANTUM};
pub use state::{BeatProbe, ConnectionState, PhaseProbe};
