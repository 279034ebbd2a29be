//! Realtime socket modules.
//!
//! - `client`: configuration, connection handle and typed operations.
//! - `worker`: background task that owns the transport and reconnects.
//! - `transport`: transport trait and the websocket implementation.
//! - `memory`: in-process transport pair for tests.
//! - `proto`: envelope codec and protocol messages.
//! - `correlator`: pending-request table keyed by correlation id.
//! - `state`: connection state machine.
//! - `dispatcher`: listener table and event fan-out.
//! - `presence`: presence snapshots and active handles.

/// Realtime client configuration and connection handle.
pub mod client;
/// Request correlation and response handles.
pub mod correlator;
/// Listener callbacks.
pub mod dispatcher;
/// Error types.
pub mod error;
/// In-memory transport.
pub mod memory;
/// Presence tracking.
pub mod presence;
/// Wire protocol.
pub mod proto;
/// Connection lifecycle.
pub mod state;
/// Transport abstraction.
pub mod transport;
mod worker;

pub use client::{
    MatchmakerQuery, RealtimeClient, RealtimeClientOptions, RealtimeConnection, RealtimeDefaults,
};
pub use correlator::ResponseHandle;
pub use dispatcher::{ClientEvent, Listeners};
pub use error::{ConnectError, FrameError, RequestError, RtErrorCode, SendError, ServerError};
pub use memory::{memory_transport, MemoryPeer, MemoryRemote, MemoryTransport};
pub use presence::{PresenceKey, PresenceSet, PresenceTracker, StreamKey};
pub use proto::{RtEvent, RtRequest, UserPresence};
pub use state::ConnectionState;
pub use transport::{
    DisconnectInfo, DisconnectReason, Transport, TransportEvent, WebSocketTransport,
};
