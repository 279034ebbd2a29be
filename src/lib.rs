//! Client SDK for realtime multiplayer sessions.
//!
//! The crate is organized by concern:
//! - `session`: authenticated session snapshots and the shared holder.
//! - `realtime`: websocket socket, request correlation, events and presence.
//! - `retry`: reconnect backoff and timeout utilities.

/// Realtime socket client, protocol types and presence tracking.
pub mod realtime;
/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Session tokens and the session holder.
pub mod session;

pub use realtime::{Listeners, RealtimeClient, RealtimeConnection};
pub use session::{Session, SessionError, SessionHolder};
