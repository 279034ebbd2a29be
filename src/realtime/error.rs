//! Error types for connecting, sending and correlated requests, plus the
//! server's error codes.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::realtime::proto::ServerErrorMsg;
use crate::realtime::state::ConnectionState;
use crate::realtime::transport::DisconnectInfo;

/// Error codes the realtime server attaches to error envelopes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RtErrorCode {
    RuntimeException,
    UnrecognizedPayload,
    MissingPayload,
    BadInput,
    MatchNotFound,
    MatchJoinRejected,
    RuntimeFunctionNotFound,
    RuntimeFunctionException,
    Unknown(i32),
}

impl RtErrorCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0 => RtErrorCode::RuntimeException,
            1 => RtErrorCode::UnrecognizedPayload,
            2 => RtErrorCode::MissingPayload,
            3 => RtErrorCode::BadInput,
            4 => RtErrorCode::MatchNotFound,
            5 => RtErrorCode::MatchJoinRejected,
            6 => RtErrorCode::RuntimeFunctionNotFound,
            7 => RtErrorCode::RuntimeFunctionException,
            other => RtErrorCode::Unknown(other),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            RtErrorCode::RuntimeException => 0,
            RtErrorCode::UnrecognizedPayload => 1,
            RtErrorCode::MissingPayload => 2,
            RtErrorCode::BadInput => 3,
            RtErrorCode::MatchNotFound => 4,
            RtErrorCode::MatchJoinRejected => 5,
            RtErrorCode::RuntimeFunctionNotFound => 6,
            RtErrorCode::RuntimeFunctionException => 7,
            RtErrorCode::Unknown(code) => code,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RtErrorCode::RuntimeException => "RUNTIME_EXCEPTION",
            RtErrorCode::UnrecognizedPayload => "UNRECOGNIZED_PAYLOAD",
            RtErrorCode::MissingPayload => "MISSING_PAYLOAD",
            RtErrorCode::BadInput => "BAD_INPUT",
            RtErrorCode::MatchNotFound => "MATCH_NOT_FOUND",
            RtErrorCode::MatchJoinRejected => "MATCH_JOIN_REJECTED",
            RtErrorCode::RuntimeFunctionNotFound => "RUNTIME_FUNCTION_NOT_FOUND",
            RtErrorCode::RuntimeFunctionException => "RUNTIME_FUNCTION_EXCEPTION",
            RtErrorCode::Unknown(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for RtErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtErrorCode::Unknown(code) => write!(f, "UNKNOWN({code})"),
            known => f.write_str(known.as_str()),
        }
    }
}

/// Error reported by the server, either in reply to a request or unsolicited.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(from = "ServerErrorMsg", into = "ServerErrorMsg")]
#[error("server error {code}: {message}")]
pub struct ServerError {
    pub code: RtErrorCode,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl From<ServerErrorMsg> for ServerError {
    fn from(msg: ServerErrorMsg) -> Self {
        Self {
            code: RtErrorCode::from_i32(msg.code),
            message: msg.message,
            context: msg.context,
        }
    }
}

impl From<ServerError> for ServerErrorMsg {
    fn from(error: ServerError) -> Self {
        Self {
            code: error.code.as_i32(),
            message: error.message,
            context: error.context,
        }
    }
}

/// Errors raised while opening the socket and attaching the session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// WebSocket connection failed.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Session token cannot be carried in an HTTP header.
    #[error("invalid authorization header: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),

    /// The held session expired before the attempt started.
    #[error("session token expired")]
    SessionExpired,

    /// The server answered the handshake with an error.
    #[error("handshake rejected: {0}")]
    Rejected(ServerError),

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("encode handshake: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("send handshake: {0}")]
    Send(#[from] SendError),

    /// The connection dropped before the handshake completed.
    #[error("connection closed during handshake: {0}")]
    Handshake(DisconnectInfo),

    /// Transport refused to open for a reason of its own.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// `disconnect` was requested while the attempt was in flight.
    #[error("connect attempt cancelled")]
    Cancelled,

    #[error("client is closed")]
    Closed,
}

/// Errors raised before an outbound frame reaches the transport.
#[derive(Debug, Error)]
pub enum SendError {
    /// Requests are only accepted while connected.
    #[error("not connected (state: {0:?})")]
    NotConnected(ConnectionState),

    #[error("client is closed")]
    Closed,

    #[error("encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// The underlying transport has no open connection.
    #[error("transport is not open")]
    TransportClosed,
}

/// Inbound frame that cannot be classified.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Shape(String),

    /// Correlated frame whose body could not be decoded.
    #[error("malformed response {cid}: {source}")]
    Response {
        cid: u64,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// Correlation id of the request this frame answered, if it was readable.
    pub fn cid(&self) -> Option<u64> {
        match self {
            FrameError::Response { cid, .. } => Some(*cid),
            _ => None,
        }
    }
}

/// Terminal outcome of a correlated request other than success.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error(transparent)]
    Send(#[from] SendError),

    #[error("request {cid} timed out after {after:?}")]
    Timeout { cid: u64, after: Duration },

    /// The connection dropped while the request was pending.
    #[error("connection lost: {0}")]
    ConnectionLost(DisconnectInfo),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("expected `{expected}` response, got `{got}`")]
    UnexpectedResponse { expected: &'static str, got: String },

    /// The server answered, but the reply could not be decoded.
    #[error("malformed response to request {cid}: {message}")]
    MalformedResponse { cid: u64, message: String },

    #[error("decode `{kind}` response: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}
