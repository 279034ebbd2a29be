//! Bidirectional text-frame transports.
//!
//! [`Transport`] is the seam between the connection worker and the network.
//! [`WebSocketTransport`] talks to a real server; the in-memory pair in
//! [`crate::realtime::memory`] lets tests script the server side.

use std::fmt;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::realtime::error::{ConnectError, SendError};

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_UNSUPPORTED_DATA: u16 = 1003;
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Application close code used when the heartbeat detects a silent peer.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly close, by either side.
    Normal,
    NetworkError,
    /// The peer violated the envelope protocol.
    ProtocolError,
    /// No traffic within the heartbeat window.
    Timeout,
    /// The client was shut down.
    ClientClosed,
    /// Automatic reconnect gave up.
    ReconnectExhausted,
}

/// Why and how a connection ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    pub code: u16,
    pub message: String,
    /// `true` when the peer initiated the close.
    pub remote: bool,
}

impl DisconnectInfo {
    pub fn new(
        reason: DisconnectReason,
        code: u16,
        message: impl Into<String>,
        remote: bool,
    ) -> Self {
        Self {
            reason,
            code,
            message: message.into(),
            remote,
        }
    }

    /// Close requested by the local application.
    pub fn user_requested() -> Self {
        Self::new(DisconnectReason::Normal, CLOSE_NORMAL, "disconnect requested", false)
    }

    pub fn client_closed() -> Self {
        Self::new(DisconnectReason::ClientClosed, CLOSE_NORMAL, "client closed", false)
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(DisconnectReason::NetworkError, CLOSE_ABNORMAL, message, false)
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(DisconnectReason::ProtocolError, CLOSE_PROTOCOL_ERROR, message, false)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DisconnectReason::Timeout, CLOSE_HEARTBEAT_TIMEOUT, message, false)
    }

    pub fn reconnect_exhausted(attempts: usize) -> Self {
        Self::new(
            DisconnectReason::ReconnectExhausted,
            CLOSE_ABNORMAL,
            format!("gave up after {attempts} reconnect attempts"),
            false,
        )
    }

    /// Close initiated by the peer with the given close code.
    pub fn remote_close(code: u16, message: impl Into<String>) -> Self {
        let reason = match code {
            CLOSE_NORMAL | 1001 => DisconnectReason::Normal,
            CLOSE_PROTOCOL_ERROR | CLOSE_UNSUPPORTED_DATA | 1007 => DisconnectReason::ProtocolError,
            _ => DisconnectReason::NetworkError,
        };
        Self::new(reason, code, message, true)
    }

    /// Whether the local application asked for this close.
    pub fn is_user_initiated(&self) -> bool {
        !self.remote
            && matches!(
                self.reason,
                DisconnectReason::Normal | DisconnectReason::ClientClosed
            )
    }
}

impl fmt::Display for DisconnectInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.reason, self.code, self.message)
    }
}

/// Item produced by [`Transport::recv`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed(DisconnectInfo),
}

/// Text-frame transport driven by the connection worker.
///
/// Only one worker owns a transport, so methods take `&mut self`. After
/// `recv` yields [`TransportEvent::Closed`] the transport must be reopened
/// before it is used again.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Opens a connection to `url`, authenticating with `token`.
    async fn open(&mut self, url: &str, token: &SecretString) -> Result<(), ConnectError>;

    async fn send(&mut self, frame: String) -> Result<(), SendError>;

    /// Waits for the next inbound frame or for the connection to end.
    async fn recv(&mut self) -> TransportEvent;

    /// Closes the connection. No-op if it is not open.
    async fn close(&mut self, info: &DisconnectInfo);

    fn is_open(&self) -> bool;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// [`Transport`] over a tungstenite websocket.
///
/// The session token travels both as a `token` query parameter and as an
/// `Authorization: Bearer` header. Websocket pings are answered here; binary
/// frames are treated as a protocol error.
#[derive(Default)]
pub struct WebSocketTransport {
    socket: Option<WsStream>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self, url: &str, token: &SecretString) -> Result<(), ConnectError> {
        if let Some(mut stale) = self.socket.take() {
            let _ = stale.close(None).await;
        }

        let mut request = with_token_query(url, token.expose_secret()).into_client_request()?;
        let auth_header: HeaderValue = format!("Bearer {}", token.expose_secret()).parse()?;
        request.headers_mut().insert(AUTHORIZATION, auth_header);

        let (socket, _) = connect_async(request).await?;
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), SendError> {
        let socket = self.socket.as_mut().ok_or(SendError::TransportClosed)?;
        socket.send(Message::Text(frame)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some(socket) = self.socket.as_mut() else {
            return TransportEvent::Closed(DisconnectInfo::network_error("transport is not open"));
        };

        let info = loop {
            match socket.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Frame(text),
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = socket.send(Message::Pong(payload)).await {
                        break DisconnectInfo::network_error(format!("pong failed: {err}"));
                    }
                }
                Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    break match frame {
                        Some(frame) => DisconnectInfo::remote_close(
                            u16::from(frame.code),
                            frame.reason.into_owned(),
                        ),
                        None => DisconnectInfo::remote_close(CLOSE_NORMAL, "closed without status"),
                    };
                }
                Some(Ok(Message::Binary(_))) => {
                    let _ = socket
                        .close(Some(CloseFrame {
                            code: CloseCode::Unsupported,
                            reason: "binary frames are not supported".into(),
                        }))
                        .await;
                    break DisconnectInfo::new(
                        DisconnectReason::ProtocolError,
                        CLOSE_UNSUPPORTED_DATA,
                        "received binary frame",
                        false,
                    );
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break DisconnectInfo::network_error(err.to_string()),
                None => break DisconnectInfo::network_error("socket ended"),
            }
        };

        self.socket = None;
        TransportEvent::Closed(info)
    }

    async fn close(&mut self, info: &DisconnectInfo) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket
                .close(Some(CloseFrame {
                    code: CloseCode::from(sendable_close_code(info.code)),
                    reason: info.message.clone().into(),
                }))
                .await;
        }
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

/// Appends the session token as a `token` query parameter.
fn with_token_query(url: &str, token: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}token={}", percent_encode(token))
}

fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(char::from(byte))
            }
            other => encoded.push_str(&format!("%{other:02X}")),
        }
    }
    encoded
}

/// Codes 1005, 1006 and 1015 are reserved for local reporting and must not
/// appear in a close frame.
fn sendable_close_code(code: u16) -> u16 {
    match code {
        1005 | 1006 | 1015 => 1011,
        0..=999 => CLOSE_NORMAL,
        code => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_close_codes_map_to_reasons() {
        assert_eq!(
            DisconnectInfo::remote_close(1000, "bye").reason,
            DisconnectReason::Normal
        );
        assert_eq!(
            DisconnectInfo::remote_close(1002, "bad").reason,
            DisconnectReason::ProtocolError
        );
        assert_eq!(
            DisconnectInfo::remote_close(1011, "oops").reason,
            DisconnectReason::NetworkError
        );
        assert!(DisconnectInfo::remote_close(1000, "bye").remote);
    }

    #[test]
    fn only_local_orderly_closes_are_user_initiated() {
        assert!(DisconnectInfo::user_requested().is_user_initiated());
        assert!(DisconnectInfo::client_closed().is_user_initiated());
        assert!(!DisconnectInfo::remote_close(1000, "server restart").is_user_initiated());
        assert!(!DisconnectInfo::timeout("silent").is_user_initiated());
    }

    #[test]
    fn token_rides_in_the_query_string() {
        assert_eq!(
            with_token_query("ws://h:7350/ws?status=false&format=json", "a.b+c/d="),
            "ws://h:7350/ws?status=false&format=json&token=a.b%2Bc%2Fd%3D"
        );
        assert_eq!(with_token_query("ws://h/ws", "eyJ.x_y-z"), "ws://h/ws?token=eyJ.x_y-z");
    }

    #[test]
    fn reserved_close_codes_are_not_sent() {
        assert_eq!(sendable_close_code(CLOSE_ABNORMAL), 1011);
        assert_eq!(sendable_close_code(1005), 1011);
        assert_eq!(sendable_close_code(CLOSE_NORMAL), CLOSE_NORMAL);
        assert_eq!(sendable_close_code(CLOSE_HEARTBEAT_TIMEOUT), CLOSE_HEARTBEAT_TIMEOUT);
        assert_eq!(
            sendable_close_code(DisconnectInfo::reconnect_exhausted(3).code),
            1011
        );
    }

    #[tokio::test]
    async fn unopened_websocket_transport_reports_closed() {
        let mut transport = WebSocketTransport::new();
        assert!(!transport.is_open());
        assert!(matches!(
            transport.send("{}".to_string()).await,
            Err(SendError::TransportClosed)
        ));
        assert!(matches!(transport.recv().await, TransportEvent::Closed(_)));
    }
}
