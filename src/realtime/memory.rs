//! In-process transport pair for tests and local tooling.
//!
//! [`memory_transport`] returns the client half, handed to the realtime
//! client, and a [`MemoryRemote`] that accepts each `open` as a
//! [`MemoryPeer`]. The peer reads the client's frames and scripts replies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::realtime::error::{ConnectError, SendError, ServerError};
use crate::realtime::proto::{self, RtEvent, RtRequest};
use crate::realtime::transport::{DisconnectInfo, Transport, TransportEvent};

/// Creates a connected client transport and its scripted remote.
pub fn memory_transport() -> (MemoryTransport, MemoryRemote) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let refuse_next = Arc::new(AtomicUsize::new(0));
    (
        MemoryTransport {
            accept_tx,
            refuse_next: Arc::clone(&refuse_next),
            link: None,
        },
        MemoryRemote {
            accept_rx,
            refuse_next,
        },
    )
}

struct ClientLink {
    to_peer: mpsc::UnboundedSender<String>,
    from_peer: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Client half of the in-memory transport.
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refuse_next: Arc<AtomicUsize>,
    link: Option<ClientLink>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&mut self, url: &str, token: &SecretString) -> Result<(), ConnectError> {
        self.link = None;

        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectError::Unavailable(
                "memory remote refused the connection".to_string(),
            ));
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let peer = MemoryPeer {
            url: url.to_string(),
            token: token.expose_secret().clone(),
            from_client,
            to_client,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| ConnectError::Unavailable("memory remote dropped".to_string()))?;
        self.link = Some(ClientLink { to_peer, from_peer });
        Ok(())
    }

    async fn send(&mut self, frame: String) -> Result<(), SendError> {
        let link = self.link.as_ref().ok_or(SendError::TransportClosed)?;
        link.to_peer
            .send(frame)
            .map_err(|_| SendError::TransportClosed)
    }

    async fn recv(&mut self) -> TransportEvent {
        let Some(link) = self.link.as_mut() else {
            return TransportEvent::Closed(DisconnectInfo::network_error("transport is not open"));
        };
        match link.from_peer.recv().await {
            Some(TransportEvent::Frame(text)) => TransportEvent::Frame(text),
            Some(TransportEvent::Closed(info)) => {
                self.link = None;
                TransportEvent::Closed(info)
            }
            None => {
                self.link = None;
                TransportEvent::Closed(DisconnectInfo::network_error("memory peer dropped"))
            }
        }
    }

    async fn close(&mut self, _info: &DisconnectInfo) {
        self.link = None;
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }
}

/// Server side of the in-memory transport.
pub struct MemoryRemote {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    refuse_next: Arc<AtomicUsize>,
}

impl MemoryRemote {
    /// Waits for the client to open a connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Makes the next `count` opens fail.
    pub fn refuse_next(&self, count: usize) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Accepts a connection and acknowledges its handshake ping.
    pub async fn accept_attached(&mut self) -> Option<MemoryPeer> {
        let mut peer = self.accept().await?;
        peer.ack_handshake().await?;
        Some(peer)
    }
}

/// One accepted in-memory connection.
pub struct MemoryPeer {
    /// URL the client opened.
    pub url: String,
    /// Token the client authenticated with.
    pub token: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// Next raw frame from the client, `None` once the client closed.
    pub async fn recv_frame(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next client frame decoded as a request. Undecodable frames yield `None`.
    pub async fn recv_request(&mut self) -> Option<(Option<u64>, RtRequest)> {
        let frame = self.recv_frame().await?;
        proto::decode_request(&frame).ok()
    }

    /// Reads the handshake ping and answers it with a pong.
    pub async fn ack_handshake(&mut self) -> Option<u64> {
        loop {
            match self.recv_request().await? {
                (Some(cid), RtRequest::Ping {}) => {
                    self.respond(cid, "pong", &serde_json::json!({}));
                    return Some(cid);
                }
                _ => continue,
            }
        }
    }

    /// Pushes a raw frame to the client. Returns `false` if the client is gone.
    pub fn send_frame(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Frame(frame.into())).is_ok()
    }

    pub fn respond<T: Serialize>(&self, cid: u64, kind: &str, payload: &T) -> bool {
        match proto::encode_response(cid, kind, payload) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    pub fn respond_empty(&self, cid: u64) -> bool {
        self.send_frame(proto::encode_empty_response(cid))
    }

    pub fn respond_error(&self, cid: u64, error: &ServerError) -> bool {
        match proto::encode_error_response(cid, error) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    pub fn push_event(&self, event: &RtEvent) -> bool {
        match proto::encode_event(event) {
            Ok(frame) => self.send_frame(frame),
            Err(_) => false,
        }
    }

    /// Ends the connection as seen by the client.
    pub fn close(self, info: DisconnectInfo) {
        let _ = self.to_client.send(TransportEvent::Closed(info));
    }

    /// Whether the client has dropped its end of this connection.
    pub fn is_client_gone(&self) -> bool {
        self.to_client.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (mut transport, mut remote) = memory_transport();
        let token = SecretString::new("tok".to_string());
        transport.open("mem://realtime", &token).await.expect("open");
        let mut peer = remote.accept().await.expect("peer");
        assert_eq!(peer.url, "mem://realtime");
        assert_eq!(peer.token, "tok");

        transport.send("hello".to_string()).await.expect("send");
        assert_eq!(peer.recv_frame().await.as_deref(), Some("hello"));

        assert!(peer.send_frame("world"));
        assert_eq!(
            transport.recv().await,
            TransportEvent::Frame("world".to_string())
        );

        peer.close(DisconnectInfo::remote_close(1000, "bye"));
        assert!(matches!(transport.recv().await, TransportEvent::Closed(_)));
        assert!(!transport.is_open());
    }

    #[tokio::test]
    async fn refused_opens_fail_then_recover() {
        let (mut transport, mut remote) = memory_transport();
        let token = SecretString::new("tok".to_string());
        remote.refuse_next(2);

        assert!(transport.open("mem://", &token).await.is_err());
        assert!(transport.open("mem://", &token).await.is_err());
        transport.open("mem://", &token).await.expect("third open");
        assert!(remote.accept().await.is_some());
    }

    #[tokio::test]
    async fn closing_client_is_visible_to_peer() {
        let (mut transport, mut remote) = memory_transport();
        transport
            .open("mem://", &SecretString::new("tok".to_string()))
            .await
            .expect("open");
        let mut peer = remote.accept().await.expect("peer");
        transport.close(&DisconnectInfo::user_requested()).await;
        assert!(peer.recv_frame().await.is_none());
        assert!(peer.is_client_gone());
    }
}
