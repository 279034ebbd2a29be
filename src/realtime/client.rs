//! Realtime client configuration and the connection handle.
//!
//! [`RealtimeClient`] holds endpoint and behavior settings. Starting it
//! spawns a background worker that owns the transport and returns a
//! cloneable [`RealtimeConnection`] used to connect, issue requests and
//! observe state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::Instrument;

use crate::realtime::correlator::{RequestCorrelator, RequestDescriptor, ResponseHandle};
use crate::realtime::dispatcher::{EventDispatcher, Listeners};
use crate::realtime::error::{ConnectError, RequestError, SendError};
use crate::realtime::presence::PresenceTracker;
use crate::realtime::proto::{
    self, Channel, ChannelMessageAck, ChannelType, Match, MatchmakerTicket, Party,
    PartyJoinRequest, PartyMatchmakerTicket, Rpc, RtRequest, Status, UserPresence,
};
use crate::realtime::state::{ConnectionState, ConnectionStateMachine};
use crate::realtime::transport::{Transport, WebSocketTransport};
use crate::realtime::worker::{ConnectionWorker, Control, Outbound, Shared, WorkerSettings};
use crate::retry::ReconnectPolicy;
use crate::session::SessionHolder;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Default values used by [`RealtimeClient`].
pub struct RealtimeDefaults;

impl RealtimeDefaults {
    /// Plain websocket port of the realtime server.
    pub const PORT: u16 = 7350;
    /// Port used when TLS is enabled.
    pub const SSL_PORT: u16 = 443;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
}

/// Behavior settings for realtime connections.
#[derive(Clone, Debug)]
pub struct RealtimeClientOptions {
    /// Deadline for correlated requests. `None` waits until the response or
    /// the connection loss.
    pub request_timeout: Option<Duration>,
    /// Deadline for opening the socket and attaching the session.
    pub handshake_timeout: Duration,
    /// Interval of keepalive pings. Two intervals without inbound traffic
    /// drop the connection. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    pub auto_reconnect: bool,
    pub reconnect_policy: ReconnectPolicy,
    /// Ask the server to publish this user's online status on attach.
    pub create_status: bool,
}

impl Default for RealtimeClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(RealtimeDefaults::REQUEST_TIMEOUT),
            handshake_timeout: RealtimeDefaults::HANDSHAKE_TIMEOUT,
            heartbeat_interval: Some(RealtimeDefaults::HEARTBEAT_INTERVAL),
            auto_reconnect: true,
            reconnect_policy: ReconnectPolicy::default(),
            create_status: false,
        }
    }
}

/// Entry point for creating realtime connections.
#[derive(Clone, Debug)]
pub struct RealtimeClient {
    host: String,
    port: Option<u16>,
    ssl: bool,
    endpoint_override: Option<String>,
    options: RealtimeClientOptions,
}

impl RealtimeClient {
    /// Creates a client for `host` with default options and no TLS.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().trim().to_string(),
            port: None,
            ssl: false,
            endpoint_override: None,
            options: RealtimeClientOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RealtimeClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Enables TLS (`wss://`). Also switches the default port to 443.
    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets an explicit websocket URL.
    ///
    /// The override is used verbatim and takes precedence over host, port,
    /// TLS and status settings.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.options.auto_reconnect = enabled;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.options.reconnect_policy = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = timeout;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.options.heartbeat_interval = interval.filter(|interval| !interval.is_zero());
        self
    }

    pub fn with_create_status(mut self, create_status: bool) -> Self {
        self.options.create_status = create_status;
        self
    }

    pub fn options(&self) -> &RealtimeClientOptions {
        &self.options
    }

    /// Websocket URL the connection opens.
    pub fn url(&self) -> String {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint.to_string();
        }
        let scheme = if self.ssl { "wss" } else { "ws" };
        let port = self.port.unwrap_or(if self.ssl {
            RealtimeDefaults::SSL_PORT
        } else {
            RealtimeDefaults::PORT
        });
        format!(
            "{scheme}://{}:{port}/ws?status={}&format=json",
            self.host, self.options.create_status
        )
    }

    /// Spawns a connection worker over `transport`, initially disconnected.
    ///
    /// Must be called within a tokio runtime.
    pub fn start<T: Transport>(
        &self,
        transport: T,
        sessions: SessionHolder,
        listeners: Listeners,
    ) -> RealtimeConnection {
        let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            state: ConnectionStateMachine::new(),
            correlator: RequestCorrelator::new(),
            presence: PresenceTracker::new(),
            dispatcher: EventDispatcher::new(listeners),
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let settings = WorkerSettings {
            url: self.url(),
            auto_reconnect: self.options.auto_reconnect,
            reconnect_policy: self.options.reconnect_policy.clone(),
            handshake_timeout: self.options.handshake_timeout,
            heartbeat_interval: self
                .options
                .heartbeat_interval
                .filter(|interval| !interval.is_zero()),
        };
        let worker = ConnectionWorker::new(
            transport,
            sessions,
            settings,
            Arc::clone(&shared),
            control_rx,
            outbound_rx,
        );
        tokio::spawn(
            worker
                .run()
                .instrument(tracing::info_span!("realtime_client", client_id)),
        );

        RealtimeConnection {
            inner: Arc::new(ConnectionHandle {
                client_id,
                shared,
                control_tx,
                outbound_tx,
                request_timeout: self.options.request_timeout,
            }),
        }
    }

    /// Starts a websocket connection and waits until it is attached.
    pub async fn connect(
        &self,
        sessions: SessionHolder,
        listeners: Listeners,
    ) -> Result<RealtimeConnection, ConnectError> {
        let connection = self.start(WebSocketTransport::new(), sessions, listeners);
        connection.connect().await?;
        Ok(connection)
    }
}

/// Matchmaker ticket parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct MatchmakerQuery {
    pub min_count: i32,
    pub max_count: i32,
    pub query: String,
    pub string_properties: BTreeMap<String, String>,
    pub numeric_properties: BTreeMap<String, f64>,
    pub count_multiple: Option<i32>,
}

impl MatchmakerQuery {
    pub fn new(min_count: i32, max_count: i32, query: impl Into<String>) -> Self {
        Self {
            min_count,
            max_count,
            query: query.into(),
            string_properties: BTreeMap::new(),
            numeric_properties: BTreeMap::new(),
            count_multiple: None,
        }
    }

    pub fn with_string_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.string_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_numeric_property(mut self, key: impl Into<String>, value: f64) -> Self {
        self.numeric_properties.insert(key.into(), value);
        self
    }

    pub fn with_count_multiple(mut self, count_multiple: i32) -> Self {
        self.count_multiple = Some(count_multiple);
        self
    }
}

struct ConnectionHandle {
    client_id: u64,
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    request_timeout: Option<Duration>,
}

/// Cloneable handle to a realtime connection.
///
/// The worker shuts down once every clone is dropped or [`close`] is called.
///
/// [`close`]: RealtimeConnection::close
#[derive(Clone)]
pub struct RealtimeConnection {
    inner: Arc<ConnectionHandle>,
}

impl std::fmt::Debug for RealtimeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeConnection")
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl RealtimeConnection {
    pub fn client_id(&self) -> u64 {
        self.inner.client_id
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.state.current()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to state changes.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// Presence snapshots and active handles for this connection.
    pub fn presence(&self) -> &PresenceTracker {
        &self.inner.shared.presence
    }

    /// Swaps the listener table. Takes effect for the next event.
    pub fn set_listeners(&self, listeners: Listeners) {
        self.inner.shared.dispatcher.replace(listeners);
    }

    /// Requests pending in the correlator.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.correlator.pending_len()
    }

    /// Opens the transport and attaches the session.
    ///
    /// Resolves once connected. Returns immediately if already connected;
    /// while a reconnect is in progress, resolves when it succeeds.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .control_tx
            .send(Control::Connect(reply_tx))
            .map_err(|_| ConnectError::Closed)?;
        reply_rx.await.map_err(|_| ConnectError::Closed)?
    }

    /// Closes the connection without reconnecting. `connect` may be called
    /// again afterwards.
    pub async fn disconnect(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .inner
            .control_tx
            .send(Control::Disconnect(reply_tx))
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// Shuts the worker down for good.
    pub async fn close(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.inner.control_tx.send(Control::Close(reply_tx)).is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Sends a correlated request using the configured timeout.
    pub fn request(&self, request: RtRequest) -> Result<ResponseHandle, SendError> {
        self.request_with_timeout(request, self.inner.request_timeout)
    }

    /// Sends a correlated request with an explicit timeout.
    pub fn request_with_timeout(
        &self,
        request: RtRequest,
        timeout: Option<Duration>,
    ) -> Result<ResponseHandle, SendError> {
        let state = self.ready_state()?;
        let correlator = &self.inner.shared.correlator;
        let (cid, epoch, handle) =
            correlator.submit(RequestDescriptor::for_request(&request), timeout, state)?;

        let frame = match proto::encode_request(Some(cid), &request) {
            Ok(frame) => frame,
            Err(err) => {
                correlator.cancel(cid);
                return Err(SendError::Encode(err));
            }
        };
        let outbound = Outbound {
            epoch,
            cid: Some(cid),
            frame,
        };
        if self.inner.outbound_tx.send(outbound).is_err() {
            correlator.cancel(cid);
            return Err(SendError::Closed);
        }
        tracing::trace!(event = "request_queued", cid, kind = request.kind());
        Ok(handle)
    }

    /// Sends a request that expects no response.
    pub fn send(&self, request: RtRequest) -> Result<(), SendError> {
        let state = self.ready_state()?;
        let epoch = self
            .inner
            .shared
            .correlator
            .epoch()
            .ok_or(SendError::NotConnected(state))?;
        let frame = proto::encode_request(None, &request)?;
        self.inner
            .outbound_tx
            .send(Outbound {
                epoch,
                cid: None,
                frame,
            })
            .map_err(|_| SendError::Closed)
    }

    fn ready_state(&self) -> Result<ConnectionState, SendError> {
        match self.state() {
            ConnectionState::Connected => Ok(ConnectionState::Connected),
            ConnectionState::Closed => Err(SendError::Closed),
            other => Err(SendError::NotConnected(other)),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: RtRequest,
        expected: &'static str,
    ) -> Result<T, RequestError> {
        let body = self.request(request)?.await?;
        body.decode(expected)
    }

    async fn call_ack(&self, request: RtRequest) -> Result<(), RequestError> {
        self.request(request)?.await?;
        Ok(())
    }

    // -- chat ---------------------------------------------------------------

    pub async fn join_chat(
        &self,
        target: impl Into<String>,
        channel_type: ChannelType,
        persistence: bool,
        hidden: bool,
    ) -> Result<Channel, RequestError> {
        self.call(
            RtRequest::ChannelJoin {
                target: target.into(),
                channel_type: channel_type.as_i32(),
                persistence: Some(persistence),
                hidden: Some(hidden),
            },
            "channel",
        )
        .await
    }

    pub async fn leave_chat(&self, channel_id: impl Into<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::ChannelLeave {
            channel_id: channel_id.into(),
        })
        .await
    }

    /// Sends a chat message. `content` must be a JSON object string.
    pub async fn write_chat_message(
        &self,
        channel_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ChannelMessageAck, RequestError> {
        self.call(
            RtRequest::ChannelMessageSend {
                channel_id: channel_id.into(),
                content: content.into(),
            },
            "channel_message_ack",
        )
        .await
    }

    pub async fn update_chat_message(
        &self,
        channel_id: impl Into<String>,
        message_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Result<ChannelMessageAck, RequestError> {
        self.call(
            RtRequest::ChannelMessageUpdate {
                channel_id: channel_id.into(),
                message_id: message_id.into(),
                content: content.into(),
            },
            "channel_message_ack",
        )
        .await
    }

    pub async fn remove_chat_message(
        &self,
        channel_id: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Result<ChannelMessageAck, RequestError> {
        self.call(
            RtRequest::ChannelMessageRemove {
                channel_id: channel_id.into(),
                message_id: message_id.into(),
            },
            "channel_message_ack",
        )
        .await
    }

    // -- matches ------------------------------------------------------------

    pub async fn create_match(&self, name: Option<String>) -> Result<Match, RequestError> {
        self.call(RtRequest::MatchCreate { name }, "match").await
    }

    pub async fn join_match(
        &self,
        match_id: impl Into<String>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Match, RequestError> {
        self.call(
            RtRequest::MatchJoin {
                match_id: Some(match_id.into()),
                token: None,
                metadata,
            },
            "match",
        )
        .await
    }

    /// Joins the match a matchmaker result points to.
    pub async fn join_match_by_token(
        &self,
        token: impl Into<String>,
    ) -> Result<Match, RequestError> {
        self.call(
            RtRequest::MatchJoin {
                match_id: None,
                token: Some(token.into()),
                metadata: BTreeMap::new(),
            },
            "match",
        )
        .await
    }

    pub async fn leave_match(&self, match_id: impl Into<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::MatchLeave {
            match_id: match_id.into(),
        })
        .await
    }

    /// Sends match state. Empty `presences` broadcasts to the whole match.
    pub fn send_match_data(
        &self,
        match_id: impl Into<String>,
        op_code: i64,
        data: impl Into<Vec<u8>>,
        presences: Vec<UserPresence>,
        reliable: bool,
    ) -> Result<(), SendError> {
        self.send(RtRequest::MatchDataSend {
            match_id: match_id.into(),
            op_code,
            data: data.into(),
            presences,
            reliable,
        })
    }

    // -- matchmaker ---------------------------------------------------------

    pub async fn add_matchmaker(
        &self,
        query: MatchmakerQuery,
    ) -> Result<MatchmakerTicket, RequestError> {
        self.call(
            RtRequest::MatchmakerAdd {
                min_count: query.min_count,
                max_count: query.max_count,
                query: query.query,
                string_properties: query.string_properties,
                numeric_properties: query.numeric_properties,
                count_multiple: query.count_multiple,
            },
            "matchmaker_ticket",
        )
        .await
    }

    pub async fn remove_matchmaker(&self, ticket: impl Into<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::MatchmakerRemove {
            ticket: ticket.into(),
        })
        .await
    }

    // -- parties ------------------------------------------------------------

    pub async fn create_party(&self, open: bool, max_size: i32) -> Result<Party, RequestError> {
        self.call(RtRequest::PartyCreate { open, max_size }, "party").await
    }

    /// Joins or requests to join a party. The membership snapshot arrives as
    /// a `party` event.
    pub async fn join_party(&self, party_id: impl Into<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyJoin {
            party_id: party_id.into(),
        })
        .await
    }

    pub async fn leave_party(&self, party_id: impl Into<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyLeave {
            party_id: party_id.into(),
        })
        .await
    }

    pub async fn close_party(&self, party_id: impl Into<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyClose {
            party_id: party_id.into(),
        })
        .await
    }

    pub async fn promote_party_member(
        &self,
        party_id: impl Into<String>,
        presence: UserPresence,
    ) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyPromote {
            party_id: party_id.into(),
            presence,
        })
        .await
    }

    pub async fn accept_party_member(
        &self,
        party_id: impl Into<String>,
        presence: UserPresence,
    ) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyAccept {
            party_id: party_id.into(),
            presence,
        })
        .await
    }

    /// Kicks a member, or rejects a pending join request.
    pub async fn remove_party_member(
        &self,
        party_id: impl Into<String>,
        presence: UserPresence,
    ) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyRemove {
            party_id: party_id.into(),
            presence,
        })
        .await
    }

    pub fn send_party_data(
        &self,
        party_id: impl Into<String>,
        op_code: i64,
        data: impl Into<Vec<u8>>,
    ) -> Result<(), SendError> {
        self.send(RtRequest::PartyDataSend {
            party_id: party_id.into(),
            op_code,
            data: data.into(),
        })
    }

    pub async fn list_party_join_requests(
        &self,
        party_id: impl Into<String>,
    ) -> Result<PartyJoinRequest, RequestError> {
        self.call(
            RtRequest::PartyJoinRequestList {
                party_id: party_id.into(),
            },
            "party_join_request",
        )
        .await
    }

    pub async fn add_matchmaker_party(
        &self,
        party_id: impl Into<String>,
        query: MatchmakerQuery,
    ) -> Result<PartyMatchmakerTicket, RequestError> {
        self.call(
            RtRequest::PartyMatchmakerAdd {
                party_id: party_id.into(),
                min_count: query.min_count,
                max_count: query.max_count,
                query: query.query,
                string_properties: query.string_properties,
                numeric_properties: query.numeric_properties,
                count_multiple: query.count_multiple,
            },
            "party_matchmaker_ticket",
        )
        .await
    }

    pub async fn remove_matchmaker_party(
        &self,
        party_id: impl Into<String>,
        ticket: impl Into<String>,
    ) -> Result<(), RequestError> {
        self.call_ack(RtRequest::PartyMatchmakerRemove {
            party_id: party_id.into(),
            ticket: ticket.into(),
        })
        .await
    }

    // -- status -------------------------------------------------------------

    pub async fn follow_users(
        &self,
        user_ids: Vec<String>,
        usernames: Vec<String>,
    ) -> Result<Status, RequestError> {
        self.call(RtRequest::StatusFollow { user_ids, usernames }, "status")
            .await
    }

    pub async fn unfollow_users(&self, user_ids: Vec<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::StatusUnfollow { user_ids }).await
    }

    /// Publishes a status. `None` appears offline.
    pub async fn update_status(&self, status: Option<String>) -> Result<(), RequestError> {
        self.call_ack(RtRequest::StatusUpdate { status }).await
    }

    // -- misc ---------------------------------------------------------------

    pub async fn rpc(
        &self,
        id: impl Into<String>,
        payload: Option<String>,
    ) -> Result<Rpc, RequestError> {
        self.call(
            RtRequest::Rpc {
                id: id.into(),
                payload,
            },
            "rpc",
        )
        .await
    }

    /// Round-trips a ping and returns the elapsed time.
    pub async fn ping(&self) -> Result<Duration, RequestError> {
        let started = tokio::time::Instant::now();
        self.call_ack(RtRequest::Ping {}).await?;
        Ok(started.elapsed())
    }
}
