//! Background task that owns the transport.
//!
//! The worker serializes every connection-level decision: opening and
//! attaching the session, routing inbound frames, writing the outbound
//! queue, heartbeats, and the reconnect loop. Callers talk to it through the
//! control and outbound channels held by `RealtimeConnection`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::realtime::correlator::{RequestCorrelator, RequestDescriptor};
use crate::realtime::dispatcher::EventDispatcher;
use crate::realtime::error::{ConnectError, RequestError, SendError};
use crate::realtime::presence::PresenceTracker;
use crate::realtime::proto::{self, Inbound, RtRequest};
use crate::realtime::state::{ConnectionState, ConnectionStateMachine};
use crate::realtime::transport::{DisconnectInfo, Transport, TransportEvent};
use crate::retry::{with_timeout, ReconnectPolicy};
use crate::session::SessionHolder;

/// Consecutive undecodable frames tolerated before the connection is dropped.
pub(crate) const MALFORMED_FRAME_LIMIT: usize = 3;
/// Longest heartbeat period honoured; larger settings are clamped.
const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
/// Correlation id of the attach ping. The correlator never hands out 0.
const HANDSHAKE_CID: u64 = 0;

/// State shared between the worker and connection handles.
pub(crate) struct Shared {
    pub state: ConnectionStateMachine,
    pub correlator: Arc<RequestCorrelator>,
    pub presence: PresenceTracker,
    pub dispatcher: EventDispatcher,
}

pub(crate) type ConnectReply = oneshot::Sender<Result<(), ConnectError>>;

pub(crate) enum Control {
    Connect(ConnectReply),
    Disconnect(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Encoded frame waiting for the transport, tagged with the epoch it was
/// built for.
pub(crate) struct Outbound {
    pub epoch: u64,
    pub cid: Option<u64>,
    pub frame: String,
}

pub(crate) struct WorkerSettings {
    pub url: String,
    pub auto_reconnect: bool,
    pub reconnect_policy: ReconnectPolicy,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Option<Duration>,
}

enum Interrupt {
    Disconnect(oneshot::Sender<()>),
    /// `None` when every connection handle was dropped.
    Close(Option<oneshot::Sender<()>>),
}

enum Attempt {
    Attached { epoch: u64, early: Vec<String> },
    Failed(ConnectError),
    Interrupted(Interrupt),
}

enum SessionEnd {
    Lost(DisconnectInfo),
    Interrupted(Interrupt),
}

enum Recovery {
    Reconnected { epoch: u64, early: Vec<String> },
    GaveUp(usize),
    Interrupted(Interrupt, Vec<ConnectReply>),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Idle,
    Exit,
}

pub(crate) struct ConnectionWorker<T> {
    transport: T,
    sessions: SessionHolder,
    settings: WorkerSettings,
    shared: Arc<Shared>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    outbound_rx: mpsc::UnboundedReceiver<Outbound>,
}

impl<T: Transport> ConnectionWorker<T> {
    pub fn new(
        transport: T,
        sessions: SessionHolder,
        settings: WorkerSettings,
        shared: Arc<Shared>,
        control_rx: mpsc::UnboundedReceiver<Control>,
        outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    ) -> Self {
        Self {
            transport,
            sessions,
            settings,
            shared,
            control_rx,
            outbound_rx,
        }
    }

    pub async fn run(mut self) {
        loop {
            let Some(control) = self.control_rx.recv().await else {
                self.shut_down(None).await;
                return;
            };

            match control {
                Control::Connect(reply) => {
                    let mut waiters = vec![reply];
                    let flow = match self.attempt(&mut waiters).await {
                        Attempt::Attached { epoch, early } => self.drive(epoch, early).await,
                        Attempt::Failed(err) => {
                            tracing::warn!(
                                event = "connect_failed",
                                url = %self.settings.url,
                                error = %err
                            );
                            self.set_state(ConnectionState::Disconnected);
                            reply_connect_failure(waiters, err);
                            Flow::Idle
                        }
                        Attempt::Interrupted(interrupt) => self.finish(interrupt, waiters).await,
                    };
                    if flow == Flow::Exit {
                        return;
                    }
                }
                Control::Disconnect(reply) => {
                    let _ = reply.send(());
                }
                Control::Close(reply) => {
                    self.shut_down(Some(reply)).await;
                    return;
                }
            }
        }
    }

    /// Runs connected sessions, reconnecting as configured, until the
    /// connection is given up or interrupted.
    async fn drive(&mut self, mut epoch: u64, mut early: Vec<String>) -> Flow {
        loop {
            let info = match self.run_connected(epoch, std::mem::take(&mut early)).await {
                SessionEnd::Interrupted(interrupt) => {
                    return self.finish(interrupt, Vec::new()).await
                }
                SessionEnd::Lost(info) => info,
            };

            tracing::warn!(
                event = "connection_lost",
                reason = ?info.reason,
                code = info.code,
                message = %info.message,
                remote = info.remote
            );
            self.transport.close(&info).await;
            self.release_connection(&info);

            if !self.settings.auto_reconnect || info.is_user_initiated() {
                self.set_state(ConnectionState::Disconnected);
                self.shared.dispatcher.disconnected(info);
                return Flow::Idle;
            }

            self.set_state(ConnectionState::Reconnecting);
            self.shared.dispatcher.disconnected(info);

            match self.reconnect().await {
                Recovery::Reconnected {
                    epoch: next_epoch,
                    early: next_early,
                } => {
                    epoch = next_epoch;
                    early = next_early;
                }
                Recovery::GaveUp(attempts) => {
                    tracing::error!(event = "reconnect_exhausted", attempts);
                    self.set_state(ConnectionState::Disconnected);
                    self.shared
                        .dispatcher
                        .disconnected(DisconnectInfo::reconnect_exhausted(attempts));
                    return Flow::Idle;
                }
                Recovery::Interrupted(interrupt, waiters) => {
                    return self.finish(interrupt, waiters).await
                }
            }
        }
    }

    /// Opens the transport and attaches the session, watching for control
    /// requests while the attempt is in flight.
    async fn attempt(&mut self, waiters: &mut Vec<ConnectReply>) -> Attempt {
        self.set_state(ConnectionState::Connecting);

        let outcome = {
            let handshake = attach(&mut self.transport, &self.settings, &self.sessions);
            tokio::pin!(handshake);
            loop {
                tokio::select! {
                    result = &mut handshake => break result,
                    control = self.control_rx.recv() => match control {
                        Some(Control::Connect(reply)) => waiters.push(reply),
                        Some(Control::Disconnect(reply)) => {
                            return Attempt::Interrupted(Interrupt::Disconnect(reply));
                        }
                        Some(Control::Close(reply)) => {
                            return Attempt::Interrupted(Interrupt::Close(Some(reply)));
                        }
                        None => return Attempt::Interrupted(Interrupt::Close(None)),
                    },
                }
            }
        };

        match outcome {
            Ok(early) => {
                let epoch = self.shared.correlator.begin_epoch();
                self.set_state(ConnectionState::Connected);
                tracing::info!(event = "realtime_connected", url = %self.settings.url, epoch);
                self.shared.dispatcher.connected();
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Ok(()));
                }
                Attempt::Attached { epoch, early }
            }
            Err(err) => {
                self.transport
                    .close(&DisconnectInfo::protocol_error("attach failed"))
                    .await;
                Attempt::Failed(err)
            }
        }
    }

    async fn reconnect(&mut self) -> Recovery {
        let mut waiters: Vec<ConnectReply> = Vec::new();
        let mut attempts = 0usize;

        loop {
            if !self.settings.reconnect_policy.allows_attempt(attempts) {
                let reason = format!("gave up after {attempts} reconnect attempts");
                for waiter in waiters.drain(..) {
                    let _ = waiter.send(Err(ConnectError::Unavailable(reason.clone())));
                }
                return Recovery::GaveUp(attempts);
            }

            attempts += 1;
            let delay = self.settings.reconnect_policy.delay_for_attempt(attempts);
            tracing::info!(
                event = "reconnect_scheduled",
                attempt = attempts,
                delay_ms = delay.as_millis() as u64
            );
            if let Some(interrupt) = self.wait_backoff(delay, &mut waiters).await {
                return Recovery::Interrupted(interrupt, waiters);
            }

            match self.attempt(&mut waiters).await {
                Attempt::Attached { epoch, early } => {
                    tracing::info!(event = "reconnected", attempt = attempts);
                    return Recovery::Reconnected { epoch, early };
                }
                Attempt::Failed(err) => {
                    tracing::warn!(event = "reconnect_failed", attempt = attempts, error = %err);
                    self.set_state(ConnectionState::Reconnecting);
                }
                Attempt::Interrupted(interrupt) => return Recovery::Interrupted(interrupt, waiters),
            }
        }
    }

    async fn wait_backoff(
        &mut self,
        delay: Duration,
        waiters: &mut Vec<ConnectReply>,
    ) -> Option<Interrupt> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                control = self.control_rx.recv() => match control {
                    Some(Control::Connect(reply)) => waiters.push(reply),
                    Some(Control::Disconnect(reply)) => return Some(Interrupt::Disconnect(reply)),
                    Some(Control::Close(reply)) => return Some(Interrupt::Close(Some(reply))),
                    None => return Some(Interrupt::Close(None)),
                },
            }
        }
    }

    async fn run_connected(&mut self, epoch: u64, early: Vec<String>) -> SessionEnd {
        let mut malformed = 0usize;
        for frame in early {
            if let Some(end) = self.on_frame(&frame, &mut malformed) {
                return end;
            }
        }

        let heartbeat = self
            .settings
            .heartbeat_interval
            .filter(|period| !period.is_zero())
            .map(|period| period.min(MAX_HEARTBEAT_INTERVAL));
        let period = heartbeat.unwrap_or(Duration::from_secs(3600));
        let silence_limit = period.saturating_mul(2);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Connect(reply)) => {
                        let _ = reply.send(Ok(()));
                    }
                    Some(Control::Disconnect(reply)) => {
                        return SessionEnd::Interrupted(Interrupt::Disconnect(reply));
                    }
                    Some(Control::Close(reply)) => {
                        return SessionEnd::Interrupted(Interrupt::Close(Some(reply)));
                    }
                    None => return SessionEnd::Interrupted(Interrupt::Close(None)),
                },
                outbound = self.outbound_rx.recv() => {
                    let Some(outbound) = outbound else {
                        return SessionEnd::Interrupted(Interrupt::Close(None));
                    };
                    if outbound.epoch != epoch {
                        tracing::debug!(
                            event = "stale_frame_dropped",
                            cid = ?outbound.cid,
                            epoch = outbound.epoch
                        );
                        continue;
                    }
                    if let Err(err) = self.transport.send(outbound.frame).await {
                        return SessionEnd::Lost(DisconnectInfo::network_error(format!(
                            "send failed: {err}"
                        )));
                    }
                }
                event = self.transport.recv() => match event {
                    TransportEvent::Frame(text) => {
                        last_inbound = Instant::now();
                        if let Some(end) = self.on_frame(&text, &mut malformed) {
                            return end;
                        }
                    }
                    TransportEvent::Closed(info) => return SessionEnd::Lost(info),
                },
                _ = ticker.tick(), if heartbeat.is_some() => {
                    let silent_for = last_inbound.elapsed();
                    if silent_for >= silence_limit {
                        return SessionEnd::Lost(DisconnectInfo::timeout(format!(
                            "no inbound traffic for {}ms",
                            silent_for.as_millis()
                        )));
                    }
                    if let Err(err) = self.send_heartbeat(period).await {
                        return SessionEnd::Lost(DisconnectInfo::network_error(format!(
                            "heartbeat send failed: {err}"
                        )));
                    }
                }
            }
        }
    }

    fn on_frame(&self, text: &str, malformed: &mut usize) -> Option<SessionEnd> {
        match proto::decode(text) {
            Ok(inbound) => {
                *malformed = 0;
                self.route(inbound);
                None
            }
            Err(err) => {
                *malformed += 1;
                tracing::warn!(event = "malformed_frame", consecutive = *malformed, error = %err);
                if let Some(cid) = err.cid() {
                    if let Some(pending) = self.shared.correlator.take(cid) {
                        pending.complete(Err(RequestError::MalformedResponse {
                            cid,
                            message: err.to_string(),
                        }));
                    }
                }
                if *malformed >= MALFORMED_FRAME_LIMIT {
                    return Some(SessionEnd::Lost(DisconnectInfo::protocol_error(format!(
                        "{} consecutive malformed frames",
                        *malformed
                    ))));
                }
                None
            }
        }
    }

    fn route(&self, inbound: Inbound) {
        match inbound {
            Inbound::Response { cid, result } => match self.shared.correlator.take(cid) {
                Some(pending) => {
                    if let Ok(body) = &result {
                        self.shared
                            .presence
                            .apply_response(body, pending.descriptor().release.as_ref());
                    }
                    tracing::trace!(
                        event = "response_routed",
                        cid,
                        kind = pending.descriptor().kind
                    );
                    pending.complete(result.map_err(RequestError::Server));
                }
                None => tracing::debug!(event = "response_without_request", cid),
            },
            Inbound::Event(event) => {
                self.shared.presence.apply_event(&event);
                self.shared.dispatcher.dispatch(event);
            }
            Inbound::Unknown { kind } => {
                tracing::debug!(event = "unknown_event_dropped", kind = %kind);
            }
        }
    }

    async fn send_heartbeat(&mut self, timeout: Duration) -> Result<(), SendError> {
        let ping = RtRequest::Ping {};
        let Ok((cid, _epoch, handle)) = self.shared.correlator.submit(
            RequestDescriptor::for_request(&ping),
            Some(timeout),
            ConnectionState::Connected,
        ) else {
            return Ok(());
        };
        drop(handle);

        let frame = match proto::encode_request(Some(cid), &ping) {
            Ok(frame) => frame,
            Err(err) => {
                self.shared.correlator.cancel(cid);
                return Err(err.into());
            }
        };
        tracing::trace!(event = "heartbeat_sent", cid);
        if let Err(err) = self.transport.send(frame).await {
            self.shared.correlator.cancel(cid);
            return Err(err);
        }
        Ok(())
    }

    /// Settles an interrupt that arrived while connecting, connected or
    /// waiting to reconnect.
    async fn finish(&mut self, interrupt: Interrupt, waiters: Vec<ConnectReply>) -> Flow {
        for waiter in waiters {
            let _ = waiter.send(Err(ConnectError::Cancelled));
        }

        match interrupt {
            Interrupt::Disconnect(reply) => {
                let info = DisconnectInfo::user_requested();
                let was_connected = self.shared.state.current() == ConnectionState::Connected;
                self.transport.close(&info).await;
                self.release_connection(&info);
                self.set_state(ConnectionState::Disconnected);
                if was_connected {
                    self.shared.dispatcher.disconnected(info);
                }
                tracing::info!(event = "realtime_disconnected");
                let _ = reply.send(());
                Flow::Idle
            }
            Interrupt::Close(reply) => {
                self.shut_down(reply).await;
                Flow::Exit
            }
        }
    }

    async fn shut_down(&mut self, reply: Option<oneshot::Sender<()>>) {
        let info = DisconnectInfo::client_closed();
        let was_connected = self.shared.state.current() == ConnectionState::Connected;
        self.transport.close(&info).await;
        self.release_connection(&info);
        self.set_state(ConnectionState::Closed);
        if was_connected {
            self.shared.dispatcher.disconnected(info);
        }
        tracing::info!(event = "realtime_client_closed");
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    /// Fails everything tied to the current connection. Runs before the new
    /// state is published.
    fn release_connection(&self, info: &DisconnectInfo) {
        self.shared.correlator.fail_all(info);
        self.shared.presence.clear();
    }

    fn set_state(&self, to: ConnectionState) {
        if let Err(err) = self.shared.state.transition(to) {
            tracing::warn!(event = "invalid_state_transition", error = %err);
        }
    }
}

/// Opens the transport, sends the attach ping and waits for its pong.
///
/// Frames that arrive before the pong are returned so they can be routed
/// once the connection is published.
async fn attach<T: Transport>(
    transport: &mut T,
    settings: &WorkerSettings,
    sessions: &SessionHolder,
) -> Result<Vec<String>, ConnectError> {
    let session = sessions.current();
    if session.is_expired() {
        return Err(ConnectError::SessionExpired);
    }

    transport.open(&settings.url, session.token()).await?;
    let ping = proto::encode_request(Some(HANDSHAKE_CID), &RtRequest::Ping {})?;
    transport.send(ping).await?;

    match with_timeout(settings.handshake_timeout, await_pong(transport)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectError::HandshakeTimeout(settings.handshake_timeout)),
    }
}

async fn await_pong<T: Transport>(transport: &mut T) -> Result<Vec<String>, ConnectError> {
    let mut early = Vec::new();
    loop {
        match transport.recv().await {
            TransportEvent::Frame(text) => match proto::decode(&text) {
                Ok(Inbound::Response {
                    cid: HANDSHAKE_CID,
                    result,
                }) => {
                    return match result {
                        Ok(_) => Ok(early),
                        Err(err) => Err(ConnectError::Rejected(err)),
                    };
                }
                _ => early.push(text),
            },
            TransportEvent::Closed(info) => return Err(ConnectError::Handshake(info)),
        }
    }
}

/// The first waiter gets the error itself; later ones get its description.
fn reply_connect_failure(waiters: Vec<ConnectReply>, err: ConnectError) {
    let mut waiters = waiters.into_iter();
    let description = err.to_string();
    if let Some(first) = waiters.next() {
        let _ = first.send(Err(err));
    }
    for waiter in waiters {
        let _ = waiter.send(Err(ConnectError::Unavailable(description.clone())));
    }
}
