//! Listener table and event fan-out.
//!
//! Handlers run on the connection worker task, in arrival order. A category
//! without a handler drops its events.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::realtime::error::ServerError;
use crate::realtime::proto::{
    ChannelMessage, ChannelPresenceEvent, MatchData, MatchPresenceEvent, MatchmakerMatched,
    NotificationList, Party, PartyClose, PartyData, PartyJoinRequest, PartyLeader,
    PartyMatchmakerTicket, PartyPresenceEvent, RtEvent, StatusPresenceEvent, StreamData,
    StreamPresenceEvent,
};
use crate::realtime::transport::DisconnectInfo;

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Lifecycle notifications and server events, as delivered by
/// [`Listeners::channel`].
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected(DisconnectInfo),
    Event(RtEvent),
}

/// Table of optional handlers, one per event category.
///
/// ```no_run
/// use gamelink_sdk::realtime::Listeners;
///
/// let listeners = Listeners::new()
///     .on_connect(|| println!("connected"))
///     .on_match_data(|data| println!("op {} from {}", data.op_code, data.match_id));
/// ```
#[derive(Clone, Default)]
pub struct Listeners {
    connect: Option<Handler<()>>,
    disconnect: Option<Handler<DisconnectInfo>>,
    error: Option<Handler<ServerError>>,
    channel_message: Option<Handler<ChannelMessage>>,
    channel_presence: Option<Handler<ChannelPresenceEvent>>,
    matchmaker_matched: Option<Handler<MatchmakerMatched>>,
    match_data: Option<Handler<MatchData>>,
    match_presence: Option<Handler<MatchPresenceEvent>>,
    notifications: Option<Handler<NotificationList>>,
    status_presence: Option<Handler<StatusPresenceEvent>>,
    stream_data: Option<Handler<StreamData>>,
    stream_presence: Option<Handler<StreamPresenceEvent>>,
    party: Option<Handler<Party>>,
    party_close: Option<Handler<PartyClose>>,
    party_data: Option<Handler<PartyData>>,
    party_join_request: Option<Handler<PartyJoinRequest>>,
    party_leader: Option<Handler<PartyLeader>>,
    party_matchmaker_ticket: Option<Handler<PartyMatchmakerTicket>>,
    party_presence: Option<Handler<PartyPresenceEvent>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listeners that forward everything into an unbounded channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let forward = move |event: ClientEvent| {
            let _ = tx.send(event);
        };
        let forward = Arc::new(forward);

        let listeners = Self::new()
            .on_connect({
                let forward = Arc::clone(&forward);
                move || forward(ClientEvent::Connected)
            })
            .on_disconnect({
                let forward = Arc::clone(&forward);
                move |info| forward(ClientEvent::Disconnected(info))
            })
            .on_any_event(move |event| forward(ClientEvent::Event(event)));
        (listeners, rx)
    }

    /// Installs `handler` for every server event category, including errors.
    pub fn on_any_event(self, handler: impl Fn(RtEvent) + Send + Sync + 'static) -> Self {
        let handler: Handler<RtEvent> = Arc::new(handler);
        self.on_error(wrap_event(&handler, RtEvent::Error))
            .on_channel_message(wrap_event(&handler, RtEvent::ChannelMessage))
            .on_channel_presence(wrap_event(&handler, RtEvent::ChannelPresenceEvent))
            .on_matchmaker_matched(wrap_event(&handler, RtEvent::MatchmakerMatched))
            .on_match_data(wrap_event(&handler, RtEvent::MatchData))
            .on_match_presence(wrap_event(&handler, RtEvent::MatchPresenceEvent))
            .on_notifications(wrap_event(&handler, RtEvent::Notifications))
            .on_status_presence(wrap_event(&handler, RtEvent::StatusPresenceEvent))
            .on_stream_data(wrap_event(&handler, RtEvent::StreamData))
            .on_stream_presence(wrap_event(&handler, RtEvent::StreamPresenceEvent))
            .on_party(wrap_event(&handler, RtEvent::Party))
            .on_party_close(wrap_event(&handler, RtEvent::PartyClose))
            .on_party_data(wrap_event(&handler, RtEvent::PartyData))
            .on_party_join_request(wrap_event(&handler, RtEvent::PartyJoinRequest))
            .on_party_leader(wrap_event(&handler, RtEvent::PartyLeader))
            .on_party_matchmaker_ticket(wrap_event(&handler, RtEvent::PartyMatchmakerTicket))
            .on_party_presence(wrap_event(&handler, RtEvent::PartyPresenceEvent))
    }

    pub fn on_connect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.connect = Some(Arc::new(move |()| handler()));
        self
    }

    pub fn on_disconnect(
        mut self,
        handler: impl Fn(DisconnectInfo) + Send + Sync + 'static,
    ) -> Self {
        self.disconnect = Some(Arc::new(handler));
        self
    }

    /// Server errors that are not replies to a request.
    pub fn on_error(mut self, handler: impl Fn(ServerError) + Send + Sync + 'static) -> Self {
        self.error = Some(Arc::new(handler));
        self
    }

    pub fn on_channel_message(
        mut self,
        handler: impl Fn(ChannelMessage) + Send + Sync + 'static,
    ) -> Self {
        self.channel_message = Some(Arc::new(handler));
        self
    }

    pub fn on_channel_presence(
        mut self,
        handler: impl Fn(ChannelPresenceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.channel_presence = Some(Arc::new(handler));
        self
    }

    pub fn on_matchmaker_matched(
        mut self,
        handler: impl Fn(MatchmakerMatched) + Send + Sync + 'static,
    ) -> Self {
        self.matchmaker_matched = Some(Arc::new(handler));
        self
    }

    pub fn on_match_data(mut self, handler: impl Fn(MatchData) + Send + Sync + 'static) -> Self {
        self.match_data = Some(Arc::new(handler));
        self
    }

    pub fn on_match_presence(
        mut self,
        handler: impl Fn(MatchPresenceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.match_presence = Some(Arc::new(handler));
        self
    }

    pub fn on_notifications(
        mut self,
        handler: impl Fn(NotificationList) + Send + Sync + 'static,
    ) -> Self {
        self.notifications = Some(Arc::new(handler));
        self
    }

    pub fn on_status_presence(
        mut self,
        handler: impl Fn(StatusPresenceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.status_presence = Some(Arc::new(handler));
        self
    }

    pub fn on_stream_data(mut self, handler: impl Fn(StreamData) + Send + Sync + 'static) -> Self {
        self.stream_data = Some(Arc::new(handler));
        self
    }

    pub fn on_stream_presence(
        mut self,
        handler: impl Fn(StreamPresenceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.stream_presence = Some(Arc::new(handler));
        self
    }

    pub fn on_party(mut self, handler: impl Fn(Party) + Send + Sync + 'static) -> Self {
        self.party = Some(Arc::new(handler));
        self
    }

    pub fn on_party_close(mut self, handler: impl Fn(PartyClose) + Send + Sync + 'static) -> Self {
        self.party_close = Some(Arc::new(handler));
        self
    }

    pub fn on_party_data(mut self, handler: impl Fn(PartyData) + Send + Sync + 'static) -> Self {
        self.party_data = Some(Arc::new(handler));
        self
    }

    pub fn on_party_join_request(
        mut self,
        handler: impl Fn(PartyJoinRequest) + Send + Sync + 'static,
    ) -> Self {
        self.party_join_request = Some(Arc::new(handler));
        self
    }

    pub fn on_party_leader(
        mut self,
        handler: impl Fn(PartyLeader) + Send + Sync + 'static,
    ) -> Self {
        self.party_leader = Some(Arc::new(handler));
        self
    }

    pub fn on_party_matchmaker_ticket(
        mut self,
        handler: impl Fn(PartyMatchmakerTicket) + Send + Sync + 'static,
    ) -> Self {
        self.party_matchmaker_ticket = Some(Arc::new(handler));
        self
    }

    pub fn on_party_presence(
        mut self,
        handler: impl Fn(PartyPresenceEvent) + Send + Sync + 'static,
    ) -> Self {
        self.party_presence = Some(Arc::new(handler));
        self
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("connect", &self.connect.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .field("error", &self.error.is_some())
            .finish_non_exhaustive()
    }
}

fn wrap_event<T>(
    handler: &Handler<RtEvent>,
    map: fn(T) -> RtEvent,
) -> impl Fn(T) + Send + Sync + 'static
where
    T: 'static,
{
    let handler = Arc::clone(handler);
    move |value| handler(map(value))
}

/// Routes lifecycle notifications and server events to the current
/// [`Listeners`].
pub(crate) struct EventDispatcher {
    listeners: ArcSwap<Listeners>,
}

impl EventDispatcher {
    pub fn new(listeners: Listeners) -> Self {
        Self {
            listeners: ArcSwap::from_pointee(listeners),
        }
    }

    pub fn replace(&self, listeners: Listeners) {
        self.listeners.store(Arc::new(listeners));
    }

    pub fn connected(&self) {
        let listeners = self.listeners.load();
        deliver(&listeners.connect, (), "connect");
    }

    pub fn disconnected(&self, info: DisconnectInfo) {
        let listeners = self.listeners.load();
        deliver(&listeners.disconnect, info, "disconnect");
    }

    pub fn dispatch(&self, event: RtEvent) {
        let listeners = self.listeners.load();
        let kind = event.kind();
        match event {
            RtEvent::Error(error) => {
                tracing::warn!(
                    event = "server_error_event",
                    code = %error.code,
                    message = %error.message
                );
                deliver(&listeners.error, error, kind)
            }
            RtEvent::ChannelMessage(message) => deliver(&listeners.channel_message, message, kind),
            RtEvent::ChannelPresenceEvent(diff) => deliver(&listeners.channel_presence, diff, kind),
            RtEvent::MatchmakerMatched(matched) => {
                deliver(&listeners.matchmaker_matched, matched, kind)
            }
            RtEvent::MatchData(data) => deliver(&listeners.match_data, data, kind),
            RtEvent::MatchPresenceEvent(diff) => deliver(&listeners.match_presence, diff, kind),
            RtEvent::Notifications(list) => deliver(&listeners.notifications, list, kind),
            RtEvent::StatusPresenceEvent(diff) => deliver(&listeners.status_presence, diff, kind),
            RtEvent::StreamData(data) => deliver(&listeners.stream_data, data, kind),
            RtEvent::StreamPresenceEvent(diff) => deliver(&listeners.stream_presence, diff, kind),
            RtEvent::Party(party) => deliver(&listeners.party, party, kind),
            RtEvent::PartyClose(close) => deliver(&listeners.party_close, close, kind),
            RtEvent::PartyData(data) => deliver(&listeners.party_data, data, kind),
            RtEvent::PartyJoinRequest(request) => {
                deliver(&listeners.party_join_request, request, kind)
            }
            RtEvent::PartyLeader(leader) => deliver(&listeners.party_leader, leader, kind),
            RtEvent::PartyMatchmakerTicket(ticket) => {
                deliver(&listeners.party_matchmaker_ticket, ticket, kind)
            }
            RtEvent::PartyPresenceEvent(diff) => deliver(&listeners.party_presence, diff, kind),
        }
    }
}

fn deliver<T>(handler: &Option<Handler<T>>, value: T, kind: &'static str) {
    match handler {
        Some(handler) => handler(value),
        None => tracing::trace!(event = "event_without_listener", kind),
    }
}
