//! Presence bookkeeping for joined matches, parties, channels and streams.
//!
//! Join and create responses seed a snapshot; presence events are applied on
//! top as diffs. Snapshots are immutable `Arc<PresenceSet>` values replaced
//! wholesale, so readers never see a half-applied diff.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::realtime::proto::{
    Channel, Match, MatchmakerTicket, Party, PartyMatchmakerTicket, Release, ResponseBody,
    RtEvent, Status, StreamId, UserPresence,
};

/// Identity of a presence within a stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PresenceKey {
    pub user_id: String,
    pub session_id: String,
}

impl From<&UserPresence> for PresenceKey {
    fn from(presence: &UserPresence) -> Self {
        Self {
            user_id: presence.user_id.clone(),
            session_id: presence.session_id.clone(),
        }
    }
}

/// Members of one presence stream.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PresenceSet {
    members: BTreeMap<PresenceKey, UserPresence>,
}

impl PresenceSet {
    pub fn from_presences<'a>(presences: impl IntoIterator<Item = &'a UserPresence>) -> Self {
        let mut set = Self::default();
        set.apply(presences, std::iter::empty());
        set
    }

    /// Applies a diff. Leaves are removed before joins are added, so a
    /// presence listed in both ends up present with its joined state.
    pub fn apply<'a>(
        &mut self,
        joins: impl IntoIterator<Item = &'a UserPresence>,
        leaves: impl IntoIterator<Item = &'a UserPresence>,
    ) {
        for presence in leaves {
            self.members.remove(&PresenceKey::from(presence));
        }
        for presence in joins {
            self.members.insert(PresenceKey::from(presence), presence.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, user_id: &str, session_id: &str) -> bool {
        self.members.contains_key(&PresenceKey {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        })
    }

    pub fn get(&self, key: &PresenceKey) -> Option<&UserPresence> {
        self.members.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserPresence> {
        self.members.values()
    }

    /// Distinct user ids in the set.
    pub fn user_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.members.keys().map(|key| key.user_id.as_str()).collect();
        ids.dedup();
        ids
    }
}

/// Presence stream a snapshot belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StreamKey {
    Match(String),
    Party(String),
    Channel(String),
    /// Users followed through `status_follow`.
    Status,
    Stream(StreamId),
}

#[derive(Default)]
struct TrackerState {
    streams: HashMap<StreamKey, Arc<PresenceSet>>,
    matchmaker_tickets: HashSet<String>,
    party_tickets: HashSet<(String, String)>,
}

impl TrackerState {
    fn seed(&mut self, key: StreamKey, set: PresenceSet) {
        self.streams.insert(key, Arc::new(set));
    }

    fn apply_diff(
        &mut self,
        key: StreamKey,
        joins: &[UserPresence],
        leaves: &[UserPresence],
        create_missing: bool,
    ) {
        let current = match self.streams.get(&key) {
            Some(current) => current.as_ref().clone(),
            None if create_missing => PresenceSet::default(),
            None => {
                tracing::debug!(event = "presence_diff_ignored", stream = ?key);
                return;
            }
        };
        let mut next = current;
        next.apply(joins, leaves);
        self.streams.insert(key, Arc::new(next));
    }
}

/// Tracks presence snapshots and the match/party/channel/ticket handles that
/// are valid on the current connection.
///
/// Only the connection worker mutates the tracker; any thread may read.
#[derive(Default)]
pub struct PresenceTracker {
    state: RwLock<TrackerState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot for `key`, if the stream is tracked.
    pub fn presences(&self, key: &StreamKey) -> Option<Arc<PresenceSet>> {
        self.state.read().streams.get(key).cloned()
    }

    pub fn active_matches(&self) -> Vec<String> {
        self.handles(|key| match key {
            StreamKey::Match(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn active_parties(&self) -> Vec<String> {
        self.handles(|key| match key {
            StreamKey::Party(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn active_channels(&self) -> Vec<String> {
        self.handles(|key| match key {
            StreamKey::Channel(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn matchmaker_tickets(&self) -> Vec<String> {
        let mut tickets: Vec<String> =
            self.state.read().matchmaker_tickets.iter().cloned().collect();
        tickets.sort();
        tickets
    }

    /// Party matchmaker tickets as `(party_id, ticket)` pairs.
    pub fn party_matchmaker_tickets(&self) -> Vec<(String, String)> {
        let mut tickets: Vec<(String, String)> =
            self.state.read().party_tickets.iter().cloned().collect();
        tickets.sort();
        tickets
    }

    /// Whether the handle behind `key` is valid on the current connection.
    pub fn is_active(&self, key: &StreamKey) -> bool {
        self.state.read().streams.contains_key(key)
    }

    fn handles(&self, select: impl Fn(&StreamKey) -> Option<String>) -> Vec<String> {
        let mut ids: Vec<String> = self.state.read().streams.keys().filter_map(select).collect();
        ids.sort();
        ids
    }

    /// Applies the effect of a successful correlated response.
    pub(crate) fn apply_response(&self, body: &ResponseBody, release: Option<&Release>) {
        let mut state = self.state.write();

        if let Some(release) = release {
            match release {
                Release::Stream(key) => {
                    state.streams.remove(key);
                }
                Release::Ticket(ticket) => {
                    state.matchmaker_tickets.remove(ticket);
                }
                Release::PartyTicket { party_id, ticket } => {
                    state.party_tickets.remove(&(party_id.clone(), ticket.clone()));
                }
            }
        }

        match body.kind() {
            Some("match") => {
                if let Some(joined) = body.peek::<Match>("match") {
                    let set = snapshot(&joined.presences, joined.self_presence.as_ref());
                    state.seed(StreamKey::Match(joined.match_id), set);
                }
            }
            Some("channel") => {
                if let Some(channel) = body.peek::<Channel>("channel") {
                    let set = snapshot(&channel.presences, channel.self_presence.as_ref());
                    state.seed(StreamKey::Channel(channel.id), set);
                }
            }
            Some("party") => {
                if let Some(party) = body.peek::<Party>("party") {
                    let set = snapshot(&party.presences, party.self_presence.as_ref());
                    state.seed(StreamKey::Party(party.party_id), set);
                }
            }
            Some("status") => {
                if let Some(status) = body.peek::<Status>("status") {
                    state.apply_diff(StreamKey::Status, &status.presences, &[], true);
                }
            }
            Some("matchmaker_ticket") => {
                if let Some(ticket) = body.peek::<MatchmakerTicket>("matchmaker_ticket") {
                    state.matchmaker_tickets.insert(ticket.ticket);
                }
            }
            Some("party_matchmaker_ticket") => {
                let ticket = body.peek::<PartyMatchmakerTicket>("party_matchmaker_ticket");
                if let Some(ticket) = ticket {
                    state.party_tickets.insert((ticket.party_id, ticket.ticket));
                }
            }
            _ => {}
        }
    }

    /// Applies the presence effect of a server event.
    pub(crate) fn apply_event(&self, event: &RtEvent) {
        let mut state = self.state.write();
        match event {
            RtEvent::MatchPresenceEvent(diff) => {
                let key = StreamKey::Match(diff.match_id.clone());
                state.apply_diff(key, &diff.joins, &diff.leaves, false);
            }
            RtEvent::ChannelPresenceEvent(diff) => {
                let key = StreamKey::Channel(diff.channel_id.clone());
                state.apply_diff(key, &diff.joins, &diff.leaves, false);
            }
            RtEvent::PartyPresenceEvent(diff) => {
                let key = StreamKey::Party(diff.party_id.clone());
                state.apply_diff(key, &diff.joins, &diff.leaves, false);
            }
            RtEvent::StatusPresenceEvent(diff) => {
                state.apply_diff(StreamKey::Status, &diff.joins, &diff.leaves, true);
            }
            RtEvent::StreamPresenceEvent(diff) => {
                let key = StreamKey::Stream(diff.stream.clone());
                state.apply_diff(key, &diff.joins, &diff.leaves, true);
            }
            RtEvent::Party(party) => {
                let set = snapshot(&party.presences, party.self_presence.as_ref());
                state.seed(StreamKey::Party(party.party_id.clone()), set);
            }
            RtEvent::PartyClose(close) => {
                state.streams.remove(&StreamKey::Party(close.party_id.clone()));
                state.party_tickets.retain(|(party_id, _)| party_id != &close.party_id);
            }
            RtEvent::MatchmakerMatched(matched) => {
                state.matchmaker_tickets.remove(&matched.ticket);
                state.party_tickets.retain(|(_, ticket)| ticket != &matched.ticket);
            }
            RtEvent::PartyMatchmakerTicket(ticket) => {
                state.party_tickets.insert((ticket.party_id.clone(), ticket.ticket.clone()));
            }
            _ => {}
        }
    }

    /// Invalidates every snapshot and handle. Called on connection loss.
    pub(crate) fn clear(&self) {
        let mut state = self.state.write();
        let dropped =
            state.streams.len() + state.matchmaker_tickets.len() + state.party_tickets.len();
        *state = TrackerState::default();
        if dropped > 0 {
            tracing::debug!(event = "presence_cleared", dropped);
        }
    }
}

fn snapshot(presences: &[UserPresence], self_presence: Option<&UserPresence>) -> PresenceSet {
    PresenceSet::from_presences(presences.iter().chain(self_presence))
}
