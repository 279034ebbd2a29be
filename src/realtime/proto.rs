//! Realtime envelope codec and the protocol messages shared with the server.
//!
//! Every frame is a JSON object. A correlated frame carries a `cid` member
//! (decimal string); the remaining single member names the payload kind:
//!
//! ```text
//! {"cid":"7","match_join":{"match_id":"m1"}}     client request
//! {"cid":"7","match":{"match_id":"m1",...}}      server response
//! {"cid":"7","error":{"code":4,"message":"..."}} server error response
//! {"match_data":{"match_id":"m1",...}}           unsolicited event
//! ```

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::realtime::error::{FrameError, RequestError, ServerError};
use crate::realtime::presence::StreamKey;

/// Byte payloads travel as standard base64 strings inside JSON frames.
mod base64_data {
    use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Protobuf JSON writes 64-bit integers as strings; numbers are accepted too.
mod lenient_int {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(i64),
        Text(String),
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<i64>,
    {
        let value = match Repr::deserialize(deserializer)? {
            Repr::Number(value) => value,
            Repr::Text(text) => text.trim().parse::<i64>().map_err(D::Error::custom)?,
        };
        T::try_from(value).map_err(|_| D::Error::custom(format!("integer {value} out of range")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UserPresence {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub persistence: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Chat channel kinds accepted by `channel_join`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    Room,
    DirectMessage,
    Group,
}

impl ChannelType {
    pub fn as_i32(self) -> i32 {
        match self {
            ChannelType::Room => 1,
            ChannelType::DirectMessage => 2,
            ChannelType::Group => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct StreamId {
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub mode: i32,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub subcontext: String,
    #[serde(default)]
    pub label: String,
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RtRequest {
    ChannelJoin {
        target: String,
        #[serde(rename = "type")]
        channel_type: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        persistence: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hidden: Option<bool>,
    },
    ChannelLeave {
        channel_id: String,
    },
    ChannelMessageSend {
        channel_id: String,
        content: String,
    },
    ChannelMessageUpdate {
        channel_id: String,
        message_id: String,
        content: String,
    },
    ChannelMessageRemove {
        channel_id: String,
        message_id: String,
    },
    MatchCreate {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    MatchJoin {
        #[serde(skip_serializing_if = "Option::is_none")]
        match_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, String>,
    },
    MatchLeave {
        match_id: String,
    },
    MatchDataSend {
        match_id: String,
        op_code: i64,
        #[serde(with = "base64_data")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        presences: Vec<UserPresence>,
        reliable: bool,
    },
    MatchmakerAdd {
        min_count: i32,
        max_count: i32,
        query: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        string_properties: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        numeric_properties: BTreeMap<String, f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        count_multiple: Option<i32>,
    },
    MatchmakerRemove {
        ticket: String,
    },
    PartyCreate {
        open: bool,
        max_size: i32,
    },
    PartyJoin {
        party_id: String,
    },
    PartyLeave {
        party_id: String,
    },
    PartyClose {
        party_id: String,
    },
    PartyPromote {
        party_id: String,
        presence: UserPresence,
    },
    PartyAccept {
        party_id: String,
        presence: UserPresence,
    },
    PartyRemove {
        party_id: String,
        presence: UserPresence,
    },
    PartyDataSend {
        party_id: String,
        op_code: i64,
        #[serde(with = "base64_data")]
        data: Vec<u8>,
    },
    PartyJoinRequestList {
        party_id: String,
    },
    PartyMatchmakerAdd {
        party_id: String,
        min_count: i32,
        max_count: i32,
        query: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        string_properties: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        numeric_properties: BTreeMap<String, f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        count_multiple: Option<i32>,
    },
    PartyMatchmakerRemove {
        party_id: String,
        ticket: String,
    },
    StatusFollow {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        user_ids: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        usernames: Vec<String>,
    },
    StatusUnfollow {
        user_ids: Vec<String>,
    },
    StatusUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },
    Rpc {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<String>,
    },
    Ping {},
}

/// Tracker state released by a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Release {
    Stream(StreamKey),
    Ticket(String),
    PartyTicket { party_id: String, ticket: String },
}

impl RtRequest {
    /// Wire name of the request payload member.
    pub fn kind(&self) -> &'static str {
        match self {
            RtRequest::ChannelJoin { .. } => "channel_join",
            RtRequest::ChannelLeave { .. } => "channel_leave",
            RtRequest::ChannelMessageSend { .. } => "channel_message_send",
            RtRequest::ChannelMessageUpdate { .. } => "channel_message_update",
            RtRequest::ChannelMessageRemove { .. } => "channel_message_remove",
            RtRequest::MatchCreate { .. } => "match_create",
            RtRequest::MatchJoin { .. } => "match_join",
            RtRequest::MatchLeave { .. } => "match_leave",
            RtRequest::MatchDataSend { .. } => "match_data_send",
            RtRequest::MatchmakerAdd { .. } => "matchmaker_add",
            RtRequest::MatchmakerRemove { .. } => "matchmaker_remove",
            RtRequest::PartyCreate { .. } => "party_create",
            RtRequest::PartyJoin { .. } => "party_join",
            RtRequest::PartyLeave { .. } => "party_leave",
            RtRequest::PartyClose { .. } => "party_close",
            RtRequest::PartyPromote { .. } => "party_promote",
            RtRequest::PartyAccept { .. } => "party_accept",
            RtRequest::PartyRemove { .. } => "party_remove",
            RtRequest::PartyDataSend { .. } => "party_data_send",
            RtRequest::PartyJoinRequestList { .. } => "party_join_request_list",
            RtRequest::PartyMatchmakerAdd { .. } => "party_matchmaker_add",
            RtRequest::PartyMatchmakerRemove { .. } => "party_matchmaker_remove",
            RtRequest::StatusFollow { .. } => "status_follow",
            RtRequest::StatusUnfollow { .. } => "status_unfollow",
            RtRequest::StatusUpdate { .. } => "status_update",
            RtRequest::Rpc { .. } => "rpc",
            RtRequest::Ping {} => "ping",
        }
    }

    pub(crate) fn release(&self) -> Option<Release> {
        match self {
            RtRequest::ChannelLeave { channel_id } => {
                Some(Release::Stream(StreamKey::Channel(channel_id.clone())))
            }
            RtRequest::MatchLeave { match_id } => {
                Some(Release::Stream(StreamKey::Match(match_id.clone())))
            }
            RtRequest::PartyLeave { party_id } | RtRequest::PartyClose { party_id } => {
                Some(Release::Stream(StreamKey::Party(party_id.clone())))
            }
            RtRequest::MatchmakerRemove { ticket } => Some(Release::Ticket(ticket.clone())),
            RtRequest::PartyMatchmakerRemove { party_id, ticket } => Some(Release::PartyTicket {
                party_id: party_id.clone(),
                ticket: ticket.clone(),
            }),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    #[serde(default)]
    pub presences: Vec<UserPresence>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_presence: Option<UserPresence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id_one: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id_two: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMessageAck {
    pub channel_id: String,
    pub message_id: String,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub code: i32,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub update_time: String,
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Match {
    pub match_id: String,
    #[serde(default)]
    pub authoritative: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub size: i32,
    #[serde(default)]
    pub presences: Vec<UserPresence>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_presence: Option<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchmakerTicket {
    pub ticket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Party {
    pub party_id: String,
    #[serde(default)]
    pub open: bool,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub max_size: i32,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_presence: Option<UserPresence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<UserPresence>,
    #[serde(default)]
    pub presences: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyMatchmakerTicket {
    pub party_id: String,
    pub ticket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyJoinRequest {
    pub party_id: String,
    #[serde(default)]
    pub presences: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Status {
    #[serde(default)]
    pub presences: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rpc {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel_id: String,
    pub message_id: String,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub code: i32,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub update_time: String,
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelPresenceEvent {
    pub channel_id: String,
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchmakerUser {
    pub presence: UserPresence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub party_id: Option<String>,
    #[serde(default)]
    pub string_properties: BTreeMap<String, String>,
    #[serde(default)]
    pub numeric_properties: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchmakerMatched {
    pub ticket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default)]
    pub users: Vec<MatchmakerUser>,
    #[serde(rename = "self", default, skip_serializing_if = "Option::is_none")]
    pub self_user: Option<MatchmakerUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchData {
    pub match_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<UserPresence>,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub op_code: i64,
    #[serde(with = "base64_data", default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub reliable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchPresenceEvent {
    pub match_id: String,
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub code: i32,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub create_time: String,
    #[serde(default)]
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationList {
    #[serde(default)]
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusPresenceEvent {
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamData {
    pub stream: StreamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<UserPresence>,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub reliable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamPresenceEvent {
    pub stream: StreamId,
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyClose {
    pub party_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyData {
    pub party_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<UserPresence>,
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub op_code: i64,
    #[serde(with = "base64_data", default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyLeader {
    pub party_id: String,
    pub presence: UserPresence,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartyPresenceEvent {
    pub party_id: String,
    #[serde(default)]
    pub joins: Vec<UserPresence>,
    #[serde(default)]
    pub leaves: Vec<UserPresence>,
}

/// Wire shape of a server error member.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerErrorMsg {
    #[serde(default, deserialize_with = "lenient_int::deserialize")]
    pub code: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

/// Unsolicited server-pushed event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RtEvent {
    Error(ServerError),
    ChannelMessage(ChannelMessage),
    ChannelPresenceEvent(ChannelPresenceEvent),
    MatchmakerMatched(MatchmakerMatched),
    MatchData(MatchData),
    MatchPresenceEvent(MatchPresenceEvent),
    Notifications(NotificationList),
    StatusPresenceEvent(StatusPresenceEvent),
    StreamData(StreamData),
    StreamPresenceEvent(StreamPresenceEvent),
    Party(Party),
    PartyClose(PartyClose),
    PartyData(PartyData),
    PartyJoinRequest(PartyJoinRequest),
    PartyLeader(PartyLeader),
    PartyMatchmakerTicket(PartyMatchmakerTicket),
    PartyPresenceEvent(PartyPresenceEvent),
}

impl RtEvent {
    /// Payload member names this client understands.
    pub const KINDS: &'static [&'static str] = &[
        "error",
        "channel_message",
        "channel_presence_event",
        "matchmaker_matched",
        "match_data",
        "match_presence_event",
        "notifications",
        "status_presence_event",
        "stream_data",
        "stream_presence_event",
        "party",
        "party_close",
        "party_data",
        "party_join_request",
        "party_leader",
        "party_matchmaker_ticket",
        "party_presence_event",
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            RtEvent::Error(_) => "error",
            RtEvent::ChannelMessage(_) => "channel_message",
            RtEvent::ChannelPresenceEvent(_) => "channel_presence_event",
            RtEvent::MatchmakerMatched(_) => "matchmaker_matched",
            RtEvent::MatchData(_) => "match_data",
            RtEvent::MatchPresenceEvent(_) => "match_presence_event",
            RtEvent::Notifications(_) => "notifications",
            RtEvent::StatusPresenceEvent(_) => "status_presence_event",
            RtEvent::StreamData(_) => "stream_data",
            RtEvent::StreamPresenceEvent(_) => "stream_presence_event",
            RtEvent::Party(_) => "party",
            RtEvent::PartyClose(_) => "party_close",
            RtEvent::PartyData(_) => "party_data",
            RtEvent::PartyJoinRequest(_) => "party_join_request",
            RtEvent::PartyLeader(_) => "party_leader",
            RtEvent::PartyMatchmakerTicket(_) => "party_matchmaker_ticket",
            RtEvent::PartyPresenceEvent(_) => "party_presence_event",
        }
    }

    pub fn is_known_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }
}

// ---------------------------------------------------------------------------
// Envelope codec
// ---------------------------------------------------------------------------

/// Successful response payload, decoded lazily into the caller's type.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseBody {
    kind: Option<String>,
    data: Value,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self {
            kind: None,
            data: Value::Null,
        }
    }

    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: Some(kind.into()),
            data,
        }
    }

    /// Payload member name, `None` for an acknowledgement without payload.
    pub fn kind(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Decodes the payload as `T`, checking the member name first.
    pub fn decode<T: DeserializeOwned>(self, expected: &'static str) -> Result<T, RequestError> {
        match self.kind.as_deref() {
            Some(kind) if kind == expected => {}
            other => {
                return Err(RequestError::UnexpectedResponse {
                    expected,
                    got: other.unwrap_or("<empty>").to_string(),
                })
            }
        }
        serde_json::from_value(self.data).map_err(|source| RequestError::Decode {
            kind: expected,
            source,
        })
    }

    /// Decodes the payload as `T` if it is present under `expected`.
    pub(crate) fn peek<T: DeserializeOwned>(&self, expected: &str) -> Option<T> {
        if self.kind.as_deref() != Some(expected) {
            return None;
        }
        T::deserialize(&self.data).ok()
    }
}

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Correlated response to an earlier request.
    Response {
        cid: u64,
        result: Result<ResponseBody, ServerError>,
    },
    /// Unsolicited server event.
    Event(RtEvent),
    /// Well-formed event of a kind this client does not handle.
    Unknown { kind: String },
}

/// Encodes a request envelope. `cid` is `None` for fire-and-forget sends.
pub fn encode_request(cid: Option<u64>, request: &RtRequest) -> Result<String, serde_json::Error> {
    let mut value = serde_json::to_value(request)?;
    if let (Some(cid), Value::Object(object)) = (cid, &mut value) {
        object.insert("cid".to_string(), Value::String(cid.to_string()));
    }
    serde_json::to_string(&value)
}

/// Decodes a client request envelope, returning its correlation id.
pub fn decode_request(text: &str) -> Result<(Option<u64>, RtRequest), FrameError> {
    let (cid, object) = split_envelope(text)?;
    Ok((cid, serde_json::from_value(Value::Object(object))?))
}

/// Encodes a successful response envelope.
pub fn encode_response<T: Serialize>(
    cid: u64,
    kind: &str,
    payload: &T,
) -> Result<String, serde_json::Error> {
    let mut object = Map::new();
    object.insert("cid".to_string(), Value::String(cid.to_string()));
    object.insert(kind.to_string(), serde_json::to_value(payload)?);
    serde_json::to_string(&Value::Object(object))
}

/// Encodes an acknowledgement that carries no payload.
pub fn encode_empty_response(cid: u64) -> String {
    let mut object = Map::new();
    object.insert("cid".to_string(), Value::String(cid.to_string()));
    Value::Object(object).to_string()
}

pub fn encode_error_response(cid: u64, error: &ServerError) -> Result<String, serde_json::Error> {
    encode_response(cid, "error", error)
}

pub fn encode_event(event: &RtEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Decodes an inbound server frame.
pub fn decode(text: &str) -> Result<Inbound, FrameError> {
    let (cid, object) = split_envelope(text)?;
    let member = object.into_iter().next();

    match (cid, member) {
        (Some(cid), None) => Ok(Inbound::Response {
            cid,
            result: Ok(ResponseBody::empty()),
        }),
        (Some(cid), Some((kind, data))) if kind == "error" => Ok(Inbound::Response {
            cid,
            result: Err(serde_json::from_value::<ServerError>(data)
                .map_err(|source| FrameError::Response { cid, source })?),
        }),
        (Some(cid), Some((kind, data))) => Ok(Inbound::Response {
            cid,
            result: Ok(ResponseBody::new(kind, data)),
        }),
        (None, None) => Err(FrameError::Shape(
            "event envelope carries no payload".to_string(),
        )),
        (None, Some((kind, _))) if !RtEvent::is_known_kind(&kind) => Ok(Inbound::Unknown { kind }),
        (None, Some((kind, data))) => {
            let mut event = Map::new();
            event.insert(kind, data);
            Ok(Inbound::Event(serde_json::from_value(Value::Object(event))?))
        }
    }
}

fn split_envelope(text: &str) -> Result<(Option<u64>, Map<String, Value>), FrameError> {
    let Value::Object(mut object) = serde_json::from_str::<Value>(text)? else {
        return Err(FrameError::Shape("envelope is not a JSON object".to_string()));
    };

    let cid = match object.remove("cid") {
        None | Some(Value::Null) => None,
        Some(Value::String(cid)) if cid.is_empty() => None,
        Some(Value::String(cid)) => Some(
            cid.parse::<u64>()
                .map_err(|_| FrameError::Shape(format!("invalid cid `{cid}`")))?,
        ),
        Some(Value::Number(cid)) => Some(
            cid.as_u64()
                .ok_or_else(|| FrameError::Shape(format!("invalid cid `{cid}`")))?,
        ),
        Some(other) => return Err(FrameError::Shape(format!("invalid cid `{other}`"))),
    };

    if object.len() > 1 {
        return Err(FrameError::Shape(format!(
            "envelope carries {} payload members",
            object.len()
        )));
    }

    Ok((cid, object))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::realtime::error::RtErrorCode;

    fn presence(user: &str) -> UserPresence {
        UserPresence {
            user_id: user.to_string(),
            session_id: format!("{user}-session"),
            username: user.to_string(),
            persistence: false,
            status: None,
        }
    }

    #[test]
    fn request_envelope_carries_cid_and_single_payload_member() {
        let text = encode_request(
            Some(12),
            &RtRequest::MatchJoin {
                match_id: Some("m1".to_string()),
                token: None,
                metadata: BTreeMap::new(),
            },
        )
        .expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value, json!({"cid": "12", "match_join": {"match_id": "m1"}}));
    }

    #[test]
    fn fire_and_forget_request_has_no_cid() {
        let text = encode_request(
            None,
            &RtRequest::MatchDataSend {
                match_id: "m1".to_string(),
                op_code: 3,
                data: b"hi".to_vec(),
                presences: Vec::new(),
                reliable: true,
            },
        )
        .expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(
            value,
            json!({
                "match_data_send": {
                    "match_id": "m1",
                    "op_code": 3,
                    "data": "aGk=",
                    "reliable": true
                }
            })
        );
    }

    #[test]
    fn ping_encodes_as_empty_object() {
        let text = encode_request(Some(1), &RtRequest::Ping {}).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value, json!({"cid": "1", "ping": {}}));
    }

    #[test]
    fn request_then_synthetic_response_keeps_cid_and_payload() {
        let request = RtRequest::Rpc {
            id: "echo".to_string(),
            payload: Some("{\"a\":1}".to_string()),
        };
        let outbound = encode_request(Some(41), &request).expect("encode");
        let (cid, decoded_request) = decode_request(&outbound).expect("decode request");
        assert_eq!(cid, Some(41));
        assert_eq!(decoded_request, request);

        let reply = Rpc {
            id: "echo".to_string(),
            payload: Some("{\"a\":1}".to_string()),
        };
        let inbound = encode_response(41, "rpc", &reply).expect("encode response");
        match decode(&inbound).expect("decode") {
            Inbound::Response { cid, result } => {
                assert_eq!(cid, 41);
                let body = result.expect("success");
                assert_eq!(body.decode::<Rpc>("rpc").expect("rpc"), reply);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn numeric_cid_is_accepted() {
        let inbound = decode(r#"{"cid": 5}"#).expect("decode");
        assert_eq!(
            inbound,
            Inbound::Response {
                cid: 5,
                result: Ok(ResponseBody::empty())
            }
        );
    }

    #[test]
    fn error_member_decodes_into_server_error() {
        let text =
            r#"{"cid":"9","error":{"code":4,"message":"match not found","context":{"id":"m9"}}}"#;
        let inbound = decode(text).expect("decode");
        let Inbound::Response { cid, result } = inbound else {
            panic!("expected response");
        };
        assert_eq!(cid, 9);
        let error = result.expect_err("server error");
        assert_eq!(error.code, RtErrorCode::MatchNotFound);
        assert_eq!(error.message, "match not found");
        assert_eq!(error.context.get("id").map(String::as_str), Some("m9"));
    }

    #[test]
    fn frame_without_cid_is_an_event() {
        let event = RtEvent::MatchPresenceEvent(MatchPresenceEvent {
            match_id: "m1".to_string(),
            joins: vec![presence("alice")],
            leaves: Vec::new(),
        });
        let text = encode_event(&event).expect("encode");
        assert_eq!(decode(&text).expect("decode"), Inbound::Event(event.clone()));

        let with_empty_cid = text.replacen('{', r#"{"cid":"","#, 1);
        assert_eq!(decode(&with_empty_cid).expect("decode"), Inbound::Event(event));
    }

    #[test]
    fn match_data_bytes_round_trip_through_base64() {
        let text = r#"{"match_data":{"match_id":"m1","op_code":7,"data":"AAEC","reliable":true}}"#;
        let Inbound::Event(RtEvent::MatchData(data)) = decode(text).expect("decode") else {
            panic!("expected match data");
        };
        assert_eq!(data.data, vec![0, 1, 2]);
        assert_eq!(data.op_code, 7);
    }

    #[test]
    fn protobuf_json_integers_and_omitted_zero_values_decode() {
        let text = r#"{"match_data":{"match_id":"m1","op_code":"9007199254740993","data":"AA=="}}"#;
        let Inbound::Event(RtEvent::MatchData(data)) = decode(text).expect("decode") else {
            panic!("expected match data");
        };
        assert_eq!(data.op_code, 9_007_199_254_740_993);
        assert!(!data.reliable);

        let text = r#"{"match_data":{"match_id":"m1"}}"#;
        let Inbound::Event(RtEvent::MatchData(data)) = decode(text).expect("decode") else {
            panic!("expected match data");
        };
        assert_eq!(data.op_code, 0);
        assert!(data.data.is_empty());

        let text = r#"{"stream_presence_event":{"stream":{"subject":"s1"},"joins":[]}}"#;
        let Inbound::Event(RtEvent::StreamPresenceEvent(event)) = decode(text).expect("decode")
        else {
            panic!("expected stream presence");
        };
        assert_eq!(event.stream.mode, 0);
        assert_eq!(event.stream.subject, "s1");

        let inbound = decode(r#"{"cid":"3","error":{"message":"boom"}}"#).expect("decode");
        let Inbound::Response { cid: 3, result } = inbound else {
            panic!("expected response");
        };
        assert_eq!(result.expect_err("server error").code, RtErrorCode::RuntimeException);
    }

    #[test]
    fn out_of_range_integers_are_malformed() {
        let body = ResponseBody::new("party", json!({"party_id": "p1", "max_size": "99999999999"}));
        assert!(matches!(body.decode::<Party>("party"), Err(RequestError::Decode { .. })));
    }

    #[test]
    fn undecodable_error_body_keeps_its_cid() {
        let err = decode(r#"{"cid":"4","error":["nope"]}"#).expect_err("malformed");
        assert_eq!(err.cid(), Some(4));
        assert_eq!(decode("not json").expect_err("malformed").cid(), None);
    }

    #[test]
    fn unknown_event_kind_is_not_malformed() {
        assert_eq!(
            decode(r#"{"something_new":{}}"#).expect("decode"),
            Inbound::Unknown {
                kind: "something_new".to_string()
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        for text in [
            "not json",
            "[1,2,3]",
            r#"{"cid":"abc","pong":{}}"#,
            r#"{"cid":"1","pong":{},"status":{}}"#,
            r#"{}"#,
            r#"{"match_data":{"op_code":"x"}}"#,
            r#"{"cid":true}"#,
        ] {
            assert!(decode(text).is_err(), "{text} should be malformed");
        }
    }

    #[test]
    fn response_body_checks_member_name() {
        let body = ResponseBody::new("party", json!({"party_id": "p1"}));
        let err = body.decode::<Match>("match").expect_err("mismatch");
        assert!(matches!(
            err,
            RequestError::UnexpectedResponse { expected: "match", ref got } if got == "party"
        ));
        let err = ResponseBody::empty()
            .decode::<Match>("match")
            .expect_err("empty");
        assert!(matches!(err, RequestError::UnexpectedResponse { .. }));
    }

    #[test]
    fn leave_requests_release_tracked_state() {
        assert_eq!(
            RtRequest::MatchLeave {
                match_id: "m1".to_string()
            }
            .release(),
            Some(Release::Stream(StreamKey::Match("m1".to_string())))
        );
        assert_eq!(
            RtRequest::MatchmakerRemove {
                ticket: "t1".to_string()
            }
            .release(),
            Some(Release::Ticket("t1".to_string()))
        );
        assert_eq!(RtRequest::Ping {}.release(), None);
    }
}
