//! JSON wire protocol between clients and the hub.
//!
//! Inbound frame:
//! ```text
//! { "type": "request_seat",          one FrameType per verb
//!   "payload": { "seat": 3 },        verb-specific fields
//!   "groupId": "…",                  or "conversationId"
//!   "userId": "…", "username": "Ana",
//!   "timestamp": 1718000000000,
//!   "requestId": "r-17" }            optional; answered by exactly one ack
//! ```
//!
//! Outbound events are tagged by `"type"` as well (`user_joined`,
//! `typing_update`, `seat_update`, `ack`, ...).

use parley_core::{
    Action, ActionError, Conflict, ErrorKind, InvalidSeat, Membership, MembershipEvent, Message,
    Seat, SeatAction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Pre-encoded outbound frame, shared by every recipient.
pub type Payload = Arc<str>;

/// Every inbound verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    JoinGroup,
    LeaveGroup,
    LeaveRoom,
    TypingStart,
    TypingStop,
    SendMessage,
    MessageReaction,
    EmojiReaction,
    EditMessage,
    DeleteMessage,
    ReadReceipt,
    VoiceState,
    EmojiBurst,
    CreateGroup,
    DeleteGroup,
    RequestSeat,
    CancelSeatRequest,
    AcceptJoinRequest,
    RejectJoinRequest,
    Promote,
    MoveToSeat,
    Demote,
    MoveToWaiting,
    LeaveSeat,
    Kick,
    GrantAdmin,
    RevokeAdmin,
    UpdateProfile,
    Ping,
}

/// Ephemeral events relayed to the rest of a room without persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayKind {
    MessageReaction,
    EmojiReaction,
    MessageEdited,
    MessageDeleted,
    ReadReceipt,
    VoiceState,
    EmojiBurst,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    pub user_id: Uuid,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// A validated inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    JoinGroup { group_id: Uuid },
    LeaveGroup { group_id: Uuid },
    LeaveRoom { group_id: Uuid },
    TypingStart,
    TypingStop,
    SendMessage { group_id: Uuid, client_id: Uuid, content: String },
    Relay { kind: RelayKind, payload: Value },
    CreateGroup { name: String, language: String },
    DeleteGroup { group_id: Uuid },
    Seat { group_id: Uuid, action: SeatAction },
    UpdateProfile { display_name: String },
    Ping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    #[serde(default)]
    content: String,
    client_id: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeatPayload {
    user_id: Option<Uuid>,
    seat: Option<u8>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    language: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfilePayload {
    #[serde(default)]
    display_name: String,
}

impl InboundFrame {
    pub fn new(frame_type: FrameType, user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            frame_type,
            payload: Value::Null,
            group_id: None,
            conversation_id: None,
            user_id,
            username: username.into(),
            timestamp: parley_core::model::unix_millis(),
            request_id: None,
        }
    }

    pub fn with_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// The frame a client sends to perform `action`.
    pub fn from_action(action: &Action, user_id: Uuid, username: &str) -> Self {
        let frame = |t: FrameType| InboundFrame::new(t, user_id, username);
        match action {
            Action::SendMessage { group_id, client_id, content } => frame(FrameType::SendMessage)
                .with_group(*group_id)
                .with_payload(serde_json::json!({ "content": content, "clientId": client_id })),
            Action::JoinGroup { group_id } => frame(FrameType::JoinGroup).with_group(*group_id),
            Action::LeaveGroup { group_id } => frame(FrameType::LeaveGroup).with_group(*group_id),
            Action::ProfileUpdate { display_name } => frame(FrameType::UpdateProfile)
                .with_payload(serde_json::json!({ "displayName": display_name })),
            Action::SeatAction { group_id, action } => {
                let (t, user, seat) = match *action {
                    SeatAction::RequestSeat { seat } => (FrameType::RequestSeat, None, Some(seat)),
                    SeatAction::CancelSeatRequest => (FrameType::CancelSeatRequest, None, None),
                    SeatAction::AcceptJoinRequest { user_id, seat } => {
                        (FrameType::AcceptJoinRequest, Some(user_id), Some(seat))
                    }
                    SeatAction::RejectJoinRequest { user_id } => {
                        (FrameType::RejectJoinRequest, Some(user_id), None)
                    }
                    SeatAction::Promote { user_id, seat } => (FrameType::Promote, Some(user_id), Some(seat)),
                    SeatAction::MoveToSeat { user_id, seat } => {
                        (FrameType::MoveToSeat, Some(user_id), Some(seat))
                    }
                    SeatAction::Demote { user_id } => (FrameType::Demote, Some(user_id), None),
                    SeatAction::MoveToWaiting { user_id } => (FrameType::MoveToWaiting, Some(user_id), None),
                    SeatAction::LeaveSeat => (FrameType::LeaveSeat, None, None),
                    SeatAction::Kick { user_id } => (FrameType::Kick, Some(user_id), None),
                    SeatAction::GrantAdmin { user_id } => (FrameType::GrantAdmin, Some(user_id), None),
                    SeatAction::RevokeAdmin { user_id } => (FrameType::RevokeAdmin, Some(user_id), None),
                };
                let mut payload = serde_json::Map::new();
                if let Some(u) = user {
                    payload.insert("userId".into(), Value::String(u.to_string()));
                }
                if let Some(s) = seat {
                    payload.insert("seat".into(), Value::from(s.index()));
                }
                frame(t).with_group(*group_id).with_payload(Value::Object(payload))
            }
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// `groupId`, falling back to `conversationId`.
    pub fn target_group(&self) -> Option<Uuid> {
        self.group_id.or(self.conversation_id)
    }

    fn require_group(&self) -> Result<Uuid, ProtocolError> {
        self.target_group().ok_or(ProtocolError::MissingField("groupId"))
    }

    fn payload_as<T: serde::de::DeserializeOwned + Default>(&self) -> Result<T, ProtocolError> {
        if self.payload.is_null() {
            return Ok(T::default());
        }
        T::deserialize(&self.payload).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Validate the frame into a [`Command`].
    pub fn command(&self) -> Result<Command, ProtocolError> {
        use FrameType as F;
        let cmd = match self.frame_type {
            F::JoinGroup => Command::JoinGroup { group_id: self.require_group()? },
            F::LeaveGroup => Command::LeaveGroup { group_id: self.require_group()? },
            F::LeaveRoom => Command::LeaveRoom { group_id: self.require_group()? },
            F::TypingStart => Command::TypingStart,
            F::TypingStop => Command::TypingStop,
            F::SendMessage => {
                let p: MessagePayload = self.payload_as()?;
                Command::SendMessage {
                    group_id: self.require_group()?,
                    client_id: p.client_id.unwrap_or_else(Uuid::new_v4),
                    content: p.content,
                }
            }
            F::MessageReaction => self.relay(RelayKind::MessageReaction),
            F::EmojiReaction => self.relay(RelayKind::EmojiReaction),
            F::EditMessage => self.relay(RelayKind::MessageEdited),
            F::DeleteMessage => self.relay(RelayKind::MessageDeleted),
            F::ReadReceipt => self.relay(RelayKind::ReadReceipt),
            F::VoiceState => self.relay(RelayKind::VoiceState),
            F::EmojiBurst => self.relay(RelayKind::EmojiBurst),
            F::CreateGroup => {
                let p: GroupPayload = self.payload_as()?;
                Command::CreateGroup { name: p.name, language: p.language }
            }
            F::DeleteGroup => Command::DeleteGroup { group_id: self.require_group()? },
            F::UpdateProfile => {
                let p: ProfilePayload = self.payload_as()?;
                Command::UpdateProfile { display_name: p.display_name }
            }
            F::Ping => Command::Ping,
            _ => Command::Seat { group_id: self.require_group()?, action: self.seat_action()? },
        };
        Ok(cmd)
    }

    fn relay(&self, kind: RelayKind) -> Command {
        Command::Relay { kind, payload: self.payload.clone() }
    }

    fn seat_action(&self) -> Result<SeatAction, ProtocolError> {
        use FrameType as F;
        let p: SeatPayload = self.payload_as()?;
        let user = || p.user_id.ok_or(ProtocolError::MissingField("userId"));
        let seat = || -> Result<Seat, ProtocolError> {
            let raw = p.seat.ok_or(ProtocolError::MissingField("seat"))?;
            Ok(Seat::new(raw)?)
        };

        let action = match self.frame_type {
            F::RequestSeat => SeatAction::RequestSeat { seat: seat()? },
            F::CancelSeatRequest => SeatAction::CancelSeatRequest,
            F::AcceptJoinRequest => SeatAction::AcceptJoinRequest { user_id: user()?, seat: seat()? },
            F::RejectJoinRequest => SeatAction::RejectJoinRequest { user_id: user()? },
            F::Promote => SeatAction::Promote { user_id: user()?, seat: seat()? },
            F::MoveToSeat => SeatAction::MoveToSeat { user_id: user()?, seat: seat()? },
            F::Demote => SeatAction::Demote { user_id: user()? },
            F::MoveToWaiting => SeatAction::MoveToWaiting { user_id: user()? },
            F::LeaveSeat => SeatAction::LeaveSeat,
            F::Kick => SeatAction::Kick { user_id: user()? },
            F::GrantAdmin => SeatAction::GrantAdmin { user_id: user()? },
            F::RevokeAdmin => SeatAction::RevokeAdmin { user_id: user()? },
            other => return Err(ProtocolError::UnexpectedFrame(other)),
        };
        Ok(action)
    }
}

/// Best-effort extraction of `requestId` from a frame that failed to parse.
pub fn salvage_request_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value.get("requestId")?.as_str().map(str::to_owned)
}

// ─── Outbound ─────────────────────────────────────────────────────────

/// One connection as seen by the rest of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict>,
}

impl From<&ActionError> for AckError {
    fn from(e: &ActionError) -> Self {
        Self { kind: e.kind(), message: e.to_string(), conflict: e.conflict() }
    }
}

impl AckError {
    /// Rebuild the server-side error on the client.
    pub fn into_action_error(self) -> ActionError {
        if let Some(conflict) = self.conflict {
            return conflict.into();
        }
        let detail = |prefix: &str| {
            self.message
                .strip_prefix(prefix)
                .unwrap_or(&self.message)
                .to_string()
        };
        match self.kind {
            ErrorKind::Validation => ActionError::Validation(detail("invalid request: ")),
            ErrorKind::Authorization => ActionError::Authorization(detail("not allowed: ")),
            ErrorKind::Transient => ActionError::Transient(detail("temporarily unavailable: ")),
            ErrorKind::NotFound => match self.message.split_once(" not found: ") {
                Some((entity, id)) => ActionError::NotFound { entity: entity.into(), id: id.into() },
                None => ActionError::NotFound { entity: "resource".into(), id: self.message },
            },
            // A conflict always carries its variant; treat a bare one as invalid.
            ErrorKind::Conflict => ActionError::Validation(self.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HubEvent {
    UserJoined { group_id: Uuid, user: OnlineUser },
    UserLeft { group_id: Uuid, user: OnlineUser },
    /// Snapshot sent to a joiner before anyone else hears about them.
    OnlineUsers { group_id: Uuid, users: Vec<OnlineUser> },
    /// Always the full list, never a delta.
    TypingUpdate { group_id: Uuid, users: Vec<OnlineUser> },
    NewMessage { message: Message },
    SeatUpdate {
        group_id: Uuid,
        user_id: Uuid,
        event: MembershipEvent,
        membership: Option<Membership>,
    },
    MemberRemoved { group_id: Uuid, user_id: Uuid, event: MembershipEvent },
    GroupDeleted { group_id: Uuid },
    ProfileUpdated { user_id: Uuid, display_name: String },
    MessageReaction { group_id: Uuid, user_id: Uuid, payload: Value },
    EmojiReaction { group_id: Uuid, user_id: Uuid, payload: Value },
    MessageEdited { group_id: Uuid, user_id: Uuid, payload: Value },
    MessageDeleted { group_id: Uuid, user_id: Uuid, payload: Value },
    ReadReceipt { group_id: Uuid, user_id: Uuid, payload: Value },
    VoiceState { group_id: Uuid, user_id: Uuid, payload: Value },
    EmojiBurst { group_id: Uuid, user_id: Uuid, payload: Value },
    Ack {
        request_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AckError>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    Pong { timestamp: u64 },
    /// Failure of a frame that carried no `requestId`.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<AckError>,
        message: String,
    },
}

impl HubEvent {
    pub fn relay(kind: RelayKind, group_id: Uuid, user_id: Uuid, payload: Value) -> Self {
        match kind {
            RelayKind::MessageReaction => HubEvent::MessageReaction { group_id, user_id, payload },
            RelayKind::EmojiReaction => HubEvent::EmojiReaction { group_id, user_id, payload },
            RelayKind::MessageEdited => HubEvent::MessageEdited { group_id, user_id, payload },
            RelayKind::MessageDeleted => HubEvent::MessageDeleted { group_id, user_id, payload },
            RelayKind::ReadReceipt => HubEvent::ReadReceipt { group_id, user_id, payload },
            RelayKind::VoiceState => HubEvent::VoiceState { group_id, user_id, payload },
            RelayKind::EmojiBurst => HubEvent::EmojiBurst { group_id, user_id, payload },
        }
    }

    pub fn ack(request_id: String, outcome: &Result<Option<Value>, ActionError>) -> Self {
        match outcome {
            Ok(result) => HubEvent::Ack { request_id, ok: true, error: None, result: result.clone() },
            Err(e) => HubEvent::Ack { request_id, ok: false, error: Some(e.into()), result: None },
        }
    }

    pub fn error(e: &ActionError) -> Self {
        HubEvent::Error { error: Some(e.into()), message: e.to_string() }
    }

    pub fn encode(&self) -> Result<Payload, ProtocolError> {
        let text = serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Arc::from(text))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Snake-case type tag, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::UserJoined { .. } => "user_joined",
            HubEvent::UserLeft { .. } => "user_left",
            HubEvent::OnlineUsers { .. } => "online_users",
            HubEvent::TypingUpdate { .. } => "typing_update",
            HubEvent::NewMessage { .. } => "new_message",
            HubEvent::SeatUpdate { .. } => "seat_update",
            HubEvent::MemberRemoved { .. } => "member_removed",
            HubEvent::GroupDeleted { .. } => "group_deleted",
            HubEvent::ProfileUpdated { .. } => "profile_updated",
            HubEvent::MessageReaction { .. } => "message_reaction",
            HubEvent::EmojiReaction { .. } => "emoji_reaction",
            HubEvent::MessageEdited { .. } => "message_edited",
            HubEvent::MessageDeleted { .. } => "message_deleted",
            HubEvent::ReadReceipt { .. } => "read_receipt",
            HubEvent::VoiceState { .. } => "voice_state",
            HubEvent::EmojiBurst { .. } => "emoji_burst",
            HubEvent::Ack { .. } => "ack",
            HubEvent::Pong { .. } => "pong",
            HubEvent::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error(transparent)]
    InvalidSeat(#[from] InvalidSeat),
    #[error("frame type {0:?} is not a seat verb")]
    UnexpectedFrame(FrameType),
}

impl From<ProtocolError> for ActionError {
    fn from(e: ProtocolError) -> Self {
        ActionError::Validation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(json: Value) -> InboundFrame {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_decode_frame_with_conversation_id() {
        let g = Uuid::new_v4();
        let u = Uuid::new_v4();
        let f = frame(json!({
            "type": "typing_start",
            "conversationId": g,
            "userId": u,
            "username": "Ana",
            "timestamp": 1,
        }));
        assert_eq!(f.target_group(), Some(g));
        assert_eq!(f.command().unwrap(), Command::TypingStart);
        assert_eq!(f.request_id, None);
    }

    #[test]
    fn test_seat_frames_validate_payload() {
        let g = Uuid::new_v4();
        let u = Uuid::new_v4();
        let base = InboundFrame::new(FrameType::Promote, u, "Ana").with_group(g);

        let missing = base.clone().with_payload(json!({ "seat": 2 }));
        assert_eq!(missing.command(), Err(ProtocolError::MissingField("userId")));

        let out_of_range = base.clone().with_payload(json!({ "userId": u, "seat": 10 }));
        assert_eq!(out_of_range.command(), Err(ProtocolError::InvalidSeat(InvalidSeat(10))));

        let ok = base.with_payload(json!({ "userId": u, "seat": 2 }));
        assert_eq!(
            ok.command().unwrap(),
            Command::Seat {
                group_id: g,
                action: SeatAction::Promote { user_id: u, seat: Seat::new(2).unwrap() }
            }
        );
    }

    #[test]
    fn test_group_is_required() {
        let f = InboundFrame::new(FrameType::JoinGroup, Uuid::new_v4(), "Ana");
        assert_eq!(f.command(), Err(ProtocolError::MissingField("groupId")));
    }

    #[test]
    fn test_from_action_round_trips_to_command() {
        let g = Uuid::new_v4();
        let u = Uuid::new_v4();
        let actions = [
            Action::send_message(g, "hola"),
            Action::JoinGroup { group_id: g },
            Action::seat(g, SeatAction::AcceptJoinRequest { user_id: u, seat: Seat::new(4).unwrap() }),
            Action::seat(g, SeatAction::LeaveSeat),
        ];
        for action in &actions {
            let cmd = InboundFrame::from_action(action, u, "Ana").command().unwrap();
            match (action, cmd) {
                (Action::SendMessage { client_id, content, .. }, Command::SendMessage { client_id: c, content: t, .. }) => {
                    assert_eq!(*client_id, c);
                    assert_eq!(content, &t);
                }
                (Action::JoinGroup { .. }, Command::JoinGroup { group_id }) => assert_eq!(group_id, g),
                (Action::SeatAction { action, .. }, Command::Seat { action: a, .. }) => assert_eq!(action, &a),
                other => panic!("mismatch: {other:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_type_is_malformed() {
        let text = r#"{"type":"launch_rocket","userId":"00000000-0000-0000-0000-000000000000","requestId":"r1"}"#;
        assert!(matches!(InboundFrame::decode(text), Err(ProtocolError::Malformed(_))));
        assert_eq!(salvage_request_id(text).as_deref(), Some("r1"));
    }

    #[test]
    fn test_event_wire_shape() {
        let g = Uuid::new_v4();
        let event = HubEvent::TypingUpdate { group_id: g, users: vec![] };
        let json: Value = serde_json::from_str(&event.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "typing_update");
        assert_eq!(json["groupId"], g.to_string());

        let ack = HubEvent::ack("r9".into(), &Err(Conflict::OwnerCannotLeave.into()));
        let json: Value = serde_json::from_str(&ack.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["requestId"], "r9");
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["kind"], "conflict");
        assert_eq!(json["error"]["conflict"], "owner_cannot_leave");
    }

    #[test]
    fn test_ack_error_rebuilds_action_error() {
        let errors = [
            ActionError::from(Conflict::SeatOccupied(Seat::new(3).unwrap())),
            ActionError::group_not_found(Uuid::new_v4()),
            ActionError::transient("store busy"),
        ];
        for e in errors {
            let wire: AckError = serde_json::from_value(serde_json::to_value(AckError::from(&e)).unwrap()).unwrap();
            let rebuilt = wire.into_action_error();
            assert_eq!(rebuilt.kind(), e.kind());
            assert_eq!(rebuilt.to_string(), e.to_string());
        }
    }

    #[test]
    fn test_relay_names() {
        let e = HubEvent::relay(RelayKind::MessageEdited, Uuid::nil(), Uuid::nil(), Value::Null);
        assert_eq!(e.name(), "message_edited");
        let json: Value = serde_json::from_str(&e.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "message_edited");
    }
}
