//! Client action vocabulary.
//!
//! The same closed set of actions is sent live over the gateway and stored
//! in the client's offline queue, so it must survive both JSON and bincode.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::Seat;

/// Seat and membership verbs, all scoped to one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatAction {
    RequestSeat { seat: Seat },
    CancelSeatRequest,
    AcceptJoinRequest { user_id: Uuid, seat: Seat },
    RejectJoinRequest { user_id: Uuid },
    Promote { user_id: Uuid, seat: Seat },
    MoveToSeat { user_id: Uuid, seat: Seat },
    Demote { user_id: Uuid },
    MoveToWaiting { user_id: Uuid },
    LeaveSeat,
    Kick { user_id: Uuid },
    GrantAdmin { user_id: Uuid },
    RevokeAdmin { user_id: Uuid },
}

impl SeatAction {
    pub fn label(&self) -> &'static str {
        match self {
            SeatAction::RequestSeat { .. } => "request_seat",
            SeatAction::CancelSeatRequest => "cancel_seat_request",
            SeatAction::AcceptJoinRequest { .. } => "accept_join_request",
            SeatAction::RejectJoinRequest { .. } => "reject_join_request",
            SeatAction::Promote { .. } => "promote",
            SeatAction::MoveToSeat { .. } => "move_to_seat",
            SeatAction::Demote { .. } => "demote",
            SeatAction::MoveToWaiting { .. } => "move_to_waiting",
            SeatAction::LeaveSeat => "leave_seat",
            SeatAction::Kick { .. } => "kick",
            SeatAction::GrantAdmin { .. } => "grant_admin",
            SeatAction::RevokeAdmin { .. } => "revoke_admin",
        }
    }

    /// The member acted upon, when it is not the caller.
    pub fn target(&self) -> Option<Uuid> {
        match self {
            SeatAction::AcceptJoinRequest { user_id, .. }
            | SeatAction::RejectJoinRequest { user_id }
            | SeatAction::Promote { user_id, .. }
            | SeatAction::MoveToSeat { user_id, .. }
            | SeatAction::Demote { user_id }
            | SeatAction::MoveToWaiting { user_id }
            | SeatAction::Kick { user_id }
            | SeatAction::GrantAdmin { user_id }
            | SeatAction::RevokeAdmin { user_id } => Some(*user_id),
            SeatAction::RequestSeat { .. } | SeatAction::CancelSeatRequest | SeatAction::LeaveSeat => None,
        }
    }
}

/// A replayable client action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    SendMessage {
        group_id: Uuid,
        /// Generated once when the user hits send; reused on every replay.
        client_id: Uuid,
        content: String,
    },
    JoinGroup {
        group_id: Uuid,
    },
    LeaveGroup {
        group_id: Uuid,
    },
    SeatAction {
        group_id: Uuid,
        action: SeatAction,
    },
    ProfileUpdate {
        display_name: String,
    },
}

/// Discriminant of [`Action`], used for queue statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    SendMessage,
    JoinGroup,
    LeaveGroup,
    SeatAction,
    ProfileUpdate,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::SendMessage => "SEND_MESSAGE",
            ActionType::JoinGroup => "JOIN_GROUP",
            ActionType::LeaveGroup => "LEAVE_GROUP",
            ActionType::SeatAction => "SEAT_ACTION",
            ActionType::ProfileUpdate => "PROFILE_UPDATE",
        };
        f.write_str(s)
    }
}

impl Action {
    /// A message with a fresh client id.
    pub fn send_message(group_id: Uuid, content: impl Into<String>) -> Self {
        Action::SendMessage { group_id, client_id: Uuid::new_v4(), content: content.into() }
    }

    pub fn seat(group_id: Uuid, action: SeatAction) -> Self {
        Action::SeatAction { group_id, action }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Action::SendMessage { .. } => ActionType::SendMessage,
            Action::JoinGroup { .. } => ActionType::JoinGroup,
            Action::LeaveGroup { .. } => ActionType::LeaveGroup,
            Action::SeatAction { .. } => ActionType::SeatAction,
            Action::ProfileUpdate { .. } => ActionType::ProfileUpdate,
        }
    }

    /// Short human label, e.g. for progress display.
    pub fn label(&self) -> String {
        match self {
            Action::SeatAction { action, .. } => format!("SEAT_ACTION:{}", action.label()),
            other => other.action_type().to_string(),
        }
    }

    pub fn group_id(&self) -> Option<Uuid> {
        match self {
            Action::SendMessage { group_id, .. }
            | Action::JoinGroup { group_id }
            | Action::LeaveGroup { group_id }
            | Action::SeatAction { group_id, .. } => Some(*group_id),
            Action::ProfileUpdate { .. } => None,
        }
    }
}
