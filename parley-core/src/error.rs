//! Error taxonomy shared by the allocator, the hub and the reconciler.
//!
//! | kind            | retried by the reconciler | typical cause                    |
//! |-----------------|---------------------------|----------------------------------|
//! | `Validation`    | no                        | missing or malformed fields      |
//! | `Authorization` | no                        | requester lacks admin/ownership  |
//! | `Conflict`      | no                        | seat taken, already a member     |
//! | `NotFound`      | no                        | unknown group or membership      |
//! | `Transient`     | yes                       | store or network unavailable     |

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{InvalidSeat, Seat};

/// Coarse error class, carried on the wire next to the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authorization,
    Conflict,
    NotFound,
    Transient,
}

impl ErrorKind {
    /// Only transient failures are worth replaying later.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Named conflicts of the seat state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conflict {
    #[error("user is already a member of this group")]
    AlreadyMember,
    #[error("seat {0} is occupied")]
    SeatOccupied(Seat),
    #[error("seat {0} is no longer available")]
    SeatNoLongerAvailable(Seat),
    #[error("the group owner cannot be kicked")]
    CannotKickOwner,
    #[error("the group owner cannot leave; delete the group instead")]
    OwnerCannotLeave,
    #[error("the group owner's seat and role cannot be changed")]
    CannotModifyOwner,
    #[error("member has no pending seat request")]
    NotRequesting,
    #[error("member already has a pending seat request")]
    AlreadyRequesting,
    #[error("member is not seated")]
    NotSeated,
    #[error("member is already seated")]
    AlreadySeated,
}

/// Result of every allocator, service and hub action.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ActionError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not allowed: {0}")]
    Authorization(String),

    #[error("{0}")]
    Conflict(Conflict),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("temporarily unavailable: {0}")]
    Transient(String),
}

impl ActionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Validation(_) => ErrorKind::Validation,
            ActionError::Authorization(_) => ErrorKind::Authorization,
            ActionError::Conflict(_) => ErrorKind::Conflict,
            ActionError::NotFound { .. } => ErrorKind::NotFound,
            ActionError::Transient(_) => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ActionError::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        ActionError::Authorization(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        ActionError::Transient(message.into())
    }

    pub fn group_not_found(group_id: Uuid) -> Self {
        ActionError::NotFound { entity: "group".into(), id: group_id.to_string() }
    }

    pub fn membership_not_found(group_id: Uuid, user_id: Uuid) -> Self {
        ActionError::NotFound {
            entity: "membership".into(),
            id: format!("{group_id}/{user_id}"),
        }
    }

    /// The conflict, if this is one.
    pub fn conflict(&self) -> Option<Conflict> {
        match self {
            ActionError::Conflict(c) => Some(*c),
            _ => None,
        }
    }
}

impl From<Conflict> for ActionError {
    fn from(conflict: Conflict) -> Self {
        ActionError::Conflict(conflict)
    }
}

impl From<InvalidSeat> for ActionError {
    fn from(e: InvalidSeat) -> Self {
        ActionError::Validation(e.to_string())
    }
}

/// Membership store failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The store being unreachable is the one failure a client may retry.
impl From<StoreError> for ActionError {
    fn from(e: StoreError) -> Self {
        ActionError::Transient(e.to_string())
    }
}
