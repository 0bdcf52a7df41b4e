//! Domain records: groups, memberships, seat holds and messages.
//!
//! A group has a fixed row of seats:
//! ```text
//! ┌────┬────┬────┬────┬────┬────┬────┬────┬────┬────┐
//! │ 0  │ 1  │ 2  │ 3  │ 4  │ 5  │ 6  │ 7  │ 8  │ 9  │   seats
//! └─▲──┴────┴─▲──┴────┴────┴────┴────┴────┴────┴────┘
//!   │         │
//!  OWNER    PARTICIPANT            LISTENERs wait below, optionally
//!                                  holding a reservation on one seat
//! ```
//!
//! Seat state is an explicit sum type so a pending request can never be
//! mistaken for an occupied seat.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Number of seats in every group.
pub const GROUP_CAPACITY: u8 = 10;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── Seats ────────────────────────────────────────────────────────────

/// Seat index outside `0..GROUP_CAPACITY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("seat {0} is out of range (0-9)")]
pub struct InvalidSeat(pub u8);

/// A validated seat position in `[0, 9]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Seat(u8);

impl Seat {
    /// Seat 0 belongs to the group owner.
    pub const OWNER: Seat = Seat(0);

    pub fn new(index: u8) -> Result<Self, InvalidSeat> {
        if index < GROUP_CAPACITY {
            Ok(Self(index))
        } else {
            Err(InvalidSeat(index))
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    /// Every seat of a group, in order.
    pub fn all() -> impl Iterator<Item = Seat> {
        (0..GROUP_CAPACITY).map(Seat)
    }
}

impl TryFrom<u8> for Seat {
    type Error = InvalidSeat;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Seat::new(value)
    }
}

impl From<Seat> for u8 {
    fn from(seat: Seat) -> u8 {
        seat.0
    }
}

impl fmt::Display for Seat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a member sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatState {
    /// In the waiting area.
    #[default]
    Unseated,
    /// In the waiting area with a reservation on a seat.
    Requesting(Seat),
    /// Occupying a seat.
    Seated(Seat),
}

impl SeatState {
    /// The occupied seat, if any. Never a requested seat.
    pub fn seat_position(self) -> Option<Seat> {
        match self {
            SeatState::Seated(seat) => Some(seat),
            _ => None,
        }
    }

    /// The requested seat, if any.
    pub fn pending_seat_request(self) -> Option<Seat> {
        match self {
            SeatState::Requesting(seat) => Some(seat),
            _ => None,
        }
    }

    /// The hold this state keeps in the store, if any.
    pub fn hold_for(self, user_id: Uuid) -> Option<(Seat, SeatHold)> {
        match self {
            SeatState::Unseated => None,
            SeatState::Requesting(seat) => Some((seat, SeatHold::reserved(user_id))),
            SeatState::Seated(seat) => Some((seat, SeatHold::occupied(user_id))),
        }
    }
}

/// Kind of claim a member has on a seat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldKind {
    Reserved,
    Occupied,
}

/// The store's per-seat occupancy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatHold {
    pub user_id: Uuid,
    pub kind: HoldKind,
}

impl SeatHold {
    pub fn reserved(user_id: Uuid) -> Self {
        Self { user_id, kind: HoldKind::Reserved }
    }

    pub fn occupied(user_id: Uuid) -> Self {
        Self { user_id, kind: HoldKind::Occupied }
    }
}

// ─── Groups & memberships ─────────────────────────────────────────────

/// A conversation group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    /// Language the group practises, e.g. "es".
    pub language: String,
    pub owner_id: Uuid,
    pub active: bool,
    pub capacity: u8,
    pub created_at: u64,
}

impl Group {
    pub fn new(owner_id: Uuid, name: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            language: language.into(),
            owner_id,
            active: true,
            capacity: GROUP_CAPACITY,
            created_at: unix_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Owner,
    Participant,
    Listener,
}

/// One user's membership row in one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub group_id: Uuid,
    pub user_id: Uuid,
    pub role: Role,
    pub seat: SeatState,
    /// Independent of role; the owner is implicitly an admin.
    pub is_admin: bool,
    pub joined_at: u64,
}

impl Membership {
    /// A fresh listener with no seat.
    pub fn listener(group_id: Uuid, user_id: Uuid) -> Self {
        Self {
            group_id,
            user_id,
            role: Role::Listener,
            seat: SeatState::Unseated,
            is_admin: false,
            joined_at: unix_millis(),
        }
    }

    /// The owner row written at group creation.
    pub fn owner(group_id: Uuid, user_id: Uuid) -> Self {
        Self {
            group_id,
            user_id,
            role: Role::Owner,
            seat: SeatState::Seated(Seat::OWNER),
            is_admin: false,
            joined_at: unix_millis(),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// Owner or explicit admin.
    pub fn can_administer(&self) -> bool {
        self.is_owner() || self.is_admin
    }

    pub fn seat_position(&self) -> Option<Seat> {
        self.seat.seat_position()
    }

    pub fn pending_seat_request(&self) -> Option<Seat> {
        self.seat.pending_seat_request()
    }

    /// Copy of this row moved to `seat` as a participant.
    pub(crate) fn seated(&self, seat: Seat) -> Self {
        Self {
            role: if self.is_owner() { Role::Owner } else { Role::Participant },
            seat: SeatState::Seated(seat),
            ..self.clone()
        }
    }

    /// Copy of this row requesting `seat`.
    pub(crate) fn requesting(&self, seat: Seat) -> Self {
        Self {
            role: Role::Listener,
            seat: SeatState::Requesting(seat),
            ..self.clone()
        }
    }

    /// Copy of this row back in the waiting area.
    pub(crate) fn unseated(&self) -> Self {
        Self {
            role: Role::Listener,
            seat: SeatState::Unseated,
            ..self.clone()
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────

/// A chat message. `(group_id, client_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id.
    pub id: Uuid,
    pub group_id: Uuid,
    pub sender_id: Uuid,
    /// Client-generated id used to deduplicate replays.
    pub client_id: Uuid,
    pub content: String,
    pub created_at: u64,
}

impl Message {
    pub fn new(group_id: Uuid, sender_id: Uuid, client_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group_id,
            sender_id,
            client_id,
            content: content.into(),
            created_at: unix_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seat_bounds() {
        assert!(Seat::new(0).is_ok());
        assert!(Seat::new(9).is_ok());
        assert_eq!(Seat::new(10), Err(InvalidSeat(10)));
        assert_eq!(Seat::all().count(), GROUP_CAPACITY as usize);
    }

    #[test]
    fn test_seat_rejects_out_of_range_on_deserialize() {
        assert!(serde_json::from_str::<Seat>("3").is_ok());
        assert!(serde_json::from_str::<Seat>("12").is_err());
    }

    #[test]
    fn test_seat_state_accessors_do_not_alias() {
        let seat = Seat::new(3).unwrap();

        let requesting = SeatState::Requesting(seat);
        assert_eq!(requesting.pending_seat_request(), Some(seat));
        assert_eq!(requesting.seat_position(), None);

        let seated = SeatState::Seated(seat);
        assert_eq!(seated.seat_position(), Some(seat));
        assert_eq!(seated.pending_seat_request(), None);

        assert_eq!(SeatState::Unseated.seat_position(), None);
        assert_eq!(SeatState::Unseated.pending_seat_request(), None);
    }

    #[test]
    fn test_hold_for_state() {
        let user = Uuid::new_v4();
        let seat = Seat::new(2).unwrap();
        assert_eq!(SeatState::Unseated.hold_for(user), None);
        assert_eq!(
            SeatState::Requesting(seat).hold_for(user),
            Some((seat, SeatHold::reserved(user)))
        );
        assert_eq!(
            SeatState::Seated(seat).hold_for(user),
            Some((seat, SeatHold::occupied(user)))
        );
    }

    #[test]
    fn test_owner_row() {
        let owner = Membership::owner(Uuid::new_v4(), Uuid::new_v4());
        assert!(owner.is_owner());
        assert!(owner.can_administer());
        assert_eq!(owner.seat_position(), Some(Seat::OWNER));
    }

    #[test]
    fn test_row_transitions_keep_identity() {
        let row = Membership::listener(Uuid::new_v4(), Uuid::new_v4());
        let seat = Seat::new(4).unwrap();

        let seated = row.seated(seat);
        assert_eq!(seated.role, Role::Participant);
        assert_eq!(seated.user_id, row.user_id);
        assert_eq!(seated.joined_at, row.joined_at);

        let back = seated.unseated();
        assert_eq!(back.role, Role::Listener);
        assert_eq!(back.seat, SeatState::Unseated);
    }

    #[test]
    fn test_new_group_defaults() {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Café", "fr");
        assert!(group.active);
        assert_eq!(group.capacity, GROUP_CAPACITY);
        assert_eq!(group.owner_id, owner);
    }
}
