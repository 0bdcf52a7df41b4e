//! Seat Allocator: the single authority for role and seat transitions.
//!
//! ```text
//!                    request_seat(p)               accept(p)
//!  LISTENER ──────────────────────────► LISTENER ─────────────► PARTICIPANT
//!  (no seat) ◄────────────────────────── (req p)                 (seat p)
//!      ▲       cancel / reject                                      │
//!      └────────────────────────────────────────────────────────────┘
//!                         demote / move_to_waiting / leave_seat
//! ```
//!
//! Every verb runs under the group's async mutex and hands the store a
//! `before → after` pair for the member's row. The store writes the row and
//! moves the seat hold in one atomic step, refusing if the row changed since
//! it was read or another member holds the target seat. Several allocators
//! over one store therefore never both win a seat, and no hold outlives the
//! row that references it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

use crate::error::{ActionError, Conflict};
use crate::model::{Group, Membership, Seat, SeatState};
use crate::store::{SeatCommit, Store};

const MAX_GROUP_NAME_LEN: usize = 100;

/// What a successful verb did, for fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MembershipEvent {
    GroupCreated,
    Joined,
    SeatRequested { seat: Seat },
    SeatRequestCancelled,
    RequestAccepted { seat: Seat, by: Uuid },
    RequestRejected { by: Uuid },
    Seated { seat: Seat, by: Uuid },
    Unseated { by: Uuid },
    Kicked { by: Uuid },
    Left,
    AdminGranted { by: Uuid },
    AdminRevoked { by: Uuid },
    ActiveChanged { active: bool },
    GroupDeleted,
}

/// Result of one allocator verb: the row before and after, plus the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub group_id: Uuid,
    /// The member the verb acted on.
    pub user_id: Uuid,
    pub before: Option<Membership>,
    pub after: Option<Membership>,
    pub event: MembershipEvent,
}

impl Transition {
    /// False for idempotent retries that left the row untouched.
    pub fn changed(&self) -> bool {
        self.before != self.after
    }

    /// True if the member's row was deleted.
    pub fn removed(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }
}

/// Per-group async mutexes, created on first use.
#[derive(Default)]
struct GroupLocks {
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl GroupLocks {
    async fn acquire(&self, group_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let locks = self.locks.read().await;
            locks.get(&group_id).cloned()
        };
        let lock = match lock {
            Some(lock) => lock,
            None => {
                let mut locks = self.locks.write().await;
                locks.entry(group_id).or_default().clone()
            }
        };
        lock.lock_owned().await
    }

    async fn forget(&self, group_id: Uuid) {
        self.locks.write().await.remove(&group_id);
    }
}

pub struct SeatAllocator {
    store: Arc<dyn Store>,
    locks: GroupLocks,
}

impl SeatAllocator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, locks: GroupLocks::default() }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ─── Groups ───────────────────────────────────────────────────────

    /// Create a group whose creator is its owner, seated at 0.
    pub async fn create_group(
        &self,
        owner_id: Uuid,
        name: &str,
        language: &str,
    ) -> Result<(Group, Transition), ActionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ActionError::validation("group name is required"));
        }
        if name.chars().count() > MAX_GROUP_NAME_LEN {
            return Err(ActionError::validation(format!(
                "group name exceeds {MAX_GROUP_NAME_LEN} characters"
            )));
        }
        let language = language.trim();
        if language.is_empty() {
            return Err(ActionError::validation("group language is required"));
        }

        let group = Group::new(owner_id, name, language);
        let owner = Membership::owner(group.id, owner_id);
        if !self.store.insert_group(&group, &owner)? {
            return Err(ActionError::transient("group id collision, retry"));
        }
        log::info!("group {} created by {owner_id}", group.id);

        let transition = Transition {
            group_id: group.id,
            user_id: owner_id,
            before: None,
            after: Some(owner),
            event: MembershipEvent::GroupCreated,
        };
        Ok((group, transition))
    }

    pub async fn group(&self, group_id: Uuid) -> Result<Group, ActionError> {
        self.require_group(group_id)
    }

    pub async fn members(&self, group_id: Uuid) -> Result<Vec<Membership>, ActionError> {
        self.require_group(group_id)?;
        Ok(self.store.list_members(group_id)?)
    }

    /// Owner only. An inactive group refuses new members.
    pub async fn set_active(
        &self,
        group_id: Uuid,
        requester: Uuid,
        active: bool,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        let mut group = self.require_group(group_id)?;
        let owner = self.require_owner(group_id, requester)?;

        if group.active != active {
            group.active = active;
            self.store.put_group(&group)?;
        }
        Ok(Transition {
            group_id,
            user_id: requester,
            before: Some(owner.clone()),
            after: Some(owner),
            event: MembershipEvent::ActiveChanged { active },
        })
    }

    /// Owner only. Cascades to memberships, holds and messages.
    pub async fn delete_group(&self, group_id: Uuid, requester: Uuid) -> Result<Transition, ActionError> {
        let transition = {
            let _guard = self.locks.acquire(group_id).await;
            self.require_group(group_id)?;
            let owner = self.require_owner(group_id, requester)?;

            if !self.store.delete_group(group_id)? {
                return Err(ActionError::group_not_found(group_id));
            }
            log::info!("group {group_id} deleted by {requester}");
            Transition {
                group_id,
                user_id: requester,
                before: Some(owner),
                after: None,
                event: MembershipEvent::GroupDeleted,
            }
        };
        self.locks.forget(group_id).await;
        Ok(transition)
    }

    // ─── Membership ───────────────────────────────────────────────────

    pub async fn join(&self, group_id: Uuid, user_id: Uuid) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        let group = self.require_group(group_id)?;
        if !group.active {
            return Err(ActionError::validation("group is not accepting members"));
        }

        let row = Membership::listener(group_id, user_id);
        if !self.store.insert_membership(&row)? {
            return Err(Conflict::AlreadyMember.into());
        }
        log::debug!("{user_id} joined group {group_id}");
        Ok(Transition {
            group_id,
            user_id,
            before: None,
            after: Some(row),
            event: MembershipEvent::Joined,
        })
    }

    /// Self-service exit. The owner must delete the group instead.
    pub async fn leave(&self, group_id: Uuid, user_id: Uuid) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        let row = self.require_member(group_id, user_id)?;
        if row.is_owner() {
            return Err(Conflict::OwnerCannotLeave.into());
        }
        self.remove(row, MembershipEvent::Left)
    }

    /// Admin/owner only. The owner can never be kicked.
    pub async fn kick(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        let row = self.require_member(group_id, user_id)?;
        if row.is_owner() {
            return Err(Conflict::CannotKickOwner.into());
        }
        self.require_admin(group_id, requester)?;
        self.remove(row, MembershipEvent::Kicked { by: requester })
    }

    pub async fn grant_admin(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        self.set_admin(group_id, requester, user_id, true).await
    }

    pub async fn revoke_admin(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        self.set_admin(group_id, requester, user_id, false).await
    }

    async fn set_admin(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        is_admin: bool,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        self.require_owner(group_id, requester)?;
        let row = self.require_member(group_id, user_id)?;
        if row.is_owner() {
            return Err(Conflict::CannotModifyOwner.into());
        }

        let after = Membership { is_admin, ..row.clone() };
        if after != row && self.store.commit_membership(&row, &after)? != SeatCommit::Committed {
            return Err(row_changed(&row));
        }
        let event = if is_admin {
            MembershipEvent::AdminGranted { by: requester }
        } else {
            MembershipEvent::AdminRevoked { by: requester }
        };
        Ok(transition(row, after, event))
    }

    // ─── Seats ────────────────────────────────────────────────────────

    /// Reserve `seat` for the caller. Retrying the same request is a no-op.
    pub async fn request_seat(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        seat: Seat,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        let row = self.require_member(group_id, user_id)?;
        let event = MembershipEvent::SeatRequested { seat };

        match row.seat {
            SeatState::Requesting(s) if s == seat => Ok(transition(row.clone(), row, event)),
            SeatState::Requesting(_) => Err(Conflict::AlreadyRequesting.into()),
            SeatState::Seated(_) => Err(Conflict::AlreadySeated.into()),
            SeatState::Unseated => {
                let after = row.requesting(seat);
                self.relocate(&row, &after, Conflict::SeatOccupied(seat))?;
                Ok(transition(row, after, event))
            }
        }
    }

    pub async fn cancel_seat_request(
        &self,
        group_id: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        let row = self.require_member(group_id, user_id)?;
        let SeatState::Requesting(seat) = row.seat else {
            return Err(Conflict::NotRequesting.into());
        };

        let after = row.unseated();
        self.relocate(&row, &after, Conflict::SeatNoLongerAvailable(seat))?;
        Ok(transition(row, after, MembershipEvent::SeatRequestCancelled))
    }

    /// Admin/owner only. Seats a requesting (or any unseated) listener.
    pub async fn accept_join_request(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        seat: Seat,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        self.require_admin(group_id, requester)?;
        let row = self.require_member(group_id, user_id)?;
        if row.is_owner() {
            return Err(Conflict::CannotModifyOwner.into());
        }
        if let SeatState::Seated(_) = row.seat {
            return Err(Conflict::AlreadySeated.into());
        }

        let after = row.seated(seat);
        self.relocate(&row, &after, Conflict::SeatNoLongerAvailable(seat))?;
        log::debug!("{requester} accepted {user_id} into seat {seat} of {group_id}");
        Ok(transition(row, after, MembershipEvent::RequestAccepted { seat, by: requester }))
    }

    pub async fn reject_join_request(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        self.require_admin(group_id, requester)?;
        let row = self.require_member(group_id, user_id)?;
        let SeatState::Requesting(seat) = row.seat else {
            return Err(Conflict::NotRequesting.into());
        };

        let after = row.unseated();
        self.relocate(&row, &after, Conflict::SeatNoLongerAvailable(seat))?;
        Ok(transition(row, after, MembershipEvent::RequestRejected { by: requester }))
    }

    /// Admin/owner only. Seats a listener, releasing any reservation.
    pub async fn promote(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        seat: Seat,
    ) -> Result<Transition, ActionError> {
        self.place(group_id, requester, user_id, seat).await
    }

    /// Admin/owner only. Moves a member to another seat.
    pub async fn move_to_seat(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        seat: Seat,
    ) -> Result<Transition, ActionError> {
        self.place(group_id, requester, user_id, seat).await
    }

    async fn place(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
        seat: Seat,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        self.require_admin(group_id, requester)?;
        let row = self.require_member(group_id, user_id)?;
        if row.is_owner() {
            return Err(Conflict::CannotModifyOwner.into());
        }

        let after = row.seated(seat);
        if after != row {
            self.relocate(&row, &after, Conflict::SeatOccupied(seat))?;
        }
        Ok(transition(row, after, MembershipEvent::Seated { seat, by: requester }))
    }

    /// Admin/owner only. Sends a seated participant back to the waiting area.
    pub async fn demote(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        self.require_admin(group_id, requester)?;
        self.unseat(group_id, user_id, requester)
    }

    pub async fn move_to_waiting(
        &self,
        group_id: Uuid,
        requester: Uuid,
        user_id: Uuid,
    ) -> Result<Transition, ActionError> {
        self.demote(group_id, requester, user_id).await
    }

    /// Self-service demotion.
    pub async fn leave_seat(&self, group_id: Uuid, user_id: Uuid) -> Result<Transition, ActionError> {
        let _guard = self.locks.acquire(group_id).await;
        self.require_group(group_id)?;
        self.unseat(group_id, user_id, user_id)
    }

    fn unseat(&self, group_id: Uuid, user_id: Uuid, by: Uuid) -> Result<Transition, ActionError> {
        let row = self.require_member(group_id, user_id)?;
        if row.is_owner() {
            return Err(Conflict::CannotModifyOwner.into());
        }
        let SeatState::Seated(seat) = row.seat else {
            return Err(Conflict::NotSeated.into());
        };

        let after = row.unseated();
        self.relocate(&row, &after, Conflict::SeatNoLongerAvailable(seat))?;
        Ok(transition(row, after, MembershipEvent::Unseated { by }))
    }

    // ─── Holds ────────────────────────────────────────────────────────

    /// Replace `before` with `after`, moving the seat hold in the same step.
    fn relocate(
        &self,
        before: &Membership,
        after: &Membership,
        on_taken: Conflict,
    ) -> Result<(), ActionError> {
        match self.store.commit_membership(before, after)? {
            SeatCommit::Committed => Ok(()),
            SeatCommit::SeatTaken => Err(on_taken.into()),
            SeatCommit::RowChanged => Err(row_changed(before)),
        }
    }

    /// Delete the row together with its hold.
    fn remove(&self, row: Membership, event: MembershipEvent) -> Result<Transition, ActionError> {
        let group_id = row.group_id;
        let user_id = row.user_id;
        let Some(deleted) = self.store.delete_membership(group_id, user_id)? else {
            return Err(ActionError::membership_not_found(group_id, user_id));
        };
        log::debug!("{user_id} removed from group {group_id} ({event:?})");
        Ok(Transition {
            group_id,
            user_id,
            before: Some(deleted),
            after: None,
            event,
        })
    }

    // ─── Lookups ──────────────────────────────────────────────────────

    fn require_group(&self, group_id: Uuid) -> Result<Group, ActionError> {
        self.store
            .get_group(group_id)?
            .ok_or_else(|| ActionError::group_not_found(group_id))
    }

    fn require_member(&self, group_id: Uuid, user_id: Uuid) -> Result<Membership, ActionError> {
        self.store
            .get_membership(group_id, user_id)?
            .ok_or_else(|| ActionError::membership_not_found(group_id, user_id))
    }

    fn require_admin(&self, group_id: Uuid, requester: Uuid) -> Result<Membership, ActionError> {
        match self.store.get_membership(group_id, requester)? {
            Some(row) if row.can_administer() => Ok(row),
            Some(_) => Err(ActionError::unauthorized("only the owner or an admin may do this")),
            None => Err(ActionError::unauthorized("not a member of this group")),
        }
    }

    fn require_owner(&self, group_id: Uuid, requester: Uuid) -> Result<Membership, ActionError> {
        match self.store.get_membership(group_id, requester)? {
            Some(row) if row.is_owner() => Ok(row),
            _ => Err(ActionError::unauthorized("only the group owner may do this")),
        }
    }
}

/// Another allocator over the same store changed the row first.
fn row_changed(row: &Membership) -> ActionError {
    log::debug!("row for {} in {} changed concurrently", row.user_id, row.group_id);
    ActionError::transient("membership changed concurrently, retry")
}

fn transition(before: Membership, after: Membership, event: MembershipEvent) -> Transition {
    Transition {
        group_id: before.group_id,
        user_id: before.user_id,
        before: Some(before),
        after: Some(after),
        event,
    }
}
