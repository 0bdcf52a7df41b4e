//! Membership store: durable groups, memberships, seat holds and messages.
//!
//! Two implementations share the same traits:
//! - [`MemoryStore`] for tests and ephemeral deployments
//! - [`RocksStore`] for persistence (column families per record type)
//!
//! Seat exclusivity hangs on [`MembershipStore::commit_membership`]: a row
//! and the seat hold it references change in one atomic step, compared
//! against the row the caller read, so two writers racing for one seat or
//! one member cannot both win.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Group, Membership, Message, Seat, SeatHold};

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`MembershipStore::commit_membership`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatCommit {
    Committed,
    /// The stored row no longer matches the one the caller read.
    RowChanged,
    /// Another member's row references the target seat.
    SeatTaken,
}

/// Whether `user_id` may take `seat`, currently held by `current`.
///
/// A hold whose holder has no row, or whose holder's row points elsewhere,
/// is orphaned and may be taken over.
pub(crate) fn seat_available(
    group_id: Uuid,
    seat: Seat,
    user_id: Uuid,
    current: Option<SeatHold>,
    holder_row: impl FnOnce(Uuid) -> StoreResult<Option<Membership>>,
) -> StoreResult<bool> {
    let Some(current) = current else {
        return Ok(true);
    };
    if current.user_id == user_id {
        return Ok(true);
    }
    let live = holder_row(current.user_id)?
        .is_some_and(|row| row.seat.hold_for(current.user_id) == Some((seat, current)));
    if !live {
        log::warn!("reclaiming orphaned hold on seat {seat} of {group_id} (user {})", current.user_id);
    }
    Ok(!live)
}

/// Groups, memberships and seat holds.
pub trait MembershipStore: Send + Sync {
    /// Insert a group together with its owner row and the owner's hold on
    /// seat 0. Returns false if the group id already exists.
    fn insert_group(&self, group: &Group, owner: &Membership) -> StoreResult<bool>;

    fn get_group(&self, group_id: Uuid) -> StoreResult<Option<Group>>;

    fn put_group(&self, group: &Group) -> StoreResult<()>;

    fn list_groups(&self) -> StoreResult<Vec<Group>>;

    /// Delete a group with every membership, hold and message.
    fn delete_group(&self, group_id: Uuid) -> StoreResult<bool>;

    fn get_membership(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>>;

    /// Insert only if no row exists for `(group, user)`.
    fn insert_membership(&self, membership: &Membership) -> StoreResult<bool>;

    /// Replace `before` with `after` and move the member's seat hold to
    /// match, all or nothing. Nothing is written unless the stored row still
    /// equals `before` and the target seat is free, already the member's,
    /// or orphaned.
    fn commit_membership(&self, before: &Membership, after: &Membership) -> StoreResult<SeatCommit>;

    /// Delete a row together with the seat hold it references.
    fn delete_membership(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>>;

    fn list_members(&self, group_id: Uuid) -> StoreResult<Vec<Membership>>;

    fn seat_hold(&self, group_id: Uuid, seat: Seat) -> StoreResult<Option<SeatHold>>;

    /// Atomically replace the hold on `seat` with `new` if it currently
    /// equals `expected`. Does not touch membership rows.
    fn compare_and_set_seat(
        &self,
        group_id: Uuid,
        seat: Seat,
        expected: Option<SeatHold>,
        new: Option<SeatHold>,
    ) -> StoreResult<bool>;
}

/// Chat history.
pub trait MessageStore: Send + Sync {
    /// Insert a message unless `(group, client_id)` was already stored, in
    /// which case the original is returned with `created == false`.
    fn insert_message(&self, message: &Message) -> StoreResult<(Message, bool)>;

    /// Most recent `limit` messages, oldest first.
    fn messages(&self, group_id: Uuid, limit: usize) -> StoreResult<Vec<Message>>;

    fn message_by_client_id(&self, group_id: Uuid, client_id: Uuid) -> StoreResult<Option<Message>>;
}

/// Everything the allocator and the action service need.
pub trait Store: MembershipStore + MessageStore {}

impl<T: MembershipStore + MessageStore> Store for T {}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour both store implementations must share.

    use super::*;
    use crate::model::{HoldKind, SeatState};

    pub fn group_lifecycle(store: &dyn Store) {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Tertulia", "es");
        let row = Membership::owner(group.id, owner);

        assert!(store.insert_group(&group, &row).unwrap());
        assert!(!store.insert_group(&group, &row).unwrap());
        assert_eq!(store.get_group(group.id).unwrap(), Some(group.clone()));
        assert_eq!(
            store.seat_hold(group.id, Seat::OWNER).unwrap(),
            Some(SeatHold::occupied(owner))
        );
        assert_eq!(store.list_members(group.id).unwrap(), vec![row]);
        assert!(store.list_groups().unwrap().iter().any(|g| g.id == group.id));

        let mut inactive = group.clone();
        inactive.active = false;
        store.put_group(&inactive).unwrap();
        assert!(!store.get_group(group.id).unwrap().unwrap().active);
    }

    pub fn membership_crud(store: &dyn Store) {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Stammtisch", "de");
        store.insert_group(&group, &Membership::owner(group.id, owner)).unwrap();

        let user = Uuid::new_v4();
        let row = Membership::listener(group.id, user);
        assert!(store.insert_membership(&row).unwrap());
        assert!(!store.insert_membership(&row).unwrap());

        let seat = Seat::new(4).unwrap();
        let seated = Membership { seat: SeatState::Seated(seat), ..row.clone() };
        assert_eq!(store.commit_membership(&row, &seated).unwrap(), SeatCommit::Committed);
        assert_eq!(store.get_membership(group.id, user).unwrap(), Some(seated.clone()));
        assert_eq!(store.seat_hold(group.id, seat).unwrap(), Some(SeatHold::occupied(user)));
        assert_eq!(store.list_members(group.id).unwrap().len(), 2);

        // Deleting the row drops its hold too.
        assert_eq!(store.delete_membership(group.id, user).unwrap(), Some(seated));
        assert_eq!(store.seat_hold(group.id, seat).unwrap(), None);
        assert_eq!(store.delete_membership(group.id, user).unwrap(), None);
        assert_eq!(store.get_membership(group.id, user).unwrap(), None);
    }

    pub fn membership_commit(store: &dyn Store) {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Peña", "es");
        store.insert_group(&group, &Membership::owner(group.id, owner)).unwrap();

        let a = Membership::listener(group.id, Uuid::new_v4());
        let b = Membership::listener(group.id, Uuid::new_v4());
        store.insert_membership(&a).unwrap();
        store.insert_membership(&b).unwrap();
        let three = Seat::new(3).unwrap();
        let five = Seat::new(5).unwrap();

        // Request then accept on the same seat upgrades the hold in place.
        let a_req = a.requesting(three);
        assert_eq!(store.commit_membership(&a, &a_req).unwrap(), SeatCommit::Committed);
        assert_eq!(store.seat_hold(group.id, three).unwrap(), Some(SeatHold::reserved(a.user_id)));
        let a_seated = a_req.seated(three);
        assert_eq!(store.commit_membership(&a_req, &a_seated).unwrap(), SeatCommit::Committed);
        assert_eq!(store.seat_hold(group.id, three).unwrap(), Some(SeatHold::occupied(a.user_id)));

        // A stale `before` writes nothing, not even the hold.
        assert_eq!(store.commit_membership(&a, &a.seated(five)).unwrap(), SeatCommit::RowChanged);
        assert_eq!(store.seat_hold(group.id, five).unwrap(), None);

        assert_eq!(store.commit_membership(&b, &b.seated(three)).unwrap(), SeatCommit::SeatTaken);
        assert_eq!(store.get_membership(group.id, b.user_id).unwrap(), Some(b.clone()));

        // Moving releases the old seat in the same step.
        let a_moved = a_seated.seated(five);
        assert_eq!(store.commit_membership(&a_seated, &a_moved).unwrap(), SeatCommit::Committed);
        assert_eq!(store.seat_hold(group.id, three).unwrap(), None);
        assert_eq!(store.seat_hold(group.id, five).unwrap(), Some(SeatHold::occupied(a.user_id)));

        // A hold nobody's row references is taken over.
        let ghost = SeatHold::occupied(b.user_id);
        let seven = Seat::new(7).unwrap();
        store.compare_and_set_seat(group.id, seven, None, Some(ghost)).unwrap();
        let c = Membership::listener(group.id, Uuid::new_v4());
        store.insert_membership(&c).unwrap();
        assert_eq!(store.commit_membership(&c, &c.seated(seven)).unwrap(), SeatCommit::Committed);
        assert_eq!(store.seat_hold(group.id, seven).unwrap(), Some(SeatHold::occupied(c.user_id)));
    }

    pub fn seat_compare_and_set(store: &dyn Store) {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Salon", "fr");
        store.insert_group(&group, &Membership::owner(group.id, owner)).unwrap();

        let seat = Seat::new(3).unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(store.compare_and_set_seat(group.id, seat, None, Some(SeatHold::reserved(a))).unwrap());
        assert!(!store.compare_and_set_seat(group.id, seat, None, Some(SeatHold::occupied(b))).unwrap());

        assert!(store
            .compare_and_set_seat(
                group.id,
                seat,
                Some(SeatHold::reserved(a)),
                Some(SeatHold::occupied(a))
            )
            .unwrap());
        let hold = store.seat_hold(group.id, seat).unwrap().unwrap();
        assert_eq!(hold.kind, HoldKind::Occupied);

        assert!(store.compare_and_set_seat(group.id, seat, Some(hold), None).unwrap());
        assert_eq!(store.seat_hold(group.id, seat).unwrap(), None);

        // Owner seat is held from creation.
        assert!(!store
            .compare_and_set_seat(group.id, Seat::OWNER, None, Some(SeatHold::occupied(b)))
            .unwrap());
    }

    pub fn message_dedupe(store: &dyn Store) {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Circolo", "it");
        store.insert_group(&group, &Membership::owner(group.id, owner)).unwrap();

        let client_id = Uuid::new_v4();
        let first = Message::new(group.id, owner, client_id, "ciao");
        let (stored, created) = store.insert_message(&first).unwrap();
        assert!(created);
        assert_eq!(stored, first);

        let replay = Message::new(group.id, owner, client_id, "ciao");
        let (stored, created) = store.insert_message(&replay).unwrap();
        assert!(!created);
        assert_eq!(stored.id, first.id);

        let other = Message::new(group.id, owner, Uuid::new_v4(), "a dopo");
        store.insert_message(&other).unwrap();

        let history = store.messages(group.id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, first.id);
        assert_eq!(store.messages(group.id, 1).unwrap()[0].id, other.id);
        assert_eq!(store.message_by_client_id(group.id, client_id).unwrap(), Some(first));
    }

    pub fn delete_cascades(store: &dyn Store) {
        let owner = Uuid::new_v4();
        let group = Group::new(owner, "Club", "en");
        store.insert_group(&group, &Membership::owner(group.id, owner)).unwrap();

        let user = Uuid::new_v4();
        store.insert_membership(&Membership::listener(group.id, user)).unwrap();
        let seat = Seat::new(6).unwrap();
        store.compare_and_set_seat(group.id, seat, None, Some(SeatHold::reserved(user))).unwrap();
        store.insert_message(&Message::new(group.id, owner, Uuid::new_v4(), "bye")).unwrap();

        // An unrelated group survives the cascade.
        let other = Group::new(owner, "Other", "en");
        store.insert_group(&other, &Membership::owner(other.id, owner)).unwrap();

        assert!(store.delete_group(group.id).unwrap());
        assert!(!store.delete_group(group.id).unwrap());
        assert_eq!(store.get_group(group.id).unwrap(), None);
        assert!(store.list_members(group.id).unwrap().is_empty());
        assert_eq!(store.seat_hold(group.id, seat).unwrap(), None);
        assert_eq!(store.seat_hold(group.id, Seat::OWNER).unwrap(), None);
        assert!(store.messages(group.id, 10).unwrap().is_empty());

        assert!(store.get_group(other.id).unwrap().is_some());
        assert_eq!(store.list_members(other.id).unwrap().len(), 1);
    }
}
