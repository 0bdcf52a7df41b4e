//! In-memory store. Reads share one `RwLock`; every write takes it
//! exclusively, which makes commits and compare-and-set atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use super::{seat_available, MembershipStore, MessageStore, SeatCommit, StoreResult};
use crate::error::StoreError;
use crate::model::{Group, Membership, Message, Seat, SeatHold};

#[derive(Default)]
struct Tables {
    groups: HashMap<Uuid, Group>,
    /// BTreeMap keeps member listings in a stable order.
    members: BTreeMap<(Uuid, Uuid), Membership>,
    seats: HashMap<(Uuid, Seat), SeatHold>,
    messages: HashMap<Uuid, Vec<Message>>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoreResult<RwLockReadGuard<'_, Tables>> {
        self.tables.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> StoreResult<RwLockWriteGuard<'_, Tables>> {
        self.tables.write().map_err(|_| StoreError::Poisoned)
    }
}

impl MembershipStore for MemoryStore {
    fn insert_group(&self, group: &Group, owner: &Membership) -> StoreResult<bool> {
        let mut t = self.write()?;
        if t.groups.contains_key(&group.id) {
            return Ok(false);
        }
        t.groups.insert(group.id, group.clone());
        t.members.insert((group.id, owner.user_id), owner.clone());
        if let Some((seat, hold)) = owner.seat.hold_for(owner.user_id) {
            t.seats.insert((group.id, seat), hold);
        }
        Ok(true)
    }

    fn get_group(&self, group_id: Uuid) -> StoreResult<Option<Group>> {
        Ok(self.read()?.groups.get(&group_id).cloned())
    }

    fn put_group(&self, group: &Group) -> StoreResult<()> {
        self.write()?.groups.insert(group.id, group.clone());
        Ok(())
    }

    fn list_groups(&self) -> StoreResult<Vec<Group>> {
        let t = self.read()?;
        let mut groups: Vec<Group> = t.groups.values().cloned().collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    fn delete_group(&self, group_id: Uuid) -> StoreResult<bool> {
        let mut t = self.write()?;
        if t.groups.remove(&group_id).is_none() {
            return Ok(false);
        }
        t.members.retain(|(g, _), _| *g != group_id);
        t.seats.retain(|(g, _), _| *g != group_id);
        t.messages.remove(&group_id);
        Ok(true)
    }

    fn get_membership(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        Ok(self.read()?.members.get(&(group_id, user_id)).cloned())
    }

    fn insert_membership(&self, membership: &Membership) -> StoreResult<bool> {
        let mut t = self.write()?;
        let key = (membership.group_id, membership.user_id);
        if t.members.contains_key(&key) {
            return Ok(false);
        }
        t.members.insert(key, membership.clone());
        Ok(true)
    }

    fn commit_membership(&self, before: &Membership, after: &Membership) -> StoreResult<SeatCommit> {
        let mut t = self.write()?;
        let (group_id, user_id) = (before.group_id, before.user_id);
        if t.members.get(&(group_id, user_id)) != Some(before) {
            return Ok(SeatCommit::RowChanged);
        }

        let old = before.seat.hold_for(user_id);
        let new = after.seat.hold_for(user_id);
        if let Some((seat, _)) = new.filter(|n| Some(*n) != old) {
            let current = t.seats.get(&(group_id, seat)).copied();
            let available = seat_available(group_id, seat, user_id, current, |holder| {
                Ok(t.members.get(&(group_id, holder)).cloned())
            })?;
            if !available {
                return Ok(SeatCommit::SeatTaken);
            }
        }

        if let Some((seat, hold)) = old {
            if t.seats.get(&(group_id, seat)) == Some(&hold) {
                t.seats.remove(&(group_id, seat));
            }
        }
        if let Some((seat, hold)) = new {
            t.seats.insert((group_id, seat), hold);
        }
        t.members.insert((group_id, user_id), after.clone());
        Ok(SeatCommit::Committed)
    }

    fn delete_membership(&self, group_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        let mut t = self.write()?;
        let Some(row) = t.members.remove(&(group_id, user_id)) else {
            return Ok(None);
        };
        if let Some((seat, hold)) = row.seat.hold_for(user_id) {
            if t.seats.get(&(group_id, seat)) == Some(&hold) {
                t.seats.remove(&(group_id, seat));
            }
        }
        Ok(Some(row))
    }

    fn list_members(&self, group_id: Uuid) -> StoreResult<Vec<Membership>> {
        let t = self.read()?;
        Ok(t.members
            .range((group_id, Uuid::nil())..=(group_id, Uuid::max()))
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn seat_hold(&self, group_id: Uuid, seat: Seat) -> StoreResult<Option<SeatHold>> {
        Ok(self.read()?.seats.get(&(group_id, seat)).copied())
    }

    fn compare_and_set_seat(
        &self,
        group_id: Uuid,
        seat: Seat,
        expected: Option<SeatHold>,
        new: Option<SeatHold>,
    ) -> StoreResult<bool> {
        let mut t = self.write()?;
        let key = (group_id, seat);
        if t.seats.get(&key).copied() != expected {
            return Ok(false);
        }
        match new {
            Some(hold) => t.seats.insert(key, hold),
            None => t.seats.remove(&key),
        };
        Ok(true)
    }
}

impl MessageStore for MemoryStore {
    fn insert_message(&self, message: &Message) -> StoreResult<(Message, bool)> {
        let mut t = self.write()?;
        let history = t.messages.entry(message.group_id).or_default();
        if let Some(existing) = history.iter().find(|m| m.client_id == message.client_id) {
            return Ok((existing.clone(), false));
        }
        history.push(message.clone());
        Ok((message.clone(), true))
    }

    fn messages(&self, group_id: Uuid, limit: usize) -> StoreResult<Vec<Message>> {
        let t = self.read()?;
        let history = t.messages.get(&group_id).map(Vec::as_slice).unwrap_or_default();
        let skip = history.len().saturating_sub(limit);
        Ok(history[skip..].to_vec())
    }

    fn message_by_client_id(&self, group_id: Uuid, client_id: Uuid) -> StoreResult<Option<Message>> {
        let t = self.read()?;
        Ok(t.messages
            .get(&group_id)
            .and_then(|h| h.iter().find(|m| m.client_id == client_id))
            .cloned())
    }
}
