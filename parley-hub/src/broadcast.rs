//! Room fan-out with per-connection outboxes.
//!
//! Every connection owns one bounded FIFO outbox. A broadcast encodes the
//! event once and `try_send`s the shared payload into each member's outbox
//! while the room lock is held, so each subscriber sees a room's events in
//! the order they were produced. A full or closed outbox is skipped and
//! counted as dropped; fan-out never waits on a slow consumer.
//!
//! ```text
//!   publish(event) ── encode once ──► Arc<str>
//!                                       │ room lock held
//!                     ┌─────────────────┼─────────────────┐
//!                     ▼                 ▼                 ▼
//!                 outbox A          outbox B          outbox C (full → dropped)
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{OnlineUser, Payload};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

/// Lock-free counters shared by every room of a hub.
#[derive(Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Sending half of a connection's outbound FIFO.
#[derive(Debug, Clone)]
pub struct Outbox {
    connection_id: Uuid,
    tx: mpsc::Sender<Payload>,
}

impl Outbox {
    pub fn channel(connection_id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<Payload>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { connection_id, tx }, rx)
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Non-blocking enqueue. False if the outbox is full or closed.
    pub fn try_deliver(&self, payload: &Payload, stats: &AtomicBroadcastStats) -> bool {
        match self.tx.try_send(payload.clone()) {
            Ok(()) => {
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("outbox of connection {} is full, dropping event", self.connection_id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("outbox of connection {} is closed", self.connection_id);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone)]
pub struct RoomMember {
    pub user: OnlineUser,
    pub outbox: Outbox,
}

/// Mutable state of one room, only reachable through [`Room::lock`].
#[derive(Debug, Default)]
pub struct RoomState {
    /// In join order.
    members: Vec<RoomMember>,
    /// Typing connection ids, in the order they started typing.
    typing: Vec<Uuid>,
    /// Set once the room has been dropped from the registry.
    closed: bool,
}

impl RoomState {
    pub fn contains(&self, connection_id: Uuid) -> bool {
        self.members.iter().any(|m| m.user.connection_id == connection_id)
    }

    pub fn insert(&mut self, member: RoomMember) -> bool {
        if self.contains(member.user.connection_id) {
            return false;
        }
        self.members.push(member);
        true
    }

    /// Remove a connection from the room and from the typing set.
    pub fn remove(&mut self, connection_id: Uuid) -> Option<RoomMember> {
        self.typing.retain(|c| *c != connection_id);
        let idx = self.members.iter().position(|m| m.user.connection_id == connection_id)?;
        Some(self.members.remove(idx))
    }

    pub fn member(&self, connection_id: Uuid) -> Option<&RoomMember> {
        self.members.iter().find(|m| m.user.connection_id == connection_id)
    }

    pub fn member_mut(&mut self, connection_id: Uuid) -> Option<&mut RoomMember> {
        self.members.iter_mut().find(|m| m.user.connection_id == connection_id)
    }

    pub fn members(&self) -> &[RoomMember] {
        &self.members
    }

    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.members.iter().map(|m| m.user.clone()).collect()
    }

    /// True if the typing set changed.
    pub fn set_typing(&mut self, connection_id: Uuid, typing: bool) -> bool {
        let present = self.typing.contains(&connection_id);
        match (typing, present) {
            (true, false) if self.contains(connection_id) => {
                self.typing.push(connection_id);
                true
            }
            (false, true) => {
                self.typing.retain(|c| *c != connection_id);
                true
            }
            _ => false,
        }
    }

    /// The full typing list, recomputed from room membership.
    pub fn typing_users(&self) -> Vec<OnlineUser> {
        self.typing
            .iter()
            .filter_map(|c| self.member(*c).map(|m| m.user.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Detach every member, marking the room closed.
    pub fn close(&mut self) -> Vec<RoomMember> {
        self.closed = true;
        self.typing.clear();
        std::mem::take(&mut self.members)
    }
}

/// Broadcast group for a single conversation group.
pub struct Room {
    group_id: Uuid,
    state: Mutex<RoomState>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Room {
    pub fn new(group_id: Uuid, stats: Arc<AtomicBroadcastStats>) -> Self {
        Self { group_id, state: Mutex::new(RoomState::default()), stats }
    }

    pub fn group_id(&self) -> Uuid {
        self.group_id
    }

    /// The room lock. Room state stays consistent across a panicking
    /// holder because every mutation is a single Vec operation.
    pub fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver to every member except `exclude`. Call with the room lock held.
    pub fn fan_out(&self, state: &RoomState, payload: &Payload, exclude: Option<Uuid>) -> usize {
        state
            .members
            .iter()
            .filter(|m| Some(m.user.connection_id) != exclude)
            .filter(|m| m.outbox.try_deliver(payload, &self.stats))
            .count()
    }

    pub fn deliver_to(&self, outbox: &Outbox, payload: &Payload) -> bool {
        outbox.try_deliver(payload, &self.stats)
    }

    pub fn member_count(&self) -> usize {
        self.lock().members.len()
    }
}

/// Maps group ids to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    stats: Arc<AtomicBroadcastStats>,
}

impl RoomManager {
    pub fn new(stats: Arc<AtomicBroadcastStats>) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), stats }
    }

    /// Get or create a room for the given group.
    pub fn get_or_create(&self, group_id: Uuid) -> Arc<Room> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(room) = rooms.get(&group_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        // Double-check after acquiring write lock
        rooms
            .entry(group_id)
            .or_insert_with(|| Arc::new(Room::new(group_id, self.stats.clone())))
            .clone()
    }

    pub fn get(&self, group_id: Uuid) -> Option<Arc<Room>> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group_id)
            .cloned()
    }

    /// Drop the room if nobody is in it. Returns true if removed.
    pub fn remove_if_empty(&self, group_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let Some(room) = rooms.get(&group_id).cloned() else {
            return false;
        };
        let mut state = room.lock();
        if !state.is_empty() {
            return false;
        }
        state.close();
        rooms.remove(&group_id);
        log::debug!("room {group_id} removed (empty)");
        true
    }

    /// Unconditionally drop a room, returning it so callers can detach members.
    pub fn remove(&self, group_id: Uuid) -> Option<Arc<Room>> {
        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&group_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn active_groups(&self) -> Vec<Uuid> {
        self.rooms
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}
