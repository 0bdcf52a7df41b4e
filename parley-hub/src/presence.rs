//! Presence Hub: connection registry, room membership, typing state.
//!
//! ## Connection lifecycle
//!
//! ```text
//!              register             join_room(g)
//! Unregistered ─────────► Registered ───────────► InRoom(g)
//!                             ▲                      │
//!                             └──────────────────────┘
//!                                   leave_room(g)
//!          disconnect (from any state) ──► removed, implicit leave
//! ```
//!
//! The hub is a disposable cache: it never decides who holds a seat. Lock
//! order is connection table first, then a single room; the room registry
//! is never touched while a room lock is held. Joining holds the connection
//! table across the room insert, so a connection is in a room's member list
//! exactly when its entry names that room.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use parley_core::ActionError;
use uuid::Uuid;

use crate::broadcast::{AtomicBroadcastStats, BroadcastStats, Outbox, Room, RoomManager, RoomMember};
use crate::protocol::{HubEvent, OnlineUser, Payload, ProtocolError, RelayKind};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unregistered,
    Registered,
    InRoom(Uuid),
}

/// A live transport connection.
#[derive(Debug, Clone)]
pub struct ConnectedClient {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    /// At most one room at a time.
    pub group_id: Option<Uuid>,
    outbox: Outbox,
}

impl ConnectedClient {
    fn online_user(&self) -> OnlineUser {
        OnlineUser {
            connection_id: self.connection_id,
            user_id: self.user_id,
            username: self.display_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub messages_sent: u64,
    pub messages_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("connection {0} is not registered")]
    NotRegistered(Uuid),
    #[error("connection {0} is already registered")]
    AlreadyRegistered(Uuid),
    #[error("connection {0} has not joined a room")]
    NotInRoom(Uuid),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<HubError> for ActionError {
    fn from(e: HubError) -> Self {
        match e {
            HubError::NotInRoom(_) => ActionError::validation("join a group before sending room events"),
            HubError::Protocol(e) => e.into(),
            other => ActionError::validation(other.to_string()),
        }
    }
}

/// Sink the gateway publishes room events through. The hub delivers
/// locally; a pub/sub backbone can stand in for multi-node deployments.
pub trait Fanout: Send + Sync {
    /// Deliver to every connection in the room except `exclude`.
    fn publish(&self, group_id: Uuid, event: &HubEvent, exclude: Option<Uuid>) -> usize;

    /// Deliver to one connection.
    fn send_to(&self, connection_id: Uuid, event: &HubEvent) -> bool;
}

pub struct PresenceHub {
    connections: RwLock<HashMap<Uuid, ConnectedClient>>,
    rooms: RoomManager,
    stats: Arc<AtomicBroadcastStats>,
    outbox_capacity: usize,
}

impl PresenceHub {
    pub fn new(outbox_capacity: usize) -> Self {
        let stats = Arc::new(AtomicBroadcastStats::default());
        Self {
            connections: RwLock::new(HashMap::new()),
            rooms: RoomManager::new(stats.clone()),
            stats,
            outbox_capacity,
        }
    }

    fn client(&self, connection_id: Uuid) -> Result<ConnectedClient, HubError> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection_id)
            .cloned()
            .ok_or(HubError::NotRegistered(connection_id))
    }

    fn set_group(&self, connection_id: Uuid, group_id: Option<Uuid>) {
        let mut conns = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = conns.get_mut(&connection_id) {
            client.group_id = group_id;
        }
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Register a connection and hand back its outbox receiver.
    pub fn register(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        display_name: impl Into<String>,
    ) -> Result<mpsc::Receiver<Payload>, HubError> {
        let mut conns = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        if conns.contains_key(&connection_id) {
            return Err(HubError::AlreadyRegistered(connection_id));
        }
        let (outbox, rx) = Outbox::channel(connection_id, self.outbox_capacity);
        let client = ConnectedClient {
            connection_id,
            user_id,
            display_name: display_name.into(),
            group_id: None,
            outbox,
        };
        conns.insert(connection_id, client);
        log::debug!("connection {connection_id} registered for user {user_id}");
        Ok(rx)
    }

    /// Implicit leave, then removal. Safe to call more than once.
    pub fn disconnect(&self, connection_id: Uuid) -> bool {
        let removed = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id);
        let Some(client) = removed else {
            return false;
        };
        if let Some(group_id) = client.group_id {
            self.detach(group_id, connection_id);
        }
        log::debug!("connection {connection_id} disconnected");
        true
    }

    pub fn connection_state(&self, connection_id: Uuid) -> ConnectionState {
        match self.client(connection_id) {
            Err(_) => ConnectionState::Unregistered,
            Ok(ConnectedClient { group_id: Some(g), .. }) => ConnectionState::InRoom(g),
            Ok(_) => ConnectionState::Registered,
        }
    }

    // ─── Rooms ────────────────────────────────────────────────────────

    /// Join `group_id`, leaving any other room first. Joining the room the
    /// connection is already in is a no-op that returns false.
    ///
    /// The connection's room and the room's member list change under one
    /// connection-table write lock, so a concurrent disconnect or eviction
    /// sees both or neither.
    pub fn join_room(&self, connection_id: Uuid, group_id: Uuid) -> Result<bool, HubError> {
        let client = self.client(connection_id)?;
        match client.group_id {
            Some(current) if current == group_id => return Ok(false),
            Some(current) => {
                self.leave_room(connection_id, current)?;
            }
            None => {}
        }

        let mut conns = self.connections.write().unwrap_or_else(PoisonError::into_inner);
        let client = conns
            .get_mut(&connection_id)
            .ok_or(HubError::NotRegistered(connection_id))?;
        if client.group_id.is_some() {
            // A concurrent join won.
            return Ok(false);
        }
        let user = client.online_user();
        let joined_event = HubEvent::UserJoined { group_id, user: user.clone() }.encode()?;

        loop {
            let room = self.rooms.get_or_create(group_id);
            let mut state = room.lock();
            if state.is_closed() {
                // Lost a race with remove_if_empty; pick up the fresh room.
                continue;
            }
            if !state.insert(RoomMember { user: user.clone(), outbox: client.outbox.clone() }) {
                return Ok(false);
            }
            client.group_id = Some(group_id);

            let snapshot = HubEvent::OnlineUsers { group_id, users: state.online_users() }.encode()?;
            room.deliver_to(&client.outbox, &snapshot);
            let typing = state.typing_users();
            if !typing.is_empty() {
                let typing_event = HubEvent::TypingUpdate { group_id, users: typing }.encode()?;
                room.deliver_to(&client.outbox, &typing_event);
            }
            room.fan_out(&state, &joined_event, Some(connection_id));
            break;
        }
        drop(conns);

        log::info!("{} ({}) joined room {group_id}", user.username, user.user_id);
        Ok(true)
    }

    /// Leave `group_id`. Returns false if the connection was not in it.
    pub fn leave_room(&self, connection_id: Uuid, group_id: Uuid) -> Result<bool, HubError> {
        let client = self.client(connection_id)?;
        if client.group_id != Some(group_id) {
            return Ok(false);
        }
        self.set_group(connection_id, None);
        Ok(self.detach(group_id, connection_id))
    }

    /// Remove from the room, announce, rebroadcast typing, drop if empty.
    fn detach(&self, group_id: Uuid, connection_id: Uuid) -> bool {
        let Some(room) = self.rooms.get(group_id) else {
            return false;
        };
        let removed = {
            let mut state = room.lock();
            let Some(member) = state.remove(connection_id) else {
                return false;
            };
            let left = HubEvent::UserLeft { group_id, user: member.user.clone() };
            let typing = HubEvent::TypingUpdate { group_id, users: state.typing_users() };
            for event in [left, typing] {
                match event.encode() {
                    Ok(payload) => {
                        room.fan_out(&state, &payload, None);
                    }
                    Err(e) => log::error!("failed to encode {}: {e}", event.name()),
                }
            }
            member
        };
        self.rooms.remove_if_empty(group_id);
        log::info!("{} left room {group_id}", removed.user.username);
        true
    }

    /// Remove every connection of `user_id` from the room (after a kick or
    /// leave). Returns the affected connection ids.
    pub fn evict_user(&self, group_id: Uuid, user_id: Uuid) -> Vec<Uuid> {
        let targets: Vec<Uuid> = self
            .connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|c| c.user_id == user_id && c.group_id == Some(group_id))
            .map(|c| c.connection_id)
            .collect();
        for connection_id in &targets {
            if let Err(e) = self.leave_room(*connection_id, group_id) {
                log::debug!("evicting {connection_id}: {e}");
            }
        }
        targets
    }

    /// Drop a deleted group's room without per-member announcements.
    pub fn close_room(&self, group_id: Uuid) -> usize {
        let Some(room) = self.rooms.remove(group_id) else {
            return 0;
        };
        let members = room.lock().close();
        for member in &members {
            self.set_group(member.user.connection_id, None);
        }
        log::info!("room {group_id} closed ({} connections detached)", members.len());
        members.len()
    }

    // ─── Fan-out ──────────────────────────────────────────────────────

    /// Best-effort delivery to a room. Returns the number of recipients.
    pub fn broadcast(&self, group_id: Uuid, event: &HubEvent, exclude: Option<Uuid>) -> Result<usize, HubError> {
        let Some(room) = self.rooms.get(group_id) else {
            return Ok(0);
        };
        let payload = event.encode()?;
        let state = room.lock();
        Ok(room.fan_out(&state, &payload, exclude))
    }

    /// Relay an ephemeral event to the rest of the sender's room.
    pub fn relay(&self, connection_id: Uuid, kind: RelayKind, payload: serde_json::Value) -> Result<usize, HubError> {
        let client = self.client(connection_id)?;
        let group_id = client.group_id.ok_or(HubError::NotInRoom(connection_id))?;
        let event = HubEvent::relay(kind, group_id, client.user_id, payload);
        self.broadcast(group_id, &event, Some(connection_id))
    }

    pub fn start_typing(&self, connection_id: Uuid) -> Result<(), HubError> {
        self.set_typing(connection_id, true)
    }

    pub fn stop_typing(&self, connection_id: Uuid) -> Result<(), HubError> {
        self.set_typing(connection_id, false)
    }

    /// Update the typing set and broadcast the full list to the room.
    fn set_typing(&self, connection_id: Uuid, typing: bool) -> Result<(), HubError> {
        let client = self.client(connection_id)?;
        let group_id = client.group_id.ok_or(HubError::NotInRoom(connection_id))?;
        let Some(room) = self.rooms.get(group_id) else {
            return Err(HubError::NotInRoom(connection_id));
        };

        let mut state = room.lock();
        if !state.set_typing(connection_id, typing) {
            log::trace!("typing state of {connection_id} unchanged");
        }
        let users = state.typing_users();
        let count = users.len();
        let payload = HubEvent::TypingUpdate { group_id, users }.encode()?;
        let delivered = room.fan_out(&state, &payload, None);
        log::trace!("typing in {group_id}: {count} users, {delivered} recipients");
        Ok(())
    }

    pub fn update_display_name(&self, connection_id: Uuid, display_name: &str) -> Result<(), HubError> {
        let group_id = {
            let mut conns = self.connections.write().unwrap_or_else(PoisonError::into_inner);
            let client = conns
                .get_mut(&connection_id)
                .ok_or(HubError::NotRegistered(connection_id))?;
            client.display_name = display_name.to_string();
            client.group_id
        };
        if let Some(room) = group_id.and_then(|g| self.rooms.get(g)) {
            if let Some(member) = room.lock().member_mut(connection_id) {
                member.user.username = display_name.to_string();
            }
        }
        Ok(())
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub fn online_users(&self, group_id: Uuid) -> Vec<OnlineUser> {
        self.rooms
            .get(group_id)
            .map(|room| room.lock().online_users())
            .unwrap_or_default()
    }

    pub fn typing_users(&self, group_id: Uuid) -> Vec<OnlineUser> {
        self.rooms
            .get(group_id)
            .map(|room| room.lock().typing_users())
            .unwrap_or_default()
    }

    pub fn room(&self, group_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.get(group_id)
    }

    pub fn stats(&self) -> HubStats {
        let BroadcastStats { messages_sent, messages_dropped } = self.stats.snapshot();
        HubStats {
            connections: self.connections.read().unwrap_or_else(PoisonError::into_inner).len(),
            rooms: self.rooms.room_count(),
            messages_sent,
            messages_dropped,
        }
    }
}

impl Fanout for PresenceHub {
    fn publish(&self, group_id: Uuid, event: &HubEvent, exclude: Option<Uuid>) -> usize {
        match self.broadcast(group_id, event, exclude) {
            Ok(n) => n,
            Err(e) => {
                log::error!("failed to publish {} to {group_id}: {e}", event.name());
                0
            }
        }
    }

    fn send_to(&self, connection_id: Uuid, event: &HubEvent) -> bool {
        let Ok(client) = self.client(connection_id) else {
            return false;
        };
        match event.encode() {
            Ok(payload) => client.outbox.try_deliver(&payload, &self.stats),
            Err(e) => {
                log::error!("failed to encode {}: {e}", event.name());
                false
            }
        }
    }
}
