//! Server-side verbs: applies an [`Action`] on behalf of a user.
//!
//! Both the live gateway and the in-process reconciler dispatcher go through
//! [`ActionService::apply`], so replayed actions hit exactly the same rules
//! as live ones.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::action::{Action, SeatAction};
use crate::allocator::{MembershipEvent, SeatAllocator, Transition};
use crate::error::{ActionError, Conflict};
use crate::model::Message;
use crate::store::Store;

/// Upper bound on message length, in characters.
pub const MAX_MESSAGE_LEN: usize = 4000;
pub const MAX_DISPLAY_NAME_LEN: usize = 50;

/// What applying an action produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Membership(Transition),
    Message {
        message: Message,
        /// False when the client id was seen before (a replay).
        created: bool,
    },
    ProfileUpdated {
        user_id: Uuid,
        display_name: String,
    },
}

pub struct ActionService {
    allocator: Arc<SeatAllocator>,
    store: Arc<dyn Store>,
    display_names: RwLock<HashMap<Uuid, String>>,
}

impl ActionService {
    pub fn new(allocator: Arc<SeatAllocator>) -> Self {
        let store = allocator.store().clone();
        Self { allocator, store, display_names: RwLock::new(HashMap::new()) }
    }

    /// Service over a fresh allocator for `store`.
    pub fn with_store(store: Arc<dyn Store>) -> Self {
        Self::new(Arc::new(SeatAllocator::new(store)))
    }

    pub fn allocator(&self) -> &Arc<SeatAllocator> {
        &self.allocator
    }

    pub async fn apply(&self, user_id: Uuid, action: &Action) -> Result<ActionOutcome, ActionError> {
        log::debug!("applying {} for {user_id}", action.label());
        match action {
            Action::SendMessage { group_id, client_id, content } => {
                let (message, created) =
                    self.send_message(*group_id, user_id, *client_id, content).await?;
                Ok(ActionOutcome::Message { message, created })
            }
            Action::JoinGroup { group_id } => {
                Ok(ActionOutcome::Membership(self.join_group(*group_id, user_id).await?))
            }
            Action::LeaveGroup { group_id } => {
                Ok(ActionOutcome::Membership(self.allocator.leave(*group_id, user_id).await?))
            }
            Action::SeatAction { group_id, action } => Ok(ActionOutcome::Membership(
                self.seat_action(*group_id, user_id, action).await?,
            )),
            Action::ProfileUpdate { display_name } => {
                let display_name = self.update_profile(user_id, display_name)?;
                Ok(ActionOutcome::ProfileUpdated { user_id, display_name })
            }
        }
    }

    /// Join, treating an existing membership as success.
    pub async fn join_group(&self, group_id: Uuid, user_id: Uuid) -> Result<Transition, ActionError> {
        match self.allocator.join(group_id, user_id).await {
            Err(ActionError::Conflict(Conflict::AlreadyMember)) => {
                let row = self
                    .store
                    .get_membership(group_id, user_id)?
                    .ok_or_else(|| ActionError::membership_not_found(group_id, user_id))?;
                Ok(Transition {
                    group_id,
                    user_id,
                    before: Some(row.clone()),
                    after: Some(row),
                    event: MembershipEvent::Joined,
                })
            }
            other => other,
        }
    }

    pub async fn seat_action(
        &self,
        group_id: Uuid,
        user_id: Uuid,
        action: &SeatAction,
    ) -> Result<Transition, ActionError> {
        let alloc = &self.allocator;
        match *action {
            SeatAction::RequestSeat { seat } => alloc.request_seat(group_id, user_id, seat).await,
            SeatAction::CancelSeatRequest => alloc.cancel_seat_request(group_id, user_id).await,
            SeatAction::AcceptJoinRequest { user_id: target, seat } => {
                alloc.accept_join_request(group_id, user_id, target, seat).await
            }
            SeatAction::RejectJoinRequest { user_id: target } => {
                alloc.reject_join_request(group_id, user_id, target).await
            }
            SeatAction::Promote { user_id: target, seat } => {
                alloc.promote(group_id, user_id, target, seat).await
            }
            SeatAction::MoveToSeat { user_id: target, seat } => {
                alloc.move_to_seat(group_id, user_id, target, seat).await
            }
            SeatAction::Demote { user_id: target } => alloc.demote(group_id, user_id, target).await,
            SeatAction::MoveToWaiting { user_id: target } => {
                alloc.move_to_waiting(group_id, user_id, target).await
            }
            SeatAction::LeaveSeat => alloc.leave_seat(group_id, user_id).await,
            SeatAction::Kick { user_id: target } => alloc.kick(group_id, user_id, target).await,
            SeatAction::GrantAdmin { user_id: target } => {
                alloc.grant_admin(group_id, user_id, target).await
            }
            SeatAction::RevokeAdmin { user_id: target } => {
                alloc.revoke_admin(group_id, user_id, target).await
            }
        }
    }

    /// Store a message from a member. A `client_id` the sender already used
    /// returns the original; one used by someone else is refused.
    pub async fn send_message(
        &self,
        group_id: Uuid,
        sender_id: Uuid,
        client_id: Uuid,
        content: &str,
    ) -> Result<(Message, bool), ActionError> {
        self.allocator.group(group_id).await?;
        if self.store.get_membership(group_id, sender_id)?.is_none() {
            return Err(ActionError::unauthorized("only members can post in this group"));
        }

        let content = content.trim();
        if content.is_empty() {
            return Err(ActionError::validation("message content is required"));
        }
        if content.chars().count() > MAX_MESSAGE_LEN {
            return Err(ActionError::validation(format!(
                "message exceeds {MAX_MESSAGE_LEN} characters"
            )));
        }

        let message = Message::new(group_id, sender_id, client_id, content);
        let (message, created) = self.store.insert_message(&message)?;
        if !created {
            if message.sender_id != sender_id {
                log::warn!("{sender_id} reused client id {client_id} of {} in {group_id}", message.sender_id);
                return Err(ActionError::validation("client id already used by another sender"));
            }
            log::debug!("duplicate client id {client_id} in {group_id}, returning original");
        }
        Ok((message, created))
    }

    pub async fn history(&self, group_id: Uuid, limit: usize) -> Result<Vec<Message>, ActionError> {
        self.allocator.group(group_id).await?;
        Ok(self.store.messages(group_id, limit)?)
    }

    pub fn update_profile(&self, user_id: Uuid, display_name: &str) -> Result<String, ActionError> {
        let name = display_name.trim();
        if name.is_empty() {
            return Err(ActionError::validation("display name is required"));
        }
        if name.chars().count() > MAX_DISPLAY_NAME_LEN {
            return Err(ActionError::validation(format!(
                "display name exceeds {MAX_DISPLAY_NAME_LEN} characters"
            )));
        }
        let mut names = self
            .display_names
            .write()
            .map_err(|_| ActionError::transient("profile table unavailable"))?;
        names.insert(user_id, name.to_string());
        Ok(name.to_string())
    }

    pub fn display_name(&self, user_id: Uuid) -> Option<String> {
        self.display_names.read().ok()?.get(&user_id).cloned()
    }
}
