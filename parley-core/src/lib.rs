//! # parley-core — Conversation groups, seats and membership rules
//!
//! The authoritative half of Parley: every membership and seat change funnels
//! through the [`allocator::SeatAllocator`], which keeps "one seat, one
//! occupant" true against any [`store::Store`].
//!
//! ## Architecture
//!
//! ```text
//!  gateway / reconciler
//!          │  Action
//!          ▼
//! ┌─────────────────┐     ┌─────────────────┐     ┌──────────────────┐
//! │ ActionService   │────►│ SeatAllocator   │────►│ Store            │
//! │ (validation,    │     │ (per-group lock,│     │ (MemoryStore |   │
//! │  messages)      │     │  claim/write/   │     │  RocksStore,     │
//! └─────────────────┘     │  release)       │     │  seat CAS)       │
//!                         └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`] — Groups, memberships, seat state and messages
//! - [`error`] — Error taxonomy (`Validation`, `Conflict`, `Transient`, ...)
//! - [`store`] — Membership store traits, in-memory and RocksDB backends
//! - [`allocator`] — Seat state machine
//! - [`action`] — Replayable client actions
//! - [`service`] — Applies actions on behalf of a user

pub mod action;
pub mod allocator;
pub mod error;
pub mod model;
pub mod service;
pub mod store;

// Re-exports for convenience
pub use action::{Action, ActionType, SeatAction};
pub use allocator::{MembershipEvent, SeatAllocator, Transition};
pub use error::{ActionError, Conflict, ErrorKind, StoreError};
pub use model::{
    Group, HoldKind, InvalidSeat, Membership, Message, Role, Seat, SeatHold, SeatState,
    GROUP_CAPACITY,
};
pub use service::{ActionOutcome, ActionService};
pub use store::{
    MemoryStore, MembershipStore, MessageStore, RocksStore, SeatCommit, Store, StoreConfig,
};
