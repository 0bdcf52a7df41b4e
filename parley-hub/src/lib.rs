//! # parley-hub — Realtime presence and fan-out for conversation groups
//!
//! WebSocket gateway in front of [`parley_core`]. Membership and seat
//! changes are applied by the core allocator; this crate tracks who is
//! connected where and fans events out to rooms.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  JSON frames  ┌──────────────┐  verbs  ┌──────────────────┐
//! │ Client A │◄─────────────►│              │────────►│ ActionService /  │
//! └──────────┘               │  HubServer   │         │ SeatAllocator    │
//! ┌──────────┐               │  (Session    │         └──────────────────┘
//! │ Client B │◄─────────────►│   per conn)  │
//! └──────────┘               └──────┬───────┘
//!                                   │ Fanout
//!                            ┌──────▼───────┐
//!                            │ PresenceHub  │  rooms, typing, outboxes
//!                            └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Inbound frames and outbound events
//! - [`broadcast`] — Per-connection outboxes and room fan-out
//! - [`presence`] — Connection registry and room membership
//! - [`server`] — WebSocket gateway
//! - [`config`] — Server configuration and CLI

pub mod broadcast;
pub mod config;
pub mod presence;
pub mod protocol;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, Outbox, Room, RoomManager};
pub use config::{Cli, ServerConfig};
pub use presence::{ConnectedClient, ConnectionState, Fanout, HubError, HubStats, PresenceHub};
pub use protocol::{
    AckError, Command, FrameType, HubEvent, InboundFrame, OnlineUser, Payload, ProtocolError, RelayKind,
};
pub use server::{HubServer, ServerError, ServerStats};
