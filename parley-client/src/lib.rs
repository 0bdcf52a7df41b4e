//! # parley-client — Offline-first client for parley hubs
//!
//! Mutating actions taken while offline are written to a durable local
//! queue and replayed in order once the hub is reachable again.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐ execute ┌──────────────┐ dispatch ┌───────────┐  ws  ┌─────┐
//! │    app     │────────►│  Reconciler  │─────────►│ HubClient │─────►│ hub │
//! └────────────┘         └──────┬───────┘          └─────┬─────┘      └─────┘
//!                               │ append / drain         │ network watch
//!                        ┌──────▼───────┐                │
//!                        │ OfflineQueue │◄───────────────┘ (drain on reconnect)
//!                        │  (RocksDB)   │
//!                        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`queue`] — Durable offline queue with dead letters
//! - [`reconciler`] — Drain loop and dispatchers
//! - [`client`] — WebSocket hub client

pub mod client;
pub mod queue;
pub mod reconciler;

// Re-exports for convenience
pub use client::{ClientError, ClientEvent, ConnectionState, HubClient};
pub use queue::{OfflineAction, OfflineQueue, QueueConfig, QueueError, QueueStore, SyncStats};
pub use reconciler::{
    ActionDispatcher, DrainReport, DrainSummary, Execution, LocalDispatcher, Reconciler, ReconcilerEvent,
    SyncProgress,
};
