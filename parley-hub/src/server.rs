//! WebSocket transport gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                        ┌──► SeatAllocator ──► Store
//!            ├── frame ── Session ────┤       (authoritative)
//! Client B ──┘      │                 └──► PresenceHub (rooms, typing)
//!                   │                              │
//!                   ▼                              ▼  Fanout::publish
//!              ack / pong                  outbox A, outbox B, ...
//! ```
//!
//! Each connection is bound to one user by its first frame. The session
//! applies a frame, publishes the resulting events through the [`Fanout`]
//! sink, flushes whatever its own outbox collected, and only then writes
//! the frame's ack, so a client always sees the events its request caused
//! before the ack for it.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use parley_core::{
    ActionError, ActionService, MemoryStore, RocksStore, Store, StoreConfig, StoreError, Transition,
};

use crate::config::ServerConfig;
use crate::presence::{ConnectionState, Fanout, HubStats, PresenceHub};
use crate::protocol::{salvage_request_id, Command, HubEvent, InboundFrame, Payload, ProtocolError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Server statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub hub: HubStats,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_frames: AtomicU64,
}

pub struct HubServer {
    config: ServerConfig,
    hub: Arc<PresenceHub>,
    fanout: Arc<dyn Fanout>,
    service: Arc<ActionService>,
    counters: Arc<Counters>,
}

impl HubServer {
    /// Open the configured store (RocksDB if a path is set).
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn Store> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::new(path))?;
                log::info!("opened membership store at {}", path.display());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn Store>) -> Self {
        let hub = Arc::new(PresenceHub::new(config.outbox_capacity));
        Self {
            fanout: hub.clone(),
            hub,
            service: Arc::new(ActionService::with_store(store)),
            config,
            counters: Arc::default(),
        }
    }

    /// In-memory server, for tests and throwaway deployments.
    pub fn in_memory(config: ServerConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Publish room events through another sink instead of the local hub.
    pub fn with_fanout(mut self, fanout: Arc<dyn Fanout>) -> Self {
        self.fanout = fanout;
        self
    }

    pub fn hub(&self) -> &Arc<PresenceHub> {
        &self.hub
    }

    pub fn service(&self) -> &Arc<ActionService> {
        &self.service
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_frames: self.counters.total_frames.load(Ordering::Relaxed),
            hub: self.hub.stats(),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr.clone();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Bind and serve until the process is stopped.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), ServerError> {
        log::info!("hub listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            log::warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("new TCP connection from {addr}");

                    let session = Session::new(
                        self.hub.clone(),
                        self.fanout.clone(),
                        self.service.clone(),
                        self.counters.clone(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = session.run(stream, addr).await {
                            log::error!("connection error from {addr}: {e}");
                        }
                    });
                }
            }
        }
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// One client connection.
struct Session {
    connection_id: Uuid,
    /// Bound on the first frame.
    user_id: Option<Uuid>,
    outbox: Option<mpsc::Receiver<Payload>>,
    hub: Arc<PresenceHub>,
    fanout: Arc<dyn Fanout>,
    service: Arc<ActionService>,
    counters: Arc<Counters>,
}

impl Session {
    fn new(
        hub: Arc<PresenceHub>,
        fanout: Arc<dyn Fanout>,
        service: Arc<ActionService>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            user_id: None,
            outbox: None,
            hub,
            fanout,
            service,
            counters,
        }
    }

    async fn run(mut self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        log::info!("WebSocket connection {} established from {addr}", self.connection_id);

        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        self.counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let result = self.event_loop(ws_stream, addr).await;

        self.hub.disconnect(self.connection_id);
        self.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("connection {} from {addr} closed", self.connection_id);
        result
    }

    async fn event_loop(
        &mut self,
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.counters.total_frames.fetch_add(1, Ordering::Relaxed);
                            let replies = self.handle_text(text.as_str()).await;
                            self.flush_outbox(&mut ws_sender).await?;
                            for reply in replies {
                                send_event(&mut ws_sender, &reply).await?;
                            }
                        }
                        Some(Ok(WsMessage::Binary(_))) => {
                            let err = ActionError::validation("binary frames are not supported");
                            send_event(&mut ws_sender, &HubEvent::error(&err)).await?;
                        }
                        Some(Ok(WsMessage::Ping(data))) => {
                            ws_sender.send(WsMessage::Pong(data)).await?;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            log::debug!("close from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => {}
                    }
                }

                payload = async {
                    match self.outbox.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not registered yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    match payload {
                        Some(payload) => ws_sender.send(WsMessage::text(payload.to_string())).await?,
                        None => {
                            log::debug!("outbox of {} closed", self.connection_id);
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Write everything the outbox collected so far.
    async fn flush_outbox(&mut self, sink: &mut WsSink) -> Result<(), ServerError> {
        let Some(rx) = self.outbox.as_mut() else {
            return Ok(());
        };
        while let Ok(payload) = rx.try_recv() {
            sink.send(WsMessage::text(payload.to_string())).await?;
        }
        Ok(())
    }

    /// Apply one text frame. Returns the direct replies: one ack if the
    /// frame carried a request id, a pong for pings, an error event for
    /// failures nobody would otherwise hear about.
    async fn handle_text(&mut self, text: &str) -> Vec<HubEvent> {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("rejecting frame on {}: {e}", self.connection_id);
                let err = ActionError::from(e);
                return vec![match salvage_request_id(text) {
                    Some(request_id) => HubEvent::ack(request_id, &Err(err)),
                    None => HubEvent::error(&err),
                }];
            }
        };
        log::debug!("{:?} from {} on {}", frame.frame_type, frame.user_id, self.connection_id);

        let outcome = match self.bind_user(&frame) {
            Ok(()) => self.dispatch(&frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            log::debug!("{:?} from {} failed: {e}", frame.frame_type, frame.user_id);
        }

        let mut replies = Vec::with_capacity(2);
        if let Ok(Dispatched::Pong) = outcome {
            replies.push(HubEvent::Pong { timestamp: parley_core::model::unix_millis() });
        }
        match (frame.request_id, outcome) {
            (Some(request_id), outcome) => {
                replies.push(HubEvent::ack(request_id, &outcome.map(Dispatched::into_result)));
            }
            (None, Err(e)) => replies.push(HubEvent::error(&e)),
            (None, Ok(_)) => {}
        }
        replies
    }

    /// Register on the first frame; later frames must name the same user.
    fn bind_user(&mut self, frame: &InboundFrame) -> Result<(), ActionError> {
        match self.user_id {
            Some(user_id) if user_id == frame.user_id => Ok(()),
            Some(_) => Err(ActionError::unauthorized("connection is bound to another user")),
            None => {
                let username = frame.username.trim();
                let display_name = self
                    .service
                    .display_name(frame.user_id)
                    .unwrap_or_else(|| if username.is_empty() { "Anonymous".to_string() } else { username.to_string() });
                let rx = self.hub.register(self.connection_id, frame.user_id, display_name)?;
                self.outbox = Some(rx);
                self.user_id = Some(frame.user_id);
                Ok(())
            }
        }
    }

    async fn dispatch(&self, frame: &InboundFrame) -> Result<Dispatched, ActionError> {
        let user_id = frame.user_id;
        let conn = self.connection_id;

        match frame.command()? {
            Command::Ping => Ok(Dispatched::Pong),

            Command::JoinGroup { group_id } => {
                let transition = self.service.join_group(group_id, user_id).await?;
                if transition.changed() {
                    self.publish_transition(&transition);
                }
                self.hub.join_room(conn, group_id)?;
                Dispatched::json(&transition.after)
            }

            Command::LeaveGroup { group_id } => {
                let transition = self.service.allocator().leave(group_id, user_id).await?;
                self.publish_transition(&transition);
                self.hub.evict_user(group_id, user_id);
                Ok(Dispatched::Done)
            }

            Command::LeaveRoom { group_id } => {
                self.hub.leave_room(conn, group_id)?;
                Ok(Dispatched::Done)
            }

            Command::TypingStart => {
                self.hub.start_typing(conn)?;
                Ok(Dispatched::Done)
            }

            Command::TypingStop => {
                self.hub.stop_typing(conn)?;
                Ok(Dispatched::Done)
            }

            Command::SendMessage { group_id, client_id, content } => {
                let (message, created) =
                    self.service.send_message(group_id, user_id, client_id, &content).await?;
                if created {
                    self.fanout.publish(group_id, &HubEvent::NewMessage { message: message.clone() }, None);
                }
                Dispatched::json(&message)
            }

            Command::Relay { kind, payload } => {
                self.hub.relay(conn, kind, payload)?;
                Ok(Dispatched::Done)
            }

            Command::CreateGroup { name, language } => {
                let (group, _) = self.service.allocator().create_group(user_id, &name, &language).await?;
                Dispatched::json(&group)
            }

            Command::DeleteGroup { group_id } => {
                self.service.allocator().delete_group(group_id, user_id).await?;
                self.fanout.publish(group_id, &HubEvent::GroupDeleted { group_id }, None);
                self.hub.close_room(group_id);
                Ok(Dispatched::Done)
            }

            Command::Seat { group_id, action } => {
                let transition = self.service.seat_action(group_id, user_id, &action).await?;
                if transition.changed() {
                    self.publish_transition(&transition);
                }
                if transition.removed() {
                    self.hub.evict_user(group_id, transition.user_id);
                }
                Dispatched::json(&transition.after)
            }

            Command::UpdateProfile { display_name } => {
                let display_name = self.service.update_profile(user_id, &display_name)?;
                self.hub.update_display_name(conn, &display_name)?;
                if let ConnectionState::InRoom(group_id) = self.hub.connection_state(conn) {
                    let event = HubEvent::ProfileUpdated { user_id, display_name: display_name.clone() };
                    self.fanout.publish(group_id, &event, None);
                }
                Dispatched::json(&serde_json::json!({ "displayName": display_name }))
            }
        }
    }

    fn publish_transition(&self, t: &Transition) {
        let event = if t.removed() {
            HubEvent::MemberRemoved { group_id: t.group_id, user_id: t.user_id, event: t.event.clone() }
        } else {
            HubEvent::SeatUpdate {
                group_id: t.group_id,
                user_id: t.user_id,
                event: t.event.clone(),
                membership: t.after.clone(),
            }
        };
        let delivered = self.fanout.publish(t.group_id, &event, None);
        log::debug!("{} for {} in {} reached {delivered} connections", event.name(), t.user_id, t.group_id);
    }
}

/// What a frame produced, before it is turned into an ack.
enum Dispatched {
    Done,
    Pong,
    Result(Value),
}

impl Dispatched {
    fn json<T: Serialize>(value: &T) -> Result<Self, ActionError> {
        serde_json::to_value(value)
            .map(Dispatched::Result)
            .map_err(|e| ProtocolError::Serialization(e.to_string()).into())
    }

    fn into_result(self) -> Option<Value> {
        match self {
            Dispatched::Result(value) => Some(value),
            Dispatched::Done | Dispatched::Pong => None,
        }
    }
}

async fn send_event(sink: &mut WsSink, event: &HubEvent) -> Result<(), ServerError> {
    let payload = event.encode()?;
    sink.send(WsMessage::text(payload.to_string())).await?;
    Ok(())
}
