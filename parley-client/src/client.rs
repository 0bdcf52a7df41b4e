//! WebSocket client for the parley hub.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect) with a `watch<bool>` network
//!   signal the [`Reconciler`](crate::Reconciler) can follow
//! - Request/ack correlation: every request carries a `requestId` and waits
//!   for its single `ack`
//! - Hub broadcasts delivered as [`ClientEvent`]s
//!
//! [`HubClient`] is also an [`ActionDispatcher`], so queued actions replay
//! over the same socket the user is connected through.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use parley_core::{Action, ActionError, Group, Membership, Message};
use parley_hub::{FrameType, HubEvent, InboundFrame, ProtocolError};

use crate::reconciler::ActionDispatcher;

/// How long a request waits for its ack by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the hub client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Any hub event other than an ack.
    Hub(HubEvent),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<ClientError> for ActionError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Protocol(p) => p.into(),
            other => ActionError::transient(other.to_string()),
        }
    }
}

type AckResult = Result<Option<Value>, ActionError>;
type PendingAcks = Arc<Mutex<HashMap<String, oneshot::Sender<AckResult>>>>;

pub struct HubClient {
    user_id: Uuid,
    username: String,
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    /// Bumped on every connect; a reader only tears down its own connection
    generation: Arc<AtomicU64>,

    /// Requests waiting for their ack, by request id
    pending: PendingAcks,
    next_request: AtomicU64,
    request_timeout: Duration,

    /// Event receiver for the application
    event_rx: Mutex<Option<mpsc::Receiver<ClientEvent>>>,
    event_tx: mpsc::Sender<ClientEvent>,

    /// True while a connection is up
    network: watch::Sender<bool>,
}

impl HubClient {
    pub fn new(user_id: Uuid, username: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (network, _) = watch::channel(false);
        Self {
            user_id,
            username: username.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            event_rx: Mutex::new(Some(event_rx)),
            event_tx,
            network,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Follows connect/disconnect; feed this to [`Reconciler::run`](crate::Reconciler::run).
    pub fn network(&self) -> watch::Receiver<bool> {
        self.network.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Connect to the hub.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ClientError::Connect { url: self.server_url.clone(), reason: e.to_string() });
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        *self.outgoing_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;
        self.network.send_replace(true);
        let _ = self.event_tx.try_send(ClientEvent::Connected);
        log::info!("connected to {}", self.server_url);

        // Reader task: resolve acks, forward everything else
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let outgoing = self.outgoing_tx.clone();
        let network = self.network.clone();
        let current = self.generation.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match HubEvent::decode(text.as_str()) {
                        Ok(HubEvent::Ack { request_id, ok, error, result }) => {
                            let outcome = if ok {
                                Ok(result)
                            } else {
                                Err(error
                                    .map(|e| e.into_action_error())
                                    .unwrap_or_else(|| ActionError::transient("request failed")))
                            };
                            resolve(&pending, &request_id, outcome);
                        }
                        Ok(event) => {
                            if event_tx.try_send(ClientEvent::Hub(event)).is_err() {
                                log::warn!("client event channel full; dropping hub event");
                            }
                        }
                        Err(e) => log::warn!("undecodable hub event: {e}"),
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            outgoing.lock().unwrap_or_else(PoisonError::into_inner).take();
            fail_all(&pending, "connection closed");
            *state.write().await = ConnectionState::Disconnected;
            network.send_replace(false);
            let _ = event_tx.try_send(ClientEvent::Disconnected);
            log::info!("disconnected from hub");
        });

        Ok(())
    }

    /// Close the connection. Outstanding requests fail as transient.
    pub async fn disconnect(&self) {
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        fail_all(&self.pending, "disconnected");
        *self.state.write().await = ConnectionState::Disconnected;
        self.network.send_replace(false);
    }

    /// Send `frame` and wait for its ack.
    pub async fn request(&self, mut frame: InboundFrame) -> Result<Option<Value>, ActionError> {
        let tx = self
            .outgoing_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::NotConnected)?;

        let request_id = format!("c-{}", self.next_request.fetch_add(1, Ordering::Relaxed));
        frame.request_id = Some(request_id.clone());
        let text = frame.encode().map_err(ClientError::from)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.clone(), ack_tx);

        log::debug!("-> {:?} ({request_id})", frame.frame_type);
        if tx.send(text).await.is_err() {
            self.forget(&request_id);
            return Err(ClientError::NotConnected.into());
        }

        match tokio::time::timeout(self.request_timeout, ack_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ActionError::transient("connection closed")),
            Err(_) => {
                self.forget(&request_id);
                Err(ActionError::transient(format!("no ack for {request_id} within {:?}", self.request_timeout)))
            }
        }
    }

    fn forget(&self, request_id: &str) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(request_id);
    }

    fn frame(&self, frame_type: FrameType) -> InboundFrame {
        InboundFrame::new(frame_type, self.user_id, self.username.as_str())
    }

    // ─── Convenience verbs ────────────────────────────────────────────

    pub async fn ping(&self) -> Result<(), ActionError> {
        self.request(self.frame(FrameType::Ping)).await.map(|_| ())
    }

    pub async fn create_group(&self, name: &str, language: &str) -> Result<Group, ActionError> {
        let frame = self
            .frame(FrameType::CreateGroup)
            .with_payload(json!({ "name": name, "language": language }));
        decode_result(self.request(frame).await?)
    }

    /// Join a group (if needed) and its room.
    pub async fn join_group(&self, group_id: Uuid) -> Result<Membership, ActionError> {
        let frame = self.frame(FrameType::JoinGroup).with_group(group_id);
        decode_result(self.request(frame).await?)
    }

    pub async fn send_message(&self, group_id: Uuid, content: &str) -> Result<Message, ActionError> {
        let frame = InboundFrame::from_action(&Action::send_message(group_id, content), self.user_id, &self.username);
        decode_result(self.request(frame).await?)
    }

    pub async fn leave_room(&self, group_id: Uuid) -> Result<(), ActionError> {
        self.request(self.frame(FrameType::LeaveRoom).with_group(group_id)).await.map(|_| ())
    }

    pub async fn set_typing(&self, typing: bool) -> Result<(), ActionError> {
        let frame_type = if typing { FrameType::TypingStart } else { FrameType::TypingStop };
        self.request(self.frame(frame_type)).await.map(|_| ())
    }
}

impl ActionDispatcher for HubClient {
    async fn dispatch(&self, action: &Action) -> Result<(), ActionError> {
        let frame = InboundFrame::from_action(action, self.user_id, &self.username);
        self.request(frame).await.map(|_| ())
    }
}

fn resolve(pending: &PendingAcks, request_id: &str, outcome: AckResult) {
    let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(request_id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(outcome);
        }
        None => log::debug!("ack for unknown request {request_id}"),
    }
}

fn fail_all(pending: &PendingAcks, reason: &str) {
    let waiters: Vec<_> = pending.lock().unwrap_or_else(PoisonError::into_inner).drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(ActionError::transient(reason)));
    }
}

fn decode_result<T: serde::de::DeserializeOwned>(result: Option<Value>) -> Result<T, ActionError> {
    let value = result.ok_or_else(|| ActionError::validation("ack carried no result"))?;
    serde_json::from_value(value).map_err(|e| ActionError::validation(format!("unexpected ack result: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = HubClient::new(Uuid::new_v4(), "Ana", "ws://127.0.0.1:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(!*client.network().borrow());
        assert_eq!(client.server_url(), "ws://127.0.0.1:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_request_while_disconnected_is_transient() {
        let client = HubClient::new(Uuid::new_v4(), "Ana", "ws://127.0.0.1:9090");
        let err = client.ping().await.unwrap_err();
        assert!(err.is_retryable());

        let err = client.dispatch(&Action::JoinGroup { group_id: Uuid::new_v4() }).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // Port 9 (discard) is essentially never a WebSocket server.
        let client = HubClient::new(Uuid::new_v4(), "Ana", "ws://127.0.0.1:9");
        assert!(matches!(client.connect().await, Err(ClientError::Connect { .. })));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn test_resolve_and_fail_all() {
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        pending.lock().unwrap().insert("c-1".into(), tx1);
        pending.lock().unwrap().insert("c-2".into(), tx2);

        resolve(&pending, "c-1", Ok(Some(json!({ "ok": 1 }))));
        assert_eq!(rx1.try_recv().unwrap(), Ok(Some(json!({ "ok": 1 }))));

        fail_all(&pending, "gone");
        assert_eq!(rx2.try_recv().unwrap(), Err(ActionError::transient("gone")));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_decode_result() {
        let group = Group::new(Uuid::new_v4(), "Tertulia", "es");
        let decoded: Group = decode_result(Some(serde_json::to_value(&group).unwrap())).unwrap();
        assert_eq!(decoded, group);
        assert!(decode_result::<Group>(None).is_err());
    }
}
