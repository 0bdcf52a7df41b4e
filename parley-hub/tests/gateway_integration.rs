//! End-to-end tests for the WebSocket gateway.
//!
//! These tests start a real server on a free port and talk to it with raw
//! WebSocket clients speaking the JSON frame protocol.

use futures_util::{SinkExt, StreamExt};
use parley_hub::protocol::{FrameType, HubEvent, InboundFrame};
use parley_hub::{HubServer, ServerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start an in-memory server on a free port.
async fn start_test_server() -> (u16, Arc<HubServer>) {
    let server = Arc::new(HubServer::in_memory(ServerConfig::with_addr("127.0.0.1:0")));
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = server.clone();
    tokio::spawn(async move {
        handle.serve(listener, std::future::pending()).await.unwrap();
    });
    (port, server)
}

struct Peer {
    ws: Ws,
    user_id: Uuid,
    name: String,
    next_request: u32,
}

impl Peer {
    async fn connect(port: u16, name: &str) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}"))
            .await
            .unwrap();
        Self { ws, user_id: Uuid::new_v4(), name: name.to_string(), next_request: 0 }
    }

    fn frame(&self, frame_type: FrameType) -> InboundFrame {
        InboundFrame::new(frame_type, self.user_id, &self.name)
    }

    async fn send(&mut self, frame: &InboundFrame) {
        self.ws.send(Message::text(frame.encode().unwrap())).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_string())).await.unwrap();
    }

    async fn next_event(&mut self) -> HubEvent {
        loop {
            let msg = timeout(Duration::from_secs(2), self.ws.next())
                .await
                .expect("timed out waiting for an event")
                .expect("connection closed")
                .unwrap();
            if let Message::Text(text) = msg {
                return HubEvent::decode(text.as_str()).unwrap();
            }
        }
    }

    /// Send with a fresh request id; return the events seen before the ack,
    /// and the ack itself.
    async fn request(&mut self, frame: InboundFrame) -> (Vec<HubEvent>, HubEvent) {
        self.next_request += 1;
        let request_id = format!("{}-{}", self.name, self.next_request);
        self.send(&frame.with_request_id(request_id.clone())).await;
        self.until_ack(&request_id).await
    }

    async fn until_ack(&mut self, request_id: &str) -> (Vec<HubEvent>, HubEvent) {
        let mut seen = Vec::new();
        loop {
            match self.next_event().await {
                HubEvent::Ack { request_id: id, .. } if id != request_id => {
                    panic!("ack for unexpected request {id}")
                }
                ack @ HubEvent::Ack { .. } => return (seen, ack),
                other => seen.push(other),
            }
        }
    }

    /// Round-trip a ping so everything sent before it has been received.
    async fn sync(&mut self) -> Vec<HubEvent> {
        let (seen, _) = self.request(self.frame(FrameType::Ping)).await;
        seen.into_iter().filter(|e| !matches!(e, HubEvent::Pong { .. })).collect()
    }

    async fn create_group(&mut self, name: &str) -> Uuid {
        let frame = self
            .frame(FrameType::CreateGroup)
            .with_payload(json!({ "name": name, "language": "es" }));
        let (_, ack) = self.request(frame).await;
        let result = ack_result(&ack);
        result["id"].as_str().unwrap().parse().unwrap()
    }

    async fn join(&mut self, group_id: Uuid) -> Vec<HubEvent> {
        let (seen, ack) = self.request(self.frame(FrameType::JoinGroup).with_group(group_id)).await;
        ack_result(&ack);
        seen
    }
}

fn ack_result(ack: &HubEvent) -> Value {
    match ack {
        HubEvent::Ack { ok: true, result, .. } => result.clone().unwrap_or(Value::Null),
        other => panic!("expected successful ack, got {other:?}"),
    }
}

fn ack_error_kind(ack: &HubEvent) -> String {
    match ack {
        HubEvent::Ack { ok: false, error: Some(error), .. } => {
            serde_json::to_value(error.kind).unwrap().as_str().unwrap().to_string()
        }
        other => panic!("expected failed ack, got {other:?}"),
    }
}

fn count(events: &[HubEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

/// Owner with a group, already in its room.
async fn room_with_owner(port: u16) -> (Peer, Uuid) {
    let mut owner = Peer::connect(port, "owner").await;
    let group_id = owner.create_group("Spanish club").await;
    owner.join(group_id).await;
    (owner, group_id)
}

#[tokio::test]
async fn test_ping_gets_pong_then_ack() {
    let (port, _server) = start_test_server().await;
    let mut peer = Peer::connect(port, "ana").await;

    let (seen, ack) = peer.request(peer.frame(FrameType::Ping)).await;
    assert_eq!(count(&seen, "pong"), 1);
    ack_result(&ack);
}

#[tokio::test]
async fn test_joiner_gets_snapshot_and_others_see_join() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;

    let seen = ana.join(group_id).await;
    match seen.as_slice() {
        [HubEvent::OnlineUsers { users, .. }] => assert_eq!(users.len(), 2),
        other => panic!("expected one online_users snapshot, got {other:?}"),
    }

    let owner_events = owner.sync().await;
    assert_eq!(count(&owner_events, "seat_update"), 1);
    assert_eq!(count(&owner_events, "user_joined"), 1);
    assert_eq!(server.hub().online_users(group_id).len(), 2);
}

#[tokio::test]
async fn test_join_twice_announces_once() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;

    ana.join(group_id).await;
    let second = ana.join(group_id).await;
    assert!(second.is_empty(), "second join produced {second:?}");

    let owner_events = owner.sync().await;
    assert_eq!(count(&owner_events, "user_joined"), 1);
    assert_eq!(count(&owner_events, "seat_update"), 1);
    assert_eq!(server.hub().online_users(group_id).len(), 2);
}

#[tokio::test]
async fn test_typing_updates_carry_full_list() {
    let (port, _server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;
    ana.join(group_id).await;
    owner.sync().await;

    ana.request(ana.frame(FrameType::TypingStart).with_group(group_id)).await;
    owner.request(owner.frame(FrameType::TypingStart).with_group(group_id)).await;
    // The update caused by a frame arrives before that frame's ack.
    let (seen, _) = ana.request(ana.frame(FrameType::TypingStop).with_group(group_id)).await;

    let last = seen
        .into_iter()
        .filter_map(|e| match e {
            HubEvent::TypingUpdate { users, .. } => Some(users),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].user_id, owner.user_id);
}

#[tokio::test]
async fn test_messages_dedupe_on_client_id() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;
    ana.join(group_id).await;
    owner.sync().await;

    let client_id = Uuid::new_v4();
    let frame = ana
        .frame(FrameType::SendMessage)
        .with_group(group_id)
        .with_payload(json!({ "content": "hola", "clientId": client_id }));
    let (_, first) = ana.request(frame.clone()).await;
    let (_, second) = ana.request(frame).await;
    assert_eq!(ack_result(&first)["id"], ack_result(&second)["id"]);

    let owner_events = owner.sync().await;
    assert_eq!(count(&owner_events, "new_message"), 1);
    assert_eq!(server.service().history(group_id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_request_seat_vs_promote_single_winner() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;
    let mut ben = Peer::connect(port, "ben").await;
    ana.join(group_id).await;
    ben.join(group_id).await;

    let request = ana
        .frame(FrameType::RequestSeat)
        .with_group(group_id)
        .with_payload(json!({ "seat": 3 }));
    let promote = owner
        .frame(FrameType::Promote)
        .with_group(group_id)
        .with_payload(json!({ "userId": ben.user_id, "seat": 3 }));

    let ((_, request_ack), (_, promote_ack)) =
        tokio::join!(ana.request(request), owner.request(promote));

    let oks = [&request_ack, &promote_ack]
        .iter()
        .filter(|a| matches!(a, HubEvent::Ack { ok: true, .. }))
        .count();
    assert_eq!(oks, 1, "request: {request_ack:?}, promote: {promote_ack:?}");
    let loser = if matches!(request_ack, HubEvent::Ack { ok: true, .. }) { &promote_ack } else { &request_ack };
    assert_eq!(ack_error_kind(loser), "conflict");

    let members = server.service().allocator().members(group_id).await.unwrap();
    let holders = members
        .iter()
        .filter(|m| m.seat.hold_for(m.user_id).map(|(s, _)| s.index()) == Some(3))
        .count();
    assert_eq!(holders, 1);
}

#[tokio::test]
async fn test_kick_evicts_from_room() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;
    ana.join(group_id).await;

    let kick = owner
        .frame(FrameType::Kick)
        .with_group(group_id)
        .with_payload(json!({ "userId": ana.user_id }));
    let (_, ack) = owner.request(kick).await;
    ack_result(&ack);

    let ana_events = ana.sync().await;
    assert_eq!(count(&ana_events, "member_removed"), 1);
    assert_eq!(server.hub().online_users(group_id).len(), 1);

    let (_, ack) = ana.request(ana.frame(FrameType::TypingStart).with_group(group_id)).await;
    assert_eq!(ack_error_kind(&ack), "validation");
}

#[tokio::test]
async fn test_owner_cannot_leave() {
    let (port, _server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;

    let (_, ack) = owner.request(owner.frame(FrameType::LeaveGroup).with_group(group_id)).await;
    assert_eq!(ack_error_kind(&ack), "conflict");
    match ack {
        HubEvent::Ack { error: Some(error), .. } => {
            assert_eq!(serde_json::to_value(error.conflict).unwrap(), json!("owner_cannot_leave"));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_still_acked() {
    let (port, _server) = start_test_server().await;
    let mut peer = Peer::connect(port, "ana").await;

    peer.send_raw(r#"{"type":"launch_rocket","userId":"00000000-0000-0000-0000-000000000000","requestId":"bad-1"}"#)
        .await;
    let (_, ack) = peer.until_ack("bad-1").await;
    assert_eq!(ack_error_kind(&ack), "validation");

    peer.send_raw("not json").await;
    assert!(matches!(peer.next_event().await, HubEvent::Error { .. }));
}

#[tokio::test]
async fn test_connection_is_bound_to_first_user() {
    let (port, _server) = start_test_server().await;
    let mut peer = Peer::connect(port, "ana").await;
    peer.sync().await;

    let impostor = InboundFrame::new(FrameType::Ping, Uuid::new_v4(), "mallory");
    let (_, ack) = peer.request(impostor).await;
    assert_eq!(ack_error_kind(&ack), "authorization");
}

#[tokio::test]
async fn test_disconnect_announces_leave() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;
    ana.join(group_id).await;
    owner.sync().await;

    ana.ws.close(None).await.unwrap();
    drop(ana);

    loop {
        if let HubEvent::UserLeft { user, .. } = owner.next_event().await {
            assert_eq!(user.username, "ana");
            break;
        }
    }
    assert_eq!(server.hub().online_users(group_id).len(), 1);
}

#[tokio::test]
async fn test_delete_group_notifies_room() {
    let (port, server) = start_test_server().await;
    let (mut owner, group_id) = room_with_owner(port).await;
    let mut ana = Peer::connect(port, "ana").await;
    ana.join(group_id).await;

    let (_, ack) = owner.request(owner.frame(FrameType::DeleteGroup).with_group(group_id)).await;
    ack_result(&ack);

    let ana_events = ana.sync().await;
    assert_eq!(count(&ana_events, "group_deleted"), 1);
    assert!(server.hub().online_users(group_id).is_empty());
    assert!(server.service().allocator().group(group_id).await.is_err());
}
