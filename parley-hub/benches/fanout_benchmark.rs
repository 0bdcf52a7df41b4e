use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parley_hub::presence::{Fanout, PresenceHub};
use parley_hub::protocol::{FrameType, HubEvent, InboundFrame, OnlineUser};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A hub with one room of `size` connections. Receivers are returned so the
/// outboxes stay open; they are drained between iterations.
fn populated_room(size: usize) -> (PresenceHub, Uuid, Vec<mpsc::Receiver<parley_hub::Payload>>) {
    let hub = PresenceHub::new(4096);
    let group_id = Uuid::new_v4();
    let mut receivers = Vec::with_capacity(size);
    for i in 0..size {
        let conn = Uuid::new_v4();
        receivers.push(hub.register(conn, Uuid::new_v4(), format!("user-{i}")).unwrap());
        hub.join_room(conn, group_id).unwrap();
    }
    (hub, group_id, receivers)
}

fn drain(receivers: &mut [mpsc::Receiver<parley_hub::Payload>]) {
    for rx in receivers {
        while rx.try_recv().is_ok() {}
    }
}

fn bench_event_encode(c: &mut Criterion) {
    let users: Vec<OnlineUser> = (0..10)
        .map(|i| OnlineUser { connection_id: Uuid::new_v4(), user_id: Uuid::new_v4(), username: format!("user-{i}") })
        .collect();
    let event = HubEvent::OnlineUsers { group_id: Uuid::new_v4(), users };

    c.bench_function("online_users_encode_10", |b| {
        b.iter(|| black_box(black_box(&event).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = InboundFrame::new(FrameType::Promote, Uuid::new_v4(), "Ana")
        .with_group(Uuid::new_v4())
        .with_payload(json!({ "userId": Uuid::new_v4(), "seat": 4 }))
        .with_request_id("r-1")
        .encode()
        .unwrap();

    c.bench_function("seat_frame_decode_and_validate", |b| {
        b.iter(|| {
            let frame = InboundFrame::decode(black_box(&frame)).unwrap();
            black_box(frame.command().unwrap());
        })
    });
}

fn bench_room_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_fanout");
    for size in [10usize, 100, 1000] {
        let (hub, group_id, mut receivers) = populated_room(size);
        drain(&mut receivers);
        let event = HubEvent::relay(
            parley_hub::RelayKind::EmojiBurst,
            group_id,
            Uuid::new_v4(),
            json!({ "emoji": "🎉" }),
        );
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                black_box(hub.publish(group_id, &event, None));
                drain(&mut receivers);
            })
        });
    }
    group.finish();
}

fn bench_typing_churn(c: &mut Criterion) {
    let (hub, group_id, mut receivers) = populated_room(20);
    let conn = Uuid::new_v4();
    receivers.push(hub.register(conn, Uuid::new_v4(), "typist").unwrap());
    hub.join_room(conn, group_id).unwrap();
    drain(&mut receivers);

    c.bench_function("typing_start_stop_20", |b| {
        b.iter(|| {
            hub.start_typing(conn).unwrap();
            hub.stop_typing(conn).unwrap();
            drain(&mut receivers);
        })
    });
}

criterion_group!(benches, bench_event_encode, bench_frame_decode, bench_room_fanout, bench_typing_churn);
criterion_main!(benches);
