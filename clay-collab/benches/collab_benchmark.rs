use criterion::{criterion_group, criterion_main, Criterion};
use clay_collab::broadcast::{BroadcastGroup, Envelope};
use clay_collab::mesh::MeshState;
use clay_collab::protocol::{ClientMessage, ServerMessage, VertexUpdate};
use clay_collab::session::{CycleConfig, Session};
use clay_collab::storage::{MeshStore, RocksMeshStore, StoreConfig};
use std::hint::black_box;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

fn bench_vertex_edit_encode(c: &mut Criterion) {
    let msg = ClientMessage::vertex_edit(42, [0.1, 0.2, 0.3]);

    c.bench_function("vertex_edit_encode_bincode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
    c.bench_function("vertex_edit_encode_json", |b| {
        b.iter(|| black_box(black_box(&msg).to_json().unwrap()))
    });
}

fn bench_vertex_edit_decode(c: &mut Criterion) {
    let msg = ClientMessage::vertex_edit(42, [0.1, 0.2, 0.3]);
    let encoded = msg.encode().unwrap();
    let json = msg.to_json().unwrap();

    c.bench_function("vertex_edit_decode_bincode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&encoded)).unwrap()))
    });
    c.bench_function("vertex_edit_decode_json", |b| {
        b.iter(|| black_box(ClientMessage::from_json(black_box(&json)).unwrap()))
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let msg = ServerMessage::MeshSnapshot {
        mesh: MeshState::default(),
    };

    c.bench_function("snapshot_encode_default_sphere", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_uv_sphere(c: &mut Criterion) {
    c.bench_function("uv_sphere_16x32", |b| {
        b.iter(|| black_box(MeshState::uv_sphere(black_box(1.0), 16, 32)))
    });
}

fn bench_obj_export(c: &mut Criterion) {
    let mesh = MeshState::default();
    c.bench_function("obj_export_default_sphere", |b| {
        b.iter(|| black_box(black_box(&mesh).to_obj()))
    });
}

fn bench_session_edits(c: &mut Criterion) {
    let cycle = CycleConfig::default();
    let conn = Uuid::new_v4();
    let t0 = Instant::now();
    let mut session = Session::new("bench", MeshState::default(), t0);
    let vertex_count = session.mesh().vertex_count() as u32;

    c.bench_function("session_apply_1000_edits", |b| {
        b.iter(|| {
            for i in 0..1000u32 {
                let effects = session.apply_vertex_edit(
                    conn,
                    i % vertex_count,
                    Some([i as f32, 0.0, 0.0]),
                    t0 + Duration::from_micros(i as u64),
                    &cycle,
                    &MeshState::default,
                );
                black_box(effects);
            }
        })
    });

    let batch: Vec<VertexUpdate> = (0..vertex_count)
        .map(|i| VertexUpdate::new(i, [0.0, i as f32, 0.0]))
        .collect();
    c.bench_function("session_apply_full_batch", |b| {
        b.iter(|| black_box(session.apply_batch(conn, &batch, t0, &cycle, &MeshState::default)))
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let group = BroadcastGroup::new(2048);
    let mut receivers: Vec<_> = (0..100).map(|_| group.join(Uuid::new_v4())).collect();

    c.bench_function("broadcast_1000_relays_100_members", |b| {
        b.iter(|| {
            for i in 0..1000u32 {
                group.publish(Envelope {
                    exclude: None,
                    message: ServerMessage::VertexRelay {
                        vertex_index: i,
                        position: [0.0; 3],
                    },
                });
            }
            // Keep receivers from lagging across iterations
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_rocks_store(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksMeshStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let mesh = MeshState::default();

    c.bench_function("rocks_store_default_sphere", |b| {
        b.iter(|| store.store(black_box("bench"), black_box(&mesh)).unwrap())
    });
    c.bench_function("rocks_load_default_sphere", |b| {
        b.iter(|| black_box(store.load(black_box("bench")).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_vertex_edit_encode,
    bench_vertex_edit_decode,
    bench_snapshot_encode,
    bench_uv_sphere,
    bench_obj_export,
    bench_session_edits,
    bench_broadcast_1000_messages,
    bench_rocks_store,
);
criterion_main!(benches);
