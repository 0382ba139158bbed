//! Integration tests for end-to-end WebSocket sessions.
//!
//! These tests start a real server and connect real clients,
//! verifying attach, relay, phase cycling, export and reset over the wire.

use clay_collab::client::{ClayClient, ClientEvent, ConnectionState};
use clay_collab::mesh::MeshState;
use clay_collab::protocol::{Codec, Phase, ServerMessage, VertexUpdate};
use clay_collab::server::{ServerConfig, SyncServer};
use clay_collab::session::CycleConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return it with its URL.
async fn start_test_server(cycle: CycleConfig) -> (Arc<SyncServer>, String) {
    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        cycle,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let runner = server.clone();
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, format!("ws://127.0.0.1:{port}"))
}

fn long_cycle() -> CycleConfig {
    CycleConfig {
        edit_duration: Duration::from_secs(300),
        freeze_duration: Duration::from_secs(60),
        persist_debounce: Duration::from_millis(2000),
    }
}

/// Connect, attach, and wait for the initial snapshot and status.
async fn attached_client(
    url: &str,
    session: &str,
    codec: Codec,
) -> (ClayClient, mpsc::Receiver<ClientEvent>) {
    let mut client = ClayClient::with_codec(url, codec);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    client.attach(session).await.unwrap();
    wait_for(&mut events, |m| matches!(m, ServerMessage::MeshSnapshot { .. })).await;
    wait_for(&mut events, |m| matches!(m, ServerMessage::PhaseStatus(_))).await;
    (client, events)
}

/// Next server message matching `pred`, skipping everything else.
async fn wait_for<F>(events: &mut mpsc::Receiver<ClientEvent>, mut pred: F) -> ServerMessage
where
    F: FnMut(&ServerMessage) -> bool,
{
    let found = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ClientEvent::Message(m)) if pred(&m) => return m,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for server message")
}

/// Every server message received within `window`.
async fn collect_for(events: &mut mpsc::Receiver<ClientEvent>, window: Duration) -> Vec<ServerMessage> {
    let mut seen = Vec::new();
    while let Ok(Some(event)) = timeout(window, events.recv()).await {
        if let ClientEvent::Message(m) = event {
            seen.push(m);
        }
    }
    seen
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let (_server, url) = start_test_server(long_cycle()).await;

    // Connect raw WebSocket
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_attach_receives_snapshot_and_status() {
    let (server, url) = start_test_server(long_cycle()).await;

    let mut client = ClayClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(events.recv().await, Some(ClientEvent::Connected));
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    client.attach("room-a").await.unwrap();

    match wait_for(&mut events, |m| matches!(m, ServerMessage::MeshSnapshot { .. })).await {
        ServerMessage::MeshSnapshot { mesh } => assert_eq!(mesh, MeshState::default()),
        _ => unreachable!(),
    }
    match wait_for(&mut events, |m| matches!(m, ServerMessage::PhaseStatus(_))).await {
        ServerMessage::PhaseStatus(status) => {
            assert_eq!(status.phase, Phase::Editing);
            assert!(status.time_remaining_ms > 290_000);
            assert_eq!(status.edit_duration_ms, 300_000);
        }
        _ => unreachable!(),
    }

    assert!(server.engine().contains("room-a"));
    assert_eq!(client.local_mesh().await, Some(MeshState::default()));
}

#[tokio::test]
async fn test_edit_relayed_to_others_only() {
    let (server, url) = start_test_server(long_cycle()).await;
    let (alice, mut alice_events) = attached_client(&url, "s1", Codec::Binary).await;
    let (bob, mut bob_events) = attached_client(&url, "s1", Codec::Binary).await;

    alice.send_vertex_edit(0, [1.0, 2.0, 3.0]).await.unwrap();

    let relay = wait_for(&mut bob_events, |m| matches!(m, ServerMessage::VertexRelay { .. })).await;
    assert_eq!(
        relay,
        ServerMessage::VertexRelay {
            vertex_index: 0,
            position: [1.0, 2.0, 3.0]
        }
    );
    assert_eq!(bob.local_mesh().await.unwrap().vertex(0), Some([1.0, 2.0, 3.0]));

    // No echo to the sender
    let echoed = collect_for(&mut alice_events, Duration::from_millis(200)).await;
    assert!(!echoed
        .iter()
        .any(|m| matches!(m, ServerMessage::VertexRelay { .. })));

    let mesh = server.engine().mesh("s1").unwrap();
    assert_eq!(mesh.vertex(0), Some([1.0, 2.0, 3.0]));
    assert_eq!(mesh.vertex(1), MeshState::default().vertex(1));
}

#[tokio::test]
async fn test_json_and_binary_clients_share_a_session() {
    let (_server, url) = start_test_server(long_cycle()).await;
    let (json, _json_events) = attached_client(&url, "mixed", Codec::Json).await;
    let (_binary, mut binary_events) = attached_client(&url, "mixed", Codec::Binary).await;

    json.send_batch(vec![
        VertexUpdate::new(5, [0.0, 1.0, 0.0]),
        VertexUpdate::new(6, [0.0, 2.0, 0.0]),
    ])
    .await
    .unwrap();

    match wait_for(&mut binary_events, |m| matches!(m, ServerMessage::BatchRelay { .. })).await {
        ServerMessage::BatchRelay { updates } => {
            assert_eq!(updates.len(), 2);
            assert_eq!(updates[1].vertex_index, 6);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let (_server, url) = start_test_server(long_cycle()).await;
    let (a, _a_events) = attached_client(&url, "one", Codec::Binary).await;
    let (_b, mut b_events) = attached_client(&url, "two", Codec::Binary).await;

    a.send_vertex_edit(0, [7.0, 7.0, 7.0]).await.unwrap();

    let seen = collect_for(&mut b_events, Duration::from_millis(200)).await;
    assert!(seen.is_empty(), "session two saw {seen:?}");
}

#[tokio::test]
async fn test_export_rejected_while_editing() {
    let (_server, url) = start_test_server(long_cycle()).await;
    let (client, mut events) = attached_client(&url, "early", Codec::Binary).await;

    client.request_export().await.unwrap();

    match wait_for(&mut events, |m| matches!(m, ServerMessage::Rejected { .. })).await {
        ServerMessage::Rejected { reason } => assert!(reason.contains("frozen")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_full_cycle_over_the_wire() {
    let cycle = CycleConfig {
        edit_duration: Duration::from_millis(800),
        freeze_duration: Duration::from_millis(800),
        persist_debounce: Duration::from_millis(2000),
    };
    let (_server, url) = start_test_server(cycle).await;
    let (client, mut events) = attached_client(&url, "cycle", Codec::Json).await;

    client.send_vertex_edit(0, [1.0, 2.0, 3.0]).await.unwrap();

    wait_for(&mut events, |m| {
        matches!(m, ServerMessage::PhaseStatus(s) if s.phase == Phase::Frozen)
    })
    .await;

    // Frozen edits bounce with a status
    client.send_vertex_edit(1, [9.0, 9.0, 9.0]).await.unwrap();
    wait_for(&mut events, |m| {
        matches!(m, ServerMessage::PhaseStatus(s) if s.phase == Phase::Frozen)
    })
    .await;

    client.request_export().await.unwrap();
    let obj = match wait_for(&mut events, |m| matches!(m, ServerMessage::Exported { .. })).await {
        ServerMessage::Exported { obj } => obj,
        _ => unreachable!(),
    };
    let exported = MeshState::from_obj(&obj).unwrap();
    assert_eq!(exported.vertex(0), Some([1.0, 2.0, 3.0]));
    assert_eq!(exported.vertex(1), MeshState::default().vertex(1));

    // Next cycle starts from a fresh sphere
    match wait_for(&mut events, |m| matches!(m, ServerMessage::MeshSnapshot { .. })).await {
        ServerMessage::MeshSnapshot { mesh } => assert_eq!(mesh, MeshState::default()),
        _ => unreachable!(),
    }
    wait_for(&mut events, |m| {
        matches!(m, ServerMessage::PhaseStatus(s) if s.phase == Phase::Editing)
    })
    .await;
}

#[tokio::test]
async fn test_reset_broadcast_to_everyone() {
    let (server, url) = start_test_server(long_cycle()).await;
    let (alice, _alice_events) = attached_client(&url, "reset", Codec::Binary).await;
    let (_bob, mut bob_events) = attached_client(&url, "reset", Codec::Binary).await;

    alice.send_vertex_edit(3, [5.0, 5.0, 5.0]).await.unwrap();
    wait_for(&mut bob_events, |m| matches!(m, ServerMessage::VertexRelay { .. })).await;

    alice.request_reset().await.unwrap();

    match wait_for(&mut bob_events, |m| matches!(m, ServerMessage::MeshSnapshot { .. })).await {
        ServerMessage::MeshSnapshot { mesh } => assert_eq!(mesh, MeshState::default()),
        _ => unreachable!(),
    }
    assert_eq!(server.engine().mesh("reset"), Some(MeshState::default()));
}

#[tokio::test]
async fn test_message_before_attach_rejected() {
    let (_server, url) = start_test_server(long_cycle()).await;
    let mut client = ClayClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    client.send_vertex_edit(0, [1.0, 1.0, 1.0]).await.unwrap();

    match wait_for(&mut events, |m| matches!(m, ServerMessage::Rejected { .. })).await {
        ServerMessage::Rejected { reason } => assert!(reason.contains("attach")),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, url) = start_test_server(long_cycle()).await;
    let mut client = ClayClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    client.send_ping().await.unwrap();
    assert_eq!(
        wait_for(&mut events, |m| matches!(m, ServerMessage::Pong)).await,
        ServerMessage::Pong
    );
}

#[tokio::test]
async fn test_disconnect_keeps_session_state() {
    let (server, url) = start_test_server(long_cycle()).await;
    let (mut client, mut events) = attached_client(&url, "sticky", Codec::Binary).await;

    client.send_vertex_edit(2, [4.0, 4.0, 4.0]).await.unwrap();
    // Round-trip so the edit is processed before we hang up
    client.send_ping().await.unwrap();
    wait_for(&mut events, |m| matches!(m, ServerMessage::Pong)).await;

    client.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        server.engine().mesh("sticky").unwrap().vertex(2),
        Some([4.0, 4.0, 4.0])
    );
    assert_eq!(server.engine().phase("sticky"), Some(Phase::Editing));

    let stats = server.stats().await;
    assert!(stats.total_connections >= 1);
    assert!(stats.total_messages >= 3);
}

#[tokio::test]
async fn test_late_joiner_gets_current_mesh() {
    let (_server, url) = start_test_server(long_cycle()).await;
    let (alice, mut alice_events) = attached_client(&url, "late", Codec::Binary).await;

    alice.send_vertex_edit(10, [0.5, 0.5, 0.5]).await.unwrap();
    alice.send_ping().await.unwrap();
    wait_for(&mut alice_events, |m| matches!(m, ServerMessage::Pong)).await;

    let (bob, _bob_events) = attached_client(&url, "late", Codec::Binary).await;
    assert_eq!(bob.local_mesh().await.unwrap().vertex(10), Some([0.5, 0.5, 0.5]));
}
