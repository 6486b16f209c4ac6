//! End-to-end tests for the synchronization daemon.
//!
//! Spins up the three WebSocket endpoints against an in-memory store and
//! drives them with real client connections: engine envelopes, structural
//! asset operations, presence rooms and bus events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use sync_core::DocumentManager;
use sync_core::engine::DocumentEngine;
use sync_core::objects::{InMemoryObjectStore, ObjectStore};
use sync_core::store::{AssetRecord, InMemoryStore, ProjectStore, SceneRecord};
use sync_core::tree::AssetTree;
use sync_daemon::{MessengerServer, RealtimeHub, RelayServer};

/// Addresses of one running daemon stack.
struct Stack {
    sync_addr: SocketAddr,
    relay_addr: SocketAddr,
    events_addr: SocketAddr,
}

/// Start all three servers on ephemeral ports, seeded from `store`.
async fn start_stack(store: Option<Arc<InMemoryStore>>) -> Stack {
    let engine = Arc::new(DocumentEngine::new());
    let objects = Arc::new(InMemoryObjectStore::new());

    let mut manager = DocumentManager::new(Arc::clone(&engine))
        .with_object_store(objects as Arc<dyn ObjectStore>);
    if let Some(store) = &store {
        manager = manager.with_store(Arc::clone(store) as Arc<dyn ProjectStore>);
    }
    let manager = Arc::new(manager);
    manager.seed_from_store().await;

    let tree = Arc::new(AssetTree::new(
        Arc::clone(&engine),
        store.map(|store| store as Arc<dyn ProjectStore>),
    ));

    let messenger = Arc::new(MessengerServer::new());
    let relay = Arc::new(RelayServer::new());
    let hub = Arc::new(RealtimeHub::new(
        engine,
        manager,
        tree,
        messenger.publisher(),
    ));

    let sync_listener = RealtimeHub::bind("127.0.0.1:0").await.expect("bind sync");
    let relay_listener = RelayServer::bind("127.0.0.1:0").await.expect("bind relay");
    let events_listener = MessengerServer::bind("127.0.0.1:0").await.expect("bind events");

    let stack = Stack {
        sync_addr: sync_listener.local_addr().expect("sync addr"),
        relay_addr: relay_listener.local_addr().expect("relay addr"),
        events_addr: events_listener.local_addr().expect("events addr"),
    };

    tokio::spawn(hub.run(sync_listener));
    tokio::spawn(relay.run(relay_listener));
    tokio::spawn(messenger.run(events_listener));

    stack
}

/// Store with a folder (2) containing an asset (3), an asset at root (5)
/// and a folder move target (9).
fn seeded_store() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.add_scene(SceneRecord {
        id: 1,
        unique_id: Some("scene-1".into()),
        project_id: 1,
        branch_id: Some("main".into()),
        owner_id: None,
        name: Some("Main Scene".into()),
    });
    for (id, name, asset_type, path) in [
        (2, "Folder", "folder", vec![]),
        (3, "Box", "material", vec![2]),
        (5, "Sphere", "material", vec![]),
        (9, "Target", "folder", vec![]),
    ] {
        store.add_asset(AssetRecord {
            id,
            project_id: 1,
            branch_id: "main".into(),
            owner_id: "owner".into(),
            name: name.into(),
            asset_type: asset_type.into(),
            data: json!({ "path": path.clone(), "parentId": path.last() }),
            file: None,
            source_asset_id: None,
            created_at: None,
        });
    }
    store
}

/// Test client over one WebSocket endpoint.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let url = format!("ws://{addr}");
        let (ws, _) = connect_async(&url).await.expect("Failed to connect");
        Self { ws }
    }

    async fn send_text(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.into()))
            .await
            .expect("Failed to send message");
    }

    /// Receive the next text frame, skipping control frames.
    async fn recv_text(&mut self) -> String {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(Message::Binary(data))) => {
                    return String::from_utf8(data.to_vec()).expect("binary frame was not UTF-8");
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    async fn recv_text_timeout(&mut self, duration: Duration) -> Result<String, &'static str> {
        match timeout(duration, self.recv_text()).await {
            Ok(text) => Ok(text),
            Err(_) => Err("Timeout waiting for message"),
        }
    }

    async fn recv_json(&mut self) -> Value {
        let text = self
            .recv_text_timeout(Duration::from_secs(2))
            .await
            .expect("Timed out waiting for JSON frame");
        serde_json::from_str(&text).expect("Frame was not valid JSON")
    }

    /// Assert nothing arrives within a short window.
    async fn expect_silence(&mut self) {
        let result = self.recv_text_timeout(Duration::from_millis(300)).await;
        assert!(result.is_err(), "expected no frame, got {result:?}");
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Document sync hub
// ============================================================================

#[tokio::test]
async fn test_auth_handshake_is_acknowledged() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.sync_addr).await;

    client.send_text(r#"auth{"accessToken":"t"}"#).await;

    let reply = client
        .recv_text_timeout(Duration::from_secs(2))
        .await
        .expect("Should receive auth ack");
    assert_eq!(reply, r#"auth{"ok":true}"#);

    client.close().await;
}

#[tokio::test]
async fn test_malformed_frames_do_not_break_the_connection() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.sync_addr).await;

    client.send_text("%%% not a frame").await;
    client.send_text(r#"{"a":"evil"}"#).await;
    client.send_text(r#"[1,2,3]"#).await;
    client.send_text(r#"{"no_action":true}"#).await;

    // The connection still works afterwards.
    client.send_text(r#"{"a":"hs"}"#).await;
    let reply = client.recv_json().await;
    assert_eq!(reply["a"], "hs");

    client.close().await;
}

#[tokio::test]
async fn test_selection_relays_to_other_sync_peers() {
    let stack = start_stack(None).await;
    let mut sender = TestClient::connect(stack.sync_addr).await;
    let mut peer = TestClient::connect(stack.sync_addr).await;

    let frame = r#"selection{"scene":"1","ids":[4,5]}"#;
    sender.send_text(frame).await;

    let received = peer
        .recv_text_timeout(Duration::from_secs(2))
        .await
        .expect("Peer should receive the selection frame");
    assert_eq!(received, frame);

    sender.expect_silence().await;

    sender.close().await;
    peer.close().await;
}

#[tokio::test]
async fn test_subscribe_creates_scene_on_demand() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.sync_addr).await;

    client.send_text(r#"{"a":"s","c":"scenes","d":"42"}"#).await;

    let reply = client.recv_json().await;
    assert_eq!(reply["a"], "s");
    assert_eq!(reply["d"], "42");
    let doc = &reply["data"]["data"];
    assert_eq!(doc["name"], "Scene 42");
    assert_eq!(doc["entities"]["root"]["name"], "Root");
    assert_eq!(doc["settings"]["physics"]["gravity"], json!([0, -9.8, 0]));

    client.close().await;
}

#[tokio::test]
async fn test_fetch_creates_settings_with_scope_defaults() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.sync_addr).await;

    client
        .send_text(r#"{"a":"f","c":"settings","d":"user_abc"}"#)
        .await;

    let reply = client.recv_json().await;
    assert_eq!(reply["a"], "f");
    let doc = &reply["data"]["data"];
    assert_eq!(doc["editor"]["gridDivisions"], 32);
    // User scope has no project script block.
    assert!(doc.get("scripts").is_none());

    client.close().await;
}

#[tokio::test]
async fn test_move_broadcasts_paths_and_updates_document() {
    let stack = start_stack(Some(seeded_store())).await;
    let mut session1 = TestClient::connect(stack.sync_addr).await;
    let mut session2 = TestClient::connect(stack.sync_addr).await;

    // Prime session 1 with the live document.
    session1.send_text(r#"{"a":"f","c":"assets","d":5}"#).await;
    let primed = session1.recv_json().await;
    assert_eq!(primed["data"]["data"]["path"], json!([]));

    session1.send_text(r#"fs{"op":"move","ids":[5],"to":9}"#).await;

    // Both sessions receive the path broadcast.
    for session in [&mut session1, &mut session2] {
        let broadcast = session
            .recv_text_timeout(Duration::from_secs(2))
            .await
            .expect("Should receive fs:paths broadcast");
        assert_eq!(broadcast, r#"fs:paths:[{"uniqueId":5,"path":[9]}]"#);
    }

    // A subsequent fetch observes the patched path.
    session1.send_text(r#"{"a":"f","c":"assets","d":5}"#).await;
    let fetched = session1.recv_json().await;
    assert_eq!(fetched["data"]["data"]["path"], json!([9]));
    assert_eq!(fetched["data"]["data"]["data"]["path"], json!([9]));

    session1.close().await;
    session2.close().await;
}

#[tokio::test]
async fn test_delete_announces_cascade_on_the_bus() {
    let stack = start_stack(Some(seeded_store())).await;
    let mut sync_client = TestClient::connect(stack.sync_addr).await;
    let mut bus_client = TestClient::connect(stack.events_addr).await;

    let welcome = bus_client.recv_json().await;
    assert_eq!(welcome["name"], "welcome");

    // Deleting the folder takes its child with it.
    sync_client.send_text(r#"fs{"op":"delete","ids":[2]}"#).await;

    let event = bus_client.recv_json().await;
    assert_eq!(event["name"], "assets.delete");
    assert_eq!(event["data"]["assets"], json!(["2", "3"]));

    sync_client.close().await;
    bus_client.close().await;
}

#[tokio::test]
async fn test_duplicate_announces_new_assets_on_the_bus() {
    let stack = start_stack(Some(seeded_store())).await;
    let mut sync_client = TestClient::connect(stack.sync_addr).await;
    let mut bus_client = TestClient::connect(stack.events_addr).await;

    let welcome = bus_client.recv_json().await;
    assert_eq!(welcome["name"], "welcome");

    sync_client
        .send_text(r#"fs{"op":"duplicate","ids":[3]}"#)
        .await;

    let event = bus_client.recv_json().await;
    assert_eq!(event["name"], "asset.new");
    let asset = &event["data"]["asset"];
    assert_eq!(asset["type"], "material");
    assert_eq!(asset["branchId"], "main");
    assert_eq!(asset["status"], "complete");
    assert!(asset["id"].as_str().is_some());

    sync_client.close().await;
    bus_client.close().await;
}

#[tokio::test]
async fn test_deleting_unknown_assets_stays_silent() {
    let stack = start_stack(Some(seeded_store())).await;
    let mut sync_client = TestClient::connect(stack.sync_addr).await;
    let mut bus_client = TestClient::connect(stack.events_addr).await;

    let welcome = bus_client.recv_json().await;
    assert_eq!(welcome["name"], "welcome");

    sync_client.send_text(r#"fs{"op":"delete","ids":[404]}"#).await;

    bus_client.expect_silence().await;

    sync_client.close().await;
    bus_client.close().await;
}

// ============================================================================
// Presence relay
// ============================================================================

#[tokio::test]
async fn test_room_join_flow() {
    let stack = start_stack(None).await;

    let mut session_a = TestClient::connect(stack.relay_addr).await;
    let welcome_a = session_a.recv_json().await;
    assert_eq!(welcome_a["t"], "welcome");
    let id_a = welcome_a["userId"].as_i64().expect("numeric user id");

    session_a
        .send_text(r#"{"t":"room:join","name":"scene-1"}"#)
        .await;
    let joined_a = session_a.recv_json().await;
    assert_eq!(joined_a["t"], "room:join");
    assert_eq!(joined_a["users"], json!([id_a]));

    let mut session_b = TestClient::connect(stack.relay_addr).await;
    let welcome_b = session_b.recv_json().await;
    let id_b = welcome_b["userId"].as_i64().expect("numeric user id");

    session_b
        .send_text(r#"{"t":"room:join","name":"scene-1"}"#)
        .await;

    // B gets the member list including itself; A is told about B.
    let joined_b = session_b.recv_json().await;
    let users: Vec<i64> = joined_b["users"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(Value::as_i64)
        .collect();
    assert!(users.contains(&id_a));
    assert!(users.contains(&id_b));

    let announced = session_a.recv_json().await;
    assert_eq!(announced["t"], "room:join");
    assert_eq!(announced["userId"], json!(id_b));

    session_a.close().await;
    session_b.close().await;
}

#[tokio::test]
async fn test_room_message_reaches_other_members_only() {
    let stack = start_stack(None).await;

    let mut session_a = TestClient::connect(stack.relay_addr).await;
    let _ = session_a.recv_json().await;
    let mut session_b = TestClient::connect(stack.relay_addr).await;
    let _ = session_b.recv_json().await;
    let mut outsider = TestClient::connect(stack.relay_addr).await;
    let _ = outsider.recv_json().await;

    for session in [&mut session_a, &mut session_b] {
        session
            .send_text(r#"{"t":"room:join","name":"scene-1"}"#)
            .await;
        let _ = session.recv_json().await;
    }
    // A also sees B join.
    let _ = session_a.recv_json().await;

    session_a
        .send_text(r#"{"t":"room:msg","name":"scene-1","data":{"cursor":[1,2]}}"#)
        .await;

    let received = session_b.recv_json().await;
    assert_eq!(received["t"], "room:msg");
    assert_eq!(received["data"]["cursor"], json!([1, 2]));

    session_a.expect_silence().await;
    outsider.expect_silence().await;

    session_a.close().await;
    session_b.close().await;
    outsider.close().await;
}

#[tokio::test]
async fn test_targeted_message_crosses_rooms() {
    let stack = start_stack(None).await;

    let mut receiver = TestClient::connect(stack.relay_addr).await;
    let welcome = receiver.recv_json().await;
    let receiver_id = welcome["userId"].as_i64().unwrap();

    let mut sender = TestClient::connect(stack.relay_addr).await;
    let _ = sender.recv_json().await;

    // The receiver is not in any room; targeted delivery still finds it.
    sender
        .send_text(&format!(
            r#"{{"t":"room:msg","name":"scene-1","to":{receiver_id},"data":{{"hello":true}}}}"#
        ))
        .await;

    let received = receiver.recv_json().await;
    assert_eq!(received["data"]["hello"], true);

    // Unknown targets are silently dropped.
    sender
        .send_text(r#"{"t":"room:msg","name":"scene-1","to":9999,"data":{}}"#)
        .await;
    sender.expect_silence().await;

    receiver.close().await;
    sender.close().await;
}

#[tokio::test]
async fn test_leaving_a_room_announces_departure() {
    let stack = start_stack(None).await;

    let mut session_a = TestClient::connect(stack.relay_addr).await;
    let welcome_a = session_a.recv_json().await;
    let id_a = welcome_a["userId"].as_i64().unwrap();
    let mut session_b = TestClient::connect(stack.relay_addr).await;
    let _ = session_b.recv_json().await;

    for session in [&mut session_a, &mut session_b] {
        session
            .send_text(r#"{"t":"room:join","name":"scene-1"}"#)
            .await;
        let _ = session.recv_json().await;
    }
    let _ = session_a.recv_json().await;

    session_a
        .send_text(r#"{"t":"room:leave","name":"scene-1"}"#)
        .await;

    let departure = session_b.recv_json().await;
    assert_eq!(departure["t"], "room:leave");
    assert_eq!(departure["userId"], json!(id_a));

    session_a.close().await;
    session_b.close().await;
}

#[tokio::test]
async fn test_disconnect_leaves_joined_rooms() {
    let stack = start_stack(None).await;

    let mut session_a = TestClient::connect(stack.relay_addr).await;
    let welcome_a = session_a.recv_json().await;
    let id_a = welcome_a["userId"].as_i64().unwrap();
    let mut session_b = TestClient::connect(stack.relay_addr).await;
    let _ = session_b.recv_json().await;

    for session in [&mut session_a, &mut session_b] {
        session
            .send_text(r#"{"t":"room:join","name":"scene-1"}"#)
            .await;
        let _ = session.recv_json().await;
    }
    let _ = session_a.recv_json().await;

    session_a.close().await;

    let departure = session_b.recv_json().await;
    assert_eq!(departure["t"], "room:leave");
    assert_eq!(departure["userId"], json!(id_a));

    session_b.close().await;
}

#[tokio::test]
async fn test_relay_ping_pong() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.relay_addr).await;
    let _ = client.recv_json().await;

    client.send_text("ping").await;

    let reply = client
        .recv_text_timeout(Duration::from_secs(2))
        .await
        .expect("Should receive pong");
    assert_eq!(reply, "pong");

    client.close().await;
}

// ============================================================================
// Event bus
// ============================================================================

#[tokio::test]
async fn test_bus_welcome_and_authenticate() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.events_addr).await;
    let mut other = TestClient::connect(stack.events_addr).await;

    let welcome = client.recv_json().await;
    assert_eq!(welcome["name"], "welcome");
    let _ = other.recv_json().await;

    client.send_text(r#"{"name":"authenticate"}"#).await;

    // Only the sender is answered; authenticate never fans out.
    let reply = client.recv_json().await;
    assert_eq!(reply["name"], "welcome");
    other.expect_silence().await;

    client.close().await;
    other.close().await;
}

#[tokio::test]
async fn test_bus_events_fan_out_to_other_clients() {
    let stack = start_stack(None).await;
    let mut sender = TestClient::connect(stack.events_addr).await;
    let mut receiver = TestClient::connect(stack.events_addr).await;
    let _ = sender.recv_json().await;
    let _ = receiver.recv_json().await;

    sender
        .send_text(r#"{"name":"scene.saved","data":{"scene":"1"}}"#)
        .await;

    let event = receiver.recv_json().await;
    assert_eq!(event["name"], "scene.saved");
    assert_eq!(event["data"]["scene"], "1");

    sender.expect_silence().await;

    sender.close().await;
    receiver.close().await;
}

#[tokio::test]
async fn test_bus_ping_pong_and_junk_tolerance() {
    let stack = start_stack(None).await;
    let mut client = TestClient::connect(stack.events_addr).await;
    let _ = client.recv_json().await;

    client.send_text("{broken json").await;
    client.send_text(r#"{"data":"no name"}"#).await;
    client.send_text("ping").await;

    let reply = client
        .recv_text_timeout(Duration::from_secs(2))
        .await
        .expect("Should receive pong");
    assert_eq!(reply, "pong");

    client.close().await;
}
