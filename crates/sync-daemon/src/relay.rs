//! Presence relay endpoint: ephemeral rooms for cursor/selection traffic.
//!
//! Rooms are named sets of connections, unrelated to document identity and
//! never persisted. Joining announces the newcomer to the room and returns
//! the current member list; an empty room is garbage-collected. Targeted
//! messages are delivered by user id across all connections, not just the
//! room, and silently dropped when the target is gone.

use crate::clients::{ClientSet, accept_websocket, frame_text, run_writer};
use futures::StreamExt;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use sync_core::protocol::{self, RelayFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

#[derive(Default)]
struct Rooms {
    /// Room name -> member connection ids.
    members: HashMap<String, HashSet<u64>>,
    /// Connection id -> joined room names, for disconnect cleanup.
    joined: HashMap<u64, HashSet<String>>,
}

/// The presence relay server.
pub struct RelayServer {
    clients: Arc<ClientSet>,
    rooms: Mutex<Rooms>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(ClientSet::new()),
            rooms: Mutex::new(Rooms::default()),
        }
    }

    pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("presence relay listening on {listen_addr}");
        Ok(listener)
    }

    /// Accept loop; spawns one task per connection.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => error!("presence relay accept failed: {e}"),
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let Some(ws) = accept_websocket(stream, addr).await else {
            return;
        };
        let (sink, mut read) = ws.split();

        let (conn_id, rx) = self.clients.register().await;
        tokio::spawn(run_writer(sink, rx));
        debug!("relay client {conn_id} connected from {addr}");

        self.clients
            .send_to(conn_id, Message::Text(protocol::relay_welcome(conn_id as i64)))
            .await;

        while let Some(result) = read.next().await {
            let message = match result {
                Ok(message) => message,
                Err(_) => break,
            };
            if message.is_close() {
                break;
            }
            let Some(text) = frame_text(message) else {
                continue;
            };
            self.handle_frame(conn_id, &text).await;
        }

        self.leave_all_rooms(conn_id).await;
        self.clients.remove(conn_id).await;
        debug!("relay client {conn_id} disconnected");
    }

    async fn handle_frame(&self, conn_id: u64, text: &str) {
        match protocol::parse_relay_frame(text) {
            RelayFrame::Ping => {
                self.clients
                    .send_to(conn_id, Message::Text("pong".to_string()))
                    .await;
            }
            RelayFrame::Join { room } => self.join_room(conn_id, &room).await,
            RelayFrame::Leave { room } => self.leave_room(conn_id, &room).await,
            RelayFrame::Message { room, to, raw } => {
                let frame = raw.to_string();
                match to {
                    // Targeted delivery searches all connections, not just
                    // the room; a missing target is a silent drop.
                    Some(target) => {
                        self.clients
                            .send_to(target as u64, Message::Text(frame))
                            .await;
                    }
                    None => {
                        let members = self.room_members(&room).await;
                        self.clients
                            .broadcast_where(Message::Text(frame), |id| {
                                id != conn_id && members.contains(&id)
                            })
                            .await;
                    }
                }
            }
            RelayFrame::Ignored => {}
        }
    }

    async fn join_room(&self, conn_id: u64, room: &str) {
        let users: Vec<u64> = {
            let mut rooms = self.rooms.lock().await;
            let members = rooms.members.entry(room.to_string()).or_default();
            members.insert(conn_id);
            let users = members.iter().copied().collect();
            rooms.joined.entry(conn_id).or_default().insert(room.to_string());
            users
        };

        // The joiner gets the member list; everyone else gets the newcomer.
        self.clients
            .send_to(
                conn_id,
                Message::Text(
                    json!({ "t": "room:join", "name": room, "users": users }).to_string(),
                ),
            )
            .await;
        let announcement =
            json!({ "t": "room:join", "name": room, "userId": conn_id }).to_string();
        self.clients
            .broadcast_where(Message::Text(announcement), |id| {
                id != conn_id && users.contains(&id)
            })
            .await;
    }

    async fn leave_room(&self, conn_id: u64, room: &str) {
        let remaining: Option<Vec<u64>> = {
            let mut rooms = self.rooms.lock().await;
            let Some(members) = rooms.members.get_mut(room) else {
                return;
            };
            members.remove(&conn_id);
            let remaining: Vec<u64> = members.iter().copied().collect();
            if remaining.is_empty() {
                rooms.members.remove(room);
            }
            if let Some(joined) = rooms.joined.get_mut(&conn_id) {
                joined.remove(room);
            }
            Some(remaining)
        };

        if let Some(remaining) = remaining {
            let announcement =
                json!({ "t": "room:leave", "name": room, "userId": conn_id }).to_string();
            self.clients
                .broadcast_where(Message::Text(announcement), |id| remaining.contains(&id))
                .await;
        }
    }

    async fn leave_all_rooms(&self, conn_id: u64) {
        let joined: Vec<String> = {
            let mut rooms = self.rooms.lock().await;
            rooms
                .joined
                .remove(&conn_id)
                .map(|set| set.into_iter().collect())
                .unwrap_or_default()
        };
        for room in joined {
            self.leave_room(conn_id, &room).await;
        }
    }

    async fn room_members(&self, room: &str) -> HashSet<u64> {
        self.rooms
            .lock()
            .await
            .members
            .get(room)
            .cloned()
            .unwrap_or_default()
    }
}
