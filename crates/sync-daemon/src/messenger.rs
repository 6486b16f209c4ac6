//! Event bus endpoint: global fan-out of lifecycle notifications.
//!
//! Clients get a welcome frame with their id; any named event they send is
//! relayed verbatim to every other client. The `authenticate` name is the one
//! exception, answered with a welcome to the sender only (server-side
//! publishers use it to identify themselves). Out-of-band producers publish
//! through [`EventPublisher`], which reaches all connected clients.

use crate::clients::{ClientSet, accept_websocket, frame_text, run_writer};
use futures::StreamExt;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use sync_core::protocol::{self, BusFrame};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

/// Handle used by server-side producers to announce events to every
/// connected bus client.
#[derive(Clone)]
pub struct EventPublisher {
    clients: Arc<ClientSet>,
}

impl EventPublisher {
    /// Broadcast `{name, data}` to all connected clients.
    pub async fn publish(&self, name: &str, data: Value) {
        let frame = protocol::bus_event(name, data);
        self.clients
            .broadcast_where(Message::Text(frame), |_| true)
            .await;
    }
}

/// The event bus server.
pub struct MessengerServer {
    clients: Arc<ClientSet>,
}

impl Default for MessengerServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessengerServer {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(ClientSet::new()),
        }
    }

    /// A producer handle into this bus.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            clients: Arc::clone(&self.clients),
        }
    }

    pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("event bus listening on {listen_addr}");
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
                Err(e) => error!("event bus accept failed: {e}"),
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
        debug!("event bus client {conn_id} connected from {addr}");

        self.clients
            .send_to(conn_id, Message::Text(protocol::bus_welcome(conn_id as i64)))
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

        self.clients.remove(conn_id).await;
        debug!("event bus client {conn_id} disconnected");
    }

    async fn handle_frame(&self, conn_id: u64, text: &str) {
        match protocol::parse_bus_frame(text) {
            BusFrame::Ping => {
                self.clients
                    .send_to(conn_id, Message::Text("pong".to_string()))
                    .await;
            }
            BusFrame::Authenticate => {
                self.clients
                    .send_to(conn_id, Message::Text(protocol::bus_welcome(conn_id as i64)))
                    .await;
            }
            BusFrame::Publish(message) => {
                let frame = message.to_string();
                self.clients
                    .broadcast_where(Message::Text(frame), |id| id != conn_id)
                    .await;
            }
            BusFrame::Ignored => {}
        }
    }
}
