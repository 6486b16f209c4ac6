//! Connection registry shared by the three socket endpoints.
//!
//! Each connected client is a numeric id plus an unbounded sender feeding its
//! writer task. "Broadcast to connections matching a predicate" is the one
//! primitive all three servers are built from; each server owns its own
//! `ClientSet`, so identity spaces stay independent and tests can run many
//! isolated instances.

use futures::SinkExt;
use futures::stream::SplitSink;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error};

/// Id-keyed registry of connected clients.
pub struct ClientSet {
    clients: RwLock<HashMap<u64, UnboundedSender<Message>>>,
    next_id: AtomicU64,
}

impl Default for ClientSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientSet {
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new connection: assigns its id and returns the receiver
    /// the connection's writer task drains.
    pub async fn register(&self) -> (u64, UnboundedReceiver<Message>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.write().await.insert(id, tx);
        debug!("client {id} registered");
        (id, rx)
    }

    /// Remove a connection from the broadcast set.
    pub async fn remove(&self, id: u64) {
        self.clients.write().await.remove(&id);
        debug!("client {id} removed");
    }

    /// A clone of a connection's sender, for plumbing engine pushes.
    pub async fn sender(&self, id: u64) -> Option<UnboundedSender<Message>> {
        self.clients.read().await.get(&id).cloned()
    }

    /// Send to one connection. Returns `false` when the id is unknown or the
    /// connection is already gone.
    pub async fn send_to(&self, id: u64, message: Message) -> bool {
        match self.clients.read().await.get(&id) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Send to every connection matching the predicate.
    pub async fn broadcast_where<F>(&self, message: Message, predicate: F)
    where
        F: Fn(u64) -> bool,
    {
        for (id, sender) in self.clients.read().await.iter() {
            if predicate(*id) {
                let _ = sender.send(message.clone());
            }
        }
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Upgrade an incoming TCP connection to a WebSocket.
///
/// Health checks connect and immediately close without finishing the
/// handshake; those are logged as debug, not error.
pub async fn accept_websocket(
    stream: TcpStream,
    addr: SocketAddr,
) -> Option<WebSocketStream<TcpStream>> {
    match accept_async(stream).await {
        Ok(ws) => Some(ws),
        Err(e) => {
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("connection closed before handshake from {addr}");
            } else {
                error!("WebSocket upgrade failed for {addr}: {e}");
            }
            None
        }
    }
}

/// Drain a connection's outbound queue into its socket sink. Ends when every
/// sender is dropped or the socket goes away.
pub async fn run_writer(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// The text content of an inbound frame, decoding binary frames as UTF-8.
/// Control frames yield `None`.
pub fn frame_text(message: Message) -> Option<String> {
    match message {
        Message::Text(text) => Some(text),
        Message::Binary(data) => Some(String::from_utf8_lossy(&data).into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(content: &str) -> Message {
        Message::Text(content.to_string())
    }

    #[tokio::test]
    async fn test_register_assigns_distinct_ids() {
        let clients = ClientSet::new();

        let (a, _rx_a) = clients.register().await;
        let (b, _rx_b) = clients.register().await;

        assert_ne!(a, b);
        assert_eq!(clients.len().await, 2);
    }

    #[tokio::test]
    async fn test_send_to_unknown_id() {
        let clients = ClientSet::new();

        assert!(!clients.send_to(99, text("hello")).await);
    }

    #[tokio::test]
    async fn test_broadcast_where_filters() {
        let clients = ClientSet::new();
        let (a, mut rx_a) = clients.register().await;
        let (_b, mut rx_b) = clients.register().await;

        clients.broadcast_where(text("to others"), |id| id != a).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_remove_drops_sender() {
        let clients = ClientSet::new();
        let (a, mut rx_a) = clients.register().await;

        clients.remove(a).await;

        assert!(clients.is_empty().await);
        // The channel closes once the registry's sender is gone.
        assert!(rx_a.recv().await.is_none());
    }
}
