//! Document sync hub: the endpoint editor clients collaborate through.
//!
//! Each connection multiplexes four kinds of traffic, dispatched by a short
//! discriminator on every inbound frame:
//! - `auth<json>` handshakes, acknowledged but never gating
//! - `selection<json>` presence frames, relayed to all other sync peers
//! - `fs<json>` structural asset operations, applied through the tree
//!   mutator and announced to everyone
//! - raw engine envelopes with an allow-listed action code; subscribe/fetch
//!   envelopes demand-create their document before the engine sees them
//!
//! Anything else is dropped silently. A connection is only ever closed by
//! the client or by raw socket failure.

use crate::clients::{ClientSet, accept_websocket, frame_text, run_writer};
use crate::messenger::EventPublisher;
use futures::StreamExt;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use sync_core::engine::{DocumentEngine, EngineSession};
use sync_core::protocol::{self, FsRequest, SyncFrame};
use sync_core::tree::AssetTree;
use sync_core::DocumentManager;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

/// The document synchronization hub.
pub struct RealtimeHub {
    clients: Arc<ClientSet>,
    engine: Arc<DocumentEngine>,
    manager: Arc<DocumentManager>,
    tree: Arc<AssetTree>,
    events: EventPublisher,
}

impl RealtimeHub {
    pub fn new(
        engine: Arc<DocumentEngine>,
        manager: Arc<DocumentManager>,
        tree: Arc<AssetTree>,
        events: EventPublisher,
    ) -> Self {
        Self {
            clients: Arc::new(ClientSet::new()),
            engine,
            manager,
            tree,
            events,
        }
    }

    pub async fn bind(listen_addr: &str) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("document sync hub listening on {listen_addr}");
        Ok(listener)
    }

    /// Accept loop; spawns one task per connection so one client's store or
    /// engine I/O never stalls the others.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let hub = Arc::clone(&self);
                    tokio::spawn(async move {
                        hub.handle_connection(stream, addr).await;
                    });
                }
                Err(e) => error!("sync hub accept failed: {e}"),
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
        info!(
            "sync client {conn_id} connected from {addr} (total: {})",
            self.clients.len().await
        );

        // Engine pushes flow through their own channel and are forwarded as
        // text frames onto this connection's outbound queue.
        let (engine_tx, mut engine_rx) = mpsc::unbounded_channel::<Value>();
        let session = self.engine.open_session(engine_tx);
        if let Some(outbound) = self.clients.sender(conn_id).await {
            tokio::spawn(async move {
                while let Some(value) = engine_rx.recv().await {
                    if outbound.send(Message::Text(value.to_string())).is_err() {
                        break;
                    }
                }
            });
        }

        // Inbound frames are processed in receipt order for this connection.
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
            self.handle_frame(conn_id, &session, &text).await;
        }

        // Dropping the session releases every engine subscription.
        drop(session);
        self.clients.remove(conn_id).await;
        info!("sync client {conn_id} disconnected");
    }

    async fn handle_frame(&self, conn_id: u64, session: &EngineSession, text: &str) {
        match protocol::parse_sync_frame(text) {
            SyncFrame::Auth => {
                debug!("sync client {conn_id} sent auth handshake");
                self.clients
                    .send_to(conn_id, Message::Text(protocol::auth_ack()))
                    .await;
            }
            SyncFrame::Selection => {
                self.clients
                    .broadcast_where(Message::Text(text.to_string()), |id| id != conn_id)
                    .await;
            }
            SyncFrame::Fs(request) => self.handle_fs(request).await,
            SyncFrame::Envelope(envelope) => {
                if let Some((collection, id)) = protocol::envelope_doc_target(&envelope) {
                    debug!(
                        "on-demand document request: collection={} id={id}",
                        collection.as_str()
                    );
                    self.manager.ensure_document(collection, &id).await;
                }
                session.submit(envelope).await;
            }
            SyncFrame::Ignored => {}
        }
    }

    async fn handle_fs(&self, request: FsRequest) {
        match request {
            FsRequest::Move { ids, to } => {
                let patches = self.tree.move_assets(&ids, to).await;
                if !patches.is_empty() {
                    let frame = protocol::fs_paths_frame(&patches);
                    self.clients
                        .broadcast_where(Message::Text(frame), |_| true)
                        .await;
                }
            }
            FsRequest::Delete { ids } => {
                let deleted = self.tree.delete_assets(&ids).await;
                if !deleted.is_empty() {
                    let ids: Vec<String> = deleted.iter().map(ToString::to_string).collect();
                    self.events
                        .publish("assets.delete", json!({ "assets": ids }))
                        .await;
                }
            }
            FsRequest::Duplicate { ids } => {
                let created = self.tree.duplicate_assets(&ids).await;
                for asset in created {
                    let created_at = asset
                        .created_at
                        .clone()
                        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
                    self.events
                        .publish(
                            "asset.new",
                            json!({
                                "asset": {
                                    "id": asset.id.to_string(),
                                    "branchId": asset.branch_id,
                                    "type": asset.asset_type,
                                    "source": true,
                                    "status": "complete",
                                    "source_asset_id": null,
                                    "createdAt": created_at,
                                }
                            }),
                        )
                        .await;
                }
            }
        }
    }
}
