//! Boundary to the document convergence engine.
//!
//! The engine owns the authoritative in-memory state of every live document;
//! this subsystem only seeds documents, submits corrective patches, and pipes
//! each connection's validated envelopes into a per-session channel. The
//! in-process implementation stores document values with a version counter
//! and applies `{p, od, oi}` set/replace components last-write-wins with
//! subscriber fan-out. It deliberately performs no concurrent-operation
//! merging; a production deployment substitutes the external engine behind
//! this same seam.
//!
//! Per-session plumbing is an explicit channel pair: inbound envelopes are
//! handed to [`EngineSession::submit`], engine replies and remote operations
//! arrive on the outbound sender the session was opened with.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Identity of a live document: `(collection, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

/// A single `{p, od, oi}` patch component. `p` is a path of object keys
/// and array indices; `oi` inserts/replaces, `od` alone deletes.
#[derive(Debug, Clone)]
pub struct PatchOp {
    pub p: Vec<Value>,
    pub od: Option<Value>,
    pub oi: Option<Value>,
}

impl PatchOp {
    /// Replace the value at `path`, recording the previous value.
    pub fn replace(path: Vec<Value>, od: Value, oi: Value) -> Self {
        Self {
            p: path,
            od: Some(od),
            oi: Some(oi),
        }
    }

    fn to_json(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("p".into(), Value::Array(self.p.clone()));
        if let Some(od) = &self.od {
            obj.insert("od".into(), od.clone());
        }
        if let Some(oi) = &self.oi {
            obj.insert("oi".into(), oi.clone());
        }
        Value::Object(obj)
    }
}

struct DocState {
    value: Value,
    version: u64,
    subscribers: HashMap<u64, UnboundedSender<Value>>,
}

/// In-process document engine behind the convergence-engine seam.
pub struct DocumentEngine {
    docs: Mutex<HashMap<DocKey, DocState>>,
    next_session: AtomicU64,
}

impl Default for DocumentEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentEngine {
    pub fn new() -> Self {
        Self {
            docs: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DocKey, DocState>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a document unless it already exists (fetch-then-create).
    ///
    /// Returns `false` when the document was already there; a caller losing
    /// a creation race observes that as a no-op.
    pub async fn create_document(&self, key: DocKey, data: Value) -> bool {
        let mut docs = self.lock();
        if docs.contains_key(&key) {
            return false;
        }
        debug!("create document {}:{}", key.collection, key.id);
        docs.insert(
            key,
            DocState {
                value: data,
                version: 1,
                subscribers: HashMap::new(),
            },
        );
        true
    }

    /// Whether a document exists.
    pub async fn exists(&self, key: &DocKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Snapshot of a document's version and value.
    pub async fn fetch(&self, key: &DocKey) -> Option<(u64, Value)> {
        self.lock()
            .get(key)
            .map(|doc| (doc.version, doc.value.clone()))
    }

    /// Apply patch components to a document and fan the operation out to
    /// every subscribed session. Returns `false` when the document does not
    /// exist; callers treat that as a silent no-op.
    pub async fn submit_patch(&self, key: &DocKey, ops: Vec<PatchOp>) -> bool {
        if ops.is_empty() {
            return true;
        }

        let mut fan_out = Vec::new();
        {
            let mut docs = self.lock();
            let Some(doc) = docs.get_mut(key) else {
                return false;
            };

            for op in &ops {
                apply_component(&mut doc.value, op);
            }
            doc.version += 1;

            let message = op_message(key, doc.version, &ops, None);
            for sender in doc.subscribers.values() {
                fan_out.push((sender.clone(), message.clone()));
            }
        }

        for (sender, message) in fan_out {
            let _ = sender.send(message);
        }
        true
    }

    /// Open a per-connection session. Engine replies and remote operations
    /// are pushed on `outbound`; the session unsubscribes everywhere when
    /// dropped.
    pub fn open_session(self: &Arc<Self>, outbound: UnboundedSender<Value>) -> EngineSession {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        EngineSession {
            id,
            engine: Arc::clone(self),
            outbound,
        }
    }

    fn release_session(&self, session_id: u64) {
        let mut docs = self.lock();
        for doc in docs.values_mut() {
            doc.subscribers.remove(&session_id);
        }
    }
}

fn op_message(key: &DocKey, version: u64, ops: &[PatchOp], src: Option<u64>) -> Value {
    let mut msg = json!({
        "a": "op",
        "c": key.collection,
        "d": key.id,
        "v": version,
        "op": ops.iter().map(PatchOp::to_json).collect::<Vec<_>>(),
    });
    if let Some(src) = src {
        msg["src"] = json!(src.to_string());
    }
    msg
}

/// Apply one `{p, od, oi}` component in place. Unknown paths and list
/// operations are dropped silently; the live engine is the authority on
/// anything richer than object/array replacement.
fn apply_component(value: &mut Value, op: &PatchOp) {
    if op.p.is_empty() {
        if let Some(oi) = &op.oi {
            *value = oi.clone();
        } else if op.od.is_some() {
            *value = Value::Null;
        }
        return;
    }

    let mut target = value;
    for segment in &op.p[..op.p.len() - 1] {
        let next = match (segment, target) {
            (Value::String(key), Value::Object(map)) => map.get_mut(key.as_str()),
            (Value::Number(index), Value::Array(items)) => match index.as_u64() {
                Some(i) => items.get_mut(i as usize),
                None => None,
            },
            _ => None,
        };
        match next {
            Some(next) => target = next,
            None => return,
        }
    }

    let last = &op.p[op.p.len() - 1];
    match (last, target) {
        (Value::String(key), Value::Object(map)) => {
            if let Some(oi) = &op.oi {
                map.insert(key.clone(), oi.clone());
            } else if op.od.is_some() {
                map.remove(key.as_str());
            }
        }
        (Value::Number(index), Value::Array(items)) => {
            if let (Some(i), Some(oi)) = (index.as_u64(), &op.oi) {
                if let Some(slot) = items.get_mut(i as usize) {
                    *slot = oi.clone();
                }
            }
        }
        _ => {}
    }
}

/// Per-connection handle into the engine.
pub struct EngineSession {
    id: u64,
    engine: Arc<DocumentEngine>,
    outbound: UnboundedSender<Value>,
}

impl EngineSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Feed one validated envelope into the engine. Unrecognized or
    /// malformed envelopes are ignored; the session never errors back.
    pub async fn submit(&self, envelope: Value) {
        let Some(action) = envelope.get("a").and_then(Value::as_str) else {
            return;
        };

        match action {
            "hs" => {
                let _ = self.outbound.send(json!({
                    "a": "hs",
                    "protocol": 1,
                    "id": self.id.to_string(),
                }));
            }
            "f" => {
                if let Some(key) = doc_key_of(&envelope) {
                    self.reply_snapshot("f", &key).await;
                }
            }
            "s" | "bs" => {
                if let Some(key) = doc_key_of(&envelope) {
                    self.subscribe(&key);
                    self.reply_snapshot(action, &key).await;
                }
            }
            "u" | "bu" => {
                if let Some(key) = doc_key_of(&envelope) {
                    self.unsubscribe(&key);
                    let _ = self.outbound.send(json!({
                        "a": action,
                        "c": key.collection,
                        "d": key.id,
                    }));
                }
            }
            "op" => {
                if let Some(key) = doc_key_of(&envelope) {
                    self.apply_remote_ops(&key, &envelope).await;
                }
            }
            // Queries, presence and bulk actions are accepted but have no
            // local behavior.
            _ => {}
        }
    }

    fn subscribe(&self, key: &DocKey) {
        let mut docs = self.engine.lock();
        if let Some(doc) = docs.get_mut(key) {
            doc.subscribers.insert(self.id, self.outbound.clone());
        }
    }

    fn unsubscribe(&self, key: &DocKey) {
        let mut docs = self.engine.lock();
        if let Some(doc) = docs.get_mut(key) {
            doc.subscribers.remove(&self.id);
        }
    }

    async fn reply_snapshot(&self, action: &str, key: &DocKey) {
        let mut reply = json!({
            "a": action,
            "c": key.collection,
            "d": key.id,
        });
        if let Some((version, value)) = self.engine.fetch(key).await {
            reply["data"] = json!({ "v": version, "data": value });
        }
        let _ = self.outbound.send(reply);
    }

    async fn apply_remote_ops(&self, key: &DocKey, envelope: &Value) {
        let Some(components) = envelope.get("op").and_then(Value::as_array) else {
            return;
        };

        let ops: Vec<PatchOp> = components
            .iter()
            .filter_map(|component| {
                let p = component.get("p")?.as_array()?.clone();
                Some(PatchOp {
                    p,
                    od: component.get("od").cloned(),
                    oi: component.get("oi").cloned(),
                })
            })
            .collect();
        if ops.is_empty() {
            return;
        }

        let mut fan_out = Vec::new();
        let ack;
        {
            let mut docs = self.engine.lock();
            let Some(doc) = docs.get_mut(key) else {
                return;
            };

            for op in &ops {
                apply_component(&mut doc.value, op);
            }
            doc.version += 1;

            ack = json!({
                "a": "op",
                "c": key.collection,
                "d": key.id,
                "v": doc.version,
            });
            let message = op_message(key, doc.version, &ops, Some(self.id));
            for (session, sender) in &doc.subscribers {
                if *session != self.id {
                    fan_out.push((sender.clone(), message.clone()));
                }
            }
        }

        let _ = self.outbound.send(ack);
        for (sender, message) in fan_out {
            let _ = sender.send(message);
        }
    }
}

impl Drop for EngineSession {
    fn drop(&mut self) {
        self.engine.release_session(self.id);
    }
}

fn doc_key_of(envelope: &Value) -> Option<DocKey> {
    let collection = envelope.get("c")?.as_str()?;
    let id = match envelope.get("d")? {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some(DocKey::new(collection, id))
}
