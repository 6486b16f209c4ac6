//! Wire protocol spoken by editor clients on the three socket endpoints.
//!
//! The document-sync endpoint mixes three text prefixes (`auth`, `selection`,
//! `fs`) with raw JSON envelopes carrying a single-letter `a` action from a
//! fixed allow-list. The presence relay and the event bus speak their own
//! small JSON frame grammars plus a literal `ping`/`pong` convenience.
//!
//! Parsing never fails loudly: anything that is not a recognized frame maps
//! to an `Ignored` variant and is dropped by the caller.

use crate::tree::PathPatch;
use serde_json::{Value, json};

/// Action codes accepted on the document-sync endpoint and forwarded to the
/// convergence engine. Anything else is dropped before the engine sees it.
pub const ALLOWED_ACTIONS: [&str; 16] = [
    "hs", "qf", "qs", "qu", "bf", "bs", "bu", "f", "s", "u", "op", "nf", "nt", "p", "ps", "pu",
];

/// Document collections served by the synchronization service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    Scenes,
    Assets,
    Settings,
    UserData,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Scenes => "scenes",
            Collection::Assets => "assets",
            Collection::Settings => "settings",
            Collection::UserData => "user_data",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scenes" => Some(Collection::Scenes),
            "assets" => Some(Collection::Assets),
            "settings" => Some(Collection::Settings),
            "user_data" => Some(Collection::UserData),
            _ => None,
        }
    }
}

/// A structural asset operation carried in an `fs<json>` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FsRequest {
    Move { ids: Vec<i64>, to: Option<i64> },
    Delete { ids: Vec<i64> },
    Duplicate { ids: Vec<i64> },
}

/// One inbound frame on the document-sync endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncFrame {
    /// `auth<json>` handshake; answered with an acknowledgement, never gates.
    Auth,
    /// `selection<json>`; relayed verbatim to the other sync connections.
    Selection,
    /// `fs<json>` structural asset operation.
    Fs(FsRequest),
    /// Raw JSON envelope with an allow-listed action, forwarded to the engine.
    Envelope(Value),
    /// Anything else: silently dropped.
    Ignored,
}

/// Parse one text frame from the document-sync endpoint.
pub fn parse_sync_frame(text: &str) -> SyncFrame {
    if text.starts_with("auth") {
        return SyncFrame::Auth;
    }
    if text.starts_with("selection") {
        return SyncFrame::Selection;
    }
    if let Some(payload) = text.strip_prefix("fs") {
        return match parse_fs_request(payload) {
            Some(request) => SyncFrame::Fs(request),
            None => SyncFrame::Ignored,
        };
    }

    if !text.starts_with('{') && !text.starts_with('[') {
        return SyncFrame::Ignored;
    }
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return SyncFrame::Ignored;
    };
    if !message.is_object() {
        return SyncFrame::Ignored;
    }
    let Some(action) = message.get("a").and_then(Value::as_str) else {
        return SyncFrame::Ignored;
    };
    if !ALLOWED_ACTIONS.contains(&action) {
        return SyncFrame::Ignored;
    }

    SyncFrame::Envelope(message)
}

fn parse_fs_request(payload: &str) -> Option<FsRequest> {
    let value: Value = serde_json::from_str(payload).ok()?;
    let object = value.as_object()?;
    let ids = numeric_id_list(object.get("ids"));

    match object.get("op")?.as_str()? {
        "move" => Some(FsRequest::Move {
            ids,
            to: object.get("to").and_then(numeric_id),
        }),
        "delete" => Some(FsRequest::Delete { ids }),
        "duplicate" => Some(FsRequest::Duplicate { ids }),
        _ => None,
    }
}

/// Filter an id list down to positive integers; anything else is dropped.
pub fn numeric_id_list(value: Option<&Value>) -> Vec<i64> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(numeric_id).collect())
        .unwrap_or_default()
}

/// A positive integer id, accepting numbers and numeric strings.
pub fn numeric_id(value: &Value) -> Option<i64> {
    let id = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    (id > 0).then_some(id)
}

/// The `(collection, id)` a subscribe/fetch envelope addresses, when both the
/// `c` and `d` fields are present. The document id is stringified.
pub fn envelope_doc_target(envelope: &Value) -> Option<(Collection, String)> {
    let action = envelope.get("a")?.as_str()?;
    if action != "s" && action != "f" {
        return None;
    }
    let collection = Collection::parse(envelope.get("c")?.as_str()?)?;
    let id = match envelope.get("d")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    Some((collection, id))
}

/// The acknowledgement frame answering an `auth` handshake.
pub fn auth_ack() -> String {
    format!("auth{}", json!({ "ok": true }))
}

/// The `fs:paths:` broadcast carrying applied move patches.
pub fn fs_paths_frame(patches: &[PathPatch]) -> String {
    format!(
        "fs:paths:{}",
        serde_json::to_string(patches).expect("path patch serialization should not fail")
    )
}

/// One inbound frame on the presence-relay endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    /// Literal `ping` text, answered with `pong`.
    Ping,
    Join {
        room: String,
    },
    Leave {
        room: String,
    },
    /// `room:msg`; the full original message is relayed verbatim.
    Message {
        room: String,
        to: Option<i64>,
        raw: Value,
    },
    Ignored,
}

/// Parse one text frame from the presence-relay endpoint.
pub fn parse_relay_frame(text: &str) -> RelayFrame {
    if text == "ping" {
        return RelayFrame::Ping;
    }
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return RelayFrame::Ignored;
    };
    let Some(kind) = message.get("t").and_then(Value::as_str) else {
        return RelayFrame::Ignored;
    };
    let Some(room) = message.get("name").and_then(Value::as_str) else {
        return RelayFrame::Ignored;
    };
    let room = room.to_string();

    match kind {
        "room:join" => RelayFrame::Join { room },
        "room:leave" => RelayFrame::Leave { room },
        "room:msg" => {
            let to = message.get("to").and_then(numeric_id);
            RelayFrame::Message {
                room,
                to,
                raw: message,
            }
        }
        _ => RelayFrame::Ignored,
    }
}

/// One inbound frame on the event-bus endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum BusFrame {
    /// Literal `ping` text, answered with `pong`.
    Ping,
    /// `{name: "authenticate"}`; answered with a welcome, never relayed.
    Authenticate,
    /// Any other named event; relayed verbatim.
    Publish(Value),
    Ignored,
}

/// Parse one text frame from the event-bus endpoint.
pub fn parse_bus_frame(text: &str) -> BusFrame {
    if text == "ping" {
        return BusFrame::Ping;
    }
    let Ok(message) = serde_json::from_str::<Value>(text) else {
        return BusFrame::Ignored;
    };
    match message.get("name").and_then(Value::as_str) {
        Some("authenticate") => BusFrame::Authenticate,
        Some(_) => BusFrame::Publish(message),
        None => BusFrame::Ignored,
    }
}

/// A named event published on the bus by a server-side producer.
pub fn bus_event(name: &str, data: Value) -> String {
    json!({ "name": name, "data": data }).to_string()
}

/// The welcome frame greeting a relay connection.
pub fn relay_welcome(user_id: i64) -> String {
    json!({ "t": "welcome", "userId": user_id }).to_string()
}

/// The welcome frame greeting a bus connection.
pub fn bus_welcome(user_id: i64) -> String {
    json!({ "name": "welcome", "userId": user_id }).to_string()
}
