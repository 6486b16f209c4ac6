//! sync-daemon: WebSocket servers for the collaborative workspace
//! synchronization service.
//!
//! Three independent endpoints share one connection-set primitive:
//! - the document sync hub (engine envelopes, selection relay, asset ops)
//! - the presence relay (rooms)
//! - the event bus (global lifecycle notifications)

pub mod blob_dir;
pub mod clients;
pub mod messenger;
pub mod realtime;
pub mod relay;
pub mod snapshot;

pub use clients::ClientSet;
pub use messenger::{EventPublisher, MessengerServer};
pub use realtime::RealtimeHub;
pub use relay::RelayServer;
