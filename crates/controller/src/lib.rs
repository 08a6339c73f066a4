//! # Shadow Controller Library
//!
//! Controller side of the Shadow device-pairing protocol: pairs with a
//! device manager over a WebSocket, authenticates with the challenge
//! handshake, then drives devices (navigate, screenshot, inventory).
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │  SessionHandle  (clone, async)     subscribe() ─▶ events   │
//! ├────────────────────────────────────────────────────────────┤
//! │  Session driver task: commands │ transport events │ ping   │
//! │    └─ ProtocolSession (state machine)                      │
//! │         ├─ CryptoEngine / MessageFormatter   (protocol)    │
//! │         ├─ TransportChannel ─▶ Transport (WebSocket)       │
//! │         └─ SettingsStore (settings + bounded log)          │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use controller::{session, FileStore, SessionEvent, SessionOptions, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(FileStore::open_in("/tmp/shadow")?);
//!     let (handle, _task) =
//!         session::spawn(WebSocketTransport::new(), store, SessionOptions::default());
//!
//!     let mut events = handle.subscribe();
//!     handle
//!         .connect("My Controller", &controller::protocol::generate_uuid(), None)
//!         .await?;
//!
//!     if let SessionEvent::Connected { .. } = events.recv().await? {
//!         handle.send_url("http://example.com", false).await?;
//!         handle.disconnect().await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: TOML configuration
//! - [`storage`]: Settings store and protocol log
//! - [`transport`]: Transport port, channel guard, WebSocket transport
//! - [`session`]: State machine, driver task and handle
//! - [`events`]: Public session events
//! - [`runner`]: Batch URL/screenshot runner used by `shadow-ctl run`

pub mod config;
pub mod events;
pub mod runner;
pub mod session;
pub mod storage;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::{Config, ConfigError};
pub use events::{EventReceiver, SessionEvent};
pub use session::{
    ProtocolSession, SessionError, SessionHandle, SessionOptions, SessionState, SessionStatus,
};
pub use storage::{FileStore, MemoryStore, SettingsStore};
pub use transport::{
    ChannelState, ConnectionSettings, EventSink, Transport, TransportChannel, TransportEvent,
    WebSocketTransport,
};
