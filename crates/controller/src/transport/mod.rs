//! Transport channel to the device manager.
//!
//! [`Transport`] is the port the session drives: it opens one connection at
//! a time and reports lifecycle and inbound frames as [`TransportEvent`]s.
//! [`TransportChannel`] wraps a transport with the connection-state guard
//! and resolves connection settings from the settings store.
//!
//! ```text
//!   ProtocolSession ──connect/send/disconnect──▶ TransportChannel ──▶ Transport
//!         ▲                                                               │
//!         └────────────── (generation, TransportEvent) ◀──────────────────┘
//! ```

pub mod websocket;

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use protocol::Frame;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;
use crate::storage::SettingsStore;

pub use websocket::WebSocketTransport;

/// WebSocket path served by the device manager.
pub const SHADOW_PATH: &str = "/shadow";

/// Close code sent when the controller disconnects.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close reason sent when the controller disconnects.
pub const NORMAL_CLOSURE_REASON: &str = "All Done";

/// Close code reported when a connection drops without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

const PROTOCOL_KEY: &str = "protocol";
const HOST_KEY: &str = "host";
const PORT_KEY: &str = "port";

/// Raw connection lifecycle and data events.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is open.
    Opened,
    /// The connection closed, with the close code if one was received.
    Closed { code: Option<u16> },
    /// An inbound frame, untouched.
    Message(Frame),
    /// A transport error. Closing is reported separately.
    Error(String),
}

/// Delivers events for one connection attempt.
///
/// Every sink is stamped with the generation of the attempt that created it
/// so events from a superseded socket can be dropped.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    /// Creates a sink for the given connection generation.
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Emits an event. Returns false if the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    /// Returns the generation this sink reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// A connection to the device manager.
///
/// Implementations must report exactly one [`TransportEvent::Closed`] for
/// every `open`, including attempts that never connected.
pub trait Transport: Send {
    /// Starts connecting to `url`; outcomes are reported through `sink`.
    fn open(&mut self, url: &str, sink: EventSink);

    /// Queues a frame on the open connection.
    fn send(&mut self, frame: Frame);

    /// Starts a close handshake with the given code and reason.
    fn close(&mut self, code: u16, reason: &str);
}

/// Connection state of the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// No socket.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The socket is open.
    Connected,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Where the device manager listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub protocol: String,
    pub host: String,
    pub port: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionConfig::default().into()
    }
}

impl From<ConnectionConfig> for ConnectionSettings {
    fn from(config: ConnectionConfig) -> Self {
        Self {
            protocol: config.protocol,
            host: config.host,
            port: config.port,
        }
    }
}

impl ConnectionSettings {
    /// Returns the WebSocket URL, e.g. `ws://127.0.0.1:7682/shadow`.
    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.protocol, self.host, self.port, SHADOW_PATH)
    }

    /// Writes `defaults` to the store unless all three keys are present.
    pub fn ensure_stored(store: &dyn SettingsStore, defaults: &ConnectionSettings) -> Result<()> {
        let complete = [PROTOCOL_KEY, HOST_KEY, PORT_KEY]
            .iter()
            .map(|key| store.get(key))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .all(Option::is_some);
        if !complete {
            tracing::debug!("Persisting default connection settings");
            defaults.save(store)?;
        }
        Ok(())
    }

    /// Reads settings from the store, if all three keys are present.
    pub fn load(store: &dyn SettingsStore) -> Result<Option<Self>> {
        let (Some(protocol), Some(host), Some(port)) = (
            store.get(PROTOCOL_KEY)?,
            store.get(HOST_KEY)?,
            store.get(PORT_KEY)?,
        ) else {
            return Ok(None);
        };
        Ok(Some(Self {
            protocol,
            host,
            port,
        }))
    }

    /// Writes these settings to the store.
    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        store.put(PROTOCOL_KEY, &self.protocol)?;
        store.put(HOST_KEY, &self.host)?;
        store.put(PORT_KEY, &self.port)?;
        Ok(())
    }
}

/// A [`Transport`] with a connection-state guard.
///
/// `connect` is a no-op while a connection is open or in flight, and `send`
/// is a no-op unless connected.
pub struct TransportChannel {
    transport: Box<dyn Transport>,
    store: Arc<dyn SettingsStore>,
    defaults: ConnectionSettings,
    state: ChannelState,
    generation: u64,
    settings: Option<ConnectionSettings>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportChannel {
    /// Creates a channel whose events are delivered to `events_tx`.
    pub fn new(
        transport: Box<dyn Transport>,
        store: Arc<dyn SettingsStore>,
        defaults: ConnectionSettings,
        events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    ) -> Self {
        Self {
            transport,
            store,
            defaults,
            state: ChannelState::Disconnected,
            generation: 0,
            settings: None,
            events_tx,
        }
    }

    /// Persists first-run defaults if the store lacks connection settings.
    pub fn configure(&self) -> Result<()> {
        ConnectionSettings::ensure_stored(self.store.as_ref(), &self.defaults)
    }

    /// Opens a connection unless one is open or in flight.
    pub fn connect(&mut self) -> Result<()> {
        if self.state != ChannelState::Disconnected {
            tracing::debug!(state = %self.state, "Connect ignored, channel busy");
            return Ok(());
        }

        let settings = ConnectionSettings::load(self.store.as_ref())?
            .unwrap_or_else(|| self.defaults.clone());
        let url = settings.url();
        url::Url::parse(&url).with_context(|| format!("Invalid device manager URL: {}", url))?;

        self.generation += 1;
        self.state = ChannelState::Connecting;
        self.settings = Some(settings);

        tracing::info!("Connecting to device manager at {}", url);
        self.transport
            .open(&url, EventSink::new(self.generation, self.events_tx.clone()));
        Ok(())
    }

    /// Starts a normal close if a connection is open or in flight.
    pub fn disconnect(&mut self) {
        if self.state == ChannelState::Disconnected {
            return;
        }
        self.transport.close(NORMAL_CLOSURE, NORMAL_CLOSURE_REASON);
    }

    /// Sends a frame. Returns false (and drops the frame) unless connected.
    pub fn send(&mut self, frame: Frame) -> bool {
        if self.state != ChannelState::Connected {
            tracing::debug!(state = %self.state, "Dropping outbound frame, not connected");
            return false;
        }
        self.transport.send(frame);
        true
    }

    /// Applies an event to the channel state.
    ///
    /// Returns the event to republish, or `None` for events from a
    /// superseded connection.
    pub fn accept(&mut self, generation: u64, event: TransportEvent) -> Option<TransportEvent> {
        if generation != self.generation {
            tracing::debug!(generation, current = self.generation, "Dropping stale transport event");
            return None;
        }
        match &event {
            TransportEvent::Opened => self.state = ChannelState::Connected,
            TransportEvent::Closed { .. } => self.state = ChannelState::Disconnected,
            TransportEvent::Message(_) | TransportEvent::Error(_) => {}
        }
        Some(event)
    }

    /// Returns the channel state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Returns true if the socket is open.
    pub fn is_connected(&self) -> bool {
        self.state == ChannelState::Connected
    }

    /// Returns the settings resolved by the last `connect`.
    pub fn connection_settings(&self) -> Option<&ConnectionSettings> {
        self.settings.as_ref()
    }

    /// Forgets stored connection settings. Only valid while disconnected.
    pub fn reset(&mut self) -> Result<()> {
        self.store.clear(PROTOCOL_KEY)?;
        self.store.clear(HOST_KEY)?;
        self.store.clear(PORT_KEY)?;
        self.settings = None;
        Ok(())
    }
}

/// A scripted transport that records what the channel asks of it.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Calls made on a [`RecordingTransport`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum Call {
        Open(String),
        Send(Frame),
        Close(u16, String),
    }

    /// Records calls and keeps the last sink so tests can inject events.
    #[derive(Clone, Default)]
    pub struct RecordingTransport {
        pub calls: Arc<Mutex<Vec<Call>>>,
        pub sink: Arc<Mutex<Option<EventSink>>>,
    }

    impl RecordingTransport {
        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        pub fn sent(&self) -> Vec<Frame> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    Call::Send(frame) => Some(frame),
                    _ => None,
                })
                .collect()
        }

        pub fn emit(&self, event: TransportEvent) {
            let sink = self.sink.lock().unwrap().clone().expect("transport was never opened");
            sink.emit(event);
        }
    }

    impl Transport for RecordingTransport {
        fn open(&mut self, url: &str, sink: EventSink) {
            self.calls.lock().unwrap().push(Call::Open(url.to_string()));
            *self.sink.lock().unwrap() = Some(sink);
        }

        fn send(&mut self, frame: Frame) {
            self.calls.lock().unwrap().push(Call::Send(frame));
        }

        fn close(&mut self, code: u16, reason: &str) {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Close(code, reason.to_string()));
        }
    }
}
