//! The pairing/authentication state machine.
//!
//! Every method runs to completion without awaiting; the driver task calls
//! them one at a time, so session state is never mutated concurrently.

use std::sync::Arc;

use protocol::codec::decode_error_entry;
use protocol::{
    decode, generate_uuid, is_uuid_shaped, CloseReason, CryptoEngine, Decoded, DeviceCommand,
    Frame, Inbound, InventoryRequest, KeySource, MessageFormatter, DEFAULT_SALT, KEY_LENGTH,
    MIN_DEVICE_MANAGER_VERSION,
};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{SessionError, SessionState};
use crate::events::SessionEvent;
use crate::storage::{SettingsStore, VERSION_KEY};
use crate::transport::{ChannelState, ConnectionSettings, TransportChannel, TransportEvent};

/// Checks connect arguments and picks the key source.
///
/// An empty or absent token means first-time pairing with a fresh passcode.
pub fn validate_identity(
    name: &str,
    id: &str,
    token: Option<&str>,
) -> Result<KeySource, SessionError> {
    if name.is_empty() {
        return Err(SessionError::EmptyName);
    }
    if !is_uuid_shaped(id) {
        return Err(SessionError::InvalidDriverId(id.to_string()));
    }
    match token.filter(|t| !t.is_empty()) {
        None => Ok(KeySource::Passcode {
            salt: DEFAULT_SALT.to_string(),
            passcode: generate_uuid(),
        }),
        Some(token) => {
            if token.len() != KEY_LENGTH * 2 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(SessionError::InvalidEncryptionToken(format!(
                    "expected {} hex characters",
                    KEY_LENGTH * 2
                )));
            }
            Ok(KeySource::EncryptionKey(token.to_string()))
        }
    }
}

/// Controller side of one device manager session.
pub struct ProtocolSession {
    channel: TransportChannel,
    crypto: CryptoEngine,
    formatter: Option<MessageFormatter>,
    store: Arc<dyn SettingsStore>,
    events: broadcast::Sender<SessionEvent>,
    state: SessionState,
    shutdown_code: Option<CloseReason>,
    device_manager_version: Option<i64>,
    inspection_url: String,
}

impl ProtocolSession {
    /// Creates an unconfigured session over `channel`.
    pub fn new(
        channel: TransportChannel,
        store: Arc<dyn SettingsStore>,
        events: broadcast::Sender<SessionEvent>,
        inspection_url: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            crypto: CryptoEngine::new(),
            formatter: None,
            store,
            events,
            state: SessionState::Unconfigured,
            shutdown_code: None,
            device_manager_version: None,
            inspection_url: inspection_url.into(),
        }
    }

    /// Returns the session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns the transport channel state.
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Returns the settings the last connection attempt used.
    pub fn connection_settings(&self) -> Option<&ConnectionSettings> {
        self.channel.connection_settings()
    }

    /// Returns the version the device manager reported on this connection.
    pub fn device_manager_version(&self) -> Option<i64> {
        self.device_manager_version
    }

    /// True while pings should be sent.
    pub fn keepalive_active(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Configures identity and key material, then opens the transport.
    ///
    /// Fails before any network activity if the arguments are invalid or
    /// the crypto self-test fails.
    pub fn connect(
        &mut self,
        name: &str,
        id: &str,
        token: Option<&str>,
    ) -> Result<(), SessionError> {
        let source = validate_identity(name, id, token)?;
        if CryptoEngine::self_test().is_err() {
            return Err(SessionError::CryptoUnavailable);
        }
        if self.channel.state() != ChannelState::Disconnected {
            return Err(SessionError::NotDisconnected);
        }

        self.crypto
            .configure(source)
            .map_err(|e| SessionError::InvalidEncryptionToken(e.to_string()))?;
        self.formatter = Some(
            MessageFormatter::new(id, name).with_inspection_url(self.inspection_url.clone()),
        );
        self.channel.configure().map_err(SessionError::storage)?;

        self.shutdown_code = None;
        self.device_manager_version = None;
        self.channel.connect().map_err(SessionError::storage)?;
        self.state = SessionState::Configuring;
        info!(driver_id = %id, "Session configured, connecting");
        Ok(())
    }

    /// Requests a clean close. Safe to call in any state.
    pub fn disconnect(&mut self) {
        if self.channel.state() == ChannelState::Disconnected {
            debug!("Disconnect ignored, transport already closed");
            return;
        }
        if matches!(
            self.state,
            SessionState::Disconnecting | SessionState::Rejected
        ) {
            return;
        }
        info!("Disconnecting from device manager");
        self.shutdown_code = Some(CloseReason::Clean);
        self.state = SessionState::Disconnecting;
        self.channel.disconnect();
    }

    /// Forgets connection settings, identity and key material.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        if self.channel.state() != ChannelState::Disconnected {
            return Err(SessionError::NotDisconnected);
        }
        self.channel.reset().map_err(SessionError::storage)?;
        self.store.clear_all().map_err(SessionError::storage)?;
        self.crypto.reset();
        self.formatter = None;
        self.shutdown_code = None;
        self.device_manager_version = None;
        self.state = SessionState::Unconfigured;
        info!("Session reset");
        Ok(())
    }

    /// Applies one transport event.
    pub fn handle_transport(&mut self, generation: u64, event: TransportEvent) {
        let Some(event) = self.channel.accept(generation, event) else {
            return;
        };
        match event {
            TransportEvent::Opened => self.on_open(),
            TransportEvent::Closed { code } => self.on_close(code),
            TransportEvent::Message(frame) => self.on_frame(frame),
            TransportEvent::Error(error) => warn!("Transport error: {}", error),
        }
    }

    /// Sends an encrypted ping if connected.
    pub fn keepalive_tick(&mut self) {
        if !self.keepalive_active() {
            return;
        }
        debug!("Sending keepalive ping");
        if let Some(ping) = self.build("ping", |f, _| f.ping()) {
            self.send_encrypted(ping);
        }
    }

    /// Sends a device command to `destinations` (empty means all).
    pub fn publish(&mut self, command: &DeviceCommand, destinations: &[String]) {
        if let Some(message) = self.build(command.action(), |f, _| f.publish(command, destinations)) {
            self.send_encrypted(message);
        }
    }

    /// Sends an inventory request.
    pub fn inventory(&mut self, request: &InventoryRequest) {
        if let Some(message) = self.build(request.subaction(), |f, _| f.inventory(request)) {
            self.send_encrypted(message);
        }
    }

    /// Sends a preferences request.
    pub fn preferences(&mut self, subaction: &str, prefs: Option<&Value>) {
        if let Some(message) = self.build("preferences", |f, _| f.preferences(subaction, prefs)) {
            self.send_encrypted(message);
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Configuring {
            debug!(state = %self.state, "Transport opened outside of pairing");
            return;
        }
        if let Some(pair) = self.build("pair", |f, crypto| f.pair(crypto)) {
            self.send_plain(pair);
            self.state = SessionState::AwaitingPairAck;
        }
    }

    fn on_close(&mut self, code: Option<u16>) {
        let reason = self
            .shutdown_code
            .take()
            .map(CloseReason::code)
            .or(code)
            .unwrap_or(CloseReason::Unknown.code());
        if self.state != SessionState::Rejected {
            self.state = SessionState::Disconnected;
        }
        info!(reason, "Disconnected from device manager");
        self.emit(SessionEvent::Disconnected { reason });
    }

    fn on_frame(&mut self, frame: Frame) {
        match decode(&frame, &self.crypto) {
            Err(e) => {
                warn!(
                    binary = frame.is_binary(),
                    "Dropping inbound frame ({} bytes): {}",
                    frame.len(),
                    e
                );
                self.record(&decode_error_entry(&frame, &e));
            }
            Ok(Decoded::Heartbeat) => debug!("Received pong"),
            Ok(Decoded::Message(message)) => {
                self.record(&message.to_log_string());
                self.dispatch(message.kind());
            }
        }
    }

    fn dispatch(&mut self, inbound: Inbound) {
        if self.state == SessionState::Rejected {
            debug!("Session rejected, ignoring inbound message");
            return;
        }
        match inbound {
            Inbound::PairReady { version, challenge } => {
                if !self.check_version(version) {
                    return;
                }
                let verified = challenge
                    .as_deref()
                    .map(|candidate| self.crypto.verify_challenge(candidate));
                match verified {
                    Some(Ok(response)) => {
                        if let Some(message) =
                            self.build("connect", |f, crypto| f.connect(crypto, &response))
                        {
                            // Only the challenge field is ciphertext.
                            self.send_plain(message);
                            self.state = SessionState::AwaitingChallengeResult;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("Challenge not verified ({}), pairing with passcode", e);
                        self.send_passcode_pair();
                    }
                    None => {
                        debug!("pair_ready without challenge, pairing with passcode");
                        self.send_passcode_pair();
                    }
                }
            }
            Inbound::PasscodeRequest { version } => {
                if self.check_version(version) {
                    self.send_passcode_pair();
                }
            }
            Inbound::ConnectOk => {
                if self.state != SessionState::AwaitingChallengeResult {
                    debug!(state = %self.state, "Ignoring connect_ok outside of pairing");
                    return;
                }
                self.state = SessionState::Connected;
                info!("Paired with device manager");
                let session_key = self.crypto.key_hex().unwrap_or_default().to_string();
                self.emit(SessionEvent::Connected { session_key });
            }
            Inbound::TransferComplete => self.emit(SessionEvent::ScreenshotsComplete),
            Inbound::Other(action) => debug!(action = %action, "Ignoring inbound message"),
        }
    }

    /// Records the peer version once per connection and gates on it.
    fn check_version(&mut self, reported: Option<i64>) -> bool {
        let version = match self.device_manager_version {
            Some(version) => version,
            None => {
                let version = reported.unwrap_or(0);
                self.device_manager_version = Some(version);
                if let Err(e) = self.store.put(VERSION_KEY, &version.to_string()) {
                    warn!("Failed to persist device manager version: {:#}", e);
                }
                version
            }
        };

        if version < MIN_DEVICE_MANAGER_VERSION {
            warn!(
                version,
                minimum = MIN_DEVICE_MANAGER_VERSION,
                "Unsupported device manager version"
            );
            self.shutdown_code = Some(CloseReason::VersionMismatch);
            self.state = SessionState::Rejected;
            self.channel.disconnect();
            return false;
        }
        true
    }

    fn send_passcode_pair(&mut self) {
        if let Some(message) = self.build("pair", |f, crypto| f.pair_with_passcode(crypto)) {
            self.send_plain(message);
            self.state = SessionState::AwaitingPairAck;
        }
    }

    fn build<F>(&self, what: &str, build: F) -> Option<String>
    where
        F: FnOnce(&MessageFormatter, &CryptoEngine) -> protocol::Result<String>,
    {
        let Some(formatter) = self.formatter.as_ref() else {
            debug!(kind = what, "Session not configured, dropping message");
            return None;
        };
        match build(formatter, &self.crypto) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(kind = what, "Failed to build message: {}", e);
                None
            }
        }
    }

    fn send_plain(&mut self, message: String) {
        self.record(&message);
        self.channel.send(Frame::Text(message));
    }

    fn send_encrypted(&mut self, message: String) {
        match self.crypto.encrypt_envelope(&message) {
            Ok(bytes) => {
                self.record(&message);
                self.channel.send(Frame::Binary(bytes));
            }
            Err(e) => warn!("Failed to encrypt outbound message: {}", e),
        }
    }

    fn record(&self, entry: &str) {
        if let Err(e) = self.store.log(entry) {
            warn!("Failed to append protocol log: {:#}", e);
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}
