//! Outbound message definitions for the Shadow protocol.
//!
//! Every envelope has the shape `{action, source, options}`. The builders on
//! [`MessageFormatter`] fill in the protocol-required fields (action name,
//! source id, nonce) so callers only supply what varies per request.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::crypto::CryptoEngine;
use crate::error::{ProtocolError, Result};

/// Oldest device manager message version this client can talk to.
pub const MIN_DEVICE_MANAGER_VERSION: i64 = 1;

/// `type` reported in administrator messages.
pub const CLIENT_TYPE: &str = "administrator";

/// Reason codes surfaced through the `Disconnected` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// The controller disconnected on purpose.
    Clean,
    /// The device manager is shutting down.
    ServerShutdown,
    /// The device manager ejected this controller.
    ServerEjected,
    /// The device manager rejected this controller.
    ServerRejected,
    /// The device manager has no free connection slots.
    ServerMaxConnections,
    /// The device manager speaks an unsupported message version.
    VersionMismatch,
    /// No explicit reason and no usable close code.
    Unknown,
}

impl CloseReason {
    /// Returns the numeric code exposed to subscribers.
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Clean => 1001,
            CloseReason::ServerShutdown => 2001,
            CloseReason::ServerEjected => 2002,
            CloseReason::ServerRejected => 2003,
            CloseReason::ServerMaxConnections => 2004,
            CloseReason::VersionMismatch => 3001,
            CloseReason::Unknown => 4001,
        }
    }

    /// Maps a numeric code back to a known reason.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1001 => Some(CloseReason::Clean),
            2001 => Some(CloseReason::ServerShutdown),
            2002 => Some(CloseReason::ServerEjected),
            2003 => Some(CloseReason::ServerRejected),
            2004 => Some(CloseReason::ServerMaxConnections),
            3001 => Some(CloseReason::VersionMismatch),
            4001 => Some(CloseReason::Unknown),
            _ => None,
        }
    }
}

/// Returns true if `id` is shaped like a lowercase v4 UUID (8-4-4-4-12 hex).
pub fn is_uuid_shaped(id: &str) -> bool {
    let groups: Vec<&str> = id.split('-').collect();
    let expected = [8, 4, 4, 4, 12];
    groups.len() == expected.len()
        && groups.iter().zip(expected).all(|(group, len)| {
            group.len() == len
                && group
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        })
}

/// Generates a random lowercase v4 UUID.
pub fn generate_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Merges caller parameters into a message skeleton.
///
/// String and null leaves in `skeleton` are defaults that only apply where
/// `params` leaves the key undefined (or null). Objects are merged key by
/// key. Any other skeleton value is replaced by the caller's value when the
/// caller provides one. Keys only present in `params` are kept.
pub fn merge_defaults(skeleton: &Value, params: Value) -> Value {
    match (skeleton, params) {
        (Value::Object(defaults), Value::Object(mut merged)) => {
            for (key, default) in defaults {
                let supplied = merged.remove(key).filter(|v| !v.is_null());
                let value = match (default, supplied) {
                    (_, None) => default.clone(),
                    (Value::Object(_), Some(supplied)) => merge_defaults(default, supplied),
                    (_, Some(supplied)) => supplied,
                };
                merged.insert(key.clone(), value);
            }
            Value::Object(merged)
        }
        (_, Value::Null) => skeleton.clone(),
        (_, params) => params,
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a, O> {
    action: &'a str,
    source: &'a str,
    options: O,
}

#[derive(Debug, Serialize)]
struct AdminOptions<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    client_type: &'static str,
    id: &'a str,
    rand: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    passcode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    challenge: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct NonceOptions {
    random: String,
}

#[derive(Debug, Serialize)]
struct PublishOptions<'a> {
    message: DeviceMessage<'a>,
    random: String,
    destinations: &'a [String],
}

#[derive(Debug, Serialize)]
struct DeviceMessage<'a> {
    source: &'a str,
    action: &'static str,
    options: Value,
}

#[derive(Debug, Serialize)]
struct SubactionOptions<'a> {
    random: String,
    subaction: &'a str,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

/// Device inventory requests, sent as `action: "inventory"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryRequest {
    /// List known devices with the given status filter.
    ListResources { status: String },
    /// Answer a device's passcode prompt.
    PasscodeResponse { passcode: String, device_id: String },
    /// Disconnect devices.
    Eject(Vec<String>),
    /// Remove devices from the manager's memory.
    Forget(Vec<String>),
    /// Abort pending device connections.
    CancelConnect(Vec<String>),
    /// Ask the manager about itself.
    HostInfo,
}

impl InventoryRequest {
    /// Returns the `subaction` name on the wire.
    pub fn subaction(&self) -> &'static str {
        match self {
            InventoryRequest::ListResources { .. } => "listresources",
            InventoryRequest::PasscodeResponse { .. } => "passcode_response",
            InventoryRequest::Eject(_) => "eject_device",
            InventoryRequest::Forget(_) => "forget_device",
            InventoryRequest::CancelConnect(_) => "cancel_connect",
            InventoryRequest::HostInfo => "get_manager_info",
        }
    }

    fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        match self {
            InventoryRequest::ListResources { status } => {
                fields.insert("status".into(), Value::from(status.as_str()));
                fields.insert("type".into(), Value::from("device"));
            }
            InventoryRequest::PasscodeResponse {
                passcode,
                device_id,
            } => {
                fields.insert("passcode".into(), Value::from(passcode.as_str()));
                fields.insert("id".into(), Value::from(device_id.as_str()));
            }
            InventoryRequest::Eject(ids)
            | InventoryRequest::Forget(ids)
            | InventoryRequest::CancelConnect(ids) => {
                fields.insert("deviceids".into(), Value::from(ids.clone()));
            }
            InventoryRequest::HostInfo => {}
        }
        fields
    }
}

/// Commands published to devices, sent as `action: "publish"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Load a URL in the device browser.
    Navigate { url: String, fullscreen: bool },
    /// Load a URL with remote inspection attached.
    Inspect { url: String, fullscreen: bool },
    /// Capture screenshots.
    Screenshot {
        request_id: String,
        full_page: bool,
        dual_orientation: bool,
    },
    /// Reload the current page.
    Refresh { request_id: String },
    /// Abort a screenshot transfer.
    CancelScreenshot { request_id: String },
    /// Show browser chrome.
    ShowChrome { request_id: String },
    /// Hide browser chrome (full screen).
    HideChrome { request_id: String },
}

impl DeviceCommand {
    /// Returns the nested device action name.
    pub fn action(&self) -> &'static str {
        match self {
            DeviceCommand::Navigate { .. } | DeviceCommand::Inspect { .. } => "browser_navigate",
            DeviceCommand::Screenshot { .. } => "screenshot_request",
            DeviceCommand::Refresh { .. } => "force_refresh",
            DeviceCommand::CancelScreenshot { .. } => "transfer_cancel",
            DeviceCommand::ShowChrome { .. } => "show_chrome",
            DeviceCommand::HideChrome { .. } => "full_screen",
        }
    }

    fn options(&self, inspection_url: &str) -> Value {
        // Devices expect the fullscreen flag as a string.
        let flag = |b: bool| if b { "true" } else { "false" };
        match self {
            DeviceCommand::Navigate { url, fullscreen } => serde_json::json!({
                "url": url,
                "fullscreen": flag(*fullscreen),
            }),
            DeviceCommand::Inspect { url, fullscreen } => serde_json::json!({
                "url": url,
                "remoteinspect": inspection_url,
                "fullscreen": flag(*fullscreen),
            }),
            DeviceCommand::Screenshot {
                request_id,
                full_page,
                dual_orientation,
            } => serde_json::json!({
                "request_id": request_id,
                "full_page": full_page,
                "dual_orientation": dual_orientation,
            }),
            DeviceCommand::Refresh { request_id }
            | DeviceCommand::CancelScreenshot { request_id }
            | DeviceCommand::ShowChrome { request_id }
            | DeviceCommand::HideChrome { request_id } => {
                serde_json::json!({ "request_id": request_id })
            }
        }
    }
}

/// Builds serialized outbound envelopes for one controller identity.
#[derive(Debug, Clone)]
pub struct MessageFormatter {
    uuid: String,
    client_name: String,
    inspection_url: String,
}

impl MessageFormatter {
    /// Creates a formatter for the given controller id and display name.
    pub fn new(uuid: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            client_name: client_name.into(),
            inspection_url: String::new(),
        }
    }

    /// Sets the URL devices should use for remote inspection.
    pub fn with_inspection_url(mut self, url: impl Into<String>) -> Self {
        self.inspection_url = url.into();
        self
    }

    /// Returns the controller id used as `source`.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    fn envelope<O: Serialize>(&self, action: &str, options: O) -> Result<String> {
        let envelope = Envelope {
            action,
            source: &self.uuid,
            options,
        };
        serde_json::to_string(&envelope).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn admin(
        &self,
        action: &str,
        crypto: &CryptoEngine,
        passcode: Option<&str>,
        challenge: Option<&str>,
    ) -> Result<String> {
        let rand = crypto
            .challenge()
            .map(|c| c.to_hex())
            .ok_or(ProtocolError::NotConfigured)?;
        self.envelope(
            action,
            AdminOptions {
                name: &self.client_name,
                client_type: CLIENT_TYPE,
                id: &self.uuid,
                rand,
                passcode,
                challenge,
            },
        )
    }

    /// Plain pair request, sent unencrypted as soon as the socket opens.
    pub fn pair(&self, crypto: &CryptoEngine) -> Result<String> {
        self.admin("pair", crypto, None, None)
    }

    /// Pair request carrying our key as the passcode, for first-time pairing.
    pub fn pair_with_passcode(&self, crypto: &CryptoEngine) -> Result<String> {
        let key = crypto.key_hex().ok_or(ProtocolError::NotConfigured)?;
        self.admin("pair", crypto, Some(key), None)
    }

    /// Connect request carrying the verified challenge response.
    pub fn connect(&self, crypto: &CryptoEngine, challenge_response: &str) -> Result<String> {
        self.admin("connect", crypto, None, Some(challenge_response))
    }

    /// Keepalive ping.
    pub fn ping(&self) -> Result<String> {
        self.envelope(
            "ping",
            NonceOptions {
                random: CryptoEngine::random_hex(),
            },
        )
    }

    /// Inventory request.
    pub fn inventory(&self, request: &InventoryRequest) -> Result<String> {
        self.envelope(
            "inventory",
            SubactionOptions {
                random: CryptoEngine::random_hex(),
                subaction: request.subaction(),
                fields: request.fields(),
            },
        )
    }

    /// Device command addressed to `destinations` (empty means all devices).
    pub fn publish(&self, command: &DeviceCommand, destinations: &[String]) -> Result<String> {
        self.envelope(
            "publish",
            PublishOptions {
                message: DeviceMessage {
                    source: &self.uuid,
                    action: command.action(),
                    options: command.options(&self.inspection_url),
                },
                random: CryptoEngine::random_hex(),
                destinations,
            },
        )
    }

    /// Preferences get/set request.
    pub fn preferences(&self, subaction: &str, prefs: Option<&Value>) -> Result<String> {
        let mut fields = Map::new();
        if let Some(prefs) = prefs {
            fields.insert("prefs".into(), prefs.clone());
        }
        self.envelope(
            "preferences",
            SubactionOptions {
                random: CryptoEngine::random_hex(),
                subaction,
                fields,
            },
        )
    }

    /// Bare envelope with only a nonce.
    pub fn basic(&self, action: &str) -> Result<String> {
        self.basic_with_options(action, Value::Null)
    }

    /// Envelope for an arbitrary action, merging caller options over the
    /// required skeleton.
    pub fn basic_with_options(&self, action: &str, options: Value) -> Result<String> {
        let skeleton = serde_json::json!({
            "options": { "random": CryptoEngine::random_hex() },
            "source": self.uuid,
        });
        let params = serde_json::json!({ "action": action, "options": options });
        let merged = merge_defaults(&skeleton, params);
        serde_json::to_string(&merged).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
