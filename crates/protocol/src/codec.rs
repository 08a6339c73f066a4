//! Inbound message decoding and log redaction.
//!
//! Inbound frames are either plain JSON (text) or encrypted JSON (binary).
//! Decoding never panics: failures come back as [`ProtocolError`] so the
//! caller can log and drop the frame.

use serde_json::Value;

use crate::crypto::CryptoEngine;
use crate::error::{ProtocolError, Result};
use crate::framing::Frame;

/// Marker written over device-command URLs in persisted logs.
pub const REDACTED_URL: &str = "***scrubbed***";

/// Heartbeat acknowledgement action, never dispatched.
const PONG_ACTION: &str = "pong";

/// A decoded inbound envelope with its nonce removed.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    raw: Value,
}

impl InboundMessage {
    fn new(mut raw: Value) -> Self {
        if let Some(options) = raw.get_mut("options").and_then(Value::as_object_mut) {
            options.remove("random");
        }
        Self { raw }
    }

    /// Returns the `action` field, or an empty string if absent.
    pub fn action(&self) -> &str {
        self.raw.get("action").and_then(Value::as_str).unwrap_or("")
    }

    /// Returns the peer's message version, accepting numbers or numeric strings.
    pub fn version(&self) -> Option<i64> {
        match self.raw.get("version")? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the `options` object, if present.
    pub fn options(&self) -> Option<&Value> {
        self.raw.get("options")
    }

    /// Returns the full envelope.
    pub fn as_value(&self) -> &Value {
        &self.raw
    }

    /// Serializes the envelope for the persisted log.
    pub fn to_log_string(&self) -> String {
        self.raw.to_string()
    }

    /// Classifies the message for dispatch.
    pub fn kind(&self) -> Inbound {
        match self.action() {
            "pair_ready" => Inbound::PairReady {
                version: self.version(),
                challenge: self
                    .options()
                    .and_then(|o| o.get("challenge"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            "passcode_request" => Inbound::PasscodeRequest {
                version: self.version(),
            },
            "connect_ok" => Inbound::ConnectOk,
            "transfer_complete" => Inbound::TransferComplete,
            other => Inbound::Other(other.to_string()),
        }
    }
}

/// Inbound actions the session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The peer is ready to pair and sent its challenge candidate.
    PairReady {
        version: Option<i64>,
        challenge: Option<String>,
    },
    /// The peer wants the passcode-bearing pair request.
    PasscodeRequest { version: Option<i64> },
    /// The handshake completed.
    ConnectOk,
    /// Screenshot transfer finished.
    TransferComplete,
    /// Anything else; ignored by the session.
    Other(String),
}

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A message to log and dispatch.
    Message(InboundMessage),
    /// A `pong`, swallowed without logging or dispatch.
    Heartbeat,
}

/// Decodes a frame from the device manager.
pub fn decode(frame: &Frame, crypto: &CryptoEngine) -> Result<Decoded> {
    if frame.is_empty() {
        return Err(ProtocolError::InvalidEnvelope("empty frame".to_string()));
    }
    let value = match frame {
        Frame::Text(text) => serde_json::from_str::<Value>(text)?,
        Frame::Binary(bytes) => crypto.decrypt_envelope(bytes)?,
    };

    if !value.is_object() {
        return Err(ProtocolError::InvalidEnvelope(
            "expected a JSON object".to_string(),
        ));
    }
    if value.get("action").and_then(Value::as_str) == Some(PONG_ACTION) {
        return Ok(Decoded::Heartbeat);
    }
    Ok(Decoded::Message(InboundMessage::new(value)))
}

/// Builds the log entry recorded when a frame cannot be decoded.
pub fn decode_error_entry(frame: &Frame, error: &ProtocolError) -> String {
    let reason = match (frame, error) {
        (Frame::Text(_), ProtocolError::Deserialization(_)) => "Not Valid JSON",
        (Frame::Binary(_), ProtocolError::Decryption(_) | ProtocolError::Deserialization(_)) => {
            "Could Not Decrypt"
        }
        _ => "Invalid Envelope",
    };
    Value::String(format!(
        "MessageParser Error ({}): {}",
        reason,
        frame.display_payload()
    ))
    .to_string()
}

/// Applies log redaction to a serialized message.
///
/// Publish envelopes have their device-command URL replaced; otherwise a
/// top-level `options.rand` is removed. Returns `None` if `message` is not
/// JSON.
pub fn redact_log_entry(message: &str) -> Option<String> {
    let mut value: Value = serde_json::from_str(message).ok()?;
    if redact(&mut value) {
        Some(value.to_string())
    } else {
        Some(message.to_string())
    }
}

fn redact(value: &mut Value) -> bool {
    if value.get("action").and_then(Value::as_str) == Some("publish") {
        let url = value
            .pointer_mut("/options/message/options/url")
            .filter(|url| !url.is_null());
        return match url {
            Some(url) => {
                *url = Value::from(REDACTED_URL);
                true
            }
            None => false,
        };
    }
    value
        .get_mut("options")
        .and_then(Value::as_object_mut)
        .map(|options| options.remove("rand").is_some())
        .unwrap_or(false)
}
