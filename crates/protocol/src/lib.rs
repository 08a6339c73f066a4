//! # Shadow Protocol Library
//!
//! This crate provides the wire-level pieces of the Shadow device-pairing
//! protocol, used by a controller to drive a device manager.
//!
//! ## Overview
//!
//! - **Pairing Cryptography**: PBKDF2 key derivation, AES-256-CBC envelopes
//!   and the mutual challenge exchange
//! - **Message Definitions**: Builders for every outbound envelope kind
//! - **Inbound Codec**: Decoding of text and encrypted frames, log redaction
//! - **Frames**: The text/binary split carried over the WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │      JSON envelopes {action, source,    │  MessageFormatter / codec
//! │              options}                   │
//! ├─────────────────────────────────────────┤
//! │      AES-256-CBC, IV-prefixed           │  CryptoEngine
//! ├─────────────────────────────────────────┤
//! │      Text / Binary frames               │  Frame
//! ├─────────────────────────────────────────┤
//! │      WebSocket (ws://host:port/shadow)  │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{CryptoEngine, KeySource, MessageFormatter, DEFAULT_SALT};
//!
//! let mut crypto = CryptoEngine::new();
//! crypto
//!     .configure(KeySource::Passcode {
//!         salt: DEFAULT_SALT.to_string(),
//!         passcode: protocol::generate_uuid(),
//!     })
//!     .unwrap();
//!
//! let formatter = MessageFormatter::new(protocol::generate_uuid(), "My Controller");
//! let pair_request = formatter.pair(&crypto).unwrap();
//! assert!(pair_request.contains("\"action\":\"pair\""));
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: Key material, challenge and cipher operations
//! - [`messages`]: Outbound envelope builders and reason codes
//! - [`codec`]: Inbound decoding and log redaction
//! - [`framing`]: Wire frames
//! - [`error`]: Error types

pub mod codec;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod messages;

pub use codec::{decode, Decoded, Inbound, InboundMessage, REDACTED_URL};
pub use crypto::{
    Challenge, CryptoEngine, KeyMaterial, KeySource, CHALLENGE_LENGTH, DEFAULT_SALT, KEY_LENGTH,
    PBKDF2_ITERATIONS,
};
pub use error::{ProtocolError, Result};
pub use framing::Frame;
pub use messages::{
    generate_uuid, is_uuid_shaped, merge_defaults, CloseReason, DeviceCommand, InventoryRequest,
    MessageFormatter, MIN_DEVICE_MANAGER_VERSION,
};
