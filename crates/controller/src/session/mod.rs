//! Protocol session: pairing, authentication and command exchange.
//!
//! [`ProtocolSession`] is the synchronous state machine. It is owned by a
//! driver task spawned with [`spawn`], which serializes commands, transport
//! events and keepalive ticks; callers talk to it through a cloneable
//! [`SessionHandle`].

mod driver;
mod machine;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub use driver::{spawn, SessionHandle, SessionOptions, SessionStatus};
pub use machine::{validate_identity, ProtocolSession};

/// Errors returned to direct callers of the session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("driver name cannot be empty")]
    EmptyName,

    #[error("driver id is not a UUID: {0}")]
    InvalidDriverId(String),

    #[error("invalid encryption token: {0}")]
    InvalidEncryptionToken(String),

    #[error("crypto self-test failed, refusing to pair")]
    CryptoUnavailable,

    #[error("session is not disconnected")]
    NotDisconnected,

    #[error("session driver has stopped")]
    SessionClosed,

    #[error("settings store error: {0}")]
    Storage(String),
}

impl SessionError {
    pub(crate) fn storage(error: anyhow::Error) -> Self {
        SessionError::Storage(format!("{:#}", error))
    }
}

/// Where the session is in the pairing lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No identity configured yet.
    Unconfigured,
    /// Configured, transport connecting.
    Configuring,
    /// Pair request sent, waiting for `pair_ready`.
    AwaitingPairAck,
    /// Challenge response sent, waiting for `connect_ok`.
    AwaitingChallengeResult,
    /// Handshake complete; keepalive running.
    Connected,
    /// Clean close requested.
    Disconnecting,
    /// Transport closed.
    Disconnected,
    /// The device manager speaks an unsupported version.
    Rejected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unconfigured => "unconfigured",
            SessionState::Configuring => "configuring",
            SessionState::AwaitingPairAck => "awaiting_pair_ack",
            SessionState::AwaitingChallengeResult => "awaiting_challenge_result",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Rejected => "rejected",
        };
        f.write_str(name)
    }
}
