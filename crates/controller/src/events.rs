//! Public session events.

use protocol::CloseReason;
use tokio::sync::broadcast;

/// Capacity of the session event channel.
pub(crate) const EVENT_CAPACITY: usize = 64;

/// Events published by a session to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake completed. Carries the session key as hex.
    Connected { session_key: String },
    /// The connection closed with the given reason code.
    Disconnected { reason: u16 },
    /// The device manager finished transferring screenshots.
    ScreenshotsComplete,
}

impl SessionEvent {
    /// Returns the event name used on the public surface.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::ScreenshotsComplete => "screenshotsComplete",
        }
    }

    /// Maps a disconnect reason to a known [`CloseReason`], if it is one.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SessionEvent::Disconnected { reason } => CloseReason::from_code(*reason),
            _ => None,
        }
    }
}

/// Receiving end of a session subscription.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;
