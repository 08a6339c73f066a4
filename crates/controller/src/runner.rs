//! Batch runner: pair, visit a list of URLs, screenshot each, disconnect.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use protocol::{generate_uuid, CloseReason};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::events::{EventReceiver, SessionEvent};
use crate::session::SessionHandle;
use crate::storage::{SettingsStore, UUID_KEY};
use crate::transport::ChannelState;

/// Pause between the `connected` event and the first URL.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Default pause after each URL and each screenshot.
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(3000);

/// How long to wait for the close handshake after a disconnect request.
pub const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Who the controller says it is.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub id: String,
    pub token: Option<String>,
}

/// What to do once paired.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub urls: Vec<String>,
    pub step_delay: Duration,
    pub screenshots: bool,
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub urls_sent: usize,
    pub screenshot_requests: Vec<String>,
    pub disconnect_reason: u16,
}

/// Returns the driver id to use, persisting a new one when none is known.
///
/// An explicit id wins and is not stored.
pub fn resolve_driver_id(store: &dyn SettingsStore, explicit: Option<&str>) -> Result<String> {
    if let Some(id) = explicit {
        return Ok(id.to_string());
    }
    if let Some(id) = store.get(UUID_KEY)? {
        return Ok(id);
    }
    let id = generate_uuid();
    store
        .put(UUID_KEY, &id)
        .context("Failed to persist driver id")?;
    info!("Generated new driver id {}", id);
    Ok(id)
}

/// Pairs, runs the plan and disconnects.
pub async fn run(handle: &SessionHandle, identity: &Identity, plan: &RunPlan) -> Result<RunReport> {
    let mut events = handle.subscribe();
    handle
        .connect(&identity.name, &identity.id, identity.token.as_deref())
        .await
        .context("Failed to start pairing")?;

    match next_event(&mut events).await? {
        SessionEvent::Connected { .. } => info!("Connected to device manager"),
        SessionEvent::Disconnected { reason } => bail!(describe_failure(reason)),
        SessionEvent::ScreenshotsComplete => bail!("Unexpected event before pairing"),
    }

    tokio::time::sleep(SETTLE_DELAY).await;

    let mut report = RunReport {
        urls_sent: 0,
        screenshot_requests: Vec::new(),
        disconnect_reason: 0,
    };
    for url in &plan.urls {
        info!("Sending URL {}", url);
        handle.send_url(url, false).await?;
        report.urls_sent += 1;
        tokio::time::sleep(plan.step_delay).await;

        if plan.screenshots {
            let request_id = handle.take_screenshot(true, true).await?;
            debug!(request_id = %request_id, "Screenshot requested");
            report.screenshot_requests.push(request_id);
            tokio::time::sleep(plan.step_delay).await;
        }
    }

    drop(events);
    report.disconnect_reason = disconnect(handle, DISCONNECT_TIMEOUT)
        .await?
        .context("Connection was not closed cleanly")?;
    info!(reason = report.disconnect_reason, "Run finished");
    Ok(report)
}

/// Requests a clean disconnect and waits up to `timeout` for the close.
///
/// Returns the reported reason, or `None` if the transport was already
/// closed or the close did not complete in time.
pub async fn disconnect(handle: &SessionHandle, timeout: Duration) -> Result<Option<u16>> {
    if handle.status().await?.channel == ChannelState::Disconnected {
        return Ok(None);
    }
    let mut events = handle.subscribe();
    handle.disconnect().await?;

    let closed = tokio::time::timeout(timeout, async {
        loop {
            match next_event(&mut events).await? {
                SessionEvent::Disconnected { reason } => return Ok::<_, anyhow::Error>(reason),
                other => debug!(event = other.name(), "Event while disconnecting"),
            }
        }
    })
    .await;

    match closed {
        Ok(reason) => reason.map(Some),
        Err(_) => {
            warn!(?timeout, "Timed out waiting for the connection to close");
            Ok(None)
        }
    }
}

async fn next_event(events: &mut EventReceiver) -> Result<SessionEvent> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed session events"),
            Err(RecvError::Closed) => bail!("Session stopped"),
        }
    }
}

fn describe_failure(reason: u16) -> String {
    let detail = match CloseReason::from_code(reason) {
        Some(CloseReason::VersionMismatch) => "device manager version is not supported",
        Some(CloseReason::ServerRejected) => "device manager rejected this controller",
        Some(CloseReason::ServerMaxConnections) => "device manager has no free connections",
        Some(CloseReason::ServerShutdown) => "device manager is shutting down",
        Some(CloseReason::ServerEjected) => "device manager ejected this controller",
        Some(CloseReason::Clean) | Some(CloseReason::Unknown) | None => "connection closed",
    };
    format!("Pairing failed: {} (reason {})", detail, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn test_resolve_driver_id_prefers_explicit() {
        let store = MemoryStore::new();
        let id = resolve_driver_id(&store, Some("5591944b-b354-404e-b714-70652e94ef03")).unwrap();
        assert_eq!(id, "5591944b-b354-404e-b714-70652e94ef03");
        assert_eq!(store.get(UUID_KEY).unwrap(), None);
    }

    #[test]
    fn test_resolve_driver_id_generates_once() {
        let store = MemoryStore::new();
        let first = resolve_driver_id(&store, None).unwrap();
        let second = resolve_driver_id(&store, None).unwrap();
        assert_eq!(first, second);
        assert!(protocol::is_uuid_shaped(&first));
    }

    #[test]
    fn test_describe_failure() {
        assert!(describe_failure(3001).contains("not supported"));
        assert!(describe_failure(1006).contains("reason 1006"));
    }
}
