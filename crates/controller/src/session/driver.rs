//! Session driver task and its public handle.

use std::sync::Arc;
use std::time::Duration;

use protocol::{generate_uuid, DeviceCommand, InventoryRequest};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info};

use super::machine::ProtocolSession;
use super::{SessionError, SessionState};
use crate::config::Config;
use crate::events::{EventReceiver, SessionEvent, EVENT_CAPACITY};
use crate::storage::SettingsStore;
use crate::transport::{
    ChannelState, ConnectionSettings, Transport, TransportChannel, TransportEvent,
};

/// Capacity of the command channel.
const COMMAND_CAPACITY: usize = 64;

/// Tunables for a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Settings persisted on first run.
    pub connection_defaults: ConnectionSettings,
    /// Time between keepalive pings once connected.
    pub keepalive_interval: Duration,
    /// URL handed to devices for remote inspection.
    pub inspection_url: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connection_defaults: ConnectionSettings::default(),
            keepalive_interval: Duration::from_secs(20),
            inspection_url: String::new(),
        }
    }
}

impl SessionOptions {
    /// Builds options from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            connection_defaults: config.connection.clone().into(),
            keepalive_interval: Duration::from_secs(config.session.keepalive_interval_secs),
            ..Default::default()
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub channel: ChannelState,
    pub connection: Option<ConnectionSettings>,
    pub device_manager_version: Option<i64>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Connect {
        name: String,
        id: String,
        token: Option<String>,
        reply: Reply<()>,
    },
    Disconnect,
    Reset {
        reply: Reply<()>,
    },
    Publish {
        command: DeviceCommand,
        destinations: Vec<String>,
    },
    Inventory(InventoryRequest),
    Preferences {
        subaction: &'static str,
        prefs: Option<Value>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown,
}

/// Spawns a session driver over `transport`.
///
/// Returns the handle used to control it and the driver's join handle. The
/// driver runs until [`SessionHandle::shutdown`] is called or every handle
/// is dropped.
pub fn spawn<T>(
    transport: T,
    store: Arc<dyn SettingsStore>,
    options: SessionOptions,
) -> (SessionHandle, JoinHandle<()>)
where
    T: Transport + 'static,
{
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (transport_tx, transport_rx) = mpsc::unbounded_channel();
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);

    let channel = TransportChannel::new(
        Box::new(transport),
        store.clone(),
        options.connection_defaults.clone(),
        transport_tx,
    );
    let session = ProtocolSession::new(
        channel,
        store,
        event_tx.clone(),
        options.inspection_url.clone(),
    );

    let driver = SessionDriver {
        session,
        commands: command_rx,
        transport_events: transport_rx,
        keepalive_interval: options.keepalive_interval,
        keepalive: None,
    };
    let task = tokio::spawn(driver.run());

    (
        SessionHandle {
            commands: command_tx,
            events: event_tx,
        },
        task,
    )
}

struct SessionDriver {
    session: ProtocolSession,
    commands: mpsc::Receiver<Command>,
    transport_events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    keepalive_interval: Duration,
    keepalive: Option<Interval>,
}

impl SessionDriver {
    async fn run(mut self) {
        debug!("Session driver started");
        loop {
            // Inbound traffic is applied before queued commands.
            tokio::select! {
                biased;
                Some((generation, event)) = self.transport_events.recv() => {
                    self.session.handle_transport(generation, event);
                }
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = next_tick(&mut self.keepalive) => self.session.keepalive_tick(),
            }
            self.sync_keepalive();
        }
        info!("Session driver stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect {
                name,
                id,
                token,
                reply,
            } => {
                let _ = reply.send(self.session.connect(&name, &id, token.as_deref()));
            }
            Command::Disconnect => self.session.disconnect(),
            Command::Reset { reply } => {
                let _ = reply.send(self.session.reset());
            }
            Command::Publish {
                command,
                destinations,
            } => self.session.publish(&command, &destinations),
            Command::Inventory(request) => self.session.inventory(&request),
            Command::Preferences { subaction, prefs } => {
                self.session.preferences(subaction, prefs.as_ref())
            }
            Command::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    state: self.session.state(),
                    channel: self.session.channel_state(),
                    connection: self.session.connection_settings().cloned(),
                    device_manager_version: self.session.device_manager_version(),
                });
            }
            Command::Shutdown => {}
        }
    }

    /// Keeps the timer running exactly while the session is connected.
    fn sync_keepalive(&mut self) {
        match (self.session.keepalive_active(), self.keepalive.is_some()) {
            (true, false) => {
                let period = self.keepalive_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.keepalive = Some(interval);
                debug!(?period, "Keepalive started");
            }
            (false, true) => {
                self.keepalive = None;
                debug!("Keepalive stopped");
            }
            _ => {}
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::SessionClosed)
    }

    async fn request<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        self.send(command).await?;
        rx.await.map_err(|_| SessionError::SessionClosed)?
    }

    /// Subscribes to session events, in publication order.
    ///
    /// Subscribe before `connect` to be sure to see the `Connected` event.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Validates the identity and starts pairing.
    ///
    /// Configuration errors are returned before any connection is opened.
    /// An empty or absent `token` starts first-time pairing.
    pub async fn connect(
        &self,
        name: &str,
        id: &str,
        token: Option<&str>,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(
            Command::Connect {
                name: name.to_string(),
                id: id.to_string(),
                token: token.map(str::to_string),
                reply,
            },
            rx,
        )
        .await
    }

    /// Requests a clean disconnect. Idempotent.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Disconnect).await
    }

    /// Forgets saved settings and key material. Requires a closed transport.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Reset { reply }, rx).await
    }

    /// Loads `url` on every device.
    ///
    /// Like every command below, this is only meaningful after `Connected`
    /// was observed; earlier calls are silently dropped.
    pub async fn send_url(&self, url: &str, fullscreen: bool) -> Result<(), SessionError> {
        self.publish(DeviceCommand::Navigate {
            url: url.to_string(),
            fullscreen,
        })
        .await
    }

    /// Loads `url` with remote inspection on every device.
    pub async fn inspect_url(&self, url: &str, fullscreen: bool) -> Result<(), SessionError> {
        self.publish(DeviceCommand::Inspect {
            url: url.to_string(),
            fullscreen,
        })
        .await
    }

    /// Requests screenshots from every device. Returns the request id.
    pub async fn take_screenshot(
        &self,
        full_page: bool,
        dual_orientation: bool,
    ) -> Result<String, SessionError> {
        let request_id = generate_uuid();
        self.publish(DeviceCommand::Screenshot {
            request_id: request_id.clone(),
            full_page,
            dual_orientation,
        })
        .await?;
        Ok(request_id)
    }

    /// Reloads the page on every device.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.publish(DeviceCommand::Refresh {
            request_id: generate_uuid(),
        })
        .await
    }

    /// Aborts a screenshot transfer.
    pub async fn cancel_screenshot(&self) -> Result<(), SessionError> {
        self.publish(DeviceCommand::CancelScreenshot {
            request_id: generate_uuid(),
        })
        .await
    }

    pub async fn show_chrome(&self) -> Result<(), SessionError> {
        self.publish(DeviceCommand::ShowChrome {
            request_id: generate_uuid(),
        })
        .await
    }

    pub async fn hide_chrome(&self) -> Result<(), SessionError> {
        self.publish(DeviceCommand::HideChrome {
            request_id: generate_uuid(),
        })
        .await
    }

    async fn publish(&self, command: DeviceCommand) -> Result<(), SessionError> {
        self.send(Command::Publish {
            command,
            destinations: Vec::new(),
        })
        .await
    }

    /// Lists devices with the given status (e.g. `"connected"`).
    pub async fn list_devices(&self, status: &str) -> Result<(), SessionError> {
        self.send(Command::Inventory(InventoryRequest::ListResources {
            status: status.to_string(),
        }))
        .await
    }

    /// Answers a device's passcode prompt.
    pub async fn passcode_response(
        &self,
        passcode: &str,
        device_id: &str,
    ) -> Result<(), SessionError> {
        self.send(Command::Inventory(InventoryRequest::PasscodeResponse {
            passcode: passcode.to_string(),
            device_id: device_id.to_string(),
        }))
        .await
    }

    pub async fn eject_devices(&self, device_ids: Vec<String>) -> Result<(), SessionError> {
        self.send(Command::Inventory(InventoryRequest::Eject(device_ids)))
            .await
    }

    pub async fn forget_devices(&self, device_ids: Vec<String>) -> Result<(), SessionError> {
        self.send(Command::Inventory(InventoryRequest::Forget(device_ids)))
            .await
    }

    pub async fn cancel_connect(&self, device_ids: Vec<String>) -> Result<(), SessionError> {
        self.send(Command::Inventory(InventoryRequest::CancelConnect(
            device_ids,
        )))
        .await
    }

    /// Asks the device manager to describe itself.
    pub async fn host_info(&self) -> Result<(), SessionError> {
        self.send(Command::Inventory(InventoryRequest::HostInfo))
            .await
    }

    pub async fn get_preferences(&self) -> Result<(), SessionError> {
        self.send(Command::Preferences {
            subaction: "get",
            prefs: None,
        })
        .await
    }

    pub async fn set_preferences(&self, prefs: Value) -> Result<(), SessionError> {
        self.send(Command::Preferences {
            subaction: "set",
            prefs: Some(prefs),
        })
        .await
    }

    /// Returns the session's current status.
    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| SessionError::SessionClosed)
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        Ok(self.status().await?.state)
    }

    /// Returns the settings the last connection attempt resolved.
    pub async fn connection_settings(&self) -> Result<Option<ConnectionSettings>, SessionError> {
        Ok(self.status().await?.connection)
    }

    /// Stops the driver. No further events are published.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown).await
    }
}
