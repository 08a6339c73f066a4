//! End-to-end tests against an in-process fake device manager.
//!
//! These tests run the real WebSocket transport and verify:
//! - Token and passcode pairing
//! - Version gating
//! - Device commands and log redaction
//! - Reset and reconnect

use std::sync::Arc;
use std::time::Duration;

use controller::runner::{self, Identity, RunPlan};
use controller::session::{self, SessionHandle, SessionOptions, SessionState};
use controller::storage::{MemoryStore, SettingsStore, VERSION_KEY};
use controller::transport::{ConnectionSettings, WebSocketTransport};
use controller::SessionEvent;
use futures_util::{SinkExt, StreamExt};
use protocol::{CryptoEngine, KeySource, CHALLENGE_LENGTH, REDACTED_URL};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

const ID: &str = "5591944b-b354-404e-b714-70652e94ef03";
const TOKEN: &str = "2bcf6b8854e61983b87b7756754ec6a694ce667aa1a2e2181c5d6dd949823d99";
const TIMEOUT: Duration = Duration::from_secs(10);

/// Fake device manager: answers pairing and records every message it sees.
struct DeviceManager {
    port: u16,
    seen: mpsc::UnboundedReceiver<Value>,
}

impl DeviceManager {
    async fn start(version: Value, token: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen) = mpsc::unbounded_channel();
        let token = token.map(str::to_string);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                serve(ws, &version, token.as_deref(), &seen_tx).await;
            }
        });

        Self { port, seen }
    }

    fn options(&self) -> SessionOptions {
        SessionOptions {
            connection_defaults: ConnectionSettings {
                protocol: "ws".into(),
                host: "127.0.0.1".into(),
                port: self.port.to_string(),
            },
            ..Default::default()
        }
    }

    fn actions(&mut self) -> Vec<String> {
        let mut actions = Vec::new();
        while let Ok(message) = self.seen.try_recv() {
            actions.push(message["action"].as_str().unwrap_or_default().to_string());
        }
        actions
    }
}

async fn serve(
    mut ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    version: &Value,
    token: Option<&str>,
    seen: &mpsc::UnboundedSender<Value>,
) {
    let mut peer = token.map(engine_for);

    while let Some(Ok(message)) = ws.next().await {
        let (value, encrypted): (Value, bool) = match message {
            Message::Text(text) => (serde_json::from_str(&text).unwrap(), false),
            Message::Binary(bytes) => match peer.as_ref() {
                Some(peer) => (peer.decrypt_envelope(&bytes).unwrap(), true),
                None => continue,
            },
            Message::Close(_) => break,
            _ => continue,
        };
        let _ = seen.send(value.clone());

        match value["action"].as_str() {
            Some("pair") => {
                if let Some(passcode) = value["options"]["passcode"].as_str() {
                    peer = Some(engine_for(passcode));
                }
                let reply = match peer.as_ref() {
                    Some(peer) => json!({
                        "action": "pair_ready",
                        "version": version,
                        "options": { "challenge": candidate(peer, &value) },
                    }),
                    None => json!({ "action": "passcode_request", "version": version }),
                };
                let _ = ws.send(Message::Text(reply.to_string())).await;
            }
            Some("connect") if encrypted => {
                // Admin messages must arrive as text frames.
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::from(2003),
                        reason: "connect must be a text frame".into(),
                    }))
                    .await;
                break;
            }
            Some("connect") => {
                if let Some(peer) = peer.as_ref() {
                    let ok = json!({ "action": "connect_ok", "options": { "random": "00" } });
                    let bytes = peer.encrypt_envelope(&ok.to_string()).unwrap();
                    let _ = ws.send(Message::Binary(bytes)).await;
                }
            }
            Some("ping") => {
                if let Some(peer) = peer.as_ref() {
                    let pong = peer.encrypt_envelope(r#"{"action":"pong"}"#).unwrap();
                    let _ = ws.send(Message::Binary(pong)).await;
                }
            }
            _ => {}
        }
    }
}

fn engine_for(token: &str) -> CryptoEngine {
    let mut engine = CryptoEngine::new();
    engine
        .configure(KeySource::EncryptionKey(token.to_string()))
        .unwrap();
    engine
}

/// Encrypts `controller challenge || device manager challenge`.
fn candidate(peer: &CryptoEngine, pair: &Value) -> String {
    let mut plain = hex::decode(pair["options"]["rand"].as_str().unwrap()).unwrap();
    plain.extend_from_slice(&[7u8; CHALLENGE_LENGTH]);
    peer.encrypt_hex(&plain).unwrap()
}

fn identity(token: Option<&str>) -> Identity {
    Identity {
        name: "E2E Runner".into(),
        id: ID.into(),
        token: token.map(str::to_string),
    }
}

fn plan(urls: &[&str], screenshots: bool) -> RunPlan {
    RunPlan {
        urls: urls.iter().map(|u| u.to_string()).collect(),
        step_delay: Duration::from_millis(20),
        screenshots,
    }
}

async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
    tokio::time::timeout(TIMEOUT, async {
        while handle.state().await.unwrap() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state not reached");
}

// =============================================================================
// Pairing
// =============================================================================

#[tokio::test]
async fn test_token_pairing_run() {
    let mut manager = DeviceManager::start(json!(1), Some(TOKEN)).await;
    let store = Arc::new(MemoryStore::new());
    let (handle, task) = session::spawn(WebSocketTransport::new(), store.clone(), manager.options());

    let report = tokio::time::timeout(
        TIMEOUT,
        runner::run(
            &handle,
            &identity(Some(TOKEN)),
            &plan(&["http://secret.example/a", "http://secret.example/b"], true),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.urls_sent, 2);
    assert_eq!(report.screenshot_requests.len(), 2);
    assert_eq!(report.disconnect_reason, 1001);

    let actions = manager.actions();
    assert_eq!(actions[0], "pair");
    assert_eq!(actions[1], "connect");
    assert_eq!(
        actions.iter().filter(|a| a.as_str() == "publish").count(),
        4
    );

    assert_eq!(store.get(VERSION_KEY).unwrap().as_deref(), Some("1"));
    let log = store.log_entries().unwrap().join("\n");
    assert!(!log.contains("secret.example"));
    assert!(log.contains(REDACTED_URL));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_passcode_pairing() {
    let mut manager = DeviceManager::start(json!(1), None).await;
    let store = Arc::new(MemoryStore::new());
    let (handle, task) = session::spawn(WebSocketTransport::new(), store, manager.options());
    let mut events = handle.subscribe();

    handle.connect("E2E Runner", ID, None).await.unwrap();
    let event = tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    let SessionEvent::Connected { session_key } = event else {
        panic!("expected connected, got {:?}", event);
    };
    assert_eq!(session_key.len(), 64);

    let actions = manager.actions();
    assert_eq!(actions, vec!["pair", "pair", "connect"]);

    handle.disconnect().await.unwrap();
    let event = tokio::time::timeout(TIMEOUT, events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, SessionEvent::Disconnected { reason: 1001 });

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_old_device_manager_rejected() {
    let manager = DeviceManager::start(json!(0), Some(TOKEN)).await;
    let store = Arc::new(MemoryStore::new());
    let (handle, task) = session::spawn(WebSocketTransport::new(), store.clone(), manager.options());

    let error = tokio::time::timeout(
        TIMEOUT,
        runner::run(&handle, &identity(Some(TOKEN)), &plan(&["http://a.example"], false)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(error.to_string().contains("reason 3001"));

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Rejected);
    assert_eq!(status.device_manager_version, Some(0));
    assert_eq!(store.get(VERSION_KEY).unwrap().as_deref(), Some("0"));

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_reset_then_reconnect() {
    let manager = DeviceManager::start(json!(2), Some(TOKEN)).await;
    let store = Arc::new(MemoryStore::new());
    let (handle, task) = session::spawn(WebSocketTransport::new(), store.clone(), manager.options());

    let first = tokio::time::timeout(
        TIMEOUT,
        runner::run(&handle, &identity(Some(TOKEN)), &plan(&[], false)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(first.disconnect_reason, 1001);
    wait_for_state(&handle, SessionState::Disconnected).await;

    handle.reset().await.unwrap();
    assert_eq!(handle.state().await.unwrap(), SessionState::Unconfigured);
    assert_eq!(store.get("port").unwrap(), None);
    assert!(store.log_entries().unwrap().is_empty());

    let second = tokio::time::timeout(
        TIMEOUT,
        runner::run(&handle, &identity(Some(TOKEN)), &plan(&["http://b.example"], false)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(second.urls_sent, 1);
    assert_eq!(
        store.get("port").unwrap(),
        Some(manager.port.to_string())
    );

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unreachable_device_manager() {
    // Bind then drop to get a port nothing listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let options = SessionOptions {
        connection_defaults: ConnectionSettings {
            protocol: "ws".into(),
            host: "127.0.0.1".into(),
            port: port.to_string(),
        },
        ..Default::default()
    };
    let (handle, task) =
        session::spawn(WebSocketTransport::new(), Arc::new(MemoryStore::new()), options);

    let error = tokio::time::timeout(
        TIMEOUT,
        runner::run(&handle, &identity(Some(TOKEN)), &plan(&[], false)),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(error.to_string().contains("reason 1006"));
    assert_eq!(handle.state().await.unwrap(), SessionState::Disconnected);

    handle.shutdown().await.unwrap();
    task.await.unwrap();
}
