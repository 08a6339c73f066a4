//! WebSocket transport built on tokio-tungstenite.
//!
//! Each `open` spawns one connection task that owns the socket. Outbound
//! frames reach it over an unbounded channel; inbound frames and lifecycle
//! changes go back through the [`EventSink`].

use std::borrow::Cow;

use futures_util::{SinkExt, StreamExt};
use protocol::Frame;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message as WsMessage,
    },
};
use tokio_util::sync::CancellationToken;

use super::{EventSink, Transport, TransportEvent, ABNORMAL_CLOSURE};

/// [`super::Transport`] over a real WebSocket.
///
/// Must be used from within a tokio runtime.
#[derive(Default)]
pub struct WebSocketTransport {
    outgoing: Option<mpsc::UnboundedSender<WsMessage>>,
    cancel: Option<CancellationToken>,
}

impl WebSocketTransport {
    /// Creates a transport with no connection.
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, message: WsMessage) {
        match &self.outgoing {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::debug!("WebSocket task has exited, dropping frame");
                }
            }
            None => tracing::debug!("No WebSocket connection, dropping frame"),
        }
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, url: &str, sink: EventSink) {
        if let Some(previous) = self.cancel.take() {
            previous.cancel();
        }

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.outgoing = Some(outgoing_tx);
        self.cancel = Some(cancel.clone());

        let url = url.to_string();
        tokio::spawn(async move {
            let code = run_connection(&url, outgoing_rx, &sink, cancel).await;
            sink.emit(TransportEvent::Closed { code });
        });
    }

    fn send(&mut self, frame: Frame) {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(bytes) => WsMessage::Binary(bytes),
        };
        self.queue(message);
    }

    fn close(&mut self, code: u16, reason: &str) {
        self.queue(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        })));
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }
}

/// Runs one connection until it closes. Returns the close code to report.
async fn run_connection(
    url: &str,
    mut outgoing_rx: mpsc::UnboundedReceiver<WsMessage>,
    sink: &EventSink,
    cancel: CancellationToken,
) -> Option<u16> {
    let ws_stream = tokio::select! {
        result = connect_async(url) => match result {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                tracing::warn!("WebSocket connection to {} failed: {}", url, e);
                sink.emit(TransportEvent::Error(e.to_string()));
                return Some(ABNORMAL_CLOSURE);
            }
        },
        _ = cancel.cancelled() => return Some(ABNORMAL_CLOSURE),
    };

    tracing::debug!(generation = sink.generation(), "WebSocket connected to {}", url);
    if !sink.emit(TransportEvent::Opened) {
        return None;
    }

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let mut close_code = Some(ABNORMAL_CLOSURE);

    loop {
        tokio::select! {
            Some(message) = outgoing_rx.recv() => {
                let closing = matches!(message, WsMessage::Close(_));
                if let Err(e) = ws_sink.send(message).await {
                    tracing::warn!("Failed to send WebSocket message: {}", e);
                    sink.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                if closing {
                    tracing::debug!("Close frame sent, waiting for peer");
                }
            }
            incoming = ws_stream.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    sink.emit(TransportEvent::Message(Frame::Text(text)));
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    sink.emit(TransportEvent::Message(Frame::Binary(bytes)));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    close_code = frame.map(|f| u16::from(f.code));
                    tracing::debug!(code = ?close_code, "WebSocket closed by peer");
                    // Let tungstenite flush the close reply.
                    let _ = ws_sink.close().await;
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/pong frames are answered by tungstenite.
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {}", e);
                    sink.emit(TransportEvent::Error(e.to_string()));
                    break;
                }
                None => break,
            },
            _ = cancel.cancelled() => {
                let _ = ws_sink.close().await;
                break;
            }
        }
    }

    close_code
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn next_event(
        rx: &mut mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    ) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("event channel closed")
            .1
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_then_close() {
        // Bind and drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WebSocketTransport::new();
        transport.open(&format!("ws://{}/shadow", addr), EventSink::new(7, tx));

        assert!(matches!(next_event(&mut rx).await, TransportEvent::Error(_)));
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closed {
                code: Some(ABNORMAL_CLOSURE)
            }
        );
    }

    #[tokio::test]
    async fn test_echo_roundtrip_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = ws.next().await {
                if message.is_text() || message.is_binary() {
                    ws.send(message).await.unwrap();
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut transport = WebSocketTransport::new();
        transport.open(&format!("ws://{}/shadow", addr), EventSink::new(1, tx));
        assert_eq!(next_event(&mut rx).await, TransportEvent::Opened);

        transport.send(Frame::Text("hello".into()));
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(Frame::Text("hello".into()))
        );

        transport.send(Frame::Binary(vec![0, 159, 255]));
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Message(Frame::Binary(vec![0, 159, 255]))
        );

        transport.close(1000, "All Done");
        assert_eq!(
            next_event(&mut rx).await,
            TransportEvent::Closed { code: Some(1000) }
        );
    }
}
