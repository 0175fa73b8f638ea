//! WebSocket Transport zum Signaling-Relay
//!
//! Hält genau eine Verbindung:
//! - Verbindungsaufbau mit Timeout
//! - getrennte Read-/Write-Tasks
//! - Keepalive per WebSocket-Ping
//! - kein automatischer Reconnect (entscheidet die Signaling-Session)

use super::connection::{
    ConnectionState, Transport, TransportError, TransportEvent, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Kapazität der Event- und Write-Queues
const CHANNEL_CAPACITY: usize = 100;

// ============================================================================
// SHARED CONNECTION CONTEXT
// ============================================================================

/// Von Transport und Verbindungs-Tasks geteilter Zustand
#[derive(Clone)]
struct ConnectionContext {
    state: Arc<RwLock<ConnectionState>>,
    writer: Arc<RwLock<Option<mpsc::Sender<Message>>>>,
    event_tx: mpsc::Sender<TransportEvent>,
    /// Jeder Verbindungsversuch bekommt eine neue Generation; Tasks einer
    /// älteren Generation melden nichts mehr
    generation: Arc<AtomicU64>,
    connect_timeout: Duration,
    keepalive_interval: Duration,
}

impl ConnectionContext {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    async fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Transport event receiver dropped");
        }
    }

    async fn fail(&self, generation: u64, error: TransportError) {
        if !self.is_current(generation) {
            return;
        }
        tracing::error!("WebSocket connection failed: {}", error);
        *self.writer.write() = None;
        *self.state.write() = ConnectionState::Error(error.to_string());
        self.emit(TransportEvent::Failed(error)).await;
    }
}

// ============================================================================
// WEBSOCKET TRANSPORT
// ============================================================================

/// WebSocket-Verbindung zum Relay
pub struct WebSocketTransport {
    ctx: ConnectionContext,
}

impl WebSocketTransport {
    /// Erstellt einen neuen Transport samt Event-Receiver
    pub fn new(
        connect_timeout: Duration,
        keepalive_interval: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let transport = Self {
            ctx: ConnectionContext {
                state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
                writer: Arc::new(RwLock::new(None)),
                event_tx,
                generation: Arc::new(AtomicU64::new(0)),
                connect_timeout,
                keepalive_interval,
            },
        };

        (Arc::new(transport), event_rx)
    }

    /// Baut die Verbindung auf und liest bis sie endet
    async fn run_connection(ctx: ConnectionContext, url: String, generation: u64) {
        tracing::info!("Connecting to relay: {}", url);

        let connected =
            tokio::time::timeout(ctx.connect_timeout, connect_async(url.as_str())).await;

        let ws_stream = match connected {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                ctx.fail(generation, TransportError::ConnectionFailed(e.to_string()))
                    .await;
                return;
            }
            Err(_) => {
                let millis = ctx.connect_timeout.as_millis() as u64;
                ctx.fail(generation, TransportError::Timeout(millis)).await;
                return;
            }
        };

        // disconnect() kam während des Handshakes
        if !ctx.is_current(generation) {
            tracing::debug!("Dropping stale connection to {}", url);
            return;
        }

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CHANNEL_CAPACITY);

        *ctx.writer.write() = Some(tx.clone());
        *ctx.state.write() = ConnectionState::Connected;
        tracing::info!("Connected to relay");
        ctx.emit(TransportEvent::Opened).await;

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        // Keepalive-Task
        let keepalive_ctx = ctx.clone();
        let keepalive_interval = ctx.keepalive_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(keepalive_interval);
            interval.tick().await;
            loop {
                interval.tick().await;
                if !keepalive_ctx.is_current(generation) {
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        });

        let outcome = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    ctx.emit(TransportEvent::MessageReceived(Bytes::from(text)))
                        .await;
                }
                Some(Ok(Message::Binary(data))) => {
                    ctx.emit(TransportEvent::MessageReceived(Bytes::from(data)))
                        .await;
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("WebSocket closed by relay");
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    break TransportEvent::Closed { code, reason };
                }
                Some(Ok(_)) => {
                    // Ping/Pong
                }
                Some(Err(e)) => {
                    tracing::error!("WebSocket error: {}", e);
                    break TransportEvent::Failed(TransportError::ConnectionLost(e.to_string()));
                }
                None => {
                    break TransportEvent::Closed {
                        code: CLOSE_NO_STATUS,
                        reason: "stream ended".to_string(),
                    };
                }
            }

            if !ctx.is_current(generation) {
                return;
            }
        };

        if !ctx.is_current(generation) {
            return;
        }

        *ctx.writer.write() = None;
        *ctx.state.write() = match &outcome {
            TransportEvent::Failed(e) => ConnectionState::Error(e.to_string()),
            _ => ConnectionState::Disconnected,
        };
        ctx.emit(outcome).await;
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint_url: &str) {
        {
            let mut state = self.ctx.state.write();
            if state.is_active() {
                tracing::debug!("Connect ignored, transport is {}", *state);
                return;
            }
            *state = ConnectionState::Connecting;
        }

        let generation = self.ctx.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = self.ctx.clone();
        let url = endpoint_url.to_string();

        tokio::spawn(Self::run_connection(ctx, url, generation));
    }

    async fn disconnect(&self, reason: &str) {
        // Laufende Tasks dieser Verbindung verstummen
        self.ctx.generation.fetch_add(1, Ordering::SeqCst);

        let writer = self.ctx.writer.write().take();
        let previous = std::mem::replace(
            &mut *self.ctx.state.write(),
            ConnectionState::Disconnected,
        );

        if let Some(tx) = writer {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            };
            let _ = tx.send(Message::Close(Some(frame))).await;
        }

        if previous != ConnectionState::Disconnected {
            tracing::info!("Disconnected from relay: {}", reason);
            self.ctx
                .emit(TransportEvent::Closed {
                    code: CLOSE_NORMAL,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if *self.ctx.state.read() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let tx = self
            .ctx
            .writer
            .read()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let text = String::from_utf8(frame.to_vec())
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        tx.send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn state(&self) -> ConnectionState {
        self.ctx.state.read().clone()
    }
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("state", &*self.ctx.state.read())
            .field("connect_timeout", &self.ctx.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    /// Lokales Relay auf einem freien Port
    async fn relay() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/room/r/user/u", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept_client(listener: &TcpListener) -> WebSocketStream<tokio::net::TcpStream> {
        let (stream, _) = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        accept_async(stream).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (transport, _events) =
            WebSocketTransport::new(Duration::from_secs(1), Duration::from_secs(25));

        let result = transport.send(Bytes::from_static(b"{}")).await;
        assert_eq!(result, Err(TransportError::NotConnected));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_connect_reports_error() {
        let (transport, mut events) =
            WebSocketTransport::new(Duration::from_secs(2), Duration::from_secs(25));

        // Port 9 (discard) ist auf localhost praktisch nie offen
        transport.connect("ws://127.0.0.1:9/room/r/user/u").await;
        assert!(transport.state().is_active());

        match events.recv().await {
            Some(TransportEvent::Failed(_)) => {}
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(matches!(transport.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_disconnect_when_idle_is_silent() {
        let (transport, mut events) =
            WebSocketTransport::new(Duration::from_secs(1), Duration::from_secs(25));

        transport.disconnect("bye").await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keepalive_pings_relay() {
        let (listener, url) = relay().await;
        let (transport, mut events) =
            WebSocketTransport::new(Duration::from_secs(2), Duration::from_millis(50));

        transport.connect(&url).await;
        let mut server = accept_client(&listener).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Opened));

        let pinged = timeout(Duration::from_secs(2), async {
            while let Some(msg) = server.next().await {
                if matches!(msg, Ok(Message::Ping(_))) {
                    return true;
                }
            }
            false
        })
        .await
        .expect("no ping within two seconds");
        assert!(pinged);
        assert_eq!(transport.state(), ConnectionState::Connected);

        transport.disconnect("done").await;
    }

    #[tokio::test]
    async fn test_connect_while_active_is_noop() {
        let (listener, url) = relay().await;
        let (transport, mut events) =
            WebSocketTransport::new(Duration::from_secs(2), Duration::from_secs(25));

        transport.connect(&url).await;
        assert_eq!(transport.state(), ConnectionState::Connecting);
        // Während des Aufbaus
        transport.connect(&url).await;

        let _server = accept_client(&listener).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Opened));

        // Bei stehender Verbindung
        transport.connect(&url).await;
        assert_eq!(transport.state(), ConnectionState::Connected);

        assert!(timeout(Duration::from_millis(200), listener.accept())
            .await
            .is_err());
        assert!(events.try_recv().is_err());

        transport.disconnect("done").await;
    }
}
