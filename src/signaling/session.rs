//! Signaling-Session über dem Transport
//!
//! Verwaltet Raum-Beitritt und den Austausch von Offer/Answer/Candidates:
//! - verbindet sofort beim Start, tritt bei `Opened` dem Raum bei
//! - dekodiert eingehende Frames und leitet sie als Events weiter
//! - Sendefehler gehen als `SignalingError` an den Aufrufer, nie als Panic
//! - Verbindungsverlust und gescheiterter Beitritt werden zu `SignalingEvent::Error`
//! - ein automatischer Reconnect pro Verbindungsabbruch, wenn ein Anruf läuft
//!
//! SDP und ICE werden nicht interpretiert, nur transportiert.

use super::messages::{decode, encode, IceCandidate, SignalingMessage};
use crate::call_engine::CallErrorCode;
use crate::config::{CallConfig, ConfigError};
use crate::transport::{Transport, TransportError, TransportEvent};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Connection to signaling server lost: {0}")]
    ConnectionLost(String),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}

impl SignalingError {
    pub fn code(&self) -> CallErrorCode {
        match self {
            SignalingError::NotConnected | SignalingError::ConnectionLost(_) => {
                CallErrorCode::ConnectionFailed
            }
            SignalingError::SendFailed(_) => CallErrorCode::Network,
            SignalingError::Encode(_) => CallErrorCode::Internal,
        }
    }
}

impl From<TransportError> for SignalingError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::NotConnected => SignalingError::NotConnected,
            TransportError::SendFailed(reason) => SignalingError::SendFailed(reason),
            other => SignalingError::ConnectionLost(other.to_string()),
        }
    }
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die von der Signaling-Session ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Raum betreten (auch nach einem Reconnect)
    Connected,

    /// SDP Offer erhalten
    OfferReceived { from_user_id: String, sdp: String },

    /// SDP Answer erhalten
    AnswerReceived { from_user_id: String, sdp: String },

    /// ICE Candidate erhalten
    IceCandidateReceived {
        from_user_id: String,
        candidate: IceCandidate,
    },

    /// Peer hat den Raum verlassen
    PeerDisconnected { user_id: String },

    /// Verbindung verloren oder Raum-Beitritt fehlgeschlagen
    Error(SignalingError),
}

// ============================================================================
// SESSION STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct SessionState {
    peers: HashSet<String>,
    call_active: bool,
    reconnect_attempted: bool,
    /// Lokal getrennt, kein Reconnect
    closing: bool,
}

/// Was der Dispatcher für Transport-Events braucht
#[derive(Clone)]
struct SessionContext {
    endpoint_url: String,
    room_id: String,
    user_id: String,
    connect_timeout: Duration,
    transport: Arc<dyn Transport>,
    state: Arc<RwLock<SessionState>>,
    /// Raum betreten und Verbindung offen
    joined: Arc<watch::Sender<bool>>,
    event_tx: mpsc::Sender<SignalingEvent>,
}

impl SessionContext {
    async fn emit(&self, event: SignalingEvent) {
        if self.event_tx.send(event).await.is_err() {
            tracing::debug!("Signaling event receiver dropped");
        }
    }

    /// Ein Encode + Send
    async fn deliver(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        let kind = message.kind();
        let frame = encode(&message).map_err(|e| SignalingError::Encode(e.to_string()))?;

        match self.transport.send(frame).await {
            Ok(()) => {
                tracing::debug!("Sent {} message", kind);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to send {} message: {}", kind, e);
                Err(e.into())
            }
        }
    }
}

// ============================================================================
// SIGNALING SESSION
// ============================================================================

/// Signaling-Session für einen Raum
pub struct SignalingSession {
    ctx: SessionContext,
    dispatcher: JoinHandle<()>,
}

impl SignalingSession {
    /// Startet die Session: verbindet sofort und verarbeitet Transport-Events
    pub fn start(
        config: &CallConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>), ConfigError> {
        let (event_tx, event_rx) = mpsc::channel(100);

        let ctx = SessionContext {
            endpoint_url: config.endpoint_url()?,
            room_id: config.room_id.clone(),
            user_id: config.user_id.clone(),
            connect_timeout: config.connect_timeout(),
            transport,
            state: Arc::new(RwLock::new(SessionState::default())),
            joined: Arc::new(watch::channel(false).0),
            event_tx,
        };

        let dispatcher = tokio::spawn(Self::run(ctx.clone(), transport_events));

        Ok((Self { ctx, dispatcher }, event_rx))
    }

    pub fn user_id(&self) -> &str {
        &self.ctx.user_id
    }

    pub fn room_id(&self) -> &str {
        &self.ctx.room_id
    }

    /// Raum betreten und Verbindung offen
    pub fn is_connected(&self) -> bool {
        *self.ctx.joined.borrow()
    }

    /// Bekannte Peers im Raum
    pub fn peers(&self) -> Vec<String> {
        let mut peers: Vec<_> = self.ctx.state.read().peers.iter().cloned().collect();
        peers.sort();
        peers
    }

    /// Steuert die Reconnect-Policy: nur bei aktivem Anruf wird neu verbunden
    pub fn set_call_active(&self, active: bool) {
        let mut state = self.ctx.state.write();
        state.call_active = active;
        if active {
            state.reconnect_attempted = false;
        }
    }

    /// Verbindet erneut, falls nötig, und wartet auf den Raum-Beitritt
    pub async fn ensure_connected(&self) -> Result<(), SignalingError> {
        let mut joined = self.ctx.joined.subscribe();
        if *joined.borrow() {
            return Ok(());
        }

        if !self.ctx.transport.state().is_active() {
            tracing::info!("Reconnecting signaling for new call");
            self.ctx.transport.connect(&self.ctx.endpoint_url).await;
        }

        let waited = tokio::time::timeout(self.ctx.connect_timeout, joined.wait_for(|j| *j))
            .await
            .map(|result| result.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SignalingError::NotConnected),
            Err(_) => Err(SignalingError::ConnectionLost(format!(
                "room not joined within {:?}",
                self.ctx.connect_timeout
            ))),
        }
    }

    /// Sendet ein SDP Offer
    pub async fn send_offer(&self, sdp: String, to_user_id: String) -> Result<(), SignalingError> {
        self.ctx
            .deliver(SignalingMessage::Offer {
                from_user_id: self.ctx.user_id.clone(),
                to_user_id,
                sdp,
            })
            .await
    }

    /// Sendet ein SDP Answer
    pub async fn send_answer(&self, sdp: String, to_user_id: String) -> Result<(), SignalingError> {
        self.ctx
            .deliver(SignalingMessage::Answer {
                from_user_id: self.ctx.user_id.clone(),
                to_user_id,
                sdp,
            })
            .await
    }

    /// Sendet einen ICE Candidate
    pub async fn send_ice_candidate(
        &self,
        candidate: IceCandidate,
        to_user_id: String,
    ) -> Result<(), SignalingError> {
        self.ctx
            .deliver(SignalingMessage::IceCandidate {
                from_user_id: self.ctx.user_id.clone(),
                to_user_id,
                candidate,
            })
            .await
    }

    /// Trennt die Verbindung; kein automatischer Reconnect
    pub async fn disconnect(&self) {
        {
            let mut state = self.ctx.state.write();
            state.closing = true;
            state.peers.clear();
        }
        self.ctx.joined.send_replace(false);
        self.ctx.transport.disconnect("client disconnect").await;
    }

    // ========================================================================
    // DISPATCHER
    // ========================================================================

    async fn run(ctx: SessionContext, mut transport_events: mpsc::Receiver<TransportEvent>) {
        ctx.transport.connect(&ctx.endpoint_url).await;

        while let Some(event) = transport_events.recv().await {
            Self::handle_transport_event(&ctx, event).await;
        }

        tracing::debug!("Transport event stream ended");
    }

    async fn handle_transport_event(ctx: &SessionContext, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                tracing::info!("Joining room {} as {}", ctx.room_id, ctx.user_id);
                let joined = ctx
                    .deliver(SignalingMessage::JoinRoom {
                        room_id: ctx.room_id.clone(),
                        user_id: ctx.user_id.clone(),
                    })
                    .await;

                match joined {
                    Ok(()) => {
                        {
                            let mut state = ctx.state.write();
                            state.reconnect_attempted = false;
                            state.closing = false;
                        }
                        ctx.joined.send_replace(true);
                        ctx.emit(SignalingEvent::Connected).await;
                    }
                    Err(e) => ctx.emit(SignalingEvent::Error(e)).await,
                }
            }

            TransportEvent::MessageReceived(frame) => match decode(&frame) {
                Ok(message) => Self::handle_message(ctx, message).await,
                Err(e) => {
                    tracing::warn!("Dropping signaling frame: {}", e);
                }
            },

            TransportEvent::Closed { code, reason } => {
                tracing::info!("Signaling connection closed ({}): {}", code, reason);
                Self::handle_connection_loss(ctx, reason).await;
            }

            TransportEvent::Failed(error) => {
                tracing::error!("Signaling connection failed: {}", error);
                Self::handle_connection_loss(ctx, error.to_string()).await;
            }
        }
    }

    async fn handle_message(ctx: &SessionContext, message: SignalingMessage) {
        if let SignalingMessage::Offer { to_user_id, .. }
        | SignalingMessage::Answer { to_user_id, .. }
        | SignalingMessage::IceCandidate { to_user_id, .. } = &message
        {
            if *to_user_id != ctx.user_id {
                tracing::debug!("Ignoring {} addressed to {}", message.kind(), to_user_id);
                return;
            }
        }

        if let Some(from) = message.from_user_id() {
            ctx.state.write().peers.insert(from.to_string());
        }

        match message {
            SignalingMessage::Offer {
                from_user_id, sdp, ..
            } => {
                tracing::info!("Offer received from {}", from_user_id);
                ctx.emit(SignalingEvent::OfferReceived { from_user_id, sdp })
                    .await;
            }

            SignalingMessage::Answer {
                from_user_id, sdp, ..
            } => {
                tracing::info!("Answer received from {}", from_user_id);
                ctx.emit(SignalingEvent::AnswerReceived { from_user_id, sdp })
                    .await;
            }

            SignalingMessage::IceCandidate {
                from_user_id,
                candidate,
                ..
            } => {
                tracing::debug!("ICE candidate from {}", from_user_id);
                ctx.emit(SignalingEvent::IceCandidateReceived {
                    from_user_id,
                    candidate,
                })
                .await;
            }

            SignalingMessage::UserLeft { user_id } => {
                tracing::info!("Peer {} left the room", user_id);
                ctx.state.write().peers.remove(&user_id);
                ctx.emit(SignalingEvent::PeerDisconnected { user_id }).await;
            }

            SignalingMessage::JoinRoom { user_id, .. } => {
                if user_id != ctx.user_id {
                    tracing::debug!("Peer {} joined the room", user_id);
                    ctx.state.write().peers.insert(user_id);
                }
            }

            SignalingMessage::Unrecognized => {
                tracing::debug!("Ignoring unrecognized signaling message");
            }
        }
    }

    async fn handle_connection_loss(ctx: &SessionContext, reason: String) {
        ctx.joined.send_replace(false);

        let reconnect = {
            let mut state = ctx.state.write();

            if state.closing {
                return;
            }

            if state.call_active && !state.reconnect_attempted {
                state.reconnect_attempted = true;
                true
            } else {
                false
            }
        };

        if reconnect {
            tracing::warn!("Signaling lost during call, reconnecting once");
            ctx.transport.connect(&ctx.endpoint_url).await;
        } else {
            ctx.emit(SignalingEvent::Error(SignalingError::ConnectionLost(reason)))
                .await;
        }
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

impl std::fmt::Debug for SignalingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingSession")
            .field("endpoint_url", &self.ctx.endpoint_url)
            .field("joined", &self.is_connected())
            .field("state", &*self.ctx.state.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use crate::transport::ConnectionState;

    fn config() -> CallConfig {
        CallConfig {
            signaling_url: "ws://relay.test".to_string(),
            room_id: "room-1".to_string(),
            user_id: "alice".to_string(),
            ..Default::default()
        }
    }

    async fn started(
        transport: Arc<MemoryTransport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> (SignalingSession, mpsc::Receiver<SignalingEvent>) {
        SignalingSession::start(&config(), transport, events).unwrap()
    }

    #[tokio::test]
    async fn test_joins_room_on_open() {
        let (transport, transport_rx) = MemoryTransport::new();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;

        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));
        assert!(session.is_connected());
        assert_eq!(
            transport.connect_urls(),
            vec!["ws://relay.test/room/room-1/user/alice".to_string()]
        );
        assert_eq!(
            transport.sent_frames(),
            vec![r#"{"type":"join_room","roomId":"room-1","userId":"alice"}"#.to_string()]
        );
    }

    #[tokio::test]
    async fn test_dispatches_inbound_messages() {
        let (transport, transport_rx) = MemoryTransport::new();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));

        transport
            .receive(r#"{"type":"offer","fromUserId":"bob","toUserId":"alice","sdp":"v=0"}"#)
            .await;
        transport.receive("garbage").await;
        transport
            .receive(r#"{"type":"offer","fromUserId":"bob","toUserId":"carol","sdp":"v=0"}"#)
            .await;
        transport
            .receive(r#"{"type":"ice_candidate","fromUserId":"bob","toUserId":"alice","candidate":{"sdpMid":"0","sdpMLineIndex":0,"candidate":"c1"}}"#)
            .await;
        transport.receive(r#"{"type":"typing","userId":"bob"}"#).await;
        transport
            .receive(r#"{"type":"user_left","userId":"bob"}"#)
            .await;

        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::OfferReceived {
                from_user_id: "bob".to_string(),
                sdp: "v=0".to_string()
            })
        );
        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::IceCandidateReceived {
                from_user_id: "bob".to_string(),
                candidate: IceCandidate {
                    sdp_mid: "0".to_string(),
                    sdp_m_line_index: 0,
                    candidate: "c1".to_string(),
                }
            })
        );
        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::PeerDisconnected {
                user_id: "bob".to_string()
            })
        );
        assert!(session.peers().is_empty());
    }

    #[tokio::test]
    async fn test_send_failure_returns_error() {
        let (transport, transport_rx) = MemoryTransport::stalled();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;

        let result = session.send_offer("v=0".to_string(), "bob".to_string()).await;

        assert_eq!(result, Err(SignalingError::NotConnected));
        assert!(transport.sent_frames().is_empty());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_outgoing_offer_wire_format() {
        let (transport, transport_rx) = MemoryTransport::new();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));

        session
            .send_offer("v=0".to_string(), "bob".to_string())
            .await
            .unwrap();

        assert_eq!(
            transport.sent_frames().last().cloned(),
            Some(r#"{"type":"offer","fromUserId":"alice","toUserId":"bob","sdp":"v=0"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_no_reconnect_without_call() {
        let (transport, transport_rx) = MemoryTransport::new();
        let (_session, mut events) = started(Arc::clone(&transport), transport_rx).await;
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));

        transport
            .inject(TransportEvent::Closed {
                code: 1006,
                reason: "abnormal".to_string(),
            })
            .await;

        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::Error(SignalingError::ConnectionLost(
                "abnormal".to_string()
            )))
        );
        assert_eq!(transport.connect_urls().len(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_once_during_call() {
        let (transport, transport_rx) = MemoryTransport::stalled();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;
        session.set_call_active(true);

        while transport.connect_urls().is_empty() {
            tokio::task::yield_now().await;
        }
        transport.inject(TransportEvent::Opened).await;
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));

        // Erster Abbruch: stiller Reconnect
        transport
            .inject(TransportEvent::Failed(TransportError::ConnectionLost(
                "reset".to_string(),
            )))
            .await;
        // Zweiter Abbruch ohne erfolgreiches Öffnen: Fehler
        transport
            .inject(TransportEvent::Failed(TransportError::ConnectionFailed(
                "refused".to_string(),
            )))
            .await;

        match events.recv().await {
            Some(SignalingEvent::Error(SignalingError::ConnectionLost(_))) => {}
            other => panic!("expected ConnectionLost, got {:?}", other),
        }
        assert_eq!(transport.connect_urls().len(), 2);
    }

    #[tokio::test]
    async fn test_ensure_connected_rejoins_after_disconnect() {
        let (transport, transport_rx) = MemoryTransport::new();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));

        session.disconnect().await;
        assert!(!session.is_connected());

        session.ensure_connected().await.unwrap();
        assert!(session.is_connected());
        assert_eq!(transport.connect_urls().len(), 2);
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_times_out() {
        let (transport, transport_rx) = MemoryTransport::stalled();
        let (session, _events) = started(Arc::clone(&transport), transport_rx).await;

        let result = session.ensure_connected().await;
        assert!(matches!(result, Err(SignalingError::ConnectionLost(_))));
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_suppresses_reconnect() {
        let (transport, transport_rx) = MemoryTransport::new();
        let (session, mut events) = started(Arc::clone(&transport), transport_rx).await;
        assert_eq!(events.recv().await, Some(SignalingEvent::Connected));
        session.set_call_active(true);

        session.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        assert!(!session.is_connected());

        // Senden nach der Abmeldung scheitert beim Aufrufer, ohne Reconnect
        let result = session.send_answer("v=0".to_string(), "bob".to_string()).await;
        assert_eq!(result, Err(SignalingError::NotConnected));
        assert!(events.try_recv().is_err());
        assert_eq!(transport.connect_urls().len(), 1);
    }
}
