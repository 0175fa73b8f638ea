//! In-Memory Transport für Tests
//!
//! Verbindet sich sofort, merkt sich gesendete Frames und lässt Tests
//! beliebige Events einspeisen.

use super::connection::{ConnectionState, Transport, TransportError, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct MemoryTransport {
    state: RwLock<ConnectionState>,
    sent: Mutex<Vec<Bytes>>,
    connects: Mutex<Vec<String>>,
    event_tx: mpsc::Sender<TransportEvent>,
    auto_open: bool,
}

impl MemoryTransport {
    /// Transport der bei `connect` sofort `Opened` meldet
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        Self::build(true)
    }

    /// Transport der in `Connecting` hängen bleibt
    pub(crate) fn stalled() -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        Self::build(false)
    }

    fn build(auto_open: bool) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let transport = Self {
            state: RwLock::new(ConnectionState::Disconnected),
            sent: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            event_tx,
            auto_open,
        };
        (Arc::new(transport), event_rx)
    }

    /// Speist ein Event ein und passt den Zustand an
    pub(crate) async fn inject(&self, event: TransportEvent) {
        match &event {
            TransportEvent::Opened => *self.state.write() = ConnectionState::Connected,
            TransportEvent::Closed { .. } => *self.state.write() = ConnectionState::Disconnected,
            TransportEvent::Failed(e) => {
                *self.state.write() = ConnectionState::Error(e.to_string())
            }
            TransportEvent::MessageReceived(_) => {}
        }
        let _ = self.event_tx.send(event).await;
    }

    /// Simuliert einen Frame vom Relay
    pub(crate) async fn receive(&self, json: &str) {
        self.inject(TransportEvent::MessageReceived(Bytes::from(json.to_string())))
            .await;
    }

    pub(crate) fn sent_frames(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    pub(crate) fn connect_urls(&self) -> Vec<String> {
        self.connects.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, endpoint_url: &str) {
        {
            let mut state = self.state.write();
            if state.is_active() {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        self.connects.lock().push(endpoint_url.to_string());
        if self.auto_open {
            self.inject(TransportEvent::Opened).await;
        }
    }

    async fn disconnect(&self, reason: &str) {
        let previous = std::mem::replace(&mut *self.state.write(), ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            let _ = self
                .event_tx
                .send(TransportEvent::Closed {
                    code: super::CLOSE_NORMAL,
                    reason: reason.to_string(),
                })
                .await;
        }
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if *self.state.read() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(frame);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.state.read().clone()
    }
}
