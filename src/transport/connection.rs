//! Transport-Abstraktion
//!
//! Eine einzelne, persistente bidirektionale Verbindung zum Relay.
//! Der Transport kennt nur Frames und den Verbindungszustand, keine
//! Signaling-Semantik und keine Retry-Logik.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected to relay")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timed out after {0} ms")]
    Timeout(u64),

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

// ============================================================================
// CONNECTION STATE
// ============================================================================

/// Einzige Quelle der Wahrheit für die Lebendigkeit des Sockets
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ConnectionState {
    /// `connect` ist in diesen Zuständen ein No-op
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(reason) => write!(f, "error ({reason})"),
        }
    }
}

// ============================================================================
// TRANSPORT EVENTS
// ============================================================================

/// Events die vom Transport ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Verbindung steht
    Opened,
    /// Ein Frame ist angekommen
    MessageReceived(Bytes),
    /// Verbindung wurde geschlossen (lokal oder vom Relay)
    Closed { code: u16, reason: String },
    /// Verbindung ist fehlgeschlagen, Zustand ist jetzt `Error`
    Failed(TransportError),
}

/// Normaler Close-Code (RFC 6455)
pub const CLOSE_NORMAL: u16 = 1000;

/// Close-Code wenn die Gegenseite keinen geliefert hat
pub const CLOSE_NO_STATUS: u16 = 1005;

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Persistente Verbindung zu einem Relay-Endpunkt
///
/// Implementierungen liefern ihre Events über einen `mpsc::Receiver`, der
/// beim Erzeugen zurückgegeben wird. Nach `Failed` bleibt der Transport im
/// Zustand `Error`, bis der Besitzer erneut `connect` aufruft.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Startet einen Verbindungsaufbau. No-op bei `Connecting`/`Connected`.
    async fn connect(&self, endpoint_url: &str);

    /// Schließt die Verbindung.
    async fn disconnect(&self, reason: &str);

    /// Sendet einen Frame. Schlägt fehl, wenn nicht `Connected`.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Aktueller Verbindungszustand
    fn state(&self) -> ConnectionState;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_states() {
        assert!(ConnectionState::Connecting.is_active());
        assert!(ConnectionState::Connected.is_active());
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(!ConnectionState::Error("boom".into()).is_active());
    }
}
