//! Fehler-Taxonomie für Anrufe
//!
//! Gemeinsames Vokabular für Signaling-Session und Call State Machine.
//! Ob ein Fehler behebbar ist, hängt ausschließlich vom Code ab.

use crate::signaling::SignalingError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

// ============================================================================
// ERROR CODES
// ============================================================================

/// Geschlossene Menge aller Fehlerarten eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallErrorCode {
    Network,
    Permission,
    DeviceUnsupported,
    ServiceUnavailable,
    Internal,
    InvalidState,
    Media,
    Remote,
    ConnectionFailed,
    StartFailed,
    EndFailed,
    Unknown,
}

impl CallErrorCode {
    /// Alle Codes, z.B. für Tests und Diagnose
    pub const ALL: [CallErrorCode; 12] = [
        CallErrorCode::Network,
        CallErrorCode::Permission,
        CallErrorCode::DeviceUnsupported,
        CallErrorCode::ServiceUnavailable,
        CallErrorCode::Internal,
        CallErrorCode::InvalidState,
        CallErrorCode::Media,
        CallErrorCode::Remote,
        CallErrorCode::ConnectionFailed,
        CallErrorCode::StartFailed,
        CallErrorCode::EndFailed,
        CallErrorCode::Unknown,
    ];

    /// Statische Eigenschaft: kann der Anruf nach diesem Fehler fortgesetzt werden?
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            CallErrorCode::Network
                | CallErrorCode::ServiceUnavailable
                | CallErrorCode::ConnectionFailed
                | CallErrorCode::StartFailed
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CallErrorCode::Network => "NETWORK",
            CallErrorCode::Permission => "PERMISSION",
            CallErrorCode::DeviceUnsupported => "DEVICE_UNSUPPORTED",
            CallErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            CallErrorCode::Internal => "INTERNAL",
            CallErrorCode::InvalidState => "INVALID_STATE",
            CallErrorCode::Media => "MEDIA",
            CallErrorCode::Remote => "REMOTE",
            CallErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            CallErrorCode::StartFailed => "START_FAILED",
            CallErrorCode::EndFailed => "END_FAILED",
            CallErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CALL ERROR
// ============================================================================

/// Fehler mit Code und lesbarer Nachricht
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct CallError {
    pub code: CallErrorCode,
    pub message: String,
}

impl CallError {
    pub fn new(code: CallErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Intent oder Event passt nicht zum aktuellen Zustand
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(CallErrorCode::InvalidState, message)
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }
}

impl From<SignalingError> for CallError {
    fn from(error: SignalingError) -> Self {
        Self::new(error.code(), error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_codes() {
        let recoverable: Vec<_> = CallErrorCode::ALL
            .iter()
            .copied()
            .filter(|c| c.is_recoverable())
            .collect();

        assert_eq!(
            recoverable,
            vec![
                CallErrorCode::Network,
                CallErrorCode::ServiceUnavailable,
                CallErrorCode::ConnectionFailed,
                CallErrorCode::StartFailed,
            ]
        );
    }

    #[test]
    fn test_display() {
        let err = CallError::invalid_state("already in a call");
        assert_eq!(err.to_string(), "INVALID_STATE: already in a call");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_from_signaling_error() {
        let err = CallError::from(SignalingError::NotConnected);
        assert_eq!(err.code, CallErrorCode::ConnectionFailed);
        assert_eq!(err.message, "Not connected to signaling server");
        assert!(err.is_recoverable());

        let err: CallError = SignalingError::Encode("bad sdp".to_string()).into();
        assert_eq!(err.code, CallErrorCode::Internal);
        assert!(!err.is_recoverable());
    }
}
