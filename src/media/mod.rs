//! Media Module - Schnittstelle zur Media-Pipeline
//!
//! Capture, Encoding und der eigentliche Paketfluss liegen außerhalb dieses
//! Crates. Die Call Engine spricht die Pipeline nur über [`MediaPipeline`]
//! an und bekommt deren Rückmeldungen als [`MediaEvent`]s.

#[cfg(test)]
pub(crate) mod fake;
mod rtc;

pub use rtc::{default_ice_servers, LocalTracks, WebRtcMedia};

use crate::call_engine::{CallErrorCode, CallType};
use crate::quality::StatsProvider;
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device not supported: {0}")]
    DeviceUnsupported(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No active media session")]
    NoSession,

    #[error("Media failure: {0}")]
    Failed(String),
}

impl MediaError {
    /// Einordnung in die Fehler-Taxonomie, abhängig von der Phase des Anrufs
    pub fn code(&self, starting: bool) -> CallErrorCode {
        match self {
            MediaError::PermissionDenied(_) => CallErrorCode::Permission,
            MediaError::DeviceUnsupported(_) => CallErrorCode::DeviceUnsupported,
            MediaError::Negotiation(_) | MediaError::InvalidSdp(_) if starting => {
                CallErrorCode::StartFailed
            }
            MediaError::NoSession => CallErrorCode::InvalidState,
            _ => CallErrorCode::Media,
        }
    }
}

// ============================================================================
// MEDIA EVENTS
// ============================================================================

/// Events die von der Media-Pipeline ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    /// Lokaler ICE Candidate, muss zur Gegenseite
    LocalIceCandidate(IceCandidate),
    /// Erste Medien fließen
    Connected,
    /// Gegenseite hat Mikrofon oder Kamera umgeschaltet, `None` heißt unverändert
    RemoteTrackChanged {
        audio_muted: Option<bool>,
        video_enabled: Option<bool>,
    },
    /// Media-Verbindung ist nicht mehr zu retten
    Failed(MediaError),
}

// ============================================================================
// MEDIA PIPELINE
// ============================================================================

/// Externe Media-Pipeline: liefert SDP und Statistiken, wendet SDP an
#[async_trait]
pub trait MediaPipeline: StatsProvider {
    /// Prüft Mikrofon-/Kamera-Berechtigungen vor dem Anrufstart
    async fn ensure_permissions(&self, _call_type: CallType) -> Result<(), MediaError> {
        Ok(())
    }

    /// Erzeugt ein lokales Offer; `ice_restart` für Neuverhandlung
    async fn create_offer(&self, call_type: CallType, ice_restart: bool)
        -> Result<String, MediaError>;

    /// Wendet ein entferntes Offer an und erzeugt das Answer
    async fn create_answer(&self, offer_sdp: &str, call_type: CallType)
        -> Result<String, MediaError>;

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    async fn set_audio_muted(&self, muted: bool) -> Result<(), MediaError>;

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    async fn set_screen_sharing(&self, sharing: bool) -> Result<(), MediaError>;

    /// Baut die Media-Session ab; danach ist ein neuer Anruf möglich
    async fn close(&self) -> Result<(), MediaError>;
}
