//! Call State und Teilnehmer
//!
//! `CallState` ist der einzige geteilte, veränderliche Zustand eines Anrufs.
//! Beobachter bekommen nur Snapshots.

use super::error::CallErrorCode;
use crate::quality::{CallQualityGrade, TransportStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

// ============================================================================
// CALL TYPE & PARTICIPANT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn is_video(self) -> bool {
        self == CallType::Video
    }

    /// Ein Offer mit Video-Section ist ein Videoanruf
    pub fn from_sdp(sdp: &str) -> Self {
        if sdp.lines().any(|line| line.trim_start().starts_with("m=video")) {
            CallType::Video
        } else {
            CallType::Audio
        }
    }
}

/// Lokal bekannter Zustand der Gegenseite
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallParticipant {
    pub id: String,
    pub display_name: String,
    pub is_muted: bool,
    pub has_video: bool,
    pub is_screen_sharing: bool,
}

impl CallParticipant {
    pub fn new(id: impl Into<String>, display_name: Option<String>, has_video: bool) -> Self {
        let id = id.into();
        Self {
            display_name: display_name.unwrap_or_else(|| id.clone()),
            id,
            is_muted: false,
            has_video,
            is_screen_sharing: false,
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    Normal,
    Declined,
    NoAnswer,
    RemoteEnded,
}

/// Nutzdaten eines verbundenen Anrufs
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveCall {
    pub participant: CallParticipant,
    pub is_video_call: bool,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_remote_video_enabled: bool,
    pub is_remote_muted: bool,
    pub is_screen_sharing: bool,
    pub stats: Option<TransportStats>,
    pub quality: Option<CallQualityGrade>,
    /// Wird einmal gesetzt und bleibt auch über Neuverhandlungen erhalten
    pub start_time: DateTime<Utc>,
}

impl ActiveCall {
    pub fn new(participant: CallParticipant, is_video_call: bool, start_time: DateTime<Utc>) -> Self {
        Self {
            is_remote_video_enabled: participant.has_video,
            is_remote_muted: participant.is_muted,
            participant,
            is_video_call,
            is_muted: false,
            is_video_enabled: is_video_call,
            is_screen_sharing: false,
            stats: None,
            quality: None,
            start_time,
        }
    }

    /// Bisherige Dauer bis `now`
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        (now - self.start_time).to_std().unwrap_or_default()
    }
}

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    #[default]
    Idle,

    /// Anruf klingelt
    Ringing {
        participant: CallParticipant,
        call_type: CallType,
        is_incoming: bool,
    },

    /// Verbindung wird hergestellt oder neu verhandelt
    Connecting {
        participant: CallParticipant,
        is_video_call: bool,
        remote_joined: bool,
        is_reconnecting: bool,
    },

    /// Anruf aktiv
    Connected(ActiveCall),

    /// Fehler; behebbare Fehler erlauben `Retry`
    Error {
        code: CallErrorCode,
        message: String,
        is_recoverable: bool,
    },

    /// Anruf beendet (terminal)
    Ended {
        reason: EndReason,
        duration: Duration,
        bytes_transferred: u64,
        last_quality: Option<CallQualityGrade>,
    },
}

impl CallState {
    /// Kurzname für Logs und UI
    pub fn name(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Ringing { .. } => "ringing",
            CallState::Connecting { .. } => "connecting",
            CallState::Connected(_) => "connected",
            CallState::Error { .. } => "error",
            CallState::Ended { .. } => "ended",
        }
    }

    pub fn participant(&self) -> Option<&CallParticipant> {
        match self {
            CallState::Ringing { participant, .. } | CallState::Connecting { participant, .. } => {
                Some(participant)
            }
            CallState::Connected(active) => Some(&active.participant),
            _ => None,
        }
    }

    /// `Ended` und nicht behebbare Fehler
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended { .. }
                | CallState::Error {
                    is_recoverable: false,
                    ..
                }
        )
    }

    /// Ein neuer Anruf darf beginnen
    pub fn accepts_new_call(&self) -> bool {
        matches!(
            self,
            CallState::Idle | CallState::Ended { .. } | CallState::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_type_from_sdp() {
        let audio = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";
        let video = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";
        assert_eq!(CallType::from_sdp(audio), CallType::Audio);
        assert_eq!(CallType::from_sdp(video), CallType::Video);
    }

    #[test]
    fn test_participant_display_name_falls_back_to_id() {
        let participant = CallParticipant::new("bob", None, true);
        assert_eq!(participant.display_name, "bob");
        assert!(participant.has_video);
    }

    #[test]
    fn test_terminal_states() {
        let ended = CallState::Ended {
            reason: EndReason::Normal,
            duration: Duration::ZERO,
            bytes_transferred: 0,
            last_quality: None,
        };
        let recoverable = CallState::Error {
            code: CallErrorCode::Network,
            message: "offline".to_string(),
            is_recoverable: true,
        };
        assert!(ended.is_terminal());
        assert!(!recoverable.is_terminal());
        assert!(recoverable.accepts_new_call());
        assert!(!CallState::Idle.is_terminal());
    }

    #[test]
    fn test_snapshot_serializes_with_tag() {
        let value = serde_json::to_value(CallState::Idle).unwrap();
        assert_eq!(value, serde_json::json!({"state": "idle"}));
    }
}
