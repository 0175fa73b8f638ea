//! Message Types und Codec für das Signaling-Protokoll
//!
//! JSON-Frames mit Diskriminator `type`. Feldnamen sind case-sensitiv und
//! entsprechen exakt dem Relay-Protokoll. Unbekannte `type`-Werte werden
//! zu [`SignalingMessage::Unrecognized`] statt zu einem Fehler.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode signaling message: {0}")]
    Encode(String),

    #[error("Malformed signaling frame: {0}")]
    Decode(String),
}

// ============================================================================
// WIRE TYPES
// ============================================================================

/// ICE Candidate wie er im Frame verschachtelt wird
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u16,
    pub candidate: String,
}

/// Alle Nachrichten des Signaling-Protokolls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Raum betreten
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// SDP Offer
    Offer {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        #[serde(rename = "toUserId")]
        to_user_id: String,
        sdp: String,
    },

    /// SDP Answer
    Answer {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        #[serde(rename = "toUserId")]
        to_user_id: String,
        sdp: String,
    },

    /// ICE Candidate
    IceCandidate {
        #[serde(rename = "fromUserId")]
        from_user_id: String,
        #[serde(rename = "toUserId")]
        to_user_id: String,
        candidate: IceCandidate,
    },

    /// Gegenseite hat den Raum verlassen
    UserLeft {
        #[serde(rename = "userId")]
        user_id: String,
    },

    /// Unbekannter `type`, neuere Protokollversion
    #[serde(other)]
    Unrecognized,
}

impl SignalingMessage {
    /// Diskriminator für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::JoinRoom { .. } => "join_room",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::UserLeft { .. } => "user_left",
            SignalingMessage::Unrecognized => "unrecognized",
        }
    }

    /// Absender bei gerichteten Nachrichten
    pub fn from_user_id(&self) -> Option<&str> {
        match self {
            SignalingMessage::Offer { from_user_id, .. }
            | SignalingMessage::Answer { from_user_id, .. }
            | SignalingMessage::IceCandidate { from_user_id, .. } => Some(from_user_id),
            _ => None,
        }
    }
}

// ============================================================================
// CODEC
// ============================================================================

/// Serialisiert eine Nachricht in einen Frame
pub fn encode(message: &SignalingMessage) -> Result<Bytes, CodecError> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Parst einen Frame; seiteneffektfrei
pub fn decode(frame: &[u8]) -> Result<SignalingMessage, CodecError> {
    serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))
}
