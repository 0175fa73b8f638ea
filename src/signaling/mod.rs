//! Signaling Module - Raum-Beitritt und SDP/ICE-Austausch über das Relay
//!
//! Dieses Modul verwaltet:
//! - das JSON-Protokoll des Relays (Encode/Decode)
//! - die Session: Raum betreten, Nachrichten senden, eingehende weiterleiten
//! - die Reconnect-Policy während eines Anrufs

mod messages;
mod session;

pub use messages::{decode, encode, CodecError, IceCandidate, SignalingMessage};
pub use session::{SignalingError, SignalingEvent, SignalingSession};
