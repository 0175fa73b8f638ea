//! Pulse Call Core - Signaling und Anrufsteuerung für P2P Audio/Video Calls
//!
//! Der Kern einer 1:1 Call-Applikation mit:
//! - WebSocket-Relay als Signaling-Server (Raum-Beitritt, SDP/ICE-Austausch)
//! - deterministischer Call State Machine
//! - Quality Monitor mit automatischer Neuverhandlung
//! - WebRTC als Media-Pipeline

pub mod call_engine;
pub mod config;
pub mod media;
pub mod quality;
pub mod signaling;
pub mod transport;

pub use call_engine::{
    CallEngine, CallError, CallErrorCode, CallHandle, CallNotification, CallState, CallType,
};
pub use config::{CallConfig, ConfigError};

use tracing_subscriber::EnvFilter;

/// Log-Filter wenn `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_FILTER: &str = "call_core=debug,pulse_call=debug,webrtc=warn";

/// Initialisiert Logging; ein zweiter Aufruf ändert nichts
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::debug!("Logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_twice() {
        init_tracing();
        init_tracing();
    }
}
