//! Transport Module - persistente Verbindung zum Relay
//!
//! Reines Byte-/Frame-Senden und -Empfangen plus Verbindungs-Lebenszyklus.
//! Retry-Entscheidungen liegen eine Ebene höher in der Signaling-Session.

mod connection;
#[cfg(test)]
pub(crate) mod memory;
mod websocket;

pub use connection::{
    ConnectionState, Transport, TransportError, TransportEvent, CLOSE_NORMAL, CLOSE_NO_STATUS,
};
pub use websocket::WebSocketTransport;
