//! Call Engine Module - Zustand und Ablauf eines 1:1 Anrufs
//!
//! Dieses Modul verwaltet:
//! - den `CallState` und seine Übergänge (reine State Machine)
//! - die Fehler-Taxonomie für Anrufe
//! - die Engine, die Signaling, Media und Quality Monitor verbindet

mod engine;
mod error;
mod machine;
mod state;

pub use engine::{CallEngine, CallHandle, CallNotification};
pub use error::{CallError, CallErrorCode};
pub use machine::{CallEffect, CallEvent, CallIntent, CallStateMachine, MachineSettings};
pub use state::{ActiveCall, CallParticipant, CallState, CallType, EndReason};
