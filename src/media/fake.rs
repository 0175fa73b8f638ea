//! Geskriptete Media-Pipeline für Tests
//!
//! Liefert feste SDPs, protokolliert jeden Aufruf und lässt Tests
//! Media-Events und Statistiken vorgeben.

use super::{MediaError, MediaEvent, MediaPipeline};
use crate::call_engine::CallType;
use crate::quality::{StatsProvider, TransportStats};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) const FAKE_OFFER: &str = "v=0 fake-offer";
pub(crate) const FAKE_ANSWER: &str = "v=0 fake-answer";

pub(crate) struct FakeMedia {
    calls: Mutex<Vec<String>>,
    stats: Mutex<TransportStats>,
    deny_permissions: AtomicBool,
    fail_toggles: AtomicBool,
    event_tx: mpsc::Sender<MediaEvent>,
}

impl FakeMedia {
    pub(crate) fn new() -> (Arc<Self>, mpsc::Receiver<MediaEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);
        let media = Self {
            calls: Mutex::new(Vec::new()),
            stats: Mutex::new(TransportStats::uniform(0.5, 100, 200.0)),
            deny_permissions: AtomicBool::new(false),
            fail_toggles: AtomicBool::new(false),
            event_tx,
        };
        (Arc::new(media), event_rx)
    }

    /// Mikrofon/Kamera werden verweigert
    pub(crate) fn deny_permissions(&self) {
        self.deny_permissions.store(true, Ordering::SeqCst);
    }

    /// Mute/Video/Screen-Share schlagen fehl
    pub(crate) fn fail_toggles(&self) {
        self.fail_toggles.store(true, Ordering::SeqCst);
    }

    pub(crate) fn set_stats(&self, stats: TransportStats) {
        *self.stats.lock() = stats;
    }

    /// Simuliert ein Event der Pipeline
    pub(crate) async fn emit(&self, event: MediaEvent) {
        let _ = self.event_tx.send(event).await;
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    fn toggle(&self, call: String) -> Result<(), MediaError> {
        self.record(call);
        if self.fail_toggles.load(Ordering::SeqCst) {
            return Err(MediaError::Failed("toggle rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl StatsProvider for FakeMedia {
    async fn sample_stats(&self) -> Result<TransportStats, MediaError> {
        Ok(*self.stats.lock())
    }
}

#[async_trait]
impl MediaPipeline for FakeMedia {
    async fn ensure_permissions(&self, _call_type: CallType) -> Result<(), MediaError> {
        self.record("ensure_permissions");
        if self.deny_permissions.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("microphone".to_string()));
        }
        Ok(())
    }

    async fn create_offer(&self, _call_type: CallType, ice_restart: bool) -> Result<String, MediaError> {
        self.record(if ice_restart {
            "create_offer(ice_restart)"
        } else {
            "create_offer"
        });
        Ok(FAKE_OFFER.to_string())
    }

    async fn create_answer(&self, _offer_sdp: &str, _call_type: CallType) -> Result<String, MediaError> {
        self.record("create_answer");
        Ok(FAKE_ANSWER.to_string())
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MediaError> {
        self.record(format!("apply_answer({answer_sdp})"));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(format!("add_ice_candidate({})", candidate.candidate));
        Ok(())
    }

    async fn set_audio_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.toggle(format!("set_audio_muted({muted})"))
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.toggle(format!("set_video_enabled({enabled})"))
    }

    async fn set_screen_sharing(&self, sharing: bool) -> Result<(), MediaError> {
        self.toggle(format!("set_screen_sharing({sharing})"))
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.record("close");
        Ok(())
    }
}
