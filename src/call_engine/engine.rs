//! Call Engine
//!
//! Verbindet Signaling-Session, Media-Pipeline und Quality Monitor mit der
//! [`CallStateMachine`]. Alle Quellen landen in einer geordneten Queue, die
//! Engine-Schleife wendet sie nacheinander auf die Maschine an und führt die
//! resultierenden Effekte aus.
//!
//! - Quality Monitor, Timer und Signaling-Trennung laufen direkt in der Schleife
//! - Media- und Signaling-Arbeit läuft auf einem einzigen Executor-Task, damit
//!   SDP vor den Candidates angewendet wird
//! - Beobachter bekommen Snapshots (`watch`) und Notifications (`broadcast`)

use super::error::{CallError, CallErrorCode};
use super::machine::{CallEffect, CallEvent, CallIntent, CallStateMachine, MachineSettings};
use super::state::{CallState, CallType};
use crate::config::{CallConfig, ConfigError};
use crate::media::{MediaError, MediaEvent, MediaPipeline};
use crate::quality::{CallQualityGrade, CallQualityIssue, QualityMonitor, QualityReport};
use crate::signaling::{SignalingEvent, SignalingSession};
use crate::transport::{Transport, TransportEvent};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ============================================================================
// NOTIFICATIONS
// ============================================================================

/// Events die von der Call Engine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotification {
    StateChanged(CallState),
    QualityChanged(CallQualityGrade),
    /// Nach Schwere absteigend sortiert
    QualityIssues(Vec<CallQualityIssue>),
    /// Intent oder Offer im aktuellen Zustand nicht erlaubt
    Rejected(CallError),
    EffectFailed(CallError),
}

/// Eingang der Engine-Schleife
enum EngineInput {
    Event(CallEvent),
    Intent {
        intent: CallIntent,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    MediaFailed(MediaError),
    EffectFailed {
        attempt: u64,
        effect: CallEffect,
        error: CallError,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Effekte eines Schritts, markiert mit dem Versuch der Maschine
struct EffectBatch {
    attempt: u64,
    effects: Vec<CallEffect>,
}

fn engine_stopped() -> CallError {
    CallError::new(CallErrorCode::Internal, "call engine is not running")
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Steuerung und Beobachtung einer laufenden [`CallEngine`]
#[derive(Clone)]
pub struct CallHandle {
    input_tx: mpsc::Sender<EngineInput>,
    state_rx: watch::Receiver<CallState>,
    event_tx: broadcast::Sender<CallNotification>,
}

impl CallHandle {
    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        &self,
        peer_id: impl Into<String>,
        display_name: Option<String>,
        call_type: CallType,
    ) -> Result<(), CallError> {
        self.intent(CallIntent::StartCall {
            peer_id: peer_id.into(),
            display_name,
            call_type,
        })
        .await
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        self.intent(CallIntent::AcceptCall).await
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.intent(CallIntent::DeclineCall).await
    }

    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.intent(CallIntent::HangUp).await
    }

    pub async fn toggle_mute(&self) -> Result<(), CallError> {
        self.intent(CallIntent::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<(), CallError> {
        self.intent(CallIntent::ToggleVideo).await
    }

    pub async fn toggle_screen_share(&self) -> Result<(), CallError> {
        self.intent(CallIntent::ToggleScreenShare).await
    }

    /// Erneuter Versuch nach einem behebbaren Fehler
    pub async fn retry(&self) -> Result<(), CallError> {
        self.intent(CallIntent::Retry).await
    }

    /// Zurück nach `Idle`
    pub async fn reset(&self) -> Result<(), CallError> {
        self.intent(CallIntent::Reset).await
    }

    /// Aktueller Snapshot
    pub fn state(&self) -> CallState {
        self.state_rx.borrow().clone()
    }

    /// Snapshot-Stream
    pub fn watch(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    /// Gibt einen Event-Receiver zurück
    pub fn notifications(&self) -> broadcast::Receiver<CallNotification> {
        self.event_tx.subscribe()
    }

    /// Beendet einen laufenden Anruf und stoppt die Engine
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.input_tx.send(EngineInput::Shutdown(reply)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn intent(&self, intent: CallIntent) -> Result<(), CallError> {
        let (reply, result) = oneshot::channel();
        self.input_tx
            .send(EngineInput::Intent { intent, reply })
            .await
            .map_err(|_| engine_stopped())?;
        result.await.map_err(|_| engine_stopped())?
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("state", &self.state_rx.borrow().name())
            .field("running", &!self.input_tx.is_closed())
            .finish()
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Besitzt die State Machine und alle Tasks eines Anrufs
pub struct CallEngine {
    machine: CallStateMachine,
    session: Arc<SignalingSession>,
    media: Arc<dyn MediaPipeline>,
    monitor: QualityMonitor,
    state_tx: watch::Sender<CallState>,
    event_tx: broadcast::Sender<CallNotification>,
    input_tx: mpsc::Sender<EngineInput>,
    effects_tx: mpsc::UnboundedSender<EffectBatch>,
    quality_tx: mpsc::Sender<QualityReport>,
    timer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    last_grade: Option<CallQualityGrade>,
    last_issues: Vec<CallQualityIssue>,
}

impl CallEngine {
    /// Startet Signaling-Session, Executor und Engine-Schleife
    pub fn start(
        config: &CallConfig,
        transport: Arc<dyn Transport>,
        transport_events: mpsc::Receiver<TransportEvent>,
        media: Arc<dyn MediaPipeline>,
        media_events: mpsc::Receiver<MediaEvent>,
    ) -> Result<CallHandle, ConfigError> {
        config.validate()?;

        let (session, signaling_events) =
            SignalingSession::start(config, transport, transport_events)?;
        let session = Arc::new(session);

        let (input_tx, input_rx) = mpsc::channel(100);
        let (effects_tx, effects_rx) = mpsc::unbounded_channel();
        let (quality_tx, quality_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(CallState::Idle);
        let (event_tx, _) = broadcast::channel(100);

        let executor = EffectExecutor {
            session: Arc::clone(&session),
            media: Arc::clone(&media),
            input_tx: input_tx.clone(),
        };

        let tasks = vec![
            tokio::spawn(executor.run(effects_rx)),
            forward(signaling_events, input_tx.clone(), map_signaling_event),
            forward(media_events, input_tx.clone(), map_media_event),
            forward(quality_rx, input_tx.clone(), |report| {
                Some(EngineInput::Event(CallEvent::Quality(report)))
            }),
        ];

        let machine = CallStateMachine::new(MachineSettings {
            local_user_id: config.user_id.clone(),
            connect_timeout: config.connect_timeout(),
            ring_timeout: config.ring_timeout(),
            poor_samples_before_reconnect: config.poor_samples_before_reconnect,
        });

        let engine = Self {
            machine,
            session,
            media,
            monitor: QualityMonitor::new(config.quality_interval()),
            state_tx,
            event_tx: event_tx.clone(),
            input_tx: input_tx.clone(),
            effects_tx,
            quality_tx,
            timer: None,
            tasks,
            last_grade: None,
            last_issues: Vec::new(),
        };

        tracing::info!(
            "Call engine started for {} in room {}",
            config.user_id,
            config.room_id
        );
        tokio::spawn(engine.run(input_rx));

        Ok(CallHandle {
            input_tx,
            state_rx,
            event_tx,
        })
    }

    async fn run(mut self, mut inputs: mpsc::Receiver<EngineInput>) {
        while let Some(input) = inputs.recv().await {
            match input {
                EngineInput::Intent { intent, reply } => {
                    let result = self.dispatch(CallEvent::Intent(intent)).await;
                    let _ = reply.send(result);
                }

                EngineInput::Event(event) => {
                    let _ = self.dispatch(event).await;
                }

                EngineInput::MediaFailed(error) => {
                    let starting = matches!(
                        self.machine.state(),
                        CallState::Ringing { .. } | CallState::Connecting { .. }
                    );
                    let error = CallError::new(error.code(starting), error.to_string());
                    let _ = self.dispatch(CallEvent::Failure(error)).await;
                }

                EngineInput::EffectFailed {
                    attempt,
                    effect,
                    error,
                } => {
                    if attempt == self.machine.attempt() {
                        self.notify(CallNotification::EffectFailed(error.clone()));
                    }
                    let _ = self
                        .dispatch(CallEvent::EffectFailed {
                            attempt,
                            effect,
                            error,
                        })
                        .await;
                }

                EngineInput::Shutdown(reply) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        tracing::debug!("Call engine loop finished");
    }

    /// Ein Event auf die Maschine anwenden, Snapshot veröffentlichen, Effekte ausführen
    async fn dispatch(&mut self, event: CallEvent) -> Result<(), CallError> {
        if let CallEvent::Quality(report) = &event {
            self.publish_quality(report);
        }

        let previous = self.machine.state().clone();
        let effects = match self.machine.handle(event, Utc::now()) {
            Ok(effects) => effects,
            Err(error) => {
                tracing::warn!("Rejected in {}: {}", previous.name(), error);
                self.notify(CallNotification::Rejected(error.clone()));
                return Err(error);
            }
        };

        if *self.machine.state() != previous {
            self.publish_state(&previous);
        }

        self.apply(effects).await;
        Ok(())
    }

    async fn apply(&mut self, effects: Vec<CallEffect>) {
        let mut queued = Vec::new();

        for effect in effects {
            match effect {
                CallEffect::StartQualityMonitor => {
                    self.monitor
                        .start(Arc::clone(&self.media), self.quality_tx.clone());
                }
                CallEffect::StopQualityMonitor => {
                    self.monitor.stop();
                    self.last_grade = None;
                    self.last_issues.clear();
                }
                CallEffect::ArmTimeout { epoch, after } => self.arm_timer(epoch, after),
                CallEffect::EndSession => {
                    self.monitor.stop();
                    self.cancel_timer();
                    self.session.disconnect().await;
                    // Media schließt der Executor, nach allem was noch ansteht
                    queued.push(CallEffect::EndSession);
                }
                other => queued.push(other),
            }
        }

        if queued.is_empty() {
            return;
        }
        let batch = EffectBatch {
            attempt: self.machine.attempt(),
            effects: queued,
        };
        if self.effects_tx.send(batch).is_err() {
            tracing::error!("Effect executor is gone");
        }
    }

    fn publish_state(&mut self, previous: &CallState) {
        let state = self.machine.state().clone();

        if state.name() != previous.name() {
            tracing::info!("Call state: {} -> {}", previous.name(), state.name());
        }

        self.session.set_call_active(matches!(
            state,
            CallState::Ringing { .. }
                | CallState::Connecting { .. }
                | CallState::Connected(_)
                | CallState::Error {
                    is_recoverable: true,
                    ..
                }
        ));

        self.state_tx.send_replace(state.clone());
        self.notify(CallNotification::StateChanged(state));
    }

    fn publish_quality(&mut self, report: &QualityReport) {
        if !matches!(self.machine.state(), CallState::Connected(_)) {
            return;
        }

        if self.last_grade != Some(report.grade) {
            if report.grade == CallQualityGrade::Poor {
                tracing::warn!("Call quality degraded to {}", report.grade);
            } else {
                tracing::debug!("Call quality: {}", report.grade);
            }
            self.last_grade = Some(report.grade);
            self.notify(CallNotification::QualityChanged(report.grade));
        }

        if report.issues != self.last_issues {
            self.last_issues = report.issues.clone();
            if !report.issues.is_empty() {
                self.notify(CallNotification::QualityIssues(report.issues.clone()));
            }
        }
    }

    fn notify(&self, notification: CallNotification) {
        let _ = self.event_tx.send(notification);
    }

    fn arm_timer(&mut self, epoch: u64, after: Duration) {
        self.cancel_timer();

        let input_tx = self.input_tx.clone();
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = input_tx
                .send(EngineInput::Event(CallEvent::Timeout { epoch }))
                .await;
        }));
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("Shutting down call engine");

        let farewell = match self.machine.state() {
            CallState::Ringing { .. } => Some(CallIntent::DeclineCall),
            CallState::Connecting { .. }
            | CallState::Connected(_)
            | CallState::Error {
                is_recoverable: true,
                ..
            } => Some(CallIntent::HangUp),
            _ => None,
        };
        if let Some(intent) = farewell {
            let _ = self.dispatch(CallEvent::Intent(intent)).await;
        }

        self.monitor.stop();
        self.cancel_timer();
        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.session.disconnect().await;
        if let Err(e) = self.media.close().await {
            tracing::warn!("Failed to close media: {}", e);
        }
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.machine.state().name())
            .field("session", &self.session)
            .field("monitor", &self.monitor)
            .finish()
    }
}

// ============================================================================
// EVENT SOURCES
// ============================================================================

/// Leitet einen Event-Stream in die Engine-Queue
fn forward<T, F>(
    mut source: mpsc::Receiver<T>,
    input_tx: mpsc::Sender<EngineInput>,
    map: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> Option<EngineInput> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = source.recv().await {
            if let Some(input) = map(item) {
                if input_tx.send(input).await.is_err() {
                    break;
                }
            }
        }
    })
}

fn map_signaling_event(event: SignalingEvent) -> Option<EngineInput> {
    let event = match event {
        SignalingEvent::Connected => {
            tracing::debug!("Signaling ready");
            return None;
        }
        SignalingEvent::OfferReceived { from_user_id, sdp } => {
            CallEvent::OfferReceived { from_user_id, sdp }
        }
        SignalingEvent::AnswerReceived { from_user_id, sdp } => {
            CallEvent::AnswerReceived { from_user_id, sdp }
        }
        SignalingEvent::IceCandidateReceived {
            from_user_id,
            candidate,
        } => CallEvent::IceCandidateReceived {
            from_user_id,
            candidate,
        },
        SignalingEvent::PeerDisconnected { user_id } => CallEvent::PeerDisconnected { user_id },
        SignalingEvent::Error(error) => CallEvent::SignalingFailed(error.into()),
    };
    Some(EngineInput::Event(event))
}

fn map_media_event(event: MediaEvent) -> Option<EngineInput> {
    let event = match event {
        MediaEvent::LocalIceCandidate(candidate) => CallEvent::LocalIceCandidate(candidate),
        MediaEvent::Connected => CallEvent::MediaConnected,
        MediaEvent::RemoteTrackChanged {
            audio_muted,
            video_enabled,
        } => CallEvent::RemoteTrackChanged {
            audio_muted,
            video_enabled,
        },
        MediaEvent::Failed(error) => return Some(EngineInput::MediaFailed(error)),
    };
    Some(EngineInput::Event(event))
}

// ============================================================================
// EFFECT EXECUTOR
// ============================================================================

/// Führt Media- und Signaling-Effekte strikt nacheinander aus
struct EffectExecutor {
    session: Arc<SignalingSession>,
    media: Arc<dyn MediaPipeline>,
    input_tx: mpsc::Sender<EngineInput>,
}

impl EffectExecutor {
    async fn run(self, mut batches: mpsc::UnboundedReceiver<EffectBatch>) {
        while let Some(EffectBatch { attempt, effects }) = batches.recv().await {
            for effect in effects {
                if let Err(error) = self.execute(effect.clone()).await {
                    tracing::warn!("Call effect failed: {}", error);
                    let failed = EngineInput::EffectFailed {
                        attempt,
                        effect,
                        error,
                    };
                    let _ = self.input_tx.send(failed).await;
                    break;
                }
            }
        }
    }

    /// Ein Fehler bricht den Rest des Batches ab
    async fn execute(&self, effect: CallEffect) -> Result<(), CallError> {
        let media_error = |starting: bool| {
            move |e: MediaError| CallError::new(e.code(starting), e.to_string())
        };

        match effect {
            CallEffect::EnsureSignaling => {
                self.session.ensure_connected().await?;
                Ok(())
            }

            CallEffect::SendOffer {
                to_user_id,
                call_type,
                ice_restart,
            } => {
                if !ice_restart {
                    self.media
                        .ensure_permissions(call_type)
                        .await
                        .map_err(media_error(true))?;
                }
                let sdp = self
                    .media
                    .create_offer(call_type, ice_restart)
                    .await
                    .map_err(media_error(true))?;
                self.session.send_offer(sdp, to_user_id).await?;
                Ok(())
            }

            CallEffect::SendAnswer {
                to_user_id,
                offer_sdp,
                call_type,
            } => {
                self.media
                    .ensure_permissions(call_type)
                    .await
                    .map_err(media_error(true))?;
                let sdp = self
                    .media
                    .create_answer(&offer_sdp, call_type)
                    .await
                    .map_err(media_error(true))?;
                self.session.send_answer(sdp, to_user_id).await?;
                Ok(())
            }

            CallEffect::ApplyAnswer { sdp } => {
                self.media
                    .apply_answer(&sdp)
                    .await
                    .map_err(media_error(true))?;
                Ok(())
            }

            CallEffect::AddIceCandidate(candidate) => {
                if let Err(e) = self.media.add_ice_candidate(&candidate).await {
                    tracing::warn!("Ignoring remote ICE candidate: {}", e);
                }
                Ok(())
            }

            CallEffect::SendIceCandidate {
                to_user_id,
                candidate,
            } => {
                self.session.send_ice_candidate(candidate, to_user_id).await?;
                Ok(())
            }

            CallEffect::SetAudioMuted(muted) => {
                self.media
                    .set_audio_muted(muted)
                    .await
                    .map_err(media_error(false))?;
                Ok(())
            }

            CallEffect::SetVideoEnabled(enabled) => {
                self.media
                    .set_video_enabled(enabled)
                    .await
                    .map_err(media_error(false))?;
                Ok(())
            }

            CallEffect::SetScreenSharing(sharing) => {
                self.media
                    .set_screen_sharing(sharing)
                    .await
                    .map_err(media_error(false))?;
                Ok(())
            }

            CallEffect::EndSession => {
                self.media
                    .close()
                    .await
                    .map_err(|e| CallError::new(CallErrorCode::EndFailed, e.to_string()))?;
                Ok(())
            }

            // Laufen direkt in der Engine-Schleife
            CallEffect::StartQualityMonitor
            | CallEffect::StopQualityMonitor
            | CallEffect::ArmTimeout { .. } => Ok(()),
        }
    }
}
