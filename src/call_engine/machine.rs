//! Call State Machine
//!
//! Deterministische Übergänge über [`CallState`]. Die Maschine macht selbst
//! kein I/O: jeder Übergang liefert eine Liste von [`CallEffect`]s, die die
//! Engine asynchron ausführt. Ergebnisse kommen als neue [`CallEvent`]s zurück.
//!
//! Ungültige Intents lassen den Zustand unverändert und liefern
//! `InvalidState`. Remote-Events, die nicht zum Zustand passen, werden
//! ignoriert (gleichzeitige Ereignisse sind der Normalfall).

use super::error::{CallError, CallErrorCode};
use super::state::{ActiveCall, CallParticipant, CallState, CallType, EndReason};
use crate::quality::{CallQualityGrade, QualityReport, TransportStats};
use crate::signaling::IceCandidate;
use chrono::{DateTime, Utc};
use std::time::Duration;

// ============================================================================
// INPUTS & OUTPUTS
// ============================================================================

/// Lokale Absichten aus der UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallIntent {
    StartCall {
        peer_id: String,
        display_name: Option<String>,
        call_type: CallType,
    },
    AcceptCall,
    DeclineCall,
    HangUp,
    ToggleMute,
    ToggleVideo,
    ToggleScreenShare,
    Retry,
    Reset,
}

impl CallIntent {
    pub fn name(&self) -> &'static str {
        match self {
            CallIntent::StartCall { .. } => "start_call",
            CallIntent::AcceptCall => "accept_call",
            CallIntent::DeclineCall => "decline_call",
            CallIntent::HangUp => "hang_up",
            CallIntent::ToggleMute => "toggle_mute",
            CallIntent::ToggleVideo => "toggle_video",
            CallIntent::ToggleScreenShare => "toggle_screen_share",
            CallIntent::Retry => "retry",
            CallIntent::Reset => "reset",
        }
    }
}

/// Alles was die Maschine verarbeitet
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Intent(CallIntent),

    // Signaling
    OfferReceived { from_user_id: String, sdp: String },
    AnswerReceived { from_user_id: String, sdp: String },
    IceCandidateReceived { from_user_id: String, candidate: IceCandidate },
    PeerDisconnected { user_id: String },
    SignalingFailed(CallError),

    // Media
    LocalIceCandidate(IceCandidate),
    MediaConnected,
    /// `None` lässt den bisherigen Wert stehen
    RemoteTrackChanged {
        audio_muted: Option<bool>,
        video_enabled: Option<bool>,
    },

    /// Media-Verbindung ausgefallen
    Failure(CallError),

    /// Ein Effekt ist gescheitert; `attempt` ist der Versuch, der ihn ausgelöst hat
    EffectFailed {
        attempt: u64,
        effect: CallEffect,
        error: CallError,
    },

    Quality(QualityReport),

    /// Abgelaufener Timer; nur die zuletzt gestellte Epoche zählt
    Timeout { epoch: u64 },
}

/// Seiteneffekte, die die Engine ausführt
#[derive(Debug, Clone, PartialEq)]
pub enum CallEffect {
    /// Signaling verbinden und dem Raum beitreten
    EnsureSignaling,
    SendOffer {
        to_user_id: String,
        call_type: CallType,
        ice_restart: bool,
    },
    SendAnswer {
        to_user_id: String,
        offer_sdp: String,
        call_type: CallType,
    },
    ApplyAnswer { sdp: String },
    AddIceCandidate(IceCandidate),
    SendIceCandidate {
        to_user_id: String,
        candidate: IceCandidate,
    },
    SetAudioMuted(bool),
    SetVideoEnabled(bool),
    SetScreenSharing(bool),
    StartQualityMonitor,
    StopQualityMonitor,
    ArmTimeout { epoch: u64, after: Duration },
    /// Media schließen, Signaling trennen
    EndSession,
}

// ============================================================================
// SETTINGS & CONTEXT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MachineSettings {
    pub local_user_id: String,
    pub connect_timeout: Duration,
    pub ring_timeout: Duration,
    pub poor_samples_before_reconnect: u32,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            local_user_id: String::new(),
            connect_timeout: Duration::from_secs(30),
            ring_timeout: Duration::from_secs(45),
            poor_samples_before_reconnect: 3,
        }
    }
}

/// Arbeitsdaten des laufenden Anrufs, nicht Teil des Snapshots
#[derive(Debug, Clone, Default)]
struct CallContext {
    is_incoming: bool,
    call_type: Option<CallType>,
    pending_offer: Option<String>,
    pending_candidates: Vec<IceCandidate>,
    /// Snapshot während einer Neuverhandlung
    resume: Option<ActiveCall>,
    poor_streak: u32,
    auto_retry_used: bool,
    last_stats: Option<TransportStats>,
    last_quality: Option<CallQualityGrade>,
}

impl CallContext {
    fn call_type(&self) -> CallType {
        self.call_type.unwrap_or(CallType::Audio)
    }
}

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug)]
pub struct CallStateMachine {
    settings: MachineSettings,
    state: CallState,
    call: CallContext,
    /// Zustand vor einem behebbaren Fehler, Ziel von `Retry`
    pre_error: Option<CallState>,
    timeout_epoch: u64,
    /// Zählt Anrufe und Neuversuche; Fehler älterer Versuche werden verworfen
    attempt: u64,
}

impl CallStateMachine {
    pub fn new(settings: MachineSettings) -> Self {
        Self {
            settings,
            state: CallState::Idle,
            call: CallContext::default(),
            pre_error: None,
            timeout_epoch: 0,
            attempt: 0,
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Aktueller Versuch, mit dem die Engine ausgeführte Effekte markiert
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Verarbeitet ein Event; `now` macht Zeitstempel testbar
    pub fn handle(
        &mut self,
        event: CallEvent,
        now: DateTime<Utc>,
    ) -> Result<Vec<CallEffect>, CallError> {
        match event {
            CallEvent::Intent(intent) => self.handle_intent(intent, now),
            CallEvent::OfferReceived { from_user_id, sdp } => self.on_offer(from_user_id, sdp),
            other => Ok(self.handle_remote(other, now)),
        }
    }

    // ========================================================================
    // LOCAL INTENTS
    // ========================================================================

    fn handle_intent(
        &mut self,
        intent: CallIntent,
        now: DateTime<Utc>,
    ) -> Result<Vec<CallEffect>, CallError> {
        let name = intent.name();

        match intent {
            CallIntent::StartCall {
                peer_id,
                display_name,
                call_type,
            } => self.start_call(peer_id, display_name, call_type),

            CallIntent::AcceptCall => match &self.state {
                CallState::Ringing {
                    participant,
                    call_type,
                    is_incoming: true,
                } => {
                    let participant = participant.clone();
                    let call_type = *call_type;
                    let offer_sdp = self.call.pending_offer.clone().ok_or_else(|| {
                        CallError::new(CallErrorCode::Internal, "no pending offer to answer")
                    })?;

                    let mut effects = vec![
                        CallEffect::EnsureSignaling,
                        CallEffect::SendAnswer {
                            to_user_id: participant.id.clone(),
                            offer_sdp,
                            call_type,
                        },
                    ];
                    effects.extend(
                        self.call
                            .pending_candidates
                            .drain(..)
                            .map(CallEffect::AddIceCandidate),
                    );
                    effects.push(self.arm(self.settings.connect_timeout));

                    self.state = CallState::Connecting {
                        participant,
                        is_video_call: call_type.is_video(),
                        remote_joined: true,
                        is_reconnecting: false,
                    };
                    Ok(effects)
                }
                _ => Err(self.rejected(name)),
            },

            CallIntent::DeclineCall => match &self.state {
                CallState::Ringing { .. } => {
                    self.finish(EndReason::Declined, now);
                    Ok(vec![CallEffect::EndSession])
                }
                _ => Err(self.rejected(name)),
            },

            CallIntent::HangUp => match &self.state {
                CallState::Connecting { .. }
                | CallState::Connected(_)
                | CallState::Error {
                    is_recoverable: true,
                    ..
                } => {
                    self.finish(EndReason::Normal, now);
                    Ok(vec![CallEffect::StopQualityMonitor, CallEffect::EndSession])
                }
                // Bereits beendet
                CallState::Ended { .. } | CallState::Error { .. } => Ok(Vec::new()),
                _ => Err(self.rejected(name)),
            },

            CallIntent::ToggleMute => {
                let active = self.active_mut().ok_or_else(|| Self::not_connected(name))?;
                active.is_muted = !active.is_muted;
                Ok(vec![CallEffect::SetAudioMuted(active.is_muted)])
            }

            CallIntent::ToggleVideo => {
                let active = self.active_mut().ok_or_else(|| Self::not_connected(name))?;
                if !active.is_video_call {
                    return Err(Self::audio_only(name));
                }
                active.is_video_enabled = !active.is_video_enabled;
                Ok(vec![CallEffect::SetVideoEnabled(active.is_video_enabled)])
            }

            CallIntent::ToggleScreenShare => {
                let active = self.active_mut().ok_or_else(|| Self::not_connected(name))?;
                if !active.is_video_call {
                    return Err(Self::audio_only(name));
                }
                active.is_screen_sharing = !active.is_screen_sharing;
                Ok(vec![CallEffect::SetScreenSharing(active.is_screen_sharing)])
            }

            CallIntent::Retry => {
                let recoverable = matches!(
                    self.state,
                    CallState::Error {
                        is_recoverable: true,
                        ..
                    }
                );
                match self.pre_error.take() {
                    Some(previous) if recoverable => Ok(self.resume(previous)),
                    previous => {
                        self.pre_error = previous;
                        Err(self.rejected(name))
                    }
                }
            }

            CallIntent::Reset => match &self.state {
                CallState::Idle => Ok(Vec::new()),
                // Zurück in den Raum, damit eingehende Anrufe ankommen
                CallState::Ended { .. } | CallState::Error { .. } => {
                    let mut effects = Vec::new();
                    if matches!(self.state, CallState::Error { is_recoverable: true, .. }) {
                        effects.extend([CallEffect::StopQualityMonitor, CallEffect::EndSession]);
                    }
                    effects.push(CallEffect::EnsureSignaling);
                    self.clear();
                    Ok(effects)
                }
                _ => Err(self.rejected(name)),
            },
        }
    }

    fn start_call(
        &mut self,
        peer_id: String,
        display_name: Option<String>,
        call_type: CallType,
    ) -> Result<Vec<CallEffect>, CallError> {
        if !self.state.accepts_new_call() {
            return Err(self.busy());
        }
        if peer_id.trim().is_empty() || peer_id == self.settings.local_user_id {
            return Err(CallError::invalid_state(format!(
                "cannot call '{}'",
                peer_id
            )));
        }

        self.clear();
        self.attempt += 1;
        self.call = CallContext {
            is_incoming: false,
            call_type: Some(call_type),
            ..Default::default()
        };

        let participant = CallParticipant::new(peer_id.clone(), display_name, call_type.is_video());
        let timeout = self.arm(self.settings.connect_timeout);

        self.state = CallState::Connecting {
            participant,
            is_video_call: call_type.is_video(),
            remote_joined: false,
            is_reconnecting: false,
        };

        Ok(vec![
            CallEffect::EnsureSignaling,
            CallEffect::SendOffer {
                to_user_id: peer_id,
                call_type,
                ice_restart: false,
            },
            timeout,
        ])
    }

    // ========================================================================
    // REMOTE EVENTS
    // ========================================================================

    fn on_offer(&mut self, from_user_id: String, sdp: String) -> Result<Vec<CallEffect>, CallError> {
        if self.state.accepts_new_call() {
            let call_type = CallType::from_sdp(&sdp);

            self.clear();
            self.attempt += 1;
            self.call = CallContext {
                is_incoming: true,
                call_type: Some(call_type),
                pending_offer: Some(sdp),
                ..Default::default()
            };

            let timeout = self.arm(self.settings.ring_timeout);
            self.state = CallState::Ringing {
                participant: CallParticipant::new(from_user_id, None, call_type.is_video()),
                call_type,
                is_incoming: true,
            };
            return Ok(vec![timeout]);
        }

        if !self.is_current_peer(&from_user_id) {
            return Err(self.busy());
        }

        // Offer vom aktuellen Peer: erneutes Offer oder Neuverhandlung
        let call_type = self.call.call_type();
        match &self.state {
            CallState::Ringing { .. } => {
                self.call.pending_offer = Some(sdp);
                Ok(Vec::new())
            }
            CallState::Connecting {
                is_reconnecting: false,
                ..
            } if !self.call.is_incoming => {
                tracing::warn!("Offer collision with {}, keeping local offer", from_user_id);
                Ok(Vec::new())
            }
            _ => {
                self.call.pending_offer = Some(sdp.clone());
                Ok(vec![CallEffect::SendAnswer {
                    to_user_id: from_user_id,
                    offer_sdp: sdp,
                    call_type,
                }])
            }
        }
    }

    fn handle_remote(&mut self, event: CallEvent, now: DateTime<Utc>) -> Vec<CallEffect> {
        match event {
            CallEvent::AnswerReceived { from_user_id, sdp } => {
                if !self.is_current_peer(&from_user_id)
                    || !matches!(self.state, CallState::Connecting { .. })
                {
                    return Vec::new();
                }
                self.enter_connected(now);
                vec![
                    CallEffect::ApplyAnswer { sdp },
                    CallEffect::StartQualityMonitor,
                ]
            }

            CallEvent::IceCandidateReceived {
                from_user_id,
                candidate,
            } => {
                if !self.is_current_peer(&from_user_id) {
                    return Vec::new();
                }
                match &mut self.state {
                    CallState::Ringing { .. } => {
                        self.call.pending_candidates.push(candidate);
                        Vec::new()
                    }
                    CallState::Connecting { remote_joined, .. } => {
                        *remote_joined = true;
                        vec![CallEffect::AddIceCandidate(candidate)]
                    }
                    CallState::Connected(_) => vec![CallEffect::AddIceCandidate(candidate)],
                    _ => Vec::new(),
                }
            }

            CallEvent::PeerDisconnected { user_id } => {
                let affected = self.is_current_peer(&user_id)
                    || (matches!(
                        self.state,
                        CallState::Error {
                            is_recoverable: true,
                            ..
                        }
                    ) && self
                        .pre_error
                        .as_ref()
                        .and_then(CallState::participant)
                        .is_some_and(|p| p.id == user_id));

                if !affected {
                    return Vec::new();
                }
                tracing::info!("Peer {} hung up", user_id);
                self.finish(EndReason::RemoteEnded, now);
                vec![CallEffect::StopQualityMonitor, CallEffect::EndSession]
            }

            CallEvent::SignalingFailed(error) => self.on_signaling_failure(error),

            CallEvent::Failure(error) => self.on_failure(error),

            CallEvent::EffectFailed {
                attempt,
                effect,
                error,
            } => {
                if attempt != self.attempt {
                    tracing::debug!("Ignoring failure of an earlier attempt: {}", error);
                    return Vec::new();
                }
                match effect {
                    CallEffect::SetAudioMuted(_)
                    | CallEffect::SetVideoEnabled(_)
                    | CallEffect::SetScreenSharing(_) => {
                        tracing::warn!("Media toggle failed: {}", error);
                        self.revert_toggle(&effect);
                        Vec::new()
                    }
                    CallEffect::EnsureSignaling | CallEffect::SendIceCandidate { .. } => {
                        self.on_signaling_failure(error)
                    }
                    _ => self.on_failure(error),
                }
            }

            CallEvent::LocalIceCandidate(candidate) => match &self.state {
                CallState::Connecting { participant, .. } => vec![CallEffect::SendIceCandidate {
                    to_user_id: participant.id.clone(),
                    candidate,
                }],
                CallState::Connected(active) => vec![CallEffect::SendIceCandidate {
                    to_user_id: active.participant.id.clone(),
                    candidate,
                }],
                _ => Vec::new(),
            },

            CallEvent::MediaConnected => {
                if !matches!(self.state, CallState::Connecting { .. }) {
                    return Vec::new();
                }
                self.enter_connected(now);
                vec![CallEffect::StartQualityMonitor]
            }

            CallEvent::RemoteTrackChanged {
                audio_muted,
                video_enabled,
            } => {
                match &mut self.state {
                    CallState::Ringing { participant, .. }
                    | CallState::Connecting { participant, .. } => {
                        if let Some(muted) = audio_muted {
                            participant.is_muted = muted;
                        }
                        if let Some(video) = video_enabled {
                            participant.has_video = video;
                        }
                    }
                    CallState::Connected(active) => {
                        if let Some(muted) = audio_muted {
                            active.participant.is_muted = muted;
                            active.is_remote_muted = muted;
                        }
                        if let Some(video) = video_enabled {
                            active.participant.has_video = video;
                            active.is_remote_video_enabled = video;
                        }
                    }
                    _ => {}
                }
                Vec::new()
            }

            CallEvent::Quality(report) => self.on_quality(report),

            CallEvent::Timeout { epoch } => {
                if epoch != self.timeout_epoch {
                    return Vec::new();
                }
                match &self.state {
                    CallState::Ringing { .. } => {
                        tracing::info!("Incoming call was not answered");
                        self.finish(EndReason::NoAnswer, now);
                        vec![CallEffect::EndSession]
                    }
                    CallState::Connecting {
                        remote_joined: false,
                        is_reconnecting: false,
                        ..
                    } => {
                        tracing::info!("No answer from peer");
                        self.finish(EndReason::NoAnswer, now);
                        vec![CallEffect::EndSession]
                    }
                    CallState::Connecting { .. } => self.fail(CallError::new(
                        CallErrorCode::ConnectionFailed,
                        "call negotiation timed out",
                    )),
                    _ => Vec::new(),
                }
            }

            // Intents und Offers laufen über eigene Pfade
            CallEvent::Intent(_) | CallEvent::OfferReceived { .. } => Vec::new(),
        }
    }

    fn on_quality(&mut self, report: QualityReport) -> Vec<CallEffect> {
        let CallState::Connected(active) = &mut self.state else {
            return Vec::new();
        };

        active.stats = Some(report.stats);
        active.quality = Some(report.grade);
        self.call.last_stats = Some(report.stats);
        self.call.last_quality = Some(report.grade);

        if report.grade == CallQualityGrade::Poor {
            self.call.poor_streak += 1;
        } else {
            self.call.poor_streak = 0;
        }

        if self.call.poor_streak < self.settings.poor_samples_before_reconnect {
            return Vec::new();
        }

        tracing::warn!(
            "Quality poor for {} samples, renegotiating media",
            self.call.poor_streak
        );
        self.call.poor_streak = 0;

        let snapshot = active.clone();
        let to_user_id = snapshot.participant.id.clone();
        let call_type = self.call.call_type();
        let timeout = self.arm(self.settings.connect_timeout);

        self.state = CallState::Connecting {
            participant: snapshot.participant.clone(),
            is_video_call: snapshot.is_video_call,
            remote_joined: true,
            is_reconnecting: true,
        };
        self.call.resume = Some(snapshot);

        vec![
            CallEffect::StopQualityMonitor,
            CallEffect::SendOffer {
                to_user_id,
                call_type,
                ice_restart: true,
            },
            timeout,
        ]
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn enter_connected(&mut self, now: DateTime<Utc>) {
        let CallState::Connecting {
            participant,
            is_video_call,
            ..
        } = &self.state
        else {
            return;
        };

        let active = match self.call.resume.take() {
            Some(mut resumed) => {
                resumed.participant = participant.clone();
                resumed
            }
            None => ActiveCall::new(participant.clone(), *is_video_call, now),
        };

        self.call.poor_streak = 0;
        self.call.auto_retry_used = false;
        self.timeout_epoch += 1;
        tracing::info!("Call connected with {}", active.participant.id);
        self.state = CallState::Connected(active);
    }

    fn on_signaling_failure(&mut self, error: CallError) -> Vec<CallEffect> {
        match &self.state {
            CallState::Connecting { .. } => self.recoverable_failure(error),
            CallState::Ringing { .. } | CallState::Connected(_) if error.is_recoverable() => {
                // Medien laufen Peer-to-Peer weiter
                tracing::warn!("Signaling degraded during {}: {}", self.state.name(), error);
                Vec::new()
            }
            CallState::Ringing { .. } | CallState::Connected(_) => self.fail(error),
            _ => Vec::new(),
        }
    }

    fn on_failure(&mut self, error: CallError) -> Vec<CallEffect> {
        match &self.state {
            CallState::Idle | CallState::Ended { .. } | CallState::Error { .. } => {
                tracing::debug!("Ignoring late failure: {}", error);
                Vec::new()
            }
            CallState::Connecting { .. } if error.is_recoverable() => {
                self.recoverable_failure(error)
            }
            _ => self.fail(error),
        }
    }

    /// Schalter zurückdrehen, den die Pipeline nicht umsetzen konnte
    fn revert_toggle(&mut self, effect: &CallEffect) {
        let Some(active) = self.active_mut() else {
            return;
        };
        match *effect {
            CallEffect::SetAudioMuted(muted) if active.is_muted == muted => {
                active.is_muted = !muted;
            }
            CallEffect::SetVideoEnabled(enabled) if active.is_video_enabled == enabled => {
                active.is_video_enabled = !enabled;
            }
            CallEffect::SetScreenSharing(sharing) if active.is_screen_sharing == sharing => {
                active.is_screen_sharing = !sharing;
            }
            _ => {}
        }
    }

    /// Erster behebbarer Fehler beim Aufbau: einmal neu verhandeln
    fn recoverable_failure(&mut self, error: CallError) -> Vec<CallEffect> {
        if !error.is_recoverable() || self.call.auto_retry_used {
            return self.fail(error);
        }

        tracing::warn!("Retrying negotiation after: {}", error);
        self.call.auto_retry_used = true;
        self.attempt += 1;

        let mut effects = vec![CallEffect::EnsureSignaling];
        effects.extend(self.negotiate());
        effects.push(self.arm(self.settings.connect_timeout));
        effects
    }

    /// Offer bzw. Answer für den aktuellen `Connecting`-Zustand
    fn negotiate(&self) -> Vec<CallEffect> {
        let CallState::Connecting {
            participant,
            is_reconnecting,
            ..
        } = &self.state
        else {
            return Vec::new();
        };

        let to_user_id = participant.id.clone();
        let call_type = self.call.call_type();

        match (&self.call.pending_offer, self.call.is_incoming, *is_reconnecting) {
            (Some(offer_sdp), true, false) => vec![CallEffect::SendAnswer {
                to_user_id,
                offer_sdp: offer_sdp.clone(),
                call_type,
            }],
            (_, _, ice_restart) => vec![CallEffect::SendOffer {
                to_user_id,
                call_type,
                ice_restart,
            }],
        }
    }

    /// Übergang nach `Error`
    fn fail(&mut self, error: CallError) -> Vec<CallEffect> {
        let is_recoverable = error.is_recoverable();
        tracing::error!("Call failed in {}: {}", self.state.name(), error);

        let previous = std::mem::replace(
            &mut self.state,
            CallState::Error {
                code: error.code,
                message: error.message,
                is_recoverable,
            },
        );
        self.timeout_epoch += 1;

        if is_recoverable {
            self.pre_error = Some(previous);
            vec![CallEffect::StopQualityMonitor]
        } else {
            self.pre_error = None;
            self.call = CallContext::default();
            vec![CallEffect::StopQualityMonitor, CallEffect::EndSession]
        }
    }

    /// `Retry`: zurück in den Zustand vor dem Fehler
    fn resume(&mut self, previous: CallState) -> Vec<CallEffect> {
        tracing::info!("Retrying call, back to {}", previous.name());
        self.call.auto_retry_used = false;
        self.attempt += 1;
        self.state = previous;

        match &self.state {
            CallState::Connecting { .. } => {
                let mut effects = vec![CallEffect::EnsureSignaling];
                effects.extend(self.negotiate());
                effects.push(self.arm(self.settings.connect_timeout));
                effects
            }
            CallState::Connected(_) => vec![CallEffect::EnsureSignaling, CallEffect::StartQualityMonitor],
            CallState::Ringing { .. } => vec![self.arm(self.settings.ring_timeout)],
            _ => Vec::new(),
        }
    }

    /// Übergang nach `Ended`
    fn finish(&mut self, reason: EndReason, now: DateTime<Utc>) {
        let duration = self
            .started_call()
            .map(|active| active.duration(now))
            .unwrap_or_default();

        let bytes_transferred = self
            .call
            .last_stats
            .map(|s| s.bytes_transferred())
            .unwrap_or(0);

        tracing::info!("Call ended: {:?} after {:?}", reason, duration);
        self.state = CallState::Ended {
            reason,
            duration,
            bytes_transferred,
            last_quality: self.call.last_quality,
        };
        self.call = CallContext::default();
        self.pre_error = None;
        self.timeout_epoch += 1;
    }

    fn clear(&mut self) {
        self.state = CallState::Idle;
        self.call = CallContext::default();
        self.pre_error = None;
        self.timeout_epoch += 1;
    }

    fn arm(&mut self, after: Duration) -> CallEffect {
        self.timeout_epoch += 1;
        CallEffect::ArmTimeout {
            epoch: self.timeout_epoch,
            after,
        }
    }

    /// Der bereits verbundene Anruf, auch während Neuverhandlung oder Fehler
    fn started_call(&self) -> Option<&ActiveCall> {
        match (&self.state, &self.pre_error) {
            (CallState::Connected(active), _) | (_, Some(CallState::Connected(active))) => {
                Some(active)
            }
            _ => self.call.resume.as_ref(),
        }
    }

    fn active_mut(&mut self) -> Option<&mut ActiveCall> {
        match &mut self.state {
            CallState::Connected(active) => Some(active),
            _ => None,
        }
    }

    fn is_current_peer(&self, user_id: &str) -> bool {
        self.state.participant().is_some_and(|p| p.id == user_id)
    }

    fn rejected(&self, intent: &str) -> CallError {
        CallError::invalid_state(format!("{} not allowed while {}", intent, self.state.name()))
    }

    fn not_connected(intent: &str) -> CallError {
        CallError::invalid_state(format!("{} requires a connected call", intent))
    }

    fn audio_only(intent: &str) -> CallError {
        CallError::invalid_state(format!("{} requires a video call", intent))
    }

    fn busy(&self) -> CallError {
        let peer = self
            .state
            .participant()
            .map(|p| p.id.as_str())
            .unwrap_or("another peer");
        CallError::invalid_state(format!("busy: already in a call with {}", peer))
    }
}
