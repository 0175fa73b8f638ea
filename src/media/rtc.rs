//! WebRTC Media-Pipeline
//!
//! Verwaltet die Peer Connection eines Anrufs: Tracks, SDP, ICE und
//! Statistiken. Capture und Encoding sind nicht Teil dieses Crates, die
//! lokalen Tracks werden von außen mit RTP-Paketen befüllt. Die Tracks des
//! laufenden Anrufs liefert [`WebRtcMedia::local_tracks`].

use super::{MediaError, MediaEvent, MediaPipeline};
use crate::call_engine::CallType;
use crate::quality::{StatsProvider, TransportStats};
use crate::signaling::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "pulse-call";

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        // Google STUN Server
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// RTC SESSION
// ============================================================================

/// Peer Connection mit den lokalen Tracks eines Anrufs
#[derive(Clone)]
struct RtcSession {
    pc: Arc<RTCPeerConnection>,
    audio_track: Arc<TrackLocalStaticRTP>,
    audio_sender: Arc<RTCRtpSender>,
    video: Option<VideoSender>,
}

#[derive(Clone)]
struct VideoSender {
    camera_track: Arc<TrackLocalStaticRTP>,
    screen_track: Arc<TrackLocalStaticRTP>,
    sender: Arc<RTCRtpSender>,
}

/// Lokale Tracks des laufenden Anrufs, in die der Capture-Teil RTP schreibt
#[derive(Clone)]
pub struct LocalTracks {
    pub audio: Arc<TrackLocalStaticRTP>,
    /// Nur bei Videoanrufen
    pub camera: Option<Arc<TrackLocalStaticRTP>>,
    pub screen: Option<Arc<TrackLocalStaticRTP>>,
}

impl LocalTracks {
    fn of(session: &RtcSession) -> Self {
        Self {
            audio: Arc::clone(&session.audio_track),
            camera: session.video.as_ref().map(|v| Arc::clone(&v.camera_track)),
            screen: session.video.as_ref().map(|v| Arc::clone(&v.screen_track)),
        }
    }
}

impl std::fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTracks")
            .field("audio", &self.audio.id())
            .field("camera", &self.camera.as_ref().map(|t| t.id()))
            .field("screen", &self.screen.as_ref().map(|t| t.id()))
            .finish()
    }
}

/// Byte-Zähler der letzten Messung für die Bitraten-Berechnung
#[derive(Debug, Clone, Copy)]
struct ByteSample {
    at: Instant,
    bytes_sent: u64,
    bytes_received: u64,
}

fn rtc_error(e: webrtc::Error) -> MediaError {
    MediaError::Negotiation(e.to_string())
}

fn local_track(mime_type: &str, clock_rate: u32, channels: u16, id: &str) -> Arc<TrackLocalStaticRTP> {
    Arc::new(TrackLocalStaticRTP::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            ..Default::default()
        },
        id.to_string(),
        STREAM_ID.to_string(),
    ))
}

// ============================================================================
// WEBRTC MEDIA
// ============================================================================

/// [`MediaPipeline`] auf Basis des `webrtc` Crates
pub struct WebRtcMedia {
    ice_servers: Vec<RTCIceServer>,
    session: Mutex<Option<RtcSession>>,
    last_sample: Mutex<Option<ByteSample>>,
    event_tx: mpsc::Sender<MediaEvent>,
    tracks_tx: watch::Sender<Option<LocalTracks>>,
}

impl WebRtcMedia {
    /// Erstellt die Pipeline; leere `ice_server_urls` bedeuten Standard-STUN
    pub fn new(ice_server_urls: &[String]) -> (Arc<Self>, mpsc::Receiver<MediaEvent>) {
        let (event_tx, event_rx) = mpsc::channel(100);

        let ice_servers = if ice_server_urls.is_empty() {
            default_ice_servers()
        } else {
            vec![RTCIceServer {
                urls: ice_server_urls.to_vec(),
                ..Default::default()
            }]
        };

        let media = Self {
            ice_servers,
            session: Mutex::new(None),
            last_sample: Mutex::new(None),
            event_tx,
            tracks_tx: watch::Sender::new(None),
        };
        (Arc::new(media), event_rx)
    }

    /// Lokale Tracks, `None` solange kein Anruf läuft
    pub fn local_tracks(&self) -> watch::Receiver<Option<LocalTracks>> {
        self.tracks_tx.subscribe()
    }

    fn current(&self) -> Result<RtcSession, MediaError> {
        self.session.lock().clone().ok_or(MediaError::NoSession)
    }

    /// Schließt eine alte und baut eine neue Peer Connection auf
    async fn fresh_session(&self, call_type: CallType) -> Result<RtcSession, MediaError> {
        let previous = self.session.lock().take();
        if let Some(previous) = previous {
            tracing::debug!("Replacing previous peer connection");
            let _ = previous.pc.close().await;
        }
        *self.last_sample.lock() = Some(ByteSample {
            at: Instant::now(),
            bytes_sent: 0,
            bytes_received: 0,
        });

        let pc = self.create_peer_connection().await?;

        let audio_track = local_track(MIME_TYPE_OPUS, 48_000, 2, "audio");
        let audio_sender = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(rtc_error)?;

        let video = if call_type.is_video() {
            let camera_track = local_track(MIME_TYPE_VP8, 90_000, 0, "camera");
            let screen_track = local_track(MIME_TYPE_VP8, 90_000, 0, "screen");
            let sender = pc
                .add_track(Arc::clone(&camera_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(rtc_error)?;
            Some(VideoSender {
                camera_track,
                screen_track,
                sender,
            })
        } else {
            None
        };

        let session = RtcSession {
            pc,
            audio_track,
            audio_sender,
            video,
        };
        *self.session.lock() = Some(session.clone());
        self.tracks_tx.send_replace(Some(LocalTracks::of(&session)));
        Ok(session)
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MediaError> {
        // Media Engine mit Opus/VP8
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| MediaError::DeviceUnsupported(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| MediaError::Failed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| MediaError::Failed(e.to_string()))?,
        );

        self.setup_peer_connection_handlers(&pc);
        Ok(pc)
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_peer_connection_handlers(&self, pc: &RTCPeerConnection) {
        let event_tx = self.event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            tracing::info!("Peer connection state: {:?}", s);

            let event = match s {
                RTCPeerConnectionState::Connected => Some(MediaEvent::Connected),
                RTCPeerConnectionState::Failed => Some(MediaEvent::Failed(MediaError::Failed(
                    "peer connection failed".to_string(),
                ))),
                _ => None,
            };

            let tx = event_tx.clone();
            Box::pin(async move {
                if let Some(event) = event {
                    let _ = tx.send(event).await;
                }
            })
        }));

        let event_tx = self.event_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let candidate = candidate.and_then(|c| match c.to_json() {
                Ok(init) => Some(IceCandidate {
                    sdp_mid: init.sdp_mid.unwrap_or_default(),
                    sdp_m_line_index: init.sdp_mline_index.unwrap_or(0),
                    candidate: init.candidate,
                }),
                Err(e) => {
                    tracing::warn!("Failed to serialize local ICE candidate: {}", e);
                    None
                }
            });

            let tx = event_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let _ = tx.send(MediaEvent::LocalIceCandidate(candidate)).await;
                }
            })
        }));

        let event_tx = self.event_tx.clone();
        pc.on_track(Box::new(move |track, _, _| {
            tracing::info!("Received remote track: {:?}", track.codec().capability.mime_type);

            // Jeder Track meldet nur seine eigene Art
            let event = match track.kind() {
                RTPCodecType::Video => Some(MediaEvent::RemoteTrackChanged {
                    audio_muted: None,
                    video_enabled: Some(true),
                }),
                RTPCodecType::Audio => Some(MediaEvent::RemoteTrackChanged {
                    audio_muted: Some(false),
                    video_enabled: None,
                }),
                _ => None,
            };

            let tx = event_tx.clone();
            Box::pin(async move {
                if let Some(event) = event {
                    let _ = tx.send(event).await;
                }
            })
        }));
    }

    /// Bitraten aus der Differenz zur letzten Messung
    fn bitrates(&self, bytes_sent: u64, bytes_received: u64) -> (f64, f64) {
        let now = Instant::now();
        let previous = self.last_sample.lock().replace(ByteSample {
            at: now,
            bytes_sent,
            bytes_received,
        });

        let Some(previous) = previous else {
            return (0.0, 0.0);
        };

        let secs = now.duration_since(previous.at).as_secs_f64();
        if secs <= 0.0 {
            return (0.0, 0.0);
        }

        let kbps = |now: u64, before: u64| now.saturating_sub(before) as f64 * 8.0 / 1000.0 / secs;
        (
            kbps(bytes_sent, previous.bytes_sent),
            kbps(bytes_received, previous.bytes_received),
        )
    }
}

#[async_trait]
impl StatsProvider for WebRtcMedia {
    async fn sample_stats(&self) -> Result<TransportStats, MediaError> {
        let session = self.current()?;
        let report = session.pc.get_stats().await;

        let mut stats = TransportStats::default();
        let mut round_trip_secs = 0.0_f64;

        for entry in report.reports.values() {
            match entry {
                StatsReportType::CandidatePair(pair) if pair.nominated => {
                    round_trip_secs = round_trip_secs.max(pair.current_round_trip_time);
                    stats.bytes_sent += pair.bytes_sent;
                    stats.bytes_received += pair.bytes_received;
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    // Verlust unserer Pakete aus Sicht der Gegenseite
                    stats.tx_packet_loss = stats.tx_packet_loss.max(remote.fraction_lost * 100.0);
                }
                _ => {}
            }
        }

        let (tx_kbps, rx_kbps) = self.bitrates(stats.bytes_sent, stats.bytes_received);
        stats.tx_bitrate_kbps = tx_kbps;
        stats.rx_bitrate_kbps = rx_kbps;
        stats.round_trip_ms = (round_trip_secs * 1000.0).round() as u32;

        Ok(stats)
    }
}

#[async_trait]
impl MediaPipeline for WebRtcMedia {
    async fn create_offer(&self, call_type: CallType, ice_restart: bool) -> Result<String, MediaError> {
        let session = if ice_restart {
            self.current()?
        } else {
            self.fresh_session(call_type).await?
        };

        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = session.pc.create_offer(options).await.map_err(rtc_error)?;
        session
            .pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;

        Ok(offer.sdp)
    }

    async fn create_answer(&self, offer_sdp: &str, call_type: CallType) -> Result<String, MediaError> {
        // Neuverhandlung auf einer laufenden Verbindung, sonst neu aufbauen
        let existing = self.session.lock().clone().filter(|s| {
            matches!(
                s.pc.connection_state(),
                RTCPeerConnectionState::Connected | RTCPeerConnectionState::Connecting
            )
        });
        let session = match existing {
            Some(session) => session,
            None => self.fresh_session(call_type).await?,
        };

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
        session
            .pc
            .set_remote_description(offer)
            .await
            .map_err(rtc_error)?;

        let answer = session.pc.create_answer(None).await.map_err(rtc_error)?;
        session
            .pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;

        Ok(answer.sdp)
    }

    async fn apply_answer(&self, answer_sdp: &str) -> Result<(), MediaError> {
        let session = self.current()?;
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| MediaError::InvalidSdp(e.to_string()))?;

        session
            .pc
            .set_remote_description(answer)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        let session = self.current()?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: Some(candidate.sdp_mid.clone()),
            sdp_mline_index: Some(candidate.sdp_m_line_index),
            username_fragment: None,
        };

        session.pc.add_ice_candidate(init).await.map_err(rtc_error)
    }

    async fn set_audio_muted(&self, muted: bool) -> Result<(), MediaError> {
        let session = self.current()?;
        let track = (!muted)
            .then(|| Arc::clone(&session.audio_track) as Arc<dyn TrackLocal + Send + Sync>);

        session
            .audio_sender
            .replace_track(track)
            .await
            .map_err(|e| MediaError::Failed(e.to_string()))
    }

    async fn set_video_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        let session = self.current()?;
        let video = session
            .video
            .ok_or_else(|| MediaError::DeviceUnsupported("audio-only call".to_string()))?;

        let track = enabled
            .then(|| Arc::clone(&video.camera_track) as Arc<dyn TrackLocal + Send + Sync>);
        video
            .sender
            .replace_track(track)
            .await
            .map_err(|e| MediaError::Failed(e.to_string()))
    }

    async fn set_screen_sharing(&self, sharing: bool) -> Result<(), MediaError> {
        let session = self.current()?;
        let video = session
            .video
            .ok_or_else(|| MediaError::DeviceUnsupported("audio-only call".to_string()))?;

        let track = if sharing {
            Arc::clone(&video.screen_track)
        } else {
            Arc::clone(&video.camera_track)
        };
        video
            .sender
            .replace_track(Some(track as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| MediaError::Failed(e.to_string()))
    }

    async fn close(&self) -> Result<(), MediaError> {
        let session = self.session.lock().take();
        *self.last_sample.lock() = None;
        self.tracks_tx.send_replace(None);

        match session {
            Some(session) => session
                .pc
                .close()
                .await
                .map_err(|e| MediaError::Failed(e.to_string())),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for WebRtcMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcMedia")
            .field("ice_servers", &self.ice_servers.len())
            .field("has_session", &self.session.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_without_session() {
        let (media, _events) = WebRtcMedia::new(&[]);

        assert_eq!(media.sample_stats().await, Err(MediaError::NoSession));
        assert_eq!(media.apply_answer("v=0").await, Err(MediaError::NoSession));
        assert!(media.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_offer_contains_requested_media() {
        let (media, _events) = WebRtcMedia::new(&[]);

        let audio = media.create_offer(CallType::Audio, false).await.unwrap();
        assert!(audio.contains("m=audio"));
        assert!(!audio.contains("m=video"));

        let video = media.create_offer(CallType::Video, false).await.unwrap();
        assert_eq!(CallType::from_sdp(&video), CallType::Video);

        media.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_local_tracks_follow_session() {
        let (media, _events) = WebRtcMedia::new(&[]);
        let tracks = media.local_tracks();
        assert!(tracks.borrow().is_none());

        media.create_offer(CallType::Audio, false).await.unwrap();
        {
            let current = tracks.borrow();
            let audio_only = current.as_ref().unwrap();
            assert_eq!(audio_only.audio.id(), "audio");
            assert!(audio_only.camera.is_none());
            assert!(audio_only.screen.is_none());
        }

        media.create_offer(CallType::Video, false).await.unwrap();
        {
            let current = tracks.borrow();
            let video = current.as_ref().unwrap();
            assert_eq!(video.camera.as_ref().map(|t| t.id()), Some("camera"));
            assert_eq!(video.screen.as_ref().map(|t| t.id()), Some("screen"));
        }

        media.close().await.unwrap();
        assert!(tracks.borrow().is_none());
    }

    #[tokio::test]
    async fn test_offer_answer_between_two_pipelines() {
        let (caller, _caller_events) = WebRtcMedia::new(&[]);
        let (callee, _callee_events) = WebRtcMedia::new(&[]);

        let offer = caller.create_offer(CallType::Audio, false).await.unwrap();
        let answer = callee.create_answer(&offer, CallType::Audio).await.unwrap();
        assert!(answer.contains("m=audio"));
        caller.apply_answer(&answer).await.unwrap();

        caller.set_audio_muted(true).await.unwrap();
        assert!(matches!(
            caller.set_video_enabled(true).await,
            Err(MediaError::DeviceUnsupported(_))
        ));

        caller.close().await.unwrap();
        callee.close().await.unwrap();
    }

    #[test]
    fn test_ice_servers_from_config() {
        let (media, _events) = WebRtcMedia::new(&["turn:turn.example.com:3478".to_string()]);
        assert_eq!(media.ice_servers[0].urls, vec!["turn:turn.example.com:3478"]);
    }
}
