//! `webrtc` crate implementation of the media capability

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::{ConnectionState, MediaEndpoint, MediaFactory, RemoteTrack};
use crate::error::{CallError, Result};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};

/// Local candidate feed capacity; gathering rarely produces more than a
/// couple dozen candidates per session.
const CANDIDATE_CHANNEL_CAPACITY: usize = 64;

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnServer {
    /// TURN server URLs (multiple URLs allow UDP/TCP transport fallback)
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

/// Peer-connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Candidates pre-gathered before they are needed
    pub candidate_pool_size: u8,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![],
            candidate_pool_size: 10,
        }
    }
}

impl RtcConfig {
    /// Configuration with no ICE servers; host candidates only, which is
    /// all a same-host or same-LAN call needs.
    pub fn host_only() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
            candidate_pool_size: 0,
        }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        let mut servers = vec![];

        for stun_url in &self.stun_servers {
            servers.push(RTCIceServer {
                urls: vec![stun_url.clone()],
                ..Default::default()
            });
        }

        for turn in &self.turn_servers {
            servers.push(RTCIceServer {
                urls: turn.urls.clone(),
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            });
        }

        servers
    }
}

/// Peer-connection endpoint backed by the `webrtc` crate
///
/// Local media is a pair of sample-fed tracks; the embedding application
/// pumps captured frames into them via [`RtcEndpoint::local_tracks`].
/// Device capture itself stays outside this crate.
pub struct RtcEndpoint {
    pc: Arc<RTCPeerConnection>,
    local_tracks: parking_lot::Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    candidate_tx: broadcast::Sender<IceCandidate>,
    track_tx: broadcast::Sender<RemoteTrack>,
    state_rx: watch::Receiver<ConnectionState>,
    closed: AtomicBool,
}

impl RtcEndpoint {
    /// Create a new endpoint
    pub async fn new(config: &RtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| CallError::Internal(format!("failed to register codecs: {e}")))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| CallError::Internal(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config.ice_servers(),
            ice_candidate_pool_size: config.candidate_pool_size,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| CallError::Internal(format!("failed to create peer connection: {e}")))?,
        );

        let (candidate_tx, _) = broadcast::channel(CANDIDATE_CHANNEL_CAPACITY);
        let (track_tx, _) = broadcast::channel(8);
        let (state_tx, state_rx) = watch::channel(ConnectionState::New);

        Self::setup_event_handlers(&pc, candidate_tx.clone(), track_tx.clone(), state_tx);

        Ok(Self {
            pc,
            local_tracks: parking_lot::Mutex::new(vec![]),
            candidate_tx,
            track_tx,
            state_rx,
            closed: AtomicBool::new(false),
        })
    }

    fn setup_event_handlers(
        pc: &Arc<RTCPeerConnection>,
        candidate_tx: broadcast::Sender<IceCandidate>,
        track_tx: broadcast::Sender<RemoteTrack>,
        state_tx: watch::Sender<ConnectionState>,
    ) {
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let new_state = match s {
                RTCPeerConnectionState::New => Some(ConnectionState::New),
                RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
                RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
                RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
                RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
                RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
                _ => None,
            };

            if let Some(state) = new_state {
                info!("peer connection state: {state}");
                let _ = state_tx.send(state);
            }
            Box::pin(async {})
        }));

        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        debug!("local candidate discovered: {}", init.candidate);
                        let _ = candidate_tx.send(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        });
                    }
                    Err(e) => warn!("unserializable local candidate dropped: {e}"),
                }
            }
            Box::pin(async {})
        }));

        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = RemoteTrack {
                id: track.id(),
                kind: track.kind().to_string(),
            };
            info!("remote track received: {} ({})", remote.id, remote.kind);
            let _ = track_tx.send(remote);
            Box::pin(async {})
        }));
    }

    /// Sample-fed local tracks, for the embedding application to write
    /// captured media into.
    pub fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().clone()
    }

    fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
        let result = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        };
        result.map_err(|e| CallError::NegotiationFailure(format!("invalid description: {e}")))
    }
}

#[async_trait]
impl MediaEndpoint for RtcEndpoint {
    async fn start_local_media(&self) -> Result<()> {
        if !self.local_tracks.lock().is_empty() {
            return Ok(());
        }

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "converge".to_owned(),
        ));
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "converge".to_owned(),
        ));

        for track in [video.clone(), audio.clone()] {
            self.pc
                .add_track(track)
                .await
                .map_err(|e| CallError::MediaUnavailable(format!("failed to add track: {e}")))?;
        }

        *self.local_tracks.lock() = vec![video, audio];
        debug!("local media tracks attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| CallError::NegotiationFailure(format!("failed to create offer: {e}")))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| {
                CallError::NegotiationFailure(format!("failed to set local description: {e}"))
            })?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| CallError::NegotiationFailure(format!("failed to create answer: {e}")))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| {
                CallError::NegotiationFailure(format!("failed to set local description: {e}"))
            })?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let sdp = Self::to_rtc_description(description)?;
        self.pc.set_remote_description(sdp).await.map_err(|e| {
            CallError::NegotiationFailure(format!("failed to set remote description: {e}"))
        })
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| CallError::NegotiationFailure(format!("candidate rejected: {e}")))
    }

    fn local_candidates(&self) -> broadcast::Receiver<IceCandidate> {
        self.candidate_tx.subscribe()
    }

    fn remote_tracks(&self) -> broadcast::Receiver<RemoteTrack> {
        self.track_tx.subscribe()
    }

    fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.local_tracks.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| CallError::Internal(format!("failed to close peer connection: {e}")))
    }
}

/// Creates one [`RtcEndpoint`] per call
pub struct RtcFactory {
    config: RtcConfig,
}

impl RtcFactory {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MediaFactory for RtcFactory {
    async fn create_endpoint(&self) -> Result<Arc<dyn MediaEndpoint>> {
        Ok(Arc::new(RtcEndpoint::new(&self.config).await?))
    }
}
