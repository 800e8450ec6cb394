//! WebRTC PeerConnection management
//!
//! [`PeerConnector`] builds one [`PeerLink`] per remote participant. The
//! `webrtc` crate backend lives here; tests substitute in-memory links.
//! Asynchronous backend callbacks (local ICE candidates, remote tracks) are
//! reported as [`PeerSignal`]s on the sink handed to `connect`.

use super::media_track::{MediaTrack, RemoteTrack, TrackKind};
use super::signaling::IceCandidatePayload;
use super::WebRTCError;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Public STUN servers every connection uses. No TURN relay is configured.
pub const ICE_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:global.stun.twilio.com:3478",
];

/// Asynchronous event raised by a peer connection backend
#[derive(Debug)]
pub enum PeerSignal {
    /// A local ICE candidate was gathered and must be sent to the remote peer
    LocalCandidate {
        connection_id: String,
        candidate: IceCandidatePayload,
    },
    /// The remote peer started sending a track
    RemoteTrack {
        connection_id: String,
        track: RemoteTrack,
    },
}

pub type PeerSignalSender = mpsc::UnboundedSender<PeerSignal>;

/// One peer connection to a remote participant
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach a local track as a new sender
    async fn add_track(&self, track: &MediaTrack) -> Result<(), WebRTCError>;

    /// Create an offer, apply it as local description, return its SDP
    async fn create_offer(&self) -> Result<String, WebRTCError>;

    /// Apply a remote offer, create and apply the answer, return its SDP
    async fn accept_offer(&self, sdp: &str) -> Result<String, WebRTCError>;

    /// Apply a remote answer
    async fn accept_answer(&self, sdp: &str) -> Result<(), WebRTCError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), WebRTCError>;

    /// Swap the track of the video sender without renegotiation.
    /// Returns `false` when the connection has no video sender.
    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, WebRTCError>;

    /// Close the connection
    async fn close(&self) -> Result<(), WebRTCError>;
}

/// Factory for peer connections
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a connection to `connection_id`, reporting callbacks on `signals`
    async fn connect(
        &self,
        connection_id: &str,
        signals: PeerSignalSender,
    ) -> Result<Arc<dyn PeerLink>, WebRTCError>;
}

/// `webrtc` crate backend
pub struct RtcPeerConnector {
    ice_servers: Vec<String>,
}

impl Default for RtcPeerConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl RtcPeerConnector {
    pub fn new() -> Self {
        Self {
            ice_servers: ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    /// Create a new RTCPeerConnection with default codecs and interceptors
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, WebRTCError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        Ok(Arc::new(peer_connection))
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        connection_id: &str,
        signals: PeerSignalSender,
    ) -> Result<Arc<dyn PeerLink>, WebRTCError> {
        let peer_connection = self.create_peer_connection().await?;
        setup_callbacks(&peer_connection, connection_id, signals);
        debug!("Created peer connection for {}", connection_id);

        Ok(Arc::new(RtcPeerLink {
            connection_id: connection_id.to_string(),
            peer_connection,
        }))
    }
}

/// Route ICE, track and state callbacks of one connection
fn setup_callbacks(peer_connection: &Arc<RTCPeerConnection>, connection_id: &str, signals: PeerSignalSender) {
    let id = connection_id.to_string();
    let ice_signals = signals.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate| {
        let id = id.clone();
        let signals = ice_signals.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                debug!("ICE gathering complete for {}", id);
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = signals.send(PeerSignal::LocalCandidate {
                        connection_id: id,
                        candidate: init.into(),
                    });
                }
                Err(e) => warn!("Failed to serialize ICE candidate for {}: {}", id, e),
            }
        })
    }));

    let id = connection_id.to_string();
    peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let id = id.clone();
        let signals = signals.clone();
        Box::pin(async move {
            let Some(kind) = TrackKind::from_codec_type(track.kind()) else {
                warn!("Ignoring remote track of unspecified kind from {}", id);
                return;
            };
            info!("Remote {} track {} from {}", kind, track.id(), id);
            let remote = RemoteTrack {
                id: track.id(),
                kind,
                stream_id: track.stream_id(),
                source: Some(track),
            };
            let _ = signals.send(PeerSignal::RemoteTrack {
                connection_id: id,
                track: remote,
            });
        })
    }));

    let id = connection_id.to_string();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let id = id.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed => warn!("Peer {} connection failed", id),
                _ => debug!("Peer {} connection state: {}", id, state),
            }
        })
    }));
}

/// Peer link backed by an RTCPeerConnection
pub struct RtcPeerLink {
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
}

impl RtcPeerLink {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), WebRTCError> {
        let sender = self
            .peer_connection
            .add_track(track.local_track())
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // Drain RTCP so interceptors (NACK, reports) keep working
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WebRTCError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.peer_connection
            .set_local_description(offer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String, WebRTCError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP offer: {}", e)))?;

        self.peer_connection
            .set_remote_description(offer)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create answer: {}", e)))?;

        self.peer_connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        if let Some(local_desc) = self.peer_connection.local_description().await {
            return Ok(local_desc.sdp);
        }
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<(), WebRTCError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP answer: {}", e)))?;

        self.peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidatePayload) -> Result<(), WebRTCError> {
        self.peer_connection
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrack) -> Result<bool, WebRTCError> {
        for sender in self.peer_connection.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() != RTPCodecType::Video {
                continue;
            }
            sender
                .replace_track(Some(track.local_track()))
                .await
                .map_err(|e| WebRTCError::MediaError(format!("Failed to replace video track: {}", e)))?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}
