//! Receive-only peer connection
//!
//! The transport talks to the peer through [`PeerConnector`] and
//! [`PeerSession`] so negotiation can be driven by a scripted peer in tests.
//! [`RtcPeerConnector`] is the webrtc-rs implementation.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_remote::TrackRemote;

use super::sdp::LocalCandidate;
use super::signaling::{ConnectionState, IceServerDescriptor};
use super::stats::stats_entry;
use crate::error::{PlayerError, Result};
use crate::protocol::CandidateTransport;
use crate::sink::{MediaKind, RemoteTrack};

/// Events raised by a peer session
#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalCandidate(LocalCandidate),
    ConnectionState(ConnectionState),
    Track(RemoteTrack),
}

pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// Creates receive-only peer sessions
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Create a session with one recvonly video and one recvonly audio
    /// transceiver. Candidates, state changes and tracks go to `events`.
    async fn connect(
        &self,
        ice_servers: &[IceServerDescriptor],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>>;
}

/// One negotiated peer connection
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<String>;

    async fn set_local_description(&self, offer: &str) -> Result<()>;

    async fn set_remote_answer(&self, answer: &str) -> Result<()>;

    /// Stats entries shaped like RTCStats dictionaries
    async fn stats(&self) -> Vec<serde_json::Value>;

    async fn close(&self);
}

/// webrtc-rs backed connector
#[derive(Debug, Default, Clone)]
pub struct RtcPeerConnector;

impl RtcPeerConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn connect(
        &self,
        ice_servers: &[IceServerDescriptor],
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerSession>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PlayerError::Peer(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PlayerError::Peer(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            PlayerError::Peer(format!("Failed to create peer connection: {}", e))
        })?;
        let pc = Arc::new(pc);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| {
                PlayerError::Peer(format!("Failed to add {:?} transceiver: {}", kind, e))
            })?;
        }

        let session = RtcPeerSession { pc };
        session.setup_event_handlers(events);
        Ok(Arc::new(session))
    }
}

struct RtcPeerSession {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerSession {
    fn setup_event_handlers(&self, events: PeerEventSender) {
        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = match s {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return Box::pin(async {}),
                };
                let _ = tx.send(PeerEvent::ConnectionState(state));
                Box::pin(async {})
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(c) = candidate {
                    match c.to_json() {
                        Ok(init) => {
                            trace!("Local ICE candidate: {}", init.candidate);
                            let _ = tx.send(PeerEvent::LocalCandidate(LocalCandidate {
                                candidate: init.candidate,
                                sdp_mline_index: init.sdp_mline_index,
                                protocol: CandidateTransport::from_token(&c.protocol.to_string()),
                            }));
                        }
                        Err(e) => debug!("Failed to serialize ICE candidate: {}", e),
                    }
                }
                Box::pin(async {})
            }));

        let tx = events;
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let codec = track.codec().capability.mime_type;
                info!("Remote {} track: {} (ssrc {})", kind, codec, track.ssrc());
                let _ = tx.send(PeerEvent::Track(RemoteTrack {
                    kind,
                    codec,
                    ssrc: track.ssrc(),
                    track: Some(track),
                }));
                Box::pin(async {})
            },
        ));
    }
}

#[async_trait]
impl PeerSession for RtcPeerSession {
    async fn create_offer(&self) -> Result<String> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PlayerError::Peer(format!("Failed to create offer: {}", e)))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, offer: &str) -> Result<()> {
        let desc = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| PlayerError::Sdp(format!("Invalid offer: {}", e)))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| PlayerError::Peer(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_answer(&self, answer: &str) -> Result<()> {
        let desc = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| PlayerError::Sdp(format!("Invalid answer: {}", e)))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| PlayerError::Peer(format!("Failed to set remote description: {}", e)))
    }

    async fn stats(&self) -> Vec<serde_json::Value> {
        let report = self.pc.get_stats().await;
        report
            .reports
            .into_iter()
            .filter_map(|(id, entry)| {
                let value = serde_json::to_value(&entry).ok()?;
                Some(stats_entry(id, value))
            })
            .collect()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}
