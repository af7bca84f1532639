use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::SessionError;
use super::peer::{IceState, PeerConnector, PeerEvent, PeerLink};
use super::sink::RemoteTrack;
use crate::config::IceConfig;
use crate::protocol::{EndpointId, IceCandidate};

/// Builds receive-only `webrtc` peer connections.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcConnector {
    pub fn new(ice: &IceConfig) -> Result<Self, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = ice
            .servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        id: &EndpointId,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let candidate_tx = events.clone();
        let endpoint = id.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = candidate_tx.clone();
            let endpoint = endpoint.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    tracing::debug!(target = "webrtc", endpoint = %endpoint, "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            endpoint = %endpoint,
                            error = %err,
                            "failed to serialize local ice candidate"
                        );
                    }
                }
            })
        }));

        let track_tx = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = track_tx.send(PeerEvent::Track(RemoteTrack::from_webrtc(track)));
                Box::pin(async {})
            },
        ));

        let state_tx = events;
        let endpoint = id.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::debug!(target = "webrtc", endpoint = %endpoint, state = ?state, "ice connection state");
            if let Some(state) = ice_state(state) {
                let _ = state_tx.send(PeerEvent::IceState(state));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcLink {
            pc,
            closed: AtomicBool::new(false),
        }))
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceState> {
    Some(match state {
        RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => return None,
    })
}

struct WebRtcLink {
    pc: Arc<RTCPeerConnection>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_offer(&self) -> Result<String, SessionError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.pc
            .local_description()
            .await
            .map(|description| description.sdp)
            .ok_or_else(|| SessionError::Negotiation("local description missing after offer".into()))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), SessionError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_candidate(&self, candidate: &IceCandidate) -> Result<(), SessionError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment.clone(),
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Drop the handlers first so nothing reaches the session after release.
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.close().await?;
        Ok(())
    }
}
