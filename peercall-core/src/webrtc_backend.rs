//! Peer transport over the `webrtc` crate
//!
//! Each session gets its own `RTCPeerConnection` built with the default
//! codecs and interceptors. Local tracks become `TrackLocalStaticSample`s;
//! the first visual track's `RTCRtpSender` is kept so that screen share can
//! swap it with `replace_track` instead of renegotiating.

use crate::media::MediaTrackHandle;
use crate::peer::{
    LinkState, PeerConfig, PeerError, PeerEvent, PeerTransport, PeerTransportFactory,
    TransportEvent,
};
use crate::types::{CallId, IceCandidate, RemoteTrack, SdpType, SessionDescription, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

const STREAM_ID: &str = "peercall";

fn backend_err(e: webrtc::Error) -> PeerError {
    PeerError::Backend(e.to_string())
}

fn negotiation_err(e: webrtc::Error) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video | TrackKind::Screen => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn local_track(handle: &MediaTrackHandle) -> Arc<dyn TrackLocal + Send + Sync> {
    Arc::new(TrackLocalStaticSample::new(
        codec_for(handle.kind()),
        handle.id().to_string(),
        STREAM_ID.to_string(),
    ))
}

/// Creates `webrtc` peer connections
#[derive(Debug, Clone, Default)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone().unwrap_or_default(),
                    credential: server.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    #[tracing::instrument(skip(self, config, events), fields(call_id = %call_id))]
    async fn connect(
        &self,
        call_id: &CallId,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(backend_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let connection = Arc::new(
            api.new_peer_connection(Self::rtc_configuration(config))
                .await
                .map_err(backend_err)?,
        );
        wire_callbacks(&connection, call_id, events);
        tracing::debug!(ice_servers = config.ice_servers.len(), "WebRTC peer connection created");

        Ok(Arc::new(WebRtcPeer {
            connection,
            video_sender: Mutex::new(None),
        }))
    }
}

fn wire_callbacks(
    connection: &Arc<RTCPeerConnection>,
    call_id: &CallId,
    events: mpsc::UnboundedSender<PeerEvent>,
) {
    let tx = events.clone();
    let id = call_id.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        let call_id = id.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent {
                        call_id,
                        event: TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }),
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Could not serialize local candidate"),
            }
        })
    }));

    let tx = events.clone();
    let id = call_id.clone();
    connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let link = match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Connecting => {
                Some(LinkState::Connecting)
            }
            RTCPeerConnectionState::Connected => Some(LinkState::Connected),
            RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
            RTCPeerConnectionState::Failed => Some(LinkState::Failed),
            RTCPeerConnectionState::Closed => Some(LinkState::Closed),
            RTCPeerConnectionState::Unspecified => None,
        };
        if let Some(link) = link {
            let _ = tx.send(PeerEvent {
                call_id: id.clone(),
                event: TransportEvent::StateChanged(link),
            });
        }
        Box::pin(async {})
    }));

    let tx = events;
    let id = call_id.clone();
    connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            RTPCodecType::Unspecified => None,
        };
        if let Some(kind) = kind {
            let _ = tx.send(PeerEvent {
                call_id: id.clone(),
                event: TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                }),
            });
        }
        Box::pin(async {})
    }));
}

struct WebRtcPeer {
    connection: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
    }
    .map_err(negotiation_err)
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn add_track(&self, track: &MediaTrackHandle) -> Result<(), PeerError> {
        let sender = self
            .connection
            .add_track(local_track(track))
            .await
            .map_err(backend_err)?;
        if track.kind().is_visual() {
            let mut slot = self.video_sender.lock();
            if slot.is_none() {
                *slot = Some(sender);
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .map_err(negotiation_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(negotiation_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        self.connection
            .set_local_description(to_rtc(description)?)
            .await
            .map_err(negotiation_err)
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        self.connection
            .set_remote_description(to_rtc(description)?)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .map_err(negotiation_err)
    }

    async fn replace_video_track(&self, track: &MediaTrackHandle) -> Result<(), PeerError> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or(PeerError::NoVideoSender)?;
        sender
            .replace_track(Some(local_track(track)))
            .await
            .map_err(backend_err)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.connection.close().await.map_err(backend_err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::{MediaPipeline, SyntheticCapture, VideoConstraints};

    #[tokio::test]
    async fn test_offer_lists_local_media() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let call = CallId::from("c1");
        let config = PeerConfig { ice_servers: vec![] };
        let transport = WebRtcTransportFactory::new()
            .connect(&call, &config, tx)
            .await
            .unwrap();

        let (mut media, _) = MediaPipeline::new(
            Arc::new(SyntheticCapture::new()),
            VideoConstraints::default(),
        );
        for track in media.acquire_local_tracks(&call, true, true).await.unwrap().tracks {
            transport.add_track(&track).await.unwrap();
        }

        let offer = transport.create_offer().await.unwrap();
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        transport.close().await.unwrap();
    }
}
