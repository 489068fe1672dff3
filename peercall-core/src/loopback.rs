//! In-process peer transport
//!
//! [`LoopbackNetwork`] creates [`LoopbackPeer`]s that speak just enough SDP
//! for two engines in the same process to negotiate with each other. A peer
//! reports itself connected once it has a local description, a remote
//! description and at least one applied remote candidate.
//!
//! The network keeps a handle to every peer it created so callers can
//! inspect senders, applied candidates and offer counts, or force link
//! state changes.

use crate::media::MediaTrackHandle;
use crate::peer::{
    LinkState, PeerConfig, PeerError, PeerEvent, PeerTransport, PeerTransportFactory,
    TransportEvent,
};
use crate::types::{CallId, IceCandidate, RemoteTrack, SdpType, SessionDescription, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Loopback behaviour knobs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Host candidates emitted when a local description is applied
    pub local_candidates: usize,
    /// Report `Connected` as soon as negotiation completes
    pub auto_connect: bool,
    /// Make every offer/answer creation fail
    pub fail_negotiation: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            local_candidates: 2,
            auto_connect: true,
            fail_negotiation: false,
        }
    }
}

/// Factory for loopback peers
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    config: LoopbackConfig,
    peers: Arc<Mutex<HashMap<CallId, Vec<LoopbackPeer>>>>,
}

impl LoopbackNetwork {
    /// Network with default behaviour
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Network with custom behaviour
    #[must_use]
    pub fn with_config(config: LoopbackConfig) -> Self {
        Self {
            config,
            peers: Arc::default(),
        }
    }

    /// Most recent peer created for a session
    #[must_use]
    pub fn peer(&self, call_id: &CallId) -> Option<LoopbackPeer> {
        self.peers
            .lock()
            .get(call_id)
            .and_then(|peers| peers.last().cloned())
    }

    /// Number of peers created so far
    #[must_use]
    pub fn created(&self) -> usize {
        self.peers.lock().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackNetwork {
    async fn connect(
        &self,
        call_id: &CallId,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        tracing::trace!(call_id = %call_id, ice_servers = config.ice_servers.len(), "Creating loopback peer");
        let peer = LoopbackPeer::new(call_id.clone(), self.config, events);
        self.peers
            .lock()
            .entry(call_id.clone())
            .or_default()
            .push(peer.clone());
        Ok(Arc::new(peer))
    }
}

#[derive(Debug, Default)]
struct PeerInner {
    session_id: u64,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    audio_sender: Option<String>,
    video_sender: Option<(String, TrackKind)>,
    applied: Vec<IceCandidate>,
    offers_created: usize,
    link: Option<LinkState>,
    closed: bool,
}

/// Loopback peer connection
///
/// Clones share state with the transport handed to the manager.
#[derive(Clone)]
pub struct LoopbackPeer {
    call_id: CallId,
    config: LoopbackConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    inner: Arc<Mutex<PeerInner>>,
}

impl LoopbackPeer {
    fn new(call_id: CallId, config: LoopbackConfig, events: mpsc::UnboundedSender<PeerEvent>) -> Self {
        let inner = PeerInner {
            session_id: rand::thread_rng().gen_range(1_000_000..u64::from(u32::MAX)),
            ..PeerInner::default()
        };
        Self {
            call_id,
            config,
            events,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Remote candidates applied, in order
    #[must_use]
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().applied.clone()
    }

    /// Whether a remote description was applied
    #[must_use]
    pub fn has_remote_description(&self) -> bool {
        self.inner.lock().remote.is_some()
    }

    /// Track id and kind on the video sender
    #[must_use]
    pub fn video_sender(&self) -> Option<(String, TrackKind)> {
        self.inner.lock().video_sender.clone()
    }

    /// Track id on the audio sender
    #[must_use]
    pub fn audio_sender(&self) -> Option<String> {
        self.inner.lock().audio_sender.clone()
    }

    /// Number of offers produced
    #[must_use]
    pub fn offers_created(&self) -> usize {
        self.inner.lock().offers_created
    }

    /// Whether the peer was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Last link state reported
    #[must_use]
    pub fn link_state(&self) -> Option<LinkState> {
        self.inner.lock().link
    }

    /// Force a link state change, as a network drop or ICE failure would
    pub fn set_link_state(&self, link: LinkState) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.link = Some(link);
        self.emit(TransportEvent::StateChanged(link));
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(PeerEvent {
            call_id: self.call_id.clone(),
            event,
        });
    }

    fn render_sdp(inner: &PeerInner) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            inner.session_id
        );
        let mut mid = 0;
        if inner.audio_sender.is_some() {
            sdp.push_str(&format!(
                "m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:{mid}\r\na=rtpmap:111 opus/48000/2\r\n"
            ));
            mid += 1;
        }
        if inner.video_sender.is_some() {
            sdp.push_str(&format!(
                "m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{mid}\r\na=rtpmap:96 VP8/90000\r\n"
            ));
        }
        sdp
    }

    fn announced_tracks(sdp: &str) -> Vec<RemoteTrack> {
        sdp.lines()
            .filter_map(|line| line.strip_prefix("m="))
            .enumerate()
            .filter_map(|(mid, media)| {
                let kind = match media.split_whitespace().next()? {
                    "audio" => TrackKind::Audio,
                    "video" => TrackKind::Video,
                    _ => return None,
                };
                Some(RemoteTrack {
                    id: format!("remote-{kind}-{mid}"),
                    kind,
                })
            })
            .collect()
    }

    fn ensure_open(inner: &PeerInner) -> Result<(), PeerError> {
        if inner.closed {
            return Err(PeerError::Closed);
        }
        Ok(())
    }

    fn maybe_connect(&self, inner: &mut PeerInner) {
        let ready = inner.local.is_some() && inner.remote.is_some() && !inner.applied.is_empty();
        if !self.config.auto_connect || !ready || inner.link.is_some() {
            return;
        }
        inner.link = Some(LinkState::Connected);
        self.emit(TransportEvent::StateChanged(LinkState::Connecting));
        self.emit(TransportEvent::StateChanged(LinkState::Connected));
    }
}

#[async_trait]
impl PeerTransport for LoopbackPeer {
    async fn add_track(&self, track: &MediaTrackHandle) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        match track.kind() {
            TrackKind::Audio => inner.audio_sender = Some(track.id().to_string()),
            kind => inner.video_sender = Some((track.id().to_string(), kind)),
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if self.config.fail_negotiation {
            return Err(PeerError::Negotiation("offer creation refused".to_string()));
        }
        inner.offers_created += 1;
        Ok(SessionDescription::offer(Self::render_sdp(&inner)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if self.config.fail_negotiation {
            return Err(PeerError::Negotiation("answer creation refused".to_string()));
        }
        match &inner.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => {
                Ok(SessionDescription::answer(Self::render_sdp(&inner)))
            }
            _ => Err(PeerError::Negotiation(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        inner.local = Some(description.clone());

        let port_base = 50000 + (inner.session_id % 10000) as u32;
        for n in 0..self.config.local_candidates {
            let n = n as u32;
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp {} 127.0.0.1 {} typ host",
                n + 1,
                2_130_706_431u32 - n,
                port_base + n
            ));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            self.emit(TransportEvent::LocalCandidate(candidate));
        }

        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if !description.sdp.starts_with("v=0") {
            return Err(PeerError::Negotiation("malformed SDP".to_string()));
        }
        match (description.sdp_type, &inner.local) {
            (SdpType::Answer, None) => {
                return Err(PeerError::Negotiation(
                    "answer without a local offer".to_string(),
                ));
            }
            (SdpType::Offer, Some(_)) => {
                return Err(PeerError::Negotiation(
                    "offer received after local description".to_string(),
                ));
            }
            _ => {}
        }

        inner.remote = Some(description.clone());
        for track in Self::announced_tracks(&description.sdp) {
            self.emit(TransportEvent::RemoteTrack(track));
        }
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if inner.remote.is_none() {
            return Err(PeerError::Negotiation(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PeerError::Negotiation(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        inner.applied.push(candidate.clone());
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn replace_video_track(&self, track: &MediaTrackHandle) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        Self::ensure_open(&inner)?;
        if inner.video_sender.is_none() {
            return Err(PeerError::NoVideoSender);
        }
        inner.video_sender = Some((track.id().to_string(), track.kind()));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.link = Some(LinkState::Closed);
        self.emit(TransportEvent::StateChanged(LinkState::Closed));
        Ok(())
    }
}
