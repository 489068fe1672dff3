//! Peer connection management
//!
//! Owns the single peer connection of the active session: offer/answer,
//! ICE candidate buffering, track attachment and connection-state
//! observation.
//!
//! The native media transport sits behind [`PeerTransport`]; a
//! [`PeerTransportFactory`] creates one per session and wires its events
//! into the manager's event channel.

use crate::media::MediaTrackHandle;
use crate::types::{CallId, IceCandidate, PeerState, RemoteTrack, SdpType, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Offer/answer could not be produced or applied
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Offer requested before any local track was attached
    #[error("No local tracks attached")]
    NoLocalTracks,

    /// No outgoing video sender exists
    #[error("No video sender")]
    NoVideoSender,

    /// Connection closed
    #[error("Peer connection closed")]
    Closed,

    /// Transport backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Connection state reported by the native transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    /// ICE/DTLS in progress
    Connecting,
    /// Media path up
    Connected,
    /// Media path lost, may recover
    Disconnected,
    /// Unrecoverable failure
    Failed,
    /// Closed
    Closed,
}

/// Event raised by a peer transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A local candidate was gathered and should be sent to the remote side
    LocalCandidate(IceCandidate),
    /// The transport changed connection state
    StateChanged(LinkState),
    /// The remote side announced a track
    RemoteTrack(RemoteTrack),
}

/// Transport event tagged with its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    /// Session the transport belongs to
    pub call_id: CallId,
    /// What happened
    pub event: TransportEvent,
}

/// ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs, e.g. `stun:stun.l.google.com:19302`
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Peer connection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// ICE servers used for candidate gathering
    pub ice_servers: Vec<IceServer>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
        }
    }
}

/// Native peer connection
///
/// Implementations report candidates, state changes and remote tracks on the
/// event channel handed to [`PeerTransportFactory::connect`].
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach a local track; visual tracks occupy the video sender
    async fn add_track(&self, track: &MediaTrackHandle) -> Result<(), PeerError>;

    /// Produce an offer
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Produce an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description; starts candidate gathering
    async fn set_local_description(&self, description: &SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, description: &SessionDescription)
        -> Result<(), PeerError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;

    /// Swap the track on the video sender without renegotiation
    async fn replace_video_track(&self, track: &MediaTrackHandle) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer transports
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    /// Create a transport for a session
    async fn connect(
        &self,
        call_id: &CallId,
        config: &PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

/// FIFO buffer for candidates that arrive before the remote description
#[derive(Debug, Default, Clone)]
pub struct IceCandidateQueue {
    pending: VecDeque<IceCandidate>,
}

impl IceCandidateQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a candidate
    pub fn push(&mut self, candidate: IceCandidate) {
        self.pending.push_back(candidate);
    }

    /// Take every buffered candidate in arrival order
    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.pending.drain(..)
    }

    /// Drop every buffered candidate
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of buffered candidates
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is buffered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// Handed to the transport
    Applied,
    /// Buffered until the remote description is set
    Queued,
    /// No matching open connection
    Ignored,
}

struct Connection {
    call_id: CallId,
    transport: Arc<dyn PeerTransport>,
    state: PeerState,
    has_local_tracks: bool,
    has_remote_description: bool,
    pending: IceCandidateQueue,
}

/// Peer connection manager
///
/// Holds at most one connection. Once closed, further operations for that
/// session are no-ops.
pub struct PeerConnectionManager {
    factory: Arc<dyn PeerTransportFactory>,
    config: PeerConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    connection: Option<Connection>,
}

impl PeerConnectionManager {
    /// Create a manager and the receiver for its transport events
    #[must_use]
    pub fn new(
        factory: Arc<dyn PeerTransportFactory>,
        config: PeerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                factory,
                config,
                events,
                connection: None,
            },
            rx,
        )
    }

    /// Create the session's connection, closing any previous one first
    ///
    /// # Errors
    ///
    /// Returns error if the transport cannot be created
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn open(&mut self, call_id: &CallId) -> Result<(), PeerError> {
        if let Some(stale) = self.connection.as_ref().map(|c| c.call_id.clone()) {
            tracing::warn!(stale_call = %stale, "Closing leftover peer connection");
            self.close(&stale).await;
        }

        let transport = self
            .factory
            .connect(call_id, &self.config, self.events.clone())
            .await?;
        self.connection = Some(Connection {
            call_id: call_id.clone(),
            transport,
            state: PeerState::New,
            has_local_tracks: false,
            has_remote_description: false,
            pending: IceCandidateQueue::new(),
        });
        tracing::debug!("Peer connection created");
        Ok(())
    }

    /// Attach local tracks to the connection
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects a track
    pub async fn attach_tracks(
        &mut self,
        call_id: &CallId,
        tracks: &[MediaTrackHandle],
    ) -> Result<(), PeerError> {
        let Some(conn) = self.connection_mut(call_id) else {
            return Err(PeerError::Closed);
        };
        for track in tracks {
            conn.transport.add_track(track).await?;
            tracing::trace!(call_id = %call_id, track_id = track.id(), kind = %track.kind(), "Track attached");
        }
        conn.has_local_tracks |= !tracks.is_empty();
        Ok(())
    }

    /// Create and apply a local offer
    ///
    /// Returns `None` if the session's connection is already closed.
    ///
    /// # Errors
    ///
    /// Returns error if no tracks are attached, an offer already exists or
    /// the transport fails
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn create_offer(
        &mut self,
        call_id: &CallId,
    ) -> Result<Option<SessionDescription>, PeerError> {
        let Some(conn) = self.connection_mut(call_id) else {
            tracing::debug!("No open connection; offer skipped");
            return Ok(None);
        };
        if !conn.has_local_tracks {
            return Err(PeerError::NoLocalTracks);
        }
        if conn.state != PeerState::New {
            return Err(PeerError::Negotiation(format!(
                "cannot offer in state {:?}",
                conn.state
            )));
        }

        let offer = conn.transport.create_offer().await?;
        conn.transport.set_local_description(&offer).await?;
        conn.state = PeerState::Negotiating;
        tracing::debug!(sdp_len = offer.sdp.len(), "SDP offer created");
        Ok(Some(offer))
    }

    /// Apply a remote offer and produce the answer
    ///
    /// Buffered candidates are flushed once the offer is applied. Returns
    /// `None` if the session's connection is already closed.
    ///
    /// # Errors
    ///
    /// Returns error if the description is not an offer, the connection has
    /// already negotiated, or the transport fails
    #[tracing::instrument(skip(self, offer), fields(call_id = %call_id, sdp_len = offer.sdp.len()))]
    pub async fn accept_offer(
        &mut self,
        call_id: &CallId,
        offer: &SessionDescription,
    ) -> Result<Option<SessionDescription>, PeerError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(PeerError::Negotiation("expected an offer".to_string()));
        }
        let Some(conn) = self.connection_mut(call_id) else {
            return Ok(None);
        };
        if conn.state != PeerState::New {
            return Err(PeerError::Negotiation(format!(
                "cannot accept offer in state {:?}",
                conn.state
            )));
        }

        conn.transport.set_remote_description(offer).await?;
        conn.has_remote_description = true;
        conn.state = PeerState::Negotiating;
        Self::flush_candidates(conn).await;

        let answer = conn.transport.create_answer().await?;
        conn.transport.set_local_description(&answer).await?;
        tracing::debug!(sdp_len = answer.sdp.len(), "SDP answer created");
        Ok(Some(answer))
    }

    /// Apply the remote answer to our offer
    ///
    /// Returns `false` when the answer was ignored: connection closed, or an
    /// answer was already applied.
    ///
    /// # Errors
    ///
    /// Returns error if the description is not an answer, no offer is
    /// outstanding, or the transport fails
    #[tracing::instrument(skip(self, answer), fields(call_id = %call_id, sdp_len = answer.sdp.len()))]
    pub async fn apply_answer(
        &mut self,
        call_id: &CallId,
        answer: &SessionDescription,
    ) -> Result<bool, PeerError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(PeerError::Negotiation("expected an answer".to_string()));
        }
        let Some(conn) = self.connection_mut(call_id) else {
            return Ok(false);
        };
        if conn.has_remote_description {
            tracing::debug!("Answer already applied; ignoring");
            return Ok(false);
        }
        if conn.state != PeerState::Negotiating {
            return Err(PeerError::Negotiation(format!(
                "no outstanding offer in state {:?}",
                conn.state
            )));
        }

        conn.transport.set_remote_description(answer).await?;
        conn.has_remote_description = true;
        Self::flush_candidates(conn).await;
        tracing::debug!("SDP answer applied");
        Ok(true)
    }

    /// Apply a remote candidate, or buffer it until the remote description
    /// is known
    ///
    /// # Errors
    ///
    /// Returns error if the transport rejects the candidate
    pub async fn add_remote_candidate(
        &mut self,
        call_id: &CallId,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, PeerError> {
        let Some(conn) = self.connection_mut(call_id) else {
            return Ok(CandidateOutcome::Ignored);
        };
        if !conn.has_remote_description {
            conn.pending.push(candidate);
            tracing::trace!(call_id = %call_id, queued = conn.pending.len(), "ICE candidate queued");
            return Ok(CandidateOutcome::Queued);
        }
        conn.transport.add_ice_candidate(&candidate).await?;
        tracing::trace!(call_id = %call_id, "ICE candidate applied");
        Ok(CandidateOutcome::Applied)
    }

    /// Swap the outgoing video track in place
    ///
    /// # Errors
    ///
    /// Returns error if the session has no open connection or no video sender
    pub async fn replace_outgoing_video(
        &mut self,
        call_id: &CallId,
        track: &MediaTrackHandle,
    ) -> Result<(), PeerError> {
        let conn = self.connection_mut(call_id).ok_or(PeerError::Closed)?;
        conn.transport.replace_video_track(track).await
    }

    /// Fold a transport event into the tracked state
    ///
    /// Returns the new state if the event changed it. Events for other
    /// sessions and events after close are ignored.
    pub fn observe(&mut self, event: &PeerEvent) -> Option<PeerState> {
        let conn = self.connection_mut(&event.call_id)?;
        let TransportEvent::StateChanged(link) = &event.event else {
            return None;
        };
        if conn.state.is_terminal() {
            return None;
        }
        let next = match link {
            LinkState::Connecting => return None,
            LinkState::Connected => PeerState::Connected,
            LinkState::Disconnected => PeerState::Disconnected,
            LinkState::Failed => PeerState::Failed,
            LinkState::Closed => PeerState::Closed,
        };
        if next == conn.state {
            return None;
        }
        tracing::debug!(call_id = %event.call_id, from = ?conn.state, to = ?next, "Peer state changed");
        conn.state = next;
        Some(next)
    }

    /// Close the session's connection; idempotent
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn close(&mut self, call_id: &CallId) {
        let matches = self
            .connection
            .as_ref()
            .is_some_and(|c| &c.call_id == call_id);
        if !matches {
            return;
        }
        if let Some(mut conn) = self.connection.take() {
            let dropped = conn.pending.len();
            conn.pending.clear();
            if let Err(e) = conn.transport.close().await {
                tracing::warn!(error = %e, "Error closing peer transport");
            }
            tracing::debug!(dropped_candidates = dropped, "Peer connection closed");
        }
    }

    /// State of the session's connection, if open
    #[must_use]
    pub fn state(&self, call_id: &CallId) -> Option<PeerState> {
        self.connection
            .as_ref()
            .filter(|c| &c.call_id == call_id)
            .map(|c| c.state)
    }

    /// Whether a connection is open for the session
    #[must_use]
    pub fn is_open(&self, call_id: &CallId) -> bool {
        self.state(call_id).is_some()
    }

    /// Number of candidates buffered for the session
    #[must_use]
    pub fn queued_candidates(&self, call_id: &CallId) -> usize {
        self.connection
            .as_ref()
            .filter(|c| &c.call_id == call_id)
            .map_or(0, |c| c.pending.len())
    }

    fn connection_mut(&mut self, call_id: &CallId) -> Option<&mut Connection> {
        self.connection
            .as_mut()
            .filter(|c| &c.call_id == call_id && c.state != PeerState::Closed)
    }

    async fn flush_candidates(conn: &mut Connection) {
        let queued: Vec<IceCandidate> = conn.pending.drain().collect();
        if queued.is_empty() {
            return;
        }
        tracing::debug!(count = queued.len(), "Flushing queued ICE candidates");
        for candidate in queued {
            if let Err(e) = conn.transport.add_ice_candidate(&candidate).await {
                tracing::warn!(error = %e, "Queued ICE candidate rejected");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackConfig, LoopbackNetwork};
    use crate::media::{MediaPipeline, SyntheticCapture, VideoConstraints};
    use proptest::prelude::*;

    fn manager(network: &LoopbackNetwork) -> (PeerConnectionManager, mpsc::UnboundedReceiver<PeerEvent>) {
        PeerConnectionManager::new(Arc::new(network.clone()), PeerConfig::default())
    }

    async fn local_tracks(call_id: &CallId) -> Vec<MediaTrackHandle> {
        let (mut media, _) = MediaPipeline::new(
            Arc::new(SyntheticCapture::new()),
            VideoConstraints::default(),
        );
        media
            .acquire_local_tracks(call_id, true, true)
            .await
            .unwrap()
            .tracks
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!(
            "candidate:{n} 1 udp 2130706431 127.0.0.1 {} typ host",
            50000 + n
        ))
    }

    #[test]
    fn test_default_ice_servers() {
        let config = PeerConfig::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls[0], "stun:stun.l.google.com:19302");
    }

    #[tokio::test]
    async fn test_offer_requires_tracks() {
        let network = LoopbackNetwork::new();
        let (mut pcm, _rx) = manager(&network);
        let call = CallId::from("c1");
        pcm.open(&call).await.unwrap();

        assert_eq!(pcm.create_offer(&call).await.unwrap_err(), PeerError::NoLocalTracks);
    }

    #[tokio::test]
    async fn test_offer_moves_to_negotiating() {
        let network = LoopbackNetwork::new();
        let (mut pcm, _rx) = manager(&network);
        let call = CallId::from("c1");
        pcm.open(&call).await.unwrap();
        pcm.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();

        let offer = pcm.create_offer(&call).await.unwrap().unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert_eq!(pcm.state(&call), Some(PeerState::Negotiating));
        assert!(pcm.create_offer(&call).await.is_err());
    }

    #[tokio::test]
    async fn test_early_candidates_are_queued_then_flushed() {
        let caller_net = LoopbackNetwork::new();
        let callee_net = LoopbackNetwork::new();
        let (mut caller, _crx) = manager(&caller_net);
        let (mut callee, _erx) = manager(&callee_net);
        let call = CallId::from("c1");

        caller.open(&call).await.unwrap();
        caller.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();
        let offer = caller.create_offer(&call).await.unwrap().unwrap();

        callee.open(&call).await.unwrap();
        callee.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();
        for n in 0..3 {
            assert_eq!(
                callee.add_remote_candidate(&call, candidate(n)).await.unwrap(),
                CandidateOutcome::Queued
            );
        }
        assert_eq!(callee.queued_candidates(&call), 3);

        callee.accept_offer(&call, &offer).await.unwrap().unwrap();
        assert_eq!(callee.queued_candidates(&call), 0);

        let peer = callee_net.peer(&call).unwrap();
        let applied: Vec<String> = peer
            .applied_candidates()
            .into_iter()
            .map(|c| c.candidate)
            .collect();
        assert_eq!(applied, (0..3).map(|n| candidate(n).candidate).collect::<Vec<_>>());
        assert_eq!(
            callee.add_remote_candidate(&call, candidate(9)).await.unwrap(),
            CandidateOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_ignored() {
        let caller_net = LoopbackNetwork::new();
        let callee_net = LoopbackNetwork::new();
        let (mut caller, _crx) = manager(&caller_net);
        let (mut callee, _erx) = manager(&callee_net);
        let call = CallId::from("c1");

        caller.open(&call).await.unwrap();
        caller.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();
        let offer = caller.create_offer(&call).await.unwrap().unwrap();
        callee.open(&call).await.unwrap();
        callee.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();
        let answer = callee.accept_offer(&call, &offer).await.unwrap().unwrap();

        assert!(caller.apply_answer(&call, &answer).await.unwrap());
        assert!(!caller.apply_answer(&call, &answer).await.unwrap());
        assert!(caller.apply_answer(&call, &offer).await.is_err());
    }

    #[tokio::test]
    async fn test_observe_tracks_link_state() {
        let network = LoopbackNetwork::new();
        let (mut pcm, _rx) = manager(&network);
        let call = CallId::from("c1");
        pcm.open(&call).await.unwrap();

        let event = |link| PeerEvent {
            call_id: call.clone(),
            event: TransportEvent::StateChanged(link),
        };
        assert_eq!(pcm.observe(&event(LinkState::Connecting)), None);
        assert_eq!(pcm.observe(&event(LinkState::Connected)), Some(PeerState::Connected));
        assert_eq!(pcm.observe(&event(LinkState::Connected)), None);
        assert_eq!(pcm.observe(&event(LinkState::Disconnected)), Some(PeerState::Disconnected));
        assert_eq!(pcm.observe(&event(LinkState::Failed)), Some(PeerState::Failed));
        assert_eq!(pcm.observe(&event(LinkState::Connected)), None);

        let other = PeerEvent {
            call_id: CallId::from("other"),
            event: TransportEvent::StateChanged(LinkState::Connected),
        };
        assert_eq!(pcm.observe(&other), None);
    }

    #[tokio::test]
    async fn test_operations_after_close_are_noops() {
        let network = LoopbackNetwork::new();
        let (mut pcm, _rx) = manager(&network);
        let call = CallId::from("c1");
        pcm.open(&call).await.unwrap();
        pcm.add_remote_candidate(&call, candidate(1)).await.unwrap();

        pcm.close(&call).await;
        pcm.close(&call).await;

        assert!(!pcm.is_open(&call));
        assert_eq!(pcm.create_offer(&call).await.unwrap(), None);
        assert_eq!(
            pcm.add_remote_candidate(&call, candidate(2)).await.unwrap(),
            CandidateOutcome::Ignored
        );
        assert!(network.peer(&call).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_open_closes_previous_connection() {
        let network = LoopbackNetwork::with_config(LoopbackConfig::default());
        let (mut pcm, _rx) = manager(&network);
        let first = CallId::from("c1");
        let second = CallId::from("c2");
        pcm.open(&first).await.unwrap();
        pcm.open(&second).await.unwrap();

        assert!(network.peer(&first).unwrap().is_closed());
        assert!(pcm.is_open(&second));
        assert!(!pcm.is_open(&first));
    }

    proptest! {
        #[test]
        fn prop_queue_preserves_arrival_order(lines in proptest::collection::vec("[a-z0-9 ]{1,24}", 0..32)) {
            let mut queue = IceCandidateQueue::new();
            for line in &lines {
                queue.push(IceCandidate::new(line.clone()));
            }
            prop_assert_eq!(queue.len(), lines.len());
            let drained: Vec<String> = queue.drain().map(|c| c.candidate).collect();
            prop_assert_eq!(drained, lines);
            prop_assert!(queue.is_empty());
        }

        #[test]
        fn prop_candidates_wait_for_remote_description(before in 0u32..8, after in 0u32..8) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (applied_early, applied, outcomes) = rt.block_on(async {
                let caller_net = LoopbackNetwork::new();
                let callee_net = LoopbackNetwork::new();
                let (mut caller, _crx) = manager(&caller_net);
                let (mut callee, _erx) = manager(&callee_net);
                let call = CallId::from("c1");

                caller.open(&call).await.unwrap();
                caller.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();
                let offer = caller.create_offer(&call).await.unwrap().unwrap();
                callee.open(&call).await.unwrap();
                callee.attach_tracks(&call, &local_tracks(&call).await).await.unwrap();
                let peer = callee_net.peer(&call).unwrap();

                let mut outcomes = Vec::new();
                for n in 0..before {
                    outcomes.push(callee.add_remote_candidate(&call, candidate(n)).await.unwrap());
                }
                let applied_early = peer.applied_candidates().len();
                callee.accept_offer(&call, &offer).await.unwrap().unwrap();
                for n in before..before + after {
                    outcomes.push(callee.add_remote_candidate(&call, candidate(n)).await.unwrap());
                }

                let applied: Vec<String> = peer
                    .applied_candidates()
                    .into_iter()
                    .map(|c| c.candidate)
                    .collect();
                (applied_early, applied, outcomes)
            });

            prop_assert_eq!(applied_early, 0);
            let arrived: Vec<String> = (0..before + after).map(|n| candidate(n).candidate).collect();
            prop_assert_eq!(applied, arrived);
            let (queued, direct) = outcomes.split_at(before as usize);
            prop_assert!(queued.iter().all(|o| *o == CandidateOutcome::Queued));
            prop_assert!(direct.iter().all(|o| *o == CandidateOutcome::Applied));
        }
    }
}
