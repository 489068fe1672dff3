//! Call engine types and data structures

use crate::identity::PeerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// No call in progress
    Idle,
    /// Offer sent, waiting for the connection to come up
    Outgoing,
    /// Offer received, ringing or answered but not yet connected
    Incoming,
    /// Media path established
    Connected,
    /// Call is over
    Ended,
}

impl CallStatus {
    /// Whether the status is terminal
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Ended
    }

    /// Whether a call occupies the engine in this status
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming | Self::Connected)
    }

    /// Whether local tracks may be muted or unmuted in this status
    #[must_use]
    pub fn allows_mute(self) -> bool {
        self.is_active()
    }
}

/// Which side started the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Locally initiated
    Outbound,
    /// Started by a remote offer
    Inbound,
}

/// Peer connection state, as tracked by the peer connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    /// Connection created, no description exchanged
    New,
    /// Offer/answer in progress
    Negotiating,
    /// Media path up
    Connected,
    /// Media path temporarily lost
    Disconnected,
    /// Closed locally
    Closed,
    /// Unrecoverable failure
    Failed,
}

impl PeerState {
    /// Whether no further transitions are possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
    /// Screen capture
    Screen,
}

impl TrackKind {
    /// Whether this kind occupies the outgoing video slot
    #[must_use]
    pub fn is_visual(self) -> bool {
        matches!(self, Self::Video | Self::Screen)
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        };
        f.write_str(s)
    }
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate attribute, e.g. `candidate:1 1 udp 2130706431 ...`
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangupReason {
    /// Local user hung up
    UserEnded,
    /// Remote side hung up
    RemoteEnded,
    /// Callee already in another call
    Busy,
    /// Callee declined
    Declined,
    /// ICE/DTLS failure
    ConnectionFailed,
    /// SDP exchange failed
    NegotiationFailed,
    /// Offer or answer could not be published
    SignalingFailed,
    /// Capture devices could not be opened
    DeviceUnavailable,
    /// Connection did not come up in time
    Timeout,
    /// Engine shut down
    Shutdown,
}

impl HangupReason {
    /// Wire/display form, e.g. `"user-ended"`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserEnded => "user-ended",
            Self::RemoteEnded => "remote-ended",
            Self::Busy => "busy",
            Self::Declined => "declined",
            Self::ConnectionFailed => "connection-failed",
            Self::NegotiationFailed => "negotiation-failed",
            Self::SignalingFailed => "signaling-failed",
            Self::DeviceUnavailable => "device-unavailable",
            Self::Timeout => "timeout",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for HangupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Track announced by the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier
    pub id: String,
    /// Track kind
    pub kind: TrackKind,
}

/// Events emitted to the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// Session moved to a new status
    SessionStateChanged {
        /// Call identifier
        call_id: CallId,
        /// New status
        status: CallStatus,
    },
    /// Inbound offer waiting for accept/decline
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: I,
    },
    /// Remote media is available
    RemoteStreamAvailable {
        /// Call identifier
        call_id: CallId,
        /// Every remote track announced so far
        tracks: Vec<RemoteTrack>,
    },
    /// Local track enabled/disabled; `Screen` reports screen share on/off
    LocalTrackToggled {
        /// Call identifier
        call_id: CallId,
        /// Track kind
        kind: TrackKind,
        /// New enabled state
        enabled: bool,
    },
    /// Call is over
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Why it ended
        reason: HangupReason,
    },
}

impl<I: PeerIdentity> CallEvent<I> {
    /// Call the event refers to
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::SessionStateChanged { call_id, .. }
            | Self::IncomingCall { call_id, .. }
            | Self::RemoteStreamAvailable { call_id, .. }
            | Self::LocalTrackToggled { call_id, .. }
            | Self::CallEnded { call_id, .. } => call_id,
        }
    }
}

/// Call session information
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub struct CallSession<I: PeerIdentity> {
    /// Call identifier
    pub call_id: CallId,
    /// Who placed the call
    pub caller: I,
    /// Who was called
    pub callee: I,
    /// Which side started the call
    pub direction: CallDirection,
    /// Current status
    pub status: CallStatus,
    /// State of the session's peer connection
    pub peer_state: PeerState,
    /// Remote tracks announced so far
    pub remote_tracks: Vec<RemoteTrack>,
    /// Remote candidates held until the remote description is applied
    #[serde(default)]
    pub queued_candidates: usize,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the media path first came up
    pub connected_at: Option<DateTime<Utc>>,
    /// When the call ended
    pub ended_at: Option<DateTime<Utc>>,
    /// Why the call ended
    pub end_reason: Option<HangupReason>,
}

impl<I: PeerIdentity> CallSession<I> {
    /// Session for a locally initiated call
    ///
    /// Starts in `Idle`; the engine keeps it private until the offer is
    /// published and the session moves to `Outgoing`.
    pub fn outgoing(call_id: CallId, caller: I, callee: I) -> Self {
        Self::new(call_id, caller, callee, CallDirection::Outbound)
    }

    /// Session for a call started by a remote offer
    pub fn incoming(call_id: CallId, caller: I, callee: I) -> Self {
        let mut session = Self::new(call_id, caller, callee, CallDirection::Inbound);
        session.status = CallStatus::Incoming;
        session
    }

    fn new(call_id: CallId, caller: I, callee: I, direction: CallDirection) -> Self {
        Self {
            call_id,
            caller,
            callee,
            direction,
            status: CallStatus::Idle,
            peer_state: PeerState::New,
            remote_tracks: Vec::new(),
            queued_candidates: 0,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
            end_reason: None,
        }
    }

    /// The other participant
    pub fn remote_peer(&self) -> &I {
        match self.direction {
            CallDirection::Outbound => &self.callee,
            CallDirection::Inbound => &self.caller,
        }
    }

    /// Get call duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.connected_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end - start),
            (Some(start), None) => Some(Utc::now() - start),
            _ => None,
        }
    }

    /// Record a remote track, ignoring repeats
    pub fn add_remote_track(&mut self, track: RemoteTrack) {
        if !self.remote_tracks.iter().any(|t| t.id == track.id) {
            self.remote_tracks.push(track);
        }
    }
}
