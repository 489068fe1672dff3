//! Peercall - 1:1 real-time call engine
//!
//! This library sets up point-to-point audio/video calls between two
//! participants. It features:
//!
//! - **Relay Signaling**: Offers, answers, ICE candidates and hangups over any
//!   at-least-once publish/subscribe relay, with redelivery filtering
//! - **Single-Task Engine**: Local intents, inbound signaling and transport
//!   events are processed one at a time by one task
//! - **Trickle ICE**: Early candidates are buffered until the remote
//!   description is known
//! - **Screen Share**: Replaces the outgoing video track without renegotiating
//! - **Pluggable Backends**: Peer transport and capture sit behind traits,
//!   with in-process implementations and an optional `webrtc` backend
//!
//! # Examples
//!
//! ```rust,no_run
//! use peercall_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = Arc::new(MemoryRelay::new());
//! let signaling = Arc::new(SignalingChannel::new(relay));
//!
//! let alice = CallEngine::builder(UserId::new("alice"), signaling)
//!     .peer_factory(Arc::new(LoopbackNetwork::new()))
//!     .capture(Arc::new(SyntheticCapture::new()))
//!     .start()
//!     .await?;
//!
//! let mut events = alice.subscribe_events();
//! let call_id = alice.initiate(UserId::new("bob")).await?;
//! while let Ok(event) = events.recv().await {
//!     if let CallEvent::CallEnded { reason, .. } = event {
//!         println!("call {call_id} ended: {reason}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Core call types and data structures
pub mod types;

/// Participant identity abstraction
pub mod identity;

/// Relay transport abstraction and in-process relay
pub mod transport;

/// Signaling channel adapter
pub mod signaling;

/// Peer connection management
pub mod peer;

/// In-process peer transport
pub mod loopback;

/// Local media acquisition and track replacement
pub mod media;

/// Call state machine and engine handle
pub mod call;

/// Peer transport over the `webrtc` crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

// Re-export main types at crate root
pub use call::{CallEngine, CallEngineBuilder, CallError, EngineConfig};
pub use identity::{PeerIdentity, UserId};
pub use loopback::{LoopbackConfig, LoopbackNetwork, LoopbackPeer};
pub use media::{
    AcquiredTracks, CaptureBackend, CaptureSource, DeviceAvailability, MediaError, MediaPipeline,
    MediaTrackHandle, ScreenShareEnded, SyntheticCapture, VideoConstraints,
};
pub use peer::{
    CandidateOutcome, IceCandidateQueue, IceServer, LinkState, PeerConfig, PeerConnectionManager,
    PeerError, PeerEvent, PeerTransport, PeerTransportFactory, TransportEvent,
};
pub use signaling::{
    SignalKind, SignalMessage, SignalPayload, SignalStream, SignalingChannel, SignalingError,
};
pub use transport::{MemoryRelay, RelayTransport, TransportError};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::WebRtcTransportFactory;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::call::{CallEngine, CallEngineBuilder, CallError, EngineConfig};
    pub use crate::identity::{PeerIdentity, UserId};
    pub use crate::loopback::LoopbackNetwork;
    pub use crate::media::{CaptureBackend, SyntheticCapture, VideoConstraints};
    pub use crate::peer::{PeerConfig, PeerTransportFactory};
    pub use crate::signaling::SignalingChannel;
    pub use crate::transport::{MemoryRelay, RelayTransport};
    pub use crate::types::{CallEvent, CallId, CallStatus, HangupReason, TrackKind};
}
