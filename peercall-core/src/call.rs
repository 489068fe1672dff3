//! Call state machine
//!
//! Coordinates signaling, the peer connection and the media pipeline for a
//! single 1:1 call at a time.
//!
//! # Architecture
//!
//! [`CallEngine`] is a cheap, clonable handle. All call state lives in one
//! engine task that merges five event sources with `tokio::select!` and
//! processes each event to completion before taking the next:
//!
//! - local intents from the handles (commands with oneshot replies)
//! - inbound signaling messages
//! - peer transport events (candidates, connection state, remote tracks)
//! - screen captures ended by the OS
//! - timers (disconnect grace period, connect timeout)
//!
//! ```text
//!              initiate()                 inbound offer
//!     Idle ─────────────► Outgoing   Idle ─────────────► Incoming
//!                            │                              │
//!                            └──────── connected ───────────┘
//!                                          │
//!                                          ▼
//!                                      Connected
//!
//!     any state ── hangup / remote hangup / failure / timeout ──► Ended
//! ```
//!
//! Long-running steps of `initiate` and of answering an offer (device
//! acquisition, description creation, publish) run on the engine task but
//! keep reading inputs while they are pending. A local hangup (through the
//! abort slot), a remote hangup for the call or the connect timeout
//! interrupts the step; other signals and timers are deferred and handled
//! in arrival order once setup returns. Every exit path runs the same
//! teardown, which emits `CallEnded` exactly once per session.

use crate::identity::PeerIdentity;
use crate::media::{CaptureBackend, MediaError, MediaPipeline, ScreenShareEnded, VideoConstraints};
use crate::peer::{
    PeerConfig, PeerConnectionManager, PeerError, PeerEvent, PeerTransportFactory,
    TransportEvent,
};
use crate::signaling::{SignalMessage, SignalPayload, SignalStream, SignalingChannel, SignalingError};
use crate::transport::RelayTransport;
use crate::types::{
    CallDirection, CallEvent, CallId, CallSession, CallStatus, HangupReason, PeerState,
    SessionDescription, TrackKind,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// A call is active or being set up
    #[error("A call is already active")]
    AlreadyActive,

    /// No call to act on
    #[error("No active call")]
    NoActiveCall,

    /// Operation not valid in the current status
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallStatus),

    /// Camera/microphone could not be opened
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Offer/answer failed
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Offer or answer could not be published
    #[error("Signaling publish failed: {0}")]
    SignalingPublish(String),

    /// Peer connection could not be created
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Media operation failed
    #[error("Media error: {0}")]
    Media(String),

    /// Setup was interrupted and the call ended
    #[error("Call ended during setup: {0}")]
    Aborted(HangupReason),

    /// Engine is misconfigured
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine has shut down
    #[error("Engine shut down")]
    Shutdown,
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::DeviceUnavailable { .. } => CallError::DeviceUnavailable(err.to_string()),
            other => CallError::Media(other.to_string()),
        }
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        CallError::Negotiation(err.to_string())
    }
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::SignalingPublish(err.to_string())
    }
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a disconnected connection may recover before the call
    /// fails, in milliseconds
    pub disconnect_grace_ms: u64,
    /// Calls not connected within this many milliseconds end with
    /// `timeout`; `None` disables the limit
    pub connect_timeout_ms: Option<u64>,
    /// Answer inbound offers without waiting for `accept_incoming`
    pub auto_accept: bool,
    /// Open the microphone for calls
    pub want_audio: bool,
    /// Open the camera for calls
    pub want_video: bool,
    /// Camera constraints
    pub video: VideoConstraints,
    /// Peer connection settings
    pub peer: PeerConfig,
    /// Event broadcast buffer size
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: 5_000,
            connect_timeout_ms: Some(45_000),
            auto_accept: true,
            want_audio: true,
            want_video: true,
            video: VideoConstraints::default(),
            peer: PeerConfig::default(),
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    /// Disconnect grace period
    #[must_use]
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    /// Connect timeout, if enabled
    #[must_use]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Check the configuration is usable
    ///
    /// # Errors
    ///
    /// Returns error if no media is requested or the event buffer is empty
    pub fn validate(&self) -> Result<(), CallError> {
        if !self.want_audio && !self.want_video {
            return Err(CallError::Config(
                "at least one of audio or video must be requested".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(CallError::Config(
                "event capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

type AbortSlot = Arc<Mutex<Option<oneshot::Sender<HangupReason>>>>;

enum Command<I: PeerIdentity> {
    Initiate {
        callee: I,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Decline {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup {
        reason: HangupReason,
        reply: oneshot::Sender<()>,
    },
    Toggle {
        kind: TrackKind,
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    StartScreenShare {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    StopScreenShare {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running call engine
///
/// Clones share the same engine. The engine stops once [`shutdown`] is
/// called or every handle is dropped.
///
/// [`shutdown`]: CallEngine::shutdown
#[derive(Clone)]
pub struct CallEngine<I: PeerIdentity> {
    local_id: I,
    commands: mpsc::Sender<Command<I>>,
    events: broadcast::Sender<CallEvent<I>>,
    session: watch::Receiver<Option<CallSession<I>>>,
    abort: AbortSlot,
    initiating: Arc<AtomicBool>,
}

struct InitiateGuard<'a>(&'a AtomicBool);

impl Drop for InitiateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<I: PeerIdentity> CallEngine<I> {
    /// Start building an engine for `local_id`
    pub fn builder<T: RelayTransport>(
        local_id: I,
        signaling: Arc<SignalingChannel<I, T>>,
    ) -> CallEngineBuilder<I, T> {
        CallEngineBuilder::new(local_id, signaling)
    }

    /// Identity this engine answers for
    pub fn local_id(&self) -> &I {
        &self.local_id
    }

    /// Call `callee`
    ///
    /// Returns once the offer is published; the call is then `Outgoing`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyActive` if a call is active or another initiate is in
    /// flight, otherwise the error that ended the attempt
    #[tracing::instrument(skip(self), fields(local = %self.local_id, callee = %callee))]
    pub async fn initiate(&self, callee: I) -> Result<CallId, CallError> {
        if self.status().is_active() {
            return Err(CallError::AlreadyActive);
        }
        if self
            .initiating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!("Initiate already in flight");
            return Err(CallError::AlreadyActive);
        }
        let _guard = InitiateGuard(&self.initiating);
        self.request(|reply| Command::Initiate { callee, reply })
            .await?
    }

    /// Answer the ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing or answering fails
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Accept { reply }).await?
    }

    /// Decline the ringing inbound call
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing
    pub async fn decline_incoming(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Decline { reply }).await?
    }

    /// End the current call; idempotent
    ///
    /// Interrupts call setup if it is still in progress.
    ///
    /// # Errors
    ///
    /// Returns `Shutdown` if the engine has stopped
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn hangup(&self, reason: HangupReason) -> Result<(), CallError> {
        self.fire_abort(reason);
        self.request(|reply| Command::Hangup { reason, reply }).await
    }

    /// Flip the local camera track; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error if no call is active or there is no camera track
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Video,
            reply,
        })
        .await?
    }

    /// Flip the local microphone track; returns the new enabled state
    ///
    /// # Errors
    ///
    /// Returns error if no call is active or there is no microphone track
    pub async fn toggle_audio(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::Toggle {
            kind: TrackKind::Audio,
            reply,
        })
        .await?
    }

    /// Send screen capture in place of the camera
    ///
    /// # Errors
    ///
    /// Returns error if the call is not connected, has no video, or screen
    /// capture is refused
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StartScreenShare { reply })
            .await?
    }

    /// Go back to the camera
    ///
    /// # Errors
    ///
    /// Returns error if no call is active or the camera cannot be restored
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        self.request(|reply| Command::StopScreenShare { reply })
            .await?
    }

    /// End any call and stop the engine; idempotent
    pub async fn shutdown(&self) {
        self.fire_abort(HangupReason::Shutdown);
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            tracing::debug!("Engine already stopped");
        }
    }

    /// Snapshot of the current (or last) session
    #[must_use]
    pub fn current_session(&self) -> Option<CallSession<I>> {
        self.session.borrow().clone()
    }

    /// Status of the current session; `Idle` if there never was one
    #[must_use]
    pub fn status(&self) -> CallStatus {
        self.session
            .borrow()
            .as_ref()
            .map_or(CallStatus::Idle, |s| s.status)
    }

    /// Receiver that changes whenever the session snapshot does
    #[must_use]
    pub fn watch_session(&self) -> watch::Receiver<Option<CallSession<I>>> {
        self.session.clone()
    }

    /// Subscribe to engine events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent<I>> {
        self.events.subscribe()
    }

    fn fire_abort(&self, reason: HangupReason) {
        if let Some(abort) = self.abort.lock().take() {
            tracing::debug!(%reason, "Interrupting call setup");
            let _ = abort.send(reason);
        }
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Command<I>,
    ) -> Result<R, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)
    }
}

/// Builder for [`CallEngine`]
pub struct CallEngineBuilder<I: PeerIdentity, T: RelayTransport> {
    local_id: I,
    signaling: Arc<SignalingChannel<I, T>>,
    factory: Option<Arc<dyn PeerTransportFactory>>,
    capture: Option<Arc<dyn CaptureBackend>>,
    config: EngineConfig,
}

impl<I: PeerIdentity, T: RelayTransport> CallEngineBuilder<I, T> {
    /// Builder with default configuration
    pub fn new(local_id: I, signaling: Arc<SignalingChannel<I, T>>) -> Self {
        Self {
            local_id,
            signaling,
            factory: None,
            capture: None,
            config: EngineConfig::default(),
        }
    }

    /// Peer transport used for connections
    #[must_use]
    pub fn peer_factory(mut self, factory: Arc<dyn PeerTransportFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Capture backend used for local media
    #[must_use]
    pub fn capture(mut self, capture: Arc<dyn CaptureBackend>) -> Self {
        self.capture = Some(capture);
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe to signaling and spawn the engine task
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing, the configuration is
    /// invalid, or the signaling subscription fails
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub async fn start(self) -> Result<CallEngine<I>, CallError> {
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| CallError::Config("peer transport factory not set".to_string()))?;
        let capture = self
            .capture
            .ok_or_else(|| CallError::Config("capture backend not set".to_string()))?;

        let signals = self.signaling.subscribe(&self.local_id).await?;
        let (peer, peer_events) = PeerConnectionManager::new(factory, self.config.peer.clone());
        let (media, screen_ended) = MediaPipeline::new(capture, self.config.video);
        let (commands_tx, commands) = mpsc::channel(32);
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (snapshot, session) = watch::channel(None);
        let (timers_tx, timers) = mpsc::unbounded_channel();
        let abort: AbortSlot = Arc::new(Mutex::new(None));

        let engine = EngineLoop {
            local_id: self.local_id.clone(),
            config: self.config,
            signaling: self.signaling,
            peer,
            media,
            session: None,
            pending_offer: None,
            events: events.clone(),
            snapshot,
            abort: Arc::clone(&abort),
            timers: timers_tx,
            grace_generation: 0,
        };
        let inputs = Inputs {
            commands,
            signals,
            peer_events,
            screen_ended,
            timers,
            deferred: VecDeque::new(),
        };
        tokio::spawn(engine.run(inputs));
        tracing::info!("Call engine started");

        Ok(CallEngine {
            local_id: self.local_id,
            commands: commands_tx,
            events,
            session,
            abort,
            initiating: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ConnectTimeout,
    DisconnectGrace { generation: u64 },
}

#[derive(Debug)]
struct TimerFired {
    call_id: CallId,
    kind: TimerKind,
}

struct Inputs<I: PeerIdentity> {
    commands: mpsc::Receiver<Command<I>>,
    signals: SignalStream<I>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    screen_ended: mpsc::UnboundedReceiver<ScreenShareEnded>,
    timers: mpsc::UnboundedReceiver<TimerFired>,
    deferred: VecDeque<Deferred<I>>,
}

/// Input read during call setup and handled after it
enum Deferred<I: PeerIdentity> {
    Signal(SignalMessage<I>),
    Timer(TimerFired),
}

/// Why call setup stopped
struct Failure {
    reason: HangupReason,
    error: CallError,
    notify_remote: bool,
}

impl Failure {
    fn new(reason: HangupReason, error: CallError, notify_remote: bool) -> Self {
        Self {
            reason,
            error,
            notify_remote,
        }
    }

    fn aborted(reason: HangupReason) -> Self {
        Self::new(reason, CallError::Aborted(reason), true)
    }
}

/// Local reason recorded when the remote side hangs up
fn local_reason(remote: HangupReason) -> HangupReason {
    match remote {
        HangupReason::Busy => HangupReason::Busy,
        HangupReason::Declined => HangupReason::Declined,
        _ => HangupReason::RemoteEnded,
    }
}

async fn abort_fired(abort: &mut Option<oneshot::Receiver<HangupReason>>) -> Option<HangupReason> {
    match abort {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

/// Interrupt sources watched while one call is being set up
struct SetupWatch<'a, I: PeerIdentity> {
    call_id: CallId,
    remote: I,
    abort: Option<oneshot::Receiver<HangupReason>>,
    inputs: &'a mut Inputs<I>,
}

impl<'a, I: PeerIdentity> SetupWatch<'a, I> {
    fn new(
        call_id: CallId,
        remote: I,
        abort: oneshot::Receiver<HangupReason>,
        inputs: &'a mut Inputs<I>,
    ) -> Self {
        Self {
            call_id,
            remote,
            abort: Some(abort),
            inputs,
        }
    }

    /// Run `op` unless the call is ended first
    async fn guard<F: Future>(&mut self, op: F) -> Result<F::Output, Failure> {
        tokio::pin!(op);
        loop {
            tokio::select! {
                biased;
                fired = abort_fired(&mut self.abort) => match fired {
                    Some(reason) => return Err(Failure::aborted(reason)),
                    None => self.abort = None,
                },
                output = &mut op => return Ok(output),
                Some(message) = self.inputs.signals.recv() => {
                    if let Some(failure) = self.remote_hangup(&message) {
                        return Err(failure);
                    }
                    self.inputs.deferred.push_back(Deferred::Signal(message));
                }
                Some(timer) = self.inputs.timers.recv() => {
                    if timer.call_id == self.call_id && timer.kind == TimerKind::ConnectTimeout {
                        tracing::warn!(call_id = %self.call_id, "Call setup did not finish in time");
                        return Err(Failure::new(
                            HangupReason::Timeout,
                            CallError::Aborted(HangupReason::Timeout),
                            true,
                        ));
                    }
                    self.inputs.deferred.push_back(Deferred::Timer(timer));
                }
            }
        }
    }

    fn remote_hangup(&self, message: &SignalMessage<I>) -> Option<Failure> {
        let SignalPayload::Hangup { reason } = &message.payload else {
            return None;
        };
        if message.call_id != self.call_id || !message.sender_id.same_as(&self.remote) {
            return None;
        }
        let local = local_reason(*reason);
        tracing::info!(call_id = %self.call_id, remote_reason = %reason, "Remote side ended the call during setup");
        Some(Failure::new(local, CallError::Aborted(local), false))
    }
}

struct EngineLoop<I: PeerIdentity, T: RelayTransport> {
    local_id: I,
    config: EngineConfig,
    signaling: Arc<SignalingChannel<I, T>>,
    peer: PeerConnectionManager,
    media: MediaPipeline,
    session: Option<CallSession<I>>,
    pending_offer: Option<SessionDescription>,
    events: broadcast::Sender<CallEvent<I>>,
    snapshot: watch::Sender<Option<CallSession<I>>>,
    abort: AbortSlot,
    timers: mpsc::UnboundedSender<TimerFired>,
    grace_generation: u64,
}

impl<I: PeerIdentity, T: RelayTransport> EngineLoop<I, T> {
    async fn run(mut self, mut inputs: Inputs<I>) {
        loop {
            if let Some(deferred) = inputs.deferred.pop_front() {
                match deferred {
                    Deferred::Signal(message) => self.handle_signal(message, &mut inputs).await,
                    Deferred::Timer(timer) => self.handle_timer(timer).await,
                }
                continue;
            }

            tokio::select! {
                command = inputs.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All engine handles dropped");
                        self.teardown(HangupReason::Shutdown, true).await;
                        break;
                    };
                    if self.handle_command(command, &mut inputs).await.is_break() {
                        break;
                    }
                }
                Some(message) = inputs.signals.recv() => self.handle_signal(message, &mut inputs).await,
                Some(event) = inputs.peer_events.recv() => self.handle_peer_event(event).await,
                Some(notice) = inputs.screen_ended.recv() => self.handle_screen_ended(notice).await,
                Some(timer) = inputs.timers.recv() => self.handle_timer(timer).await,
            }
        }

        self.signaling.unsubscribe(&self.local_id).await;
        tracing::info!(local = %self.local_id, "Call engine stopped");
    }

    async fn handle_command(&mut self, command: Command<I>, inputs: &mut Inputs<I>) -> ControlFlow<()> {
        match command {
            Command::Initiate { callee, reply } => {
                let _ = reply.send(self.initiate(callee, inputs).await);
            }
            Command::Accept { reply } => {
                let _ = reply.send(self.accept_incoming(inputs).await);
            }
            Command::Decline { reply } => {
                let _ = reply.send(self.decline_incoming().await);
            }
            Command::Hangup { reason, reply } => {
                self.teardown(reason, true).await;
                let _ = reply.send(());
            }
            Command::Toggle { kind, reply } => {
                let _ = reply.send(self.toggle(kind));
            }
            Command::StartScreenShare { reply } => {
                let _ = reply.send(self.start_screen_share().await);
            }
            Command::StopScreenShare { reply } => {
                let _ = reply.send(self.stop_screen_share().await);
            }
            Command::Shutdown { reply } => {
                self.teardown(HangupReason::Shutdown, true).await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // Local intents

    async fn initiate(&mut self, callee: I, inputs: &mut Inputs<I>) -> Result<CallId, CallError> {
        if let Some(active) = self.live_session() {
            tracing::warn!(active = %active.call_id, status = ?active.status, "Initiate rejected");
            return Err(CallError::AlreadyActive);
        }

        // Observers first see the session once it is `Outgoing`.
        let call_id = CallId::new();
        self.session = Some(CallSession::outgoing(
            call_id.clone(),
            self.local_id.clone(),
            callee.clone(),
        ));
        self.schedule_connect_timeout(&call_id);
        tracing::info!(call_id = %call_id, callee = %callee, "Initiating call");

        let mut setup = SetupWatch::new(call_id.clone(), callee.clone(), self.arm_abort(), inputs);
        let result = self.establish_outgoing(&call_id, &callee, &mut setup).await;
        self.disarm_abort();

        match result {
            Ok(()) => {
                self.set_status(CallStatus::Outgoing);
                Ok(call_id)
            }
            Err(failure) => {
                tracing::warn!(call_id = %call_id, error = %failure.error, "Call setup failed");
                self.teardown(failure.reason, failure.notify_remote).await;
                Err(failure.error)
            }
        }
    }

    async fn establish_outgoing(
        &mut self,
        call_id: &CallId,
        callee: &I,
        setup: &mut SetupWatch<'_, I>,
    ) -> Result<(), Failure> {
        let acquired = setup
            .guard(self.media.acquire_local_tracks(
                call_id,
                self.config.want_video,
                self.config.want_audio,
            ))
            .await?
            .map_err(|e| Failure::new(HangupReason::DeviceUnavailable, e.into(), false))?;
        if acquired.is_partial() {
            tracing::warn!(missing = ?acquired.missing, "Continuing with partial media");
        }

        setup
            .guard(self.peer.open(call_id))
            .await?
            .map_err(|e| {
                Failure::new(
                    HangupReason::ConnectionFailed,
                    CallError::ConnectionFailed(e.to_string()),
                    false,
                )
            })?;
        setup
            .guard(self.peer.attach_tracks(call_id, &acquired.tracks))
            .await?
            .map_err(|e| Failure::new(HangupReason::NegotiationFailed, e.into(), true))?;

        let offer = setup
            .guard(self.peer.create_offer(call_id))
            .await?
            .map_err(|e| Failure::new(HangupReason::NegotiationFailed, e.into(), true))?
            .ok_or_else(|| {
                Failure::new(
                    HangupReason::NegotiationFailed,
                    CallError::Negotiation(PeerError::Closed.to_string()),
                    false,
                )
            })?;

        let message = SignalMessage::new(
            call_id.clone(),
            self.local_id.clone(),
            callee.clone(),
            SignalPayload::Offer { description: offer },
        );
        setup
            .guard(self.signaling.publish(message))
            .await?
            .map_err(|e| Failure::new(HangupReason::SignalingFailed, e.into(), false))?;
        Ok(())
    }

    async fn accept_incoming(&mut self, inputs: &mut Inputs<I>) -> Result<(), CallError> {
        let status = self.require_live()?.status;
        if status != CallStatus::Incoming {
            return Err(CallError::InvalidState(status));
        }
        let Some(offer) = self.pending_offer.take() else {
            return Err(CallError::InvalidState(status));
        };
        self.answer_offer(offer, inputs).await
    }

    async fn decline_incoming(&mut self) -> Result<(), CallError> {
        let status = self.require_live()?.status;
        if status != CallStatus::Incoming || self.pending_offer.is_none() {
            return Err(CallError::InvalidState(status));
        }
        self.teardown(HangupReason::Declined, true).await;
        Ok(())
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let session = self.require_live()?;
        if !session.status.allows_mute() {
            return Err(CallError::InvalidState(session.status));
        }
        let call_id = session.call_id.clone();
        let enabled = self.media.toggle(&call_id, kind)?;
        self.emit(CallEvent::LocalTrackToggled {
            call_id,
            kind,
            enabled,
        });
        Ok(enabled)
    }

    async fn start_screen_share(&mut self) -> Result<(), CallError> {
        let session = self.require_live()?;
        if session.status != CallStatus::Connected {
            return Err(CallError::InvalidState(session.status));
        }
        let call_id = session.call_id.clone();
        if self.media.sharing(&call_id).is_some() {
            return Ok(());
        }
        self.media
            .start_screen_share(&call_id, &mut self.peer)
            .await?;
        self.emit(CallEvent::LocalTrackToggled {
            call_id,
            kind: TrackKind::Screen,
            enabled: true,
        });
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<(), CallError> {
        let call_id = self.require_live()?.call_id.clone();
        if self
            .media
            .stop_screen_share(&call_id, &mut self.peer)
            .await?
        {
            self.emit(CallEvent::LocalTrackToggled {
                call_id,
                kind: TrackKind::Screen,
                enabled: false,
            });
        }
        Ok(())
    }

    // Inbound signaling

    async fn handle_signal(&mut self, message: SignalMessage<I>, inputs: &mut Inputs<I>) {
        tracing::trace!(
            call_id = %message.call_id,
            kind = message.kind().as_str(),
            seq = message.seq,
            "Signal received"
        );
        let SignalMessage {
            call_id,
            sender_id,
            payload,
            ..
        } = message;

        let is_offer = matches!(payload, SignalPayload::Offer { .. });
        if !is_offer && !self.is_session_peer(&call_id, &sender_id) {
            tracing::debug!(call_id = %call_id, sender = %sender_id, "Ignoring signal for no live call");
            return;
        }

        match payload {
            SignalPayload::Offer { description } => {
                self.on_offer(call_id, sender_id, description, inputs).await;
            }
            SignalPayload::Answer { description } => self.on_answer(&call_id, description).await,
            SignalPayload::IceCandidate { candidate } => {
                match self.peer.add_remote_candidate(&call_id, candidate).await {
                    Ok(outcome) => tracing::trace!(call_id = %call_id, ?outcome, "Remote candidate handled"),
                    Err(e) => tracing::warn!(call_id = %call_id, error = %e, "Remote candidate rejected"),
                }
                self.sync_queued_candidates(&call_id);
            }
            SignalPayload::Hangup { reason } => {
                tracing::info!(call_id = %call_id, remote_reason = %reason, "Remote side ended the call");
                self.teardown(local_reason(reason), false).await;
            }
        }
    }

    async fn on_offer(
        &mut self,
        call_id: CallId,
        caller: I,
        offer: SessionDescription,
        inputs: &mut Inputs<I>,
    ) {
        if let Some(session) = self.session.as_ref().filter(|s| s.call_id == call_id) {
            tracing::debug!(call_id = %call_id, status = ?session.status, "Ignoring repeated offer");
            return;
        }
        if let Some(active) = self.live_session() {
            tracing::info!(
                active = %active.call_id,
                rejected = %call_id,
                caller = %caller,
                "Busy; declining inbound offer"
            );
            let busy = SignalMessage::new(
                call_id.clone(),
                self.local_id.clone(),
                caller,
                SignalPayload::Hangup {
                    reason: HangupReason::Busy,
                },
            );
            if let Err(e) = self.signaling.publish(busy).await {
                tracing::warn!(call_id = %call_id, error = %e, "Busy notice not delivered");
            }
            self.signaling.forget_call(&call_id, &self.local_id);
            return;
        }

        tracing::info!(call_id = %call_id, caller = %caller, "Incoming call");
        self.session = Some(CallSession::incoming(
            call_id.clone(),
            caller.clone(),
            self.local_id.clone(),
        ));
        self.emit(CallEvent::SessionStateChanged {
            call_id: call_id.clone(),
            status: CallStatus::Incoming,
        });
        self.emit(CallEvent::IncomingCall {
            call_id: call_id.clone(),
            caller,
        });
        self.publish_snapshot();

        // Open now so candidates trickling in before the answer are buffered.
        if let Err(e) = self.peer.open(&call_id).await {
            tracing::warn!(call_id = %call_id, error = %e, "Peer connection unavailable");
            self.teardown(HangupReason::ConnectionFailed, true).await;
            return;
        }
        self.schedule_connect_timeout(&call_id);

        if self.config.auto_accept {
            if let Err(e) = self.answer_offer(offer, inputs).await {
                tracing::warn!(call_id = %call_id, error = %e, "Auto-accept failed");
            }
        } else {
            self.pending_offer = Some(offer);
        }
    }

    async fn answer_offer(
        &mut self,
        offer: SessionDescription,
        inputs: &mut Inputs<I>,
    ) -> Result<(), CallError> {
        let session = self.require_live()?;
        let call_id = session.call_id.clone();
        let caller = session.remote_peer().clone();

        let mut setup = SetupWatch::new(call_id.clone(), caller.clone(), self.arm_abort(), inputs);
        let result = self
            .establish_incoming(&call_id, &caller, &offer, &mut setup)
            .await;
        self.disarm_abort();

        if let Err(failure) = result {
            tracing::warn!(call_id = %call_id, error = %failure.error, "Answering failed");
            self.teardown(failure.reason, failure.notify_remote).await;
            return Err(failure.error);
        }
        self.sync_queued_candidates(&call_id);
        Ok(())
    }

    async fn establish_incoming(
        &mut self,
        call_id: &CallId,
        caller: &I,
        offer: &SessionDescription,
        setup: &mut SetupWatch<'_, I>,
    ) -> Result<(), Failure> {
        let acquired = setup
            .guard(self.media.acquire_local_tracks(
                call_id,
                self.config.want_video,
                self.config.want_audio,
            ))
            .await?
            .map_err(|e| Failure::new(HangupReason::DeviceUnavailable, e.into(), true))?;
        if acquired.is_partial() {
            tracing::warn!(missing = ?acquired.missing, "Answering with partial media");
        }

        setup
            .guard(self.peer.attach_tracks(call_id, &acquired.tracks))
            .await?
            .map_err(|e| Failure::new(HangupReason::NegotiationFailed, e.into(), true))?;
        let answer = setup
            .guard(self.peer.accept_offer(call_id, offer))
            .await?
            .map_err(|e| Failure::new(HangupReason::NegotiationFailed, e.into(), true))?
            .ok_or_else(|| {
                Failure::new(
                    HangupReason::NegotiationFailed,
                    CallError::Negotiation(PeerError::Closed.to_string()),
                    true,
                )
            })?;

        let message = SignalMessage::new(
            call_id.clone(),
            self.local_id.clone(),
            caller.clone(),
            SignalPayload::Answer {
                description: answer,
            },
        );
        setup
            .guard(self.signaling.publish(message))
            .await?
            .map_err(|e| Failure::new(HangupReason::SignalingFailed, e.into(), true))?;
        tracing::info!(call_id = %call_id, "Answer sent");
        Ok(())
    }

    async fn on_answer(&mut self, call_id: &CallId, answer: SessionDescription) {
        let outgoing = self.session.as_ref().is_some_and(|s| {
            s.direction == CallDirection::Outbound && s.status == CallStatus::Outgoing
        });
        if !outgoing {
            tracing::debug!(call_id = %call_id, "Ignoring answer outside outgoing call");
            return;
        }
        let applied = self.peer.apply_answer(call_id, &answer).await;
        match applied {
            Ok(true) => {
                tracing::debug!(call_id = %call_id, "Answer applied");
                self.sync_queued_candidates(call_id);
            }
            Ok(false) => tracing::debug!(call_id = %call_id, "Answer ignored"),
            Err(e) => {
                tracing::warn!(call_id = %call_id, error = %e, "Answer rejected");
                self.teardown(HangupReason::NegotiationFailed, true).await;
            }
        }
    }

    // Peer transport events

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(session) = self.live_session() else {
            return;
        };
        if session.call_id != event.call_id {
            tracing::trace!(call_id = %event.call_id, "Dropping event from stale connection");
            return;
        }
        let remote = session.remote_peer().clone();

        match &event.event {
            TransportEvent::LocalCandidate(candidate) => {
                let message = SignalMessage::new(
                    event.call_id.clone(),
                    self.local_id.clone(),
                    remote,
                    SignalPayload::IceCandidate {
                        candidate: candidate.clone(),
                    },
                );
                if let Err(e) = self.signaling.publish(message).await {
                    tracing::warn!(call_id = %event.call_id, error = %e, "Candidate publish failed");
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let tracks = match self.session.as_mut() {
                    Some(session) => {
                        session.add_remote_track(track.clone());
                        session.remote_tracks.clone()
                    }
                    None => return,
                };
                tracing::debug!(call_id = %event.call_id, kind = %track.kind, "Remote track available");
                self.emit(CallEvent::RemoteStreamAvailable {
                    call_id: event.call_id.clone(),
                    tracks,
                });
                self.publish_snapshot();
            }
            TransportEvent::StateChanged(_) => {
                if let Some(state) = self.peer.observe(&event) {
                    self.on_peer_state(&event.call_id, state).await;
                }
            }
        }
    }

    async fn on_peer_state(&mut self, call_id: &CallId, state: PeerState) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.peer_state = state;
        let status = session.status;
        self.publish_snapshot();

        match state {
            PeerState::Connected => match status {
                CallStatus::Outgoing | CallStatus::Incoming => {
                    if let Some(session) = self.session.as_mut() {
                        session.connected_at = Some(Utc::now());
                    }
                    tracing::info!(call_id = %call_id, "Call connected");
                    self.set_status(CallStatus::Connected);
                }
                CallStatus::Connected => {
                    self.grace_generation += 1;
                    tracing::info!(call_id = %call_id, "Connection recovered");
                }
                _ => {}
            },
            PeerState::Disconnected => {
                self.grace_generation += 1;
                let grace = self.config.disconnect_grace();
                tracing::warn!(call_id = %call_id, grace_ms = grace.as_millis() as u64, "Connection interrupted");
                self.schedule(
                    call_id,
                    grace,
                    TimerKind::DisconnectGrace {
                        generation: self.grace_generation,
                    },
                );
            }
            PeerState::Failed => {
                tracing::warn!(call_id = %call_id, "Connection failed");
                self.teardown(HangupReason::ConnectionFailed, true).await;
            }
            PeerState::Closed => {
                tracing::warn!(call_id = %call_id, "Connection closed by transport");
                self.teardown(HangupReason::ConnectionFailed, true).await;
            }
            PeerState::New | PeerState::Negotiating => {}
        }
    }

    async fn handle_screen_ended(&mut self, notice: ScreenShareEnded) {
        let sharing = self
            .media
            .sharing(&notice.call_id)
            .is_some_and(|track| track.id() == notice.track_id);
        if !sharing || !self.is_live(&notice.call_id) {
            return;
        }
        tracing::info!(call_id = %notice.call_id, "Screen capture ended by the system");
        let restored = self
            .media
            .stop_screen_share(&notice.call_id, &mut self.peer)
            .await;
        match restored {
            Ok(_) => self.emit(CallEvent::LocalTrackToggled {
                call_id: notice.call_id,
                kind: TrackKind::Screen,
                enabled: false,
            }),
            Err(e) => tracing::warn!(error = %e, "Could not restore camera"),
        }
    }

    async fn handle_timer(&mut self, timer: TimerFired) {
        let Some(session) = self.live_session() else {
            return;
        };
        if session.call_id != timer.call_id {
            return;
        }
        let (status, peer_state) = (session.status, session.peer_state);

        match timer.kind {
            TimerKind::ConnectTimeout => {
                if matches!(status, CallStatus::Outgoing | CallStatus::Incoming) {
                    tracing::warn!(call_id = %timer.call_id, "Call did not connect in time");
                    self.teardown(HangupReason::Timeout, true).await;
                }
            }
            TimerKind::DisconnectGrace { generation } => {
                if generation == self.grace_generation && peer_state == PeerState::Disconnected {
                    tracing::warn!(call_id = %timer.call_id, "Connection did not recover");
                    self.teardown(HangupReason::ConnectionFailed, true).await;
                }
            }
        }
    }

    // Teardown

    /// End the live session; no-op once it has ended
    async fn teardown(&mut self, reason: HangupReason, notify_remote: bool) {
        let Some(session) = self.session.as_ref().filter(|s| !s.status.is_terminal()) else {
            return;
        };
        let call_id = session.call_id.clone();
        let remote = session.remote_peer().clone();
        let old_state = session.status;

        self.disarm_abort();
        self.pending_offer = None;
        self.grace_generation += 1;

        if notify_remote {
            let notice = SignalMessage::new(
                call_id.clone(),
                self.local_id.clone(),
                remote,
                SignalPayload::Hangup { reason },
            );
            if let Err(e) = self.signaling.publish(notice).await {
                tracing::warn!(call_id = %call_id, error = %e, "Hangup notice not delivered");
            }
        }

        self.peer.close(&call_id).await;
        let released = self.media.release_all(&call_id);
        self.signaling.forget_call(&call_id, &self.local_id);

        if let Some(session) = self.session.as_mut() {
            session.status = CallStatus::Ended;
            session.ended_at = Some(Utc::now());
            session.end_reason = Some(reason);
            session.queued_candidates = 0;
            if !session.peer_state.is_terminal() {
                session.peer_state = PeerState::Closed;
            }
        }

        tracing::debug!(call_id = %call_id, old_state = ?old_state, new_state = ?CallStatus::Ended, "Call state changed");
        tracing::info!(call_id = %call_id, %reason, released, "Call ended");
        self.emit(CallEvent::SessionStateChanged {
            call_id: call_id.clone(),
            status: CallStatus::Ended,
        });
        self.emit(CallEvent::CallEnded { call_id, reason });
        self.publish_snapshot();
    }

    // Helpers

    fn live_session(&self) -> Option<&CallSession<I>> {
        self.session.as_ref().filter(|s| !s.status.is_terminal())
    }

    fn require_live(&self) -> Result<&CallSession<I>, CallError> {
        self.live_session().ok_or(CallError::NoActiveCall)
    }

    fn is_live(&self, call_id: &CallId) -> bool {
        self.live_session().is_some_and(|s| &s.call_id == call_id)
    }

    fn is_session_peer(&self, call_id: &CallId, sender: &I) -> bool {
        self.live_session()
            .is_some_and(|s| &s.call_id == call_id && s.remote_peer().same_as(sender))
    }

    fn set_status(&mut self, status: CallStatus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.status == status {
            return;
        }
        tracing::debug!(call_id = %session.call_id, old_state = ?session.status, new_state = ?status, "Call state changed");
        session.status = status;
        let call_id = session.call_id.clone();
        self.emit(CallEvent::SessionStateChanged { call_id, status });
        self.publish_snapshot();
    }

    fn sync_queued_candidates(&mut self, call_id: &CallId) {
        let queued = self.peer.queued_candidates(call_id);
        let Some(session) = self.session.as_mut().filter(|s| &s.call_id == call_id) else {
            return;
        };
        if session.queued_candidates != queued {
            session.queued_candidates = queued;
            self.publish_snapshot();
        }
    }

    fn emit(&self, event: CallEvent<I>) {
        let _ = self.events.send(event);
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.session.clone());
    }

    fn arm_abort(&self) -> oneshot::Receiver<HangupReason> {
        let (tx, rx) = oneshot::channel();
        *self.abort.lock() = Some(tx);
        rx
    }

    fn disarm_abort(&self) {
        self.abort.lock().take();
    }

    fn schedule_connect_timeout(&self, call_id: &CallId) {
        if let Some(timeout) = self.config.connect_timeout() {
            self.schedule(call_id, timeout, TimerKind::ConnectTimeout);
        }
    }

    fn schedule(&self, call_id: &CallId, delay: Duration, kind: TimerKind) {
        let timers = self.timers.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(TimerFired { call_id, kind });
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use crate::loopback::LoopbackNetwork;
    use crate::media::SyntheticCapture;
    use crate::transport::MemoryRelay;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.disconnect_grace(), Duration::from_secs(5));
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(45)));
        assert!(config.auto_accept);
        assert_eq!(config.video, VideoConstraints::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"disconnect_grace_ms": 1500, "connect_timeout_ms": null}"#)
                .unwrap();
        assert_eq!(config.disconnect_grace(), Duration::from_millis(1500));
        assert_eq!(config.connect_timeout(), None);
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_config_requires_some_media() {
        let config = EngineConfig {
            want_audio: false,
            want_video: false,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(CallError::Config(_))));
    }

    #[test]
    fn test_media_error_mapping() {
        let err: CallError = MediaError::DeviceUnavailable {
            kind: TrackKind::Video,
            reason: "permission denied".to_string(),
        }
        .into();
        assert!(matches!(err, CallError::DeviceUnavailable(_)));
        let err: CallError = MediaError::NoVideoSlot.into();
        assert!(matches!(err, CallError::Media(_)));
    }

    #[tokio::test]
    async fn test_builder_requires_collaborators() {
        let relay = Arc::new(MemoryRelay::new());
        let signaling = Arc::new(SignalingChannel::<UserId, _>::new(relay));
        let result = CallEngine::builder(UserId::new("alice"), signaling.clone())
            .capture(Arc::new(SyntheticCapture::new()))
            .start()
            .await;
        assert!(matches!(result, Err(CallError::Config(_))));

        let engine = CallEngine::builder(UserId::new("alice"), signaling)
            .capture(Arc::new(SyntheticCapture::new()))
            .peer_factory(Arc::new(LoopbackNetwork::new()))
            .start()
            .await
            .unwrap();
        assert_eq!(engine.status(), CallStatus::Idle);
        assert!(engine.current_session().is_none());
    }

    #[tokio::test]
    async fn test_operations_without_call() {
        let relay = Arc::new(MemoryRelay::new());
        let signaling = Arc::new(SignalingChannel::<UserId, _>::new(relay));
        let engine = CallEngine::builder(UserId::new("alice"), signaling)
            .capture(Arc::new(SyntheticCapture::new()))
            .peer_factory(Arc::new(LoopbackNetwork::new()))
            .start()
            .await
            .unwrap();

        assert_eq!(engine.toggle_audio().await, Err(CallError::NoActiveCall));
        assert_eq!(engine.start_screen_share().await, Err(CallError::NoActiveCall));
        assert_eq!(engine.accept_incoming().await, Err(CallError::NoActiveCall));
        assert!(engine.hangup(HangupReason::UserEnded).await.is_ok());

        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.toggle_audio().await, Err(CallError::Shutdown));
    }
}
