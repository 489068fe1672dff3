//! Media pipeline
//!
//! Acquires local capture sources (camera, microphone, screen), hands out
//! track handles and swaps the outgoing video track for screen capture
//! without renegotiating.
//!
//! # Architecture
//!
//! Capture devices sit behind the [`CaptureBackend`] trait. The pipeline
//! owns every source it opened for the duration of a session and is the only
//! component that starts or stops them. [`SyntheticCapture`] is an in-process
//! backend with configurable device availability.

use crate::peer::{PeerConnectionManager, PeerError};
use crate::types::{CallId, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Permission denied or no device present
    #[error("Device unavailable ({kind}): {reason}")]
    DeviceUnavailable {
        /// Which kind of device
        kind: TrackKind,
        /// What went wrong
        reason: String,
    },

    /// No outgoing video sender to replace
    #[error("No outgoing video slot")]
    NoVideoSlot,

    /// Track cannot be used for the requested operation
    #[error("Invalid track: {0}")]
    InvalidTrack(String),

    /// Sender replacement failed
    #[error("Track replacement failed: {0}")]
    Replace(String),

    /// No media acquired for this session
    #[error("No media for call {0}")]
    NoSession(String),
}

impl From<PeerError> for MediaError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::NoVideoSender => MediaError::NoVideoSlot,
            other => MediaError::Replace(other.to_string()),
        }
    }
}

/// Camera capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Frames per second
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

#[derive(Debug)]
struct SourceState {
    live: AtomicBool,
    ended: watch::Sender<bool>,
}

/// An opened capture source
///
/// Clones refer to the same source. Stopping it, or the OS ending it,
/// fires the [`ended`](CaptureSource::ended) signal.
#[derive(Debug, Clone)]
pub struct CaptureSource {
    id: String,
    label: String,
    kind: TrackKind,
    state: Arc<SourceState>,
}

impl CaptureSource {
    /// Open a live source
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: format!("{kind}-{}", Uuid::new_v4()),
            label: label.into(),
            kind,
            state: Arc::new(SourceState {
                live: AtomicBool::new(true),
                ended,
            }),
        }
    }

    /// Source identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable device label
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Source kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Whether the source is still producing media
    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::Acquire)
    }

    /// Stop the source; idempotent
    pub fn stop(&self) {
        if self.state.live.swap(false, Ordering::AcqRel) {
            self.state.ended.send_replace(true);
        }
    }

    /// Signal that flips to `true` once the source has ended
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.state.ended.subscribe()
    }
}

/// Device capture collaborator
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// Open the camera
    async fn open_camera(&self, constraints: &VideoConstraints) -> Result<CaptureSource, MediaError>;

    /// Open the microphone
    async fn open_microphone(&self) -> Result<CaptureSource, MediaError>;

    /// Open a screen capture source
    async fn open_screen(&self) -> Result<CaptureSource, MediaError>;
}

/// Handle to a local media track
#[derive(Debug, Clone)]
pub struct MediaTrackHandle {
    id: String,
    kind: TrackKind,
    call_id: CallId,
    source: CaptureSource,
    enabled: Arc<AtomicBool>,
}

impl MediaTrackHandle {
    fn new(call_id: CallId, source: CaptureSource) -> Self {
        Self {
            id: source.id().to_string(),
            kind: source.kind(),
            call_id,
            source,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Owning session
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Underlying capture source
    pub fn source(&self) -> &CaptureSource {
        &self.source
    }

    /// Whether the track is sending media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

/// Result of local track acquisition
#[derive(Debug, Clone)]
pub struct AcquiredTracks {
    /// Tracks that were opened
    pub tracks: Vec<MediaTrackHandle>,
    /// Requested kinds that could not be opened
    pub missing: Vec<TrackKind>,
}

impl AcquiredTracks {
    /// Whether some requested kind is missing
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.missing.is_empty()
    }
}

/// Screen capture ended outside the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenShareEnded {
    /// Owning session
    pub call_id: CallId,
    /// Screen track that ended
    pub track_id: String,
}

#[derive(Debug)]
struct SessionMedia {
    call_id: CallId,
    audio: Option<MediaTrackHandle>,
    camera: Option<MediaTrackHandle>,
    screen: Option<MediaTrackHandle>,
    outgoing_video: Option<TrackKind>,
}

impl SessionMedia {
    fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            audio: None,
            camera: None,
            screen: None,
            outgoing_video: None,
        }
    }

    fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for handle in [self.audio.take(), self.camera.take(), self.screen.take()]
            .into_iter()
            .flatten()
        {
            handle.source.stop();
            stopped += 1;
        }
        self.outgoing_video = None;
        stopped
    }
}

/// Media pipeline controller
pub struct MediaPipeline {
    backend: Arc<dyn CaptureBackend>,
    video: VideoConstraints,
    session: Option<SessionMedia>,
    screen_ended: mpsc::UnboundedSender<ScreenShareEnded>,
}

impl MediaPipeline {
    /// Create a pipeline and the receiver for OS-ended screen captures
    #[must_use]
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        video: VideoConstraints,
    ) -> (Self, mpsc::UnboundedReceiver<ScreenShareEnded>) {
        let (screen_ended, rx) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                video,
                session: None,
                screen_ended,
            },
            rx,
        )
    }

    /// Open camera and/or microphone for a session
    ///
    /// Partial success is returned with the missing kinds listed. Tracks of
    /// a previous session still held are released first.
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if none of the requested devices opened
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn acquire_local_tracks(
        &mut self,
        call_id: &CallId,
        want_video: bool,
        want_audio: bool,
    ) -> Result<AcquiredTracks, MediaError> {
        self.ensure_session(call_id);

        let mut acquired = AcquiredTracks {
            tracks: Vec::new(),
            missing: Vec::new(),
        };
        let mut last_error = None;

        if want_audio {
            match self.backend.open_microphone().await {
                Ok(source) => {
                    let handle = MediaTrackHandle::new(call_id.clone(), source);
                    self.record(call_id, |media| media.audio = Some(handle.clone()));
                    acquired.tracks.push(handle);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Microphone unavailable");
                    acquired.missing.push(TrackKind::Audio);
                    last_error = Some(e);
                }
            }
        }

        if want_video {
            match self.backend.open_camera(&self.video).await {
                Ok(source) => {
                    let handle = MediaTrackHandle::new(call_id.clone(), source);
                    self.record(call_id, |media| {
                        media.camera = Some(handle.clone());
                        media.outgoing_video = Some(TrackKind::Video);
                    });
                    acquired.tracks.push(handle);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Camera unavailable");
                    acquired.missing.push(TrackKind::Video);
                    last_error = Some(e);
                }
            }
        }

        if acquired.tracks.is_empty() {
            return Err(last_error.unwrap_or(MediaError::DeviceUnavailable {
                kind: TrackKind::Audio,
                reason: "no media requested".to_string(),
            }));
        }

        tracing::info!(
            tracks = acquired.tracks.len(),
            missing = ?acquired.missing,
            "Local tracks acquired"
        );
        Ok(acquired)
    }

    /// Open a screen capture track for a session
    ///
    /// # Errors
    ///
    /// Returns `DeviceUnavailable` if screen capture is refused
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn acquire_screen_track(
        &mut self,
        call_id: &CallId,
    ) -> Result<MediaTrackHandle, MediaError> {
        let media = self.session_mut(call_id)?;
        if let Some(existing) = &media.screen {
            return Ok(existing.clone());
        }

        let source = self.backend.open_screen().await?;
        let handle = MediaTrackHandle::new(call_id.clone(), source);
        let media = self.session_mut(call_id)?;
        media.screen = Some(handle.clone());
        Ok(handle)
    }

    /// Swap the outgoing video sender's track without renegotiation
    ///
    /// Only visual tracks are accepted; the audio sender is never touched.
    ///
    /// # Errors
    ///
    /// Returns error if the track is audio, the session has no video sender,
    /// or the peer connection rejects the replacement
    pub async fn replace_outgoing_video_track(
        &mut self,
        call_id: &CallId,
        peer: &mut PeerConnectionManager,
        new_track: &MediaTrackHandle,
    ) -> Result<(), MediaError> {
        if !new_track.kind().is_visual() {
            return Err(MediaError::InvalidTrack(format!(
                "{} track cannot occupy the video slot",
                new_track.kind()
            )));
        }
        let media = self.session_mut(call_id)?;
        if media.outgoing_video.is_none() {
            return Err(MediaError::NoVideoSlot);
        }

        peer.replace_outgoing_video(call_id, new_track).await?;

        if let Some(media) = self.session.as_mut() {
            media.outgoing_video = Some(new_track.kind());
        }
        tracing::debug!(call_id = %call_id, kind = %new_track.kind(), "Outgoing video track replaced");
        Ok(())
    }

    /// Start sending screen capture in place of the camera
    ///
    /// Watches the screen source so that an OS-level stop is reported on the
    /// receiver returned from [`MediaPipeline::new`].
    ///
    /// # Errors
    ///
    /// Returns error if capture is refused or the replacement fails
    #[tracing::instrument(skip(self, peer), fields(call_id = %call_id))]
    pub async fn start_screen_share(
        &mut self,
        call_id: &CallId,
        peer: &mut PeerConnectionManager,
    ) -> Result<MediaTrackHandle, MediaError> {
        if self.session_mut(call_id)?.outgoing_video.is_none() {
            return Err(MediaError::NoVideoSlot);
        }
        if let Some(screen) = self.sharing(call_id) {
            return Ok(screen);
        }

        let screen = self.acquire_screen_track(call_id).await?;
        if let Err(e) = self
            .replace_outgoing_video_track(call_id, peer, &screen)
            .await
        {
            screen.source().stop();
            if let Some(media) = self.session.as_mut() {
                media.screen = None;
            }
            return Err(e);
        }

        self.watch_screen(&screen);
        tracing::info!(track_id = screen.id(), "Screen share started");
        Ok(screen)
    }

    /// Restore the camera track and stop screen capture
    ///
    /// Returns `false` if no screen share was active.
    ///
    /// # Errors
    ///
    /// Returns error if the camera track cannot be restored
    #[tracing::instrument(skip(self, peer), fields(call_id = %call_id))]
    pub async fn stop_screen_share(
        &mut self,
        call_id: &CallId,
        peer: &mut PeerConnectionManager,
    ) -> Result<bool, MediaError> {
        let media = self.session_mut(call_id)?;
        let Some(screen) = media.screen.take() else {
            return Ok(false);
        };
        let camera = media.camera.clone();
        screen.source().stop();

        match camera {
            Some(camera) => {
                self.replace_outgoing_video_track(call_id, peer, &camera)
                    .await?;
            }
            None => {
                tracing::warn!("No camera track to restore after screen share");
            }
        }
        tracing::info!(track_id = screen.id(), "Screen share stopped");
        Ok(true)
    }

    /// Current screen track, if sharing
    #[must_use]
    pub fn sharing(&self, call_id: &CallId) -> Option<MediaTrackHandle> {
        self.session
            .as_ref()
            .filter(|media| &media.call_id == call_id)
            .and_then(|media| media.screen.clone())
    }

    /// Kind currently occupying the outgoing video slot
    #[must_use]
    pub fn outgoing_video_kind(&self, call_id: &CallId) -> Option<TrackKind> {
        self.session
            .as_ref()
            .filter(|media| &media.call_id == call_id)
            .and_then(|media| media.outgoing_video)
    }

    /// Local track of the given kind
    #[must_use]
    pub fn track(&self, call_id: &CallId, kind: TrackKind) -> Option<MediaTrackHandle> {
        let media = self
            .session
            .as_ref()
            .filter(|media| &media.call_id == call_id)?;
        match kind {
            TrackKind::Audio => media.audio.clone(),
            TrackKind::Video => media.camera.clone(),
            TrackKind::Screen => media.screen.clone(),
        }
    }

    /// Mute or unmute a track; a pure local flip
    pub fn set_track_enabled(&self, handle: &MediaTrackHandle, enabled: bool) {
        handle.enabled.store(enabled, Ordering::Release);
        tracing::debug!(track_id = handle.id(), kind = %handle.kind(), enabled, "Track enabled state changed");
    }

    /// Flip a track's enabled state; returns the new state
    ///
    /// # Errors
    ///
    /// Returns error if the session has no track of that kind
    pub fn toggle(&self, call_id: &CallId, kind: TrackKind) -> Result<bool, MediaError> {
        let handle = self.track(call_id, kind).ok_or_else(|| {
            MediaError::InvalidTrack(format!("no local {kind} track"))
        })?;
        let enabled = !handle.is_enabled();
        self.set_track_enabled(&handle, enabled);
        Ok(enabled)
    }

    /// Stop every track held for the session; idempotent
    ///
    /// Returns the number of tracks stopped.
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub fn release_all(&mut self, call_id: &CallId) -> usize {
        match self.session.take() {
            Some(mut media) if &media.call_id == call_id => {
                let stopped = media.stop_all();
                tracing::info!(stopped, "Released session media");
                stopped
            }
            Some(media) => {
                self.session = Some(media);
                0
            }
            None => 0,
        }
    }

    fn ensure_session(&mut self, call_id: &CallId) {
        match self.session.as_mut() {
            Some(media) if &media.call_id == call_id => {}
            Some(stale) => {
                tracing::warn!(stale_call = %stale.call_id, "Releasing media left from a previous call");
                stale.stop_all();
                self.session = Some(SessionMedia::new(call_id.clone()));
            }
            None => self.session = Some(SessionMedia::new(call_id.clone())),
        }
    }

    fn record(&mut self, call_id: &CallId, f: impl FnOnce(&mut SessionMedia)) {
        if let Some(media) = self.session.as_mut().filter(|m| &m.call_id == call_id) {
            f(media);
        }
    }

    fn session_mut(&mut self, call_id: &CallId) -> Result<&mut SessionMedia, MediaError> {
        self.session
            .as_mut()
            .filter(|media| &media.call_id == call_id)
            .ok_or_else(|| MediaError::NoSession(call_id.to_string()))
    }

    fn watch_screen(&self, screen: &MediaTrackHandle) {
        let mut ended = screen.source().ended();
        let notice = ScreenShareEnded {
            call_id: screen.call_id().clone(),
            track_id: screen.id().to_string(),
        };
        let tx = self.screen_ended.clone();
        tokio::spawn(async move {
            while !*ended.borrow_and_update() {
                if ended.changed().await.is_err() {
                    return;
                }
            }
            let _ = tx.send(notice);
        });
    }
}

/// Availability of a synthetic device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceAvailability {
    /// Device present and permitted
    Available,
    /// No such device
    Missing,
    /// User refused permission
    PermissionDenied,
}

#[derive(Debug)]
struct SyntheticState {
    camera: DeviceAvailability,
    microphone: DeviceAvailability,
    screen: DeviceAvailability,
    opened: Vec<CaptureSource>,
}

/// In-process capture backend
///
/// Opens fake sources according to per-device availability and remembers
/// every source it handed out. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    state: Arc<Mutex<SyntheticState>>,
}

impl Default for SyntheticCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticCapture {
    /// All devices available
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SyntheticState {
                camera: DeviceAvailability::Available,
                microphone: DeviceAvailability::Available,
                screen: DeviceAvailability::Available,
                opened: Vec::new(),
            })),
        }
    }

    /// Set camera availability
    #[must_use]
    pub fn with_camera(self, availability: DeviceAvailability) -> Self {
        self.state.lock().camera = availability;
        self
    }

    /// Set microphone availability
    #[must_use]
    pub fn with_microphone(self, availability: DeviceAvailability) -> Self {
        self.state.lock().microphone = availability;
        self
    }

    /// Set screen capture availability
    #[must_use]
    pub fn with_screen(self, availability: DeviceAvailability) -> Self {
        self.state.lock().screen = availability;
        self
    }

    /// Every source opened so far
    #[must_use]
    pub fn opened(&self) -> Vec<CaptureSource> {
        self.state.lock().opened.clone()
    }

    /// Number of sources still live
    #[must_use]
    pub fn live_sources(&self) -> usize {
        self.state
            .lock()
            .opened
            .iter()
            .filter(|s| s.is_live())
            .count()
    }

    /// End live screen captures as the OS "stop sharing" control would
    pub fn end_screen_capture(&self) {
        for source in self
            .state
            .lock()
            .opened
            .iter()
            .filter(|s| s.kind() == TrackKind::Screen)
        {
            source.stop();
        }
    }

    fn open(&self, kind: TrackKind, label: &str) -> Result<CaptureSource, MediaError> {
        let mut state = self.state.lock();
        let availability = match kind {
            TrackKind::Audio => state.microphone,
            TrackKind::Video => state.camera,
            TrackKind::Screen => state.screen,
        };
        match availability {
            DeviceAvailability::Available => {
                let source = CaptureSource::new(kind, label);
                state.opened.push(source.clone());
                Ok(source)
            }
            DeviceAvailability::Missing => Err(MediaError::DeviceUnavailable {
                kind,
                reason: "no device found".to_string(),
            }),
            DeviceAvailability::PermissionDenied => Err(MediaError::DeviceUnavailable {
                kind,
                reason: "permission denied".to_string(),
            }),
        }
    }
}

#[async_trait]
impl CaptureBackend for SyntheticCapture {
    async fn open_camera(&self, constraints: &VideoConstraints) -> Result<CaptureSource, MediaError> {
        let label = format!(
            "Synthetic Camera {}x{}@{}",
            constraints.width, constraints.height, constraints.frame_rate
        );
        self.open(TrackKind::Video, &label)
    }

    async fn open_microphone(&self) -> Result<CaptureSource, MediaError> {
        self.open(TrackKind::Audio, "Synthetic Microphone")
    }

    async fn open_screen(&self) -> Result<CaptureSource, MediaError> {
        self.open(TrackKind::Screen, "Synthetic Display")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pipeline(capture: &SyntheticCapture) -> MediaPipeline {
        MediaPipeline::new(Arc::new(capture.clone()), VideoConstraints::default()).0
    }

    #[tokio::test]
    async fn test_acquire_audio_and_video() {
        let capture = SyntheticCapture::new();
        let mut media = pipeline(&capture);
        let call = CallId::from("c1");

        let acquired = media.acquire_local_tracks(&call, true, true).await.unwrap();
        assert_eq!(acquired.tracks.len(), 2);
        assert!(!acquired.is_partial());
        assert_eq!(media.outgoing_video_kind(&call), Some(TrackKind::Video));
        assert_eq!(capture.live_sources(), 2);
    }

    #[tokio::test]
    async fn test_partial_acquisition_reports_missing() {
        let capture = SyntheticCapture::new().with_camera(DeviceAvailability::Missing);
        let mut media = pipeline(&capture);
        let call = CallId::from("c1");

        let acquired = media.acquire_local_tracks(&call, true, true).await.unwrap();
        assert_eq!(acquired.tracks.len(), 1);
        assert_eq!(acquired.missing, vec![TrackKind::Video]);
        assert_eq!(media.outgoing_video_kind(&call), None);
    }

    #[tokio::test]
    async fn test_permission_denied_is_device_unavailable() {
        let capture = SyntheticCapture::new()
            .with_camera(DeviceAvailability::PermissionDenied)
            .with_microphone(DeviceAvailability::PermissionDenied);
        let mut media = pipeline(&capture);

        let err = media
            .acquire_local_tracks(&CallId::from("c1"), true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::DeviceUnavailable { ref reason, .. } if reason.contains("permission")));
    }

    #[tokio::test]
    async fn test_toggle_is_local_flip() {
        let capture = SyntheticCapture::new();
        let mut media = pipeline(&capture);
        let call = CallId::from("c1");
        media.acquire_local_tracks(&call, true, true).await.unwrap();

        assert!(!media.toggle(&call, TrackKind::Audio).unwrap());
        assert!(media.toggle(&call, TrackKind::Audio).unwrap());
        assert!(!media.toggle(&call, TrackKind::Video).unwrap());
        assert!(media.toggle(&call, TrackKind::Screen).is_err());
        // muting never stops the device
        assert_eq!(capture.live_sources(), 2);
    }

    #[tokio::test]
    async fn test_release_all_is_idempotent() {
        let capture = SyntheticCapture::new();
        let mut media = pipeline(&capture);
        let call = CallId::from("c1");
        media.acquire_local_tracks(&call, true, true).await.unwrap();

        assert_eq!(media.release_all(&call), 2);
        assert_eq!(media.release_all(&call), 0);
        assert_eq!(capture.live_sources(), 0);
    }

    #[tokio::test]
    async fn test_release_after_failed_acquisition() {
        let capture = SyntheticCapture::new()
            .with_camera(DeviceAvailability::Missing)
            .with_microphone(DeviceAvailability::Missing);
        let mut media = pipeline(&capture);
        let call = CallId::from("c1");
        assert!(media.acquire_local_tracks(&call, true, true).await.is_err());
        assert_eq!(media.release_all(&call), 0);
    }

    #[tokio::test]
    async fn test_new_session_releases_stale_tracks() {
        let capture = SyntheticCapture::new();
        let mut media = pipeline(&capture);
        media
            .acquire_local_tracks(&CallId::from("c1"), true, true)
            .await
            .unwrap();
        media
            .acquire_local_tracks(&CallId::from("c2"), false, true)
            .await
            .unwrap();
        assert_eq!(capture.live_sources(), 1);
    }

    #[test]
    fn test_capture_source_ended_signal() {
        let source = CaptureSource::new(TrackKind::Screen, "display");
        let ended = source.ended();
        assert!(!*ended.borrow());
        source.stop();
        source.stop();
        assert!(*ended.borrow());
        assert!(!source.is_live());
    }
}
