//! In-process call demo
//!
//! Runs a caller and a callee in one process over an in-memory relay and
//! drives the call through mute, screen share and hangup.

use anyhow::{bail, Context, Result};
use peercall_core::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How long to wait for the call to come up
const CONNECT_WAIT: Duration = Duration::from_secs(20);

/// Peer transport used by both demo participants
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// In-process transport
    Loopback,
    /// Real peer connections over localhost
    #[cfg(feature = "webrtc")]
    Webrtc,
}

impl Backend {
    fn factory(self) -> Arc<dyn PeerTransportFactory> {
        match self {
            Backend::Loopback => Arc::new(LoopbackNetwork::new()),
            #[cfg(feature = "webrtc")]
            Backend::Webrtc => Arc::new(peercall_core::WebRtcTransportFactory::new()),
        }
    }
}

/// Demo settings
#[derive(Debug, Clone)]
pub struct DemoOptions {
    pub peer: String,
    pub backend: Backend,
    pub audio_only: bool,
    pub screen_share: bool,
    pub manual_answer: bool,
    pub hold: Duration,
}

/// Outcome of a demo call
#[derive(Debug)]
pub struct DemoReport {
    pub call_id: CallId,
    pub caller_reason: HangupReason,
    pub callee_reason: HangupReason,
}

async fn start_engine(
    name: &str,
    signaling: Arc<SignalingChannel<UserId, MemoryRelay>>,
    backend: Backend,
    config: EngineConfig,
) -> Result<CallEngine<UserId>> {
    let engine = CallEngine::builder(UserId::new(name), signaling)
        .peer_factory(backend.factory())
        .capture(Arc::new(SyntheticCapture::new()))
        .config(config)
        .start()
        .await
        .with_context(|| format!("starting engine for {name}"))?;
    Ok(engine)
}

/// Print one participant's events until its call ends
fn print_events(
    label: String,
    mut events: broadcast::Receiver<CallEvent<UserId>>,
) -> JoinHandle<Option<HangupReason>> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CallEvent::SessionStateChanged { status, .. }) => {
                    println!("   [{label}] state: {status:?}");
                }
                Ok(CallEvent::IncomingCall { caller, .. }) => {
                    println!("📞 [{label}] incoming call from {caller}");
                }
                Ok(CallEvent::RemoteStreamAvailable { tracks, .. }) => {
                    let kinds: Vec<String> = tracks.iter().map(|t| t.kind.to_string()).collect();
                    println!("🎥 [{label}] remote tracks: {}", kinds.join(", "));
                }
                Ok(CallEvent::LocalTrackToggled { kind, enabled, .. }) => {
                    let icon = if enabled { "🔊" } else { "🔇" };
                    println!("{icon} [{label}] {kind} {}", if enabled { "on" } else { "off" });
                }
                Ok(CallEvent::CallEnded { reason, .. }) => {
                    println!("📴 [{label}] call ended: {reason}");
                    return Some(reason);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

/// Answer the first ringing call after a short delay
fn answer_when_ringing(engine: CallEngine<UserId>) {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, CallEvent::IncomingCall { .. }) {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if let Err(e) = engine.accept_incoming().await {
                    tracing::warn!(error = %e, "Could not answer");
                }
                return;
            }
        }
    });
}

async fn wait_connected(engine: &CallEngine<UserId>) -> Result<()> {
    let mut session = engine.watch_session();
    let reached = tokio::time::timeout(
        CONNECT_WAIT,
        session.wait_for(|s| {
            s.as_ref()
                .is_some_and(|s| matches!(s.status, CallStatus::Connected | CallStatus::Ended))
        }),
    )
    .await
    .context("call did not connect in time")?
    .context("engine stopped")?
    .as_ref()
    .map(|s| s.status);
    if reached != Some(CallStatus::Connected) {
        bail!("call ended before connecting");
    }
    Ok(())
}

/// Run a full call between `identity` and `options.peer`
pub async fn run(identity: &str, config: EngineConfig, options: DemoOptions) -> Result<DemoReport> {
    let relay = Arc::new(MemoryRelay::new());
    let config = EngineConfig {
        want_video: config.want_video && !options.audio_only,
        ..config
    };
    let callee_config = EngineConfig {
        auto_accept: config.auto_accept && !options.manual_answer,
        ..config.clone()
    };

    let caller = start_engine(
        identity,
        Arc::new(SignalingChannel::new(Arc::clone(&relay))),
        options.backend,
        config,
    )
    .await?;
    let callee = start_engine(
        &options.peer,
        Arc::new(SignalingChannel::new(Arc::clone(&relay))),
        options.backend,
        callee_config.clone(),
    )
    .await?;

    let caller_log = print_events(identity.to_string(), caller.subscribe_events());
    let callee_log = print_events(options.peer.clone(), callee.subscribe_events());
    if !callee_config.auto_accept {
        answer_when_ringing(callee.clone());
    }

    println!("📞 Calling {}...", options.peer);
    let call_id = caller.initiate(UserId::new(options.peer.as_str())).await?;
    println!("📞 Call initiated with ID: {}", call_id);
    wait_connected(&caller).await?;
    println!("✅ Connected");

    caller.toggle_audio().await?;
    caller.toggle_audio().await?;

    if options.screen_share {
        caller.start_screen_share().await?;
        tokio::time::sleep(options.hold / 2).await;
        caller.stop_screen_share().await?;
        tokio::time::sleep(options.hold / 2).await;
    } else {
        tokio::time::sleep(options.hold).await;
    }

    caller.hangup(HangupReason::UserEnded).await?;
    let caller_reason = caller_log.await?.context("caller events closed early")?;
    let callee_reason = callee_log.await?.context("callee events closed early")?;

    caller.shutdown().await;
    callee.shutdown().await;

    Ok(DemoReport {
        call_id,
        caller_reason,
        callee_reason,
    })
}
