//! Shared fixtures for engine tests

#![allow(dead_code)]

use peercall_core::{
    CallEngine, CallEvent, CallStatus, EngineConfig, HangupReason, LoopbackConfig,
    LoopbackNetwork, MemoryRelay, SignalingChannel, SyntheticCapture, UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(30);

/// One call participant with handles to its in-process collaborators
pub struct Party {
    pub id: UserId,
    pub engine: CallEngine<UserId>,
    pub capture: SyntheticCapture,
    pub network: LoopbackNetwork,
    pub events: broadcast::Receiver<CallEvent<UserId>>,
}

pub async fn party(name: &str, relay: &Arc<MemoryRelay>) -> Party {
    party_with(
        name,
        relay,
        EngineConfig::default(),
        SyntheticCapture::new(),
        LoopbackNetwork::new(),
    )
    .await
}

pub async fn party_with_config(name: &str, relay: &Arc<MemoryRelay>, config: EngineConfig) -> Party {
    party_with(
        name,
        relay,
        config,
        SyntheticCapture::new(),
        LoopbackNetwork::new(),
    )
    .await
}

pub async fn party_with(
    name: &str,
    relay: &Arc<MemoryRelay>,
    config: EngineConfig,
    capture: SyntheticCapture,
    network: LoopbackNetwork,
) -> Party {
    let id = UserId::new(name);
    let signaling = Arc::new(SignalingChannel::new(Arc::clone(relay)));
    let engine = CallEngine::builder(id.clone(), signaling)
        .peer_factory(Arc::new(network.clone()))
        .capture(Arc::new(capture.clone()))
        .config(config)
        .start()
        .await
        .unwrap();
    let events = engine.subscribe_events();
    Party {
        id,
        engine,
        capture,
        network,
        events,
    }
}

pub fn failing_network() -> LoopbackNetwork {
    LoopbackNetwork::with_config(LoopbackConfig {
        fail_negotiation: true,
        ..LoopbackConfig::default()
    })
}

/// Wait until the engine's session reaches `status`
pub async fn wait_for_status(engine: &CallEngine<UserId>, status: CallStatus) {
    let mut session = engine.watch_session();
    tokio::time::timeout(
        WAIT,
        session.wait_for(|s| s.as_ref().is_some_and(|s| s.status == status)),
    )
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {status:?}"))
    .unwrap();
}

/// Wait for the first event matching `pred`
pub async fn expect_event(
    events: &mut broadcast::Receiver<CallEvent<UserId>>,
    mut pred: impl FnMut(&CallEvent<UserId>) -> bool,
) -> CallEvent<UserId> {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap()
}

/// Wait for `CallEnded` and return its reason
pub async fn expect_ended(events: &mut broadcast::Receiver<CallEvent<UserId>>) -> HangupReason {
    match expect_event(events, |e| matches!(e, CallEvent::CallEnded { .. })).await {
        CallEvent::CallEnded { reason, .. } => reason,
        _ => unreachable!(),
    }
}

/// Drain buffered events without waiting
pub fn drain(events: &mut broadcast::Receiver<CallEvent<UserId>>) -> Vec<CallEvent<UserId>> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

/// Bring both parties to `Connected`; returns the call id
pub async fn connect(caller: &Party, callee: &Party) -> peercall_core::CallId {
    let call_id = caller.engine.initiate(callee.id.clone()).await.unwrap();
    wait_for_status(&caller.engine, CallStatus::Connected).await;
    wait_for_status(&callee.engine, CallStatus::Connected).await;
    call_id
}

/// Let spawned tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
