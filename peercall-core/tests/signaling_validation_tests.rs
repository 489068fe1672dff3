//! Signaling validation and edge case tests

use bytes::Bytes;
use peercall_core::signaling::{MAX_CANDIDATE_LENGTH, MAX_SDP_LENGTH};
use peercall_core::{
    CallId, HangupReason, IceCandidate, MemoryRelay, RelayTransport, SessionDescription,
    SignalKind, SignalMessage, SignalPayload, SignalingChannel, SignalingError, TransportError,
    UserId,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn channel(relay: &Arc<MemoryRelay>) -> SignalingChannel<UserId, MemoryRelay> {
    SignalingChannel::new(Arc::clone(relay))
}

fn candidate(call: &str, from: &str, to: &str, n: u32) -> SignalMessage<UserId> {
    SignalMessage::new(
        CallId::from(call),
        UserId::new(from),
        UserId::new(to),
        SignalPayload::IceCandidate {
            candidate: IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.1 5000 typ host")),
        },
    )
}

async fn nothing_more(stream: &peercall_core::SignalStream<UserId>) -> bool {
    tokio::time::timeout(Duration::from_millis(50), stream.recv())
        .await
        .is_err()
}

#[tokio::test]
async fn offer_wire_format_matches_relay_contract() {
    let relay = Arc::new(MemoryRelay::new());
    let mut raw = relay.listen("bob").await.unwrap();
    let signaling = channel(&relay);

    signaling
        .publish(SignalMessage::new(
            CallId::from("c1"),
            UserId::new("alice"),
            UserId::new("bob"),
            SignalPayload::Offer {
                description: SessionDescription::offer("v=0\r\n"),
            },
        ))
        .await
        .unwrap();

    let payload = raw.recv().await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "callId": "c1",
            "senderId": "alice",
            "recipientId": "bob",
            "seq": 1,
            "kind": "offer",
            "description": { "type": "offer", "sdp": "v=0\r\n" },
        })
    );
}

#[tokio::test]
async fn hand_written_message_is_accepted() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    let stream = signaling.subscribe(&UserId::new("bob")).await.unwrap();

    let raw = serde_json::json!({
        "callId": "c9",
        "senderId": "alice",
        "recipientId": "bob",
        "kind": "ice-candidate",
        "candidate": {
            "candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host",
            "sdp_mid": "0",
            "sdp_mline_index": 0
        }
    });
    relay
        .send("bob", Bytes::from(serde_json::to_vec(&raw).unwrap()))
        .await
        .unwrap();

    let message = stream.recv().await.unwrap();
    assert_eq!(message.kind(), SignalKind::IceCandidate);
    assert_eq!(message.seq, 0);
    match message.payload {
        SignalPayload::IceCandidate { candidate } => {
            assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            assert_eq!(candidate.sdp_mline_index, Some(0));
        }
        other => panic!("unexpected payload {other:?}"),
    }
}

#[tokio::test]
async fn unsequenced_messages_are_never_deduplicated() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    let stream = signaling.subscribe(&UserId::new("bob")).await.unwrap();

    let raw = serde_json::to_vec(&serde_json::json!({
        "callId": "c1",
        "senderId": "alice",
        "recipientId": "bob",
        "kind": "hangup",
        "reason": "remote-ended"
    }))
    .unwrap();
    relay.send("bob", Bytes::from(raw.clone())).await.unwrap();
    relay.send("bob", Bytes::from(raw)).await.unwrap();

    for _ in 0..2 {
        let message = stream.recv().await.unwrap();
        assert_eq!(
            message.payload,
            SignalPayload::Hangup {
                reason: HangupReason::RemoteEnded
            }
        );
    }
}

#[tokio::test]
async fn unknown_kind_is_dropped() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    let stream = signaling.subscribe(&UserId::new("bob")).await.unwrap();

    let raw = serde_json::json!({
        "callId": "c1",
        "senderId": "alice",
        "recipientId": "bob",
        "kind": "renegotiate"
    });
    relay
        .send("bob", Bytes::from(serde_json::to_vec(&raw).unwrap()))
        .await
        .unwrap();
    assert!(nothing_more(&stream).await);
}

#[tokio::test]
async fn misrouted_message_is_dropped() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = channel(&relay);
    let bob = channel(&relay);
    let stream = bob.subscribe(&UserId::new("bob")).await.unwrap();

    let misrouted = serde_json::to_vec(&candidate("c1", "alice", "carol", 1)).unwrap();
    relay.send("bob", Bytes::from(misrouted)).await.unwrap();
    alice.publish(candidate("c1", "alice", "bob", 2)).await.unwrap();

    let message = stream.recv().await.unwrap();
    assert_eq!(message.recipient_id, UserId::new("bob"));
    assert!(nothing_more(&stream).await);
}

#[tokio::test]
async fn oversized_candidate_is_rejected() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);

    let message = SignalMessage::new(
        CallId::from("c1"),
        UserId::new("alice"),
        UserId::new("bob"),
        SignalPayload::IceCandidate {
            candidate: IceCandidate::new("a".repeat(MAX_CANDIDATE_LENGTH + 1)),
        },
    );
    let result = signaling.publish(message).await;
    assert!(matches!(result, Err(SignalingError::MessageTooLarge(_))));
    assert_eq!(relay.pending_for("bob"), 0);
}

#[tokio::test]
async fn sdp_at_limit_is_accepted() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    let stream = signaling.subscribe(&UserId::new("bob")).await.unwrap();

    let message = SignalMessage::new(
        CallId::from("c1"),
        UserId::new("alice"),
        UserId::new("bob"),
        SignalPayload::Answer {
            description: SessionDescription::answer("x".repeat(MAX_SDP_LENGTH)),
        },
    );
    signaling.publish(message).await.unwrap();
    assert_eq!(stream.recv().await.unwrap().kind(), SignalKind::Answer);
}

#[tokio::test]
async fn relay_outage_surfaces_to_publisher() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    relay.set_available(false);

    let result = signaling.publish(candidate("c1", "alice", "bob", 1)).await;
    assert!(matches!(
        result,
        Err(SignalingError::Publish(TransportError::Unavailable(_)))
    ));

    relay.set_available(true);
    signaling
        .publish(candidate("c1", "alice", "bob", 2))
        .await
        .unwrap();
    assert_eq!(relay.pending_for("bob"), 1);
}

#[tokio::test]
async fn senders_are_sequenced_independently() {
    let relay = Arc::new(MemoryRelay::new());
    relay.set_duplicate_delivery(true);
    let signaling = channel(&relay);
    let stream = signaling.subscribe(&UserId::new("bob")).await.unwrap();

    signaling.publish(candidate("c1", "alice", "bob", 1)).await.unwrap();
    signaling.publish(candidate("c1", "carol", "bob", 1)).await.unwrap();
    signaling.publish(candidate("c1", "alice", "bob", 2)).await.unwrap();

    let seen: Vec<(String, u64)> = vec![
        stream.recv().await.unwrap(),
        stream.recv().await.unwrap(),
        stream.recv().await.unwrap(),
    ]
    .into_iter()
    .map(|m| (m.sender_id.to_string(), m.seq))
    .collect();
    assert_eq!(
        seen,
        vec![
            ("alice".to_string(), 1),
            ("carol".to_string(), 1),
            ("alice".to_string(), 2)
        ]
    );
    assert!(nothing_more(&stream).await);
}

#[tokio::test]
async fn forgetting_a_call_restarts_its_sequence() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    let mut raw = relay.listen("bob").await.unwrap();
    let alice = UserId::new("alice");

    signaling.publish(candidate("c1", "alice", "bob", 1)).await.unwrap();
    signaling.publish(candidate("c1", "alice", "bob", 2)).await.unwrap();
    signaling.forget_call(&CallId::from("c1"), &alice);
    signaling.publish(candidate("c1", "alice", "bob", 3)).await.unwrap();

    let mut seqs = Vec::new();
    for _ in 0..3 {
        let payload = raw.recv().await.unwrap();
        let message: SignalMessage<UserId> = serde_json::from_slice(&payload).unwrap();
        seqs.push(message.seq);
    }
    assert_eq!(seqs, vec![1, 2, 1]);
}

#[tokio::test]
async fn held_messages_reach_late_subscriber() {
    let relay = Arc::new(MemoryRelay::new());
    let alice = channel(&relay);
    let bob = channel(&relay);

    alice.publish(candidate("c1", "alice", "bob", 1)).await.unwrap();
    alice.publish(candidate("c1", "alice", "bob", 2)).await.unwrap();

    let stream = bob.subscribe(&UserId::new("bob")).await.unwrap();
    assert_eq!(stream.recv().await.unwrap().seq, 1);
    assert_eq!(stream.recv().await.unwrap().seq, 2);
}

#[tokio::test]
async fn resubscribe_after_unsubscribe_gets_new_stream() {
    let relay = Arc::new(MemoryRelay::new());
    let signaling = channel(&relay);
    let bob = UserId::new("bob");

    let first = signaling.subscribe(&bob).await.unwrap();
    signaling.unsubscribe(&bob).await;
    let second = signaling.subscribe(&bob).await.unwrap();
    assert!(!first.same_stream(&second));

    signaling.publish(candidate("c2", "alice", "bob", 1)).await.unwrap();
    assert_eq!(second.recv().await.unwrap().call_id, CallId::from("c2"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn redelivery_never_reorders_or_repeats(count in 1usize..20, duplicate in any::<bool>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let seqs = rt.block_on(async {
            let relay = Arc::new(MemoryRelay::new());
            relay.set_duplicate_delivery(duplicate);
            let signaling = channel(&relay);
            let stream = signaling.subscribe(&UserId::new("bob")).await.unwrap();
            for n in 0..count {
                signaling
                    .publish(candidate("c1", "alice", "bob", n as u32))
                    .await
                    .unwrap();
            }
            let mut seqs = Vec::new();
            for _ in 0..count {
                seqs.push(stream.recv().await.unwrap().seq);
            }
            assert!(nothing_more(&stream).await);
            seqs
        });
        let expected: Vec<u64> = (1..=count as u64).collect();
        prop_assert_eq!(seqs, expected);
    }
}
