//! Signaling channel
//!
//! Carries offers, answers, ICE candidates and hangups between the two
//! participants over a [`RelayTransport`]. The channel owns no call
//! semantics: it frames, sequences, validates and routes messages.

use crate::identity::PeerIdentity;
use crate::transport::{RelayTransport, TransportError, MAX_RELAY_PAYLOAD_SIZE};
use crate::types::{CallId, HangupReason, IceCandidate, SessionDescription};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Maximum SDP body length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum ICE candidate attribute length
pub const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Ended (call, sender) pairs remembered for redelivery filtering
const FINISHED_SEQUENCE_MEMORY: usize = 64;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Message could not be handed to the relay
    #[error("Publish failed: {0}")]
    Publish(#[from] TransportError),

    /// Message exceeds size limits
    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    /// Message could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// Subscription could not be opened
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
}

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// SDP offer
    Offer,
    /// SDP answer
    Answer,
    /// Trickled ICE candidate
    IceCandidate,
    /// End or decline of a call
    Hangup,
}

impl SignalKind {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Hangup => "hangup",
        }
    }
}

/// Kind-specific payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP offer
    Offer {
        /// Offer description
        description: SessionDescription,
    },
    /// SDP answer
    Answer {
        /// Answer description
        description: SessionDescription,
    },
    /// ICE candidate
    IceCandidate {
        /// The candidate
        candidate: IceCandidate,
    },
    /// Hangup or decline
    Hangup {
        /// Why the sender is ending the call
        reason: HangupReason,
    },
}

/// Signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity", rename_all = "camelCase")]
pub struct SignalMessage<I: PeerIdentity> {
    /// Call the message belongs to
    pub call_id: CallId,
    /// Sender identity
    pub sender_id: I,
    /// Recipient identity, used as the relay routing key
    pub recipient_id: I,
    /// Per-call sequence number, assigned on publish
    #[serde(default)]
    pub seq: u64,
    /// Kind-specific payload
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl<I: PeerIdentity> SignalMessage<I> {
    /// Build an unsequenced message
    pub fn new(call_id: CallId, sender_id: I, recipient_id: I, payload: SignalPayload) -> Self {
        Self {
            call_id,
            sender_id,
            recipient_id,
            seq: 0,
            payload,
        }
    }

    /// Message kind
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self.payload {
            SignalPayload::Offer { .. } => SignalKind::Offer,
            SignalPayload::Answer { .. } => SignalKind::Answer,
            SignalPayload::IceCandidate { .. } => SignalKind::IceCandidate,
            SignalPayload::Hangup { .. } => SignalKind::Hangup,
        }
    }

    /// Check payload size limits
    ///
    /// # Errors
    ///
    /// Returns error if an SDP body or candidate exceeds its limit
    pub fn validate(&self) -> Result<(), SignalingError> {
        match &self.payload {
            SignalPayload::Offer { description } | SignalPayload::Answer { description } => {
                if description.sdp.len() > MAX_SDP_LENGTH {
                    return Err(SignalingError::MessageTooLarge(format!(
                        "SDP is {} bytes",
                        description.sdp.len()
                    )));
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                if candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
                    return Err(SignalingError::MessageTooLarge(format!(
                        "candidate is {} bytes",
                        candidate.candidate.len()
                    )));
                }
            }
            SignalPayload::Hangup { .. } => {}
        }
        Ok(())
    }

    fn encode(&self) -> Result<Bytes, SignalingError> {
        self.validate()?;
        let data = serde_json::to_vec(self).map_err(|e| SignalingError::Encoding(e.to_string()))?;
        if data.len() > MAX_RELAY_PAYLOAD_SIZE {
            return Err(SignalingError::MessageTooLarge(format!(
                "encoded message is {} bytes",
                data.len()
            )));
        }
        Ok(Bytes::from(data))
    }

    fn decode(payload: &[u8]) -> Result<Self, SignalingError> {
        if payload.len() > MAX_RELAY_PAYLOAD_SIZE {
            return Err(SignalingError::MessageTooLarge(format!(
                "received {} bytes",
                payload.len()
            )));
        }
        let message: Self =
            serde_json::from_slice(payload).map_err(|e| SignalingError::Encoding(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }
}

/// Stream of inbound messages for one subscriber
///
/// Clones share the same underlying receiver.
pub struct SignalStream<I: PeerIdentity> {
    inner: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<SignalMessage<I>>>>,
}

impl<I: PeerIdentity> Clone for SignalStream<I> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<I: PeerIdentity> SignalStream<I> {
    /// Wait for the next message; `None` once unsubscribed
    pub async fn recv(&self) -> Option<SignalMessage<I>> {
        self.inner.lock().await.recv().await
    }

    /// Whether two handles refer to the same subscription
    #[must_use]
    pub fn same_stream(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Adapt into a [`futures::Stream`]
    pub fn into_stream(self) -> impl futures::Stream<Item = SignalMessage<I>> {
        futures::stream::unfold(self, |stream| async move {
            let next = stream.recv().await?;
            Some((next, stream))
        })
    }
}

struct Subscription<I: PeerIdentity> {
    stream: SignalStream<I>,
    pump: JoinHandle<()>,
}

/// Signaling channel adapter
pub struct SignalingChannel<I: PeerIdentity, T: RelayTransport> {
    transport: Arc<T>,
    subscriptions: tokio::sync::Mutex<HashMap<String, Subscription<I>>>,
    sequences: Mutex<HashMap<(CallId, String), u64>>,
    _identity: PhantomData<fn() -> I>,
}

impl<I: PeerIdentity, T: RelayTransport> SignalingChannel<I, T> {
    /// Create a channel over a relay transport
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            _identity: PhantomData,
        }
    }

    /// Start receiving messages addressed to `self_id`
    ///
    /// Subscribing again for the same id returns the existing stream.
    ///
    /// # Errors
    ///
    /// Returns error if the relay refuses the subscription
    #[tracing::instrument(skip(self), fields(self_id = %self_id))]
    pub async fn subscribe(&self, self_id: &I) -> Result<SignalStream<I>, SignalingError> {
        let key = self_id.routing_key();
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(existing) = subscriptions.get(&key) {
            tracing::debug!("Reusing existing subscription");
            return Ok(existing.stream.clone());
        }

        let raw = self
            .transport
            .listen(&key)
            .await
            .map_err(|e| SignalingError::Subscribe(e.to_string()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_messages::<I>(key.clone(), raw, tx));
        let stream = SignalStream {
            inner: Arc::new(tokio::sync::Mutex::new(rx)),
        };

        subscriptions.insert(
            key,
            Subscription {
                stream: stream.clone(),
                pump,
            },
        );
        tracing::info!("Subscribed to signaling channel");
        Ok(stream)
    }

    /// Stop receiving messages for `self_id`; safe to call repeatedly
    #[tracing::instrument(skip(self), fields(self_id = %self_id))]
    pub async fn unsubscribe(&self, self_id: &I) {
        let key = self_id.routing_key();
        let removed = self.subscriptions.lock().await.remove(&key);
        if let Some(subscription) = removed {
            subscription.pump.abort();
            self.transport.unlisten(&key).await;
            tracing::info!("Unsubscribed from signaling channel");
        }
    }

    /// Publish a message to its recipient
    ///
    /// The channel stamps the per-call sequence number. Failures are returned
    /// to the caller and never retried.
    ///
    /// # Errors
    ///
    /// Returns error if the message is oversized or the relay fails
    #[tracing::instrument(
        skip(self, message),
        fields(call_id = %message.call_id, kind = message.kind().as_str(), recipient = %message.recipient_id)
    )]
    pub async fn publish(&self, mut message: SignalMessage<I>) -> Result<(), SignalingError> {
        message.seq = self.next_seq(&message.call_id, &message.sender_id);
        let payload = message.encode()?;
        self.transport
            .send(&message.recipient_id.routing_key(), payload)
            .await?;
        tracing::debug!(seq = message.seq, "Published signaling message");
        Ok(())
    }

    /// Forget a sender's sequence state for a finished call
    pub fn forget_call(&self, call_id: &CallId, sender_id: &I) {
        self.sequences
            .lock()
            .remove(&(call_id.clone(), sender_id.routing_key()));
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    fn next_seq(&self, call_id: &CallId, sender_id: &I) -> u64 {
        let mut sequences = self.sequences.lock();
        let seq = sequences
            .entry((call_id.clone(), sender_id.routing_key()))
            .or_insert(0);
        *seq += 1;
        *seq
    }
}

impl<I: PeerIdentity, T: RelayTransport> Drop for SignalingChannel<I, T> {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().values() {
            subscription.pump.abort();
        }
    }
}

type SequenceKey = (CallId, String);

/// Highest sequence number seen per (call, sender)
///
/// A pair is retired when its hangup is delivered and kept in a bounded
/// history, so late redeliveries of an ended call are still dropped.
#[derive(Default)]
struct SeenSequences {
    live: HashMap<SequenceKey, u64>,
    finished: VecDeque<(SequenceKey, u64)>,
}

impl SeenSequences {
    /// Record `message`; `false` if it was already delivered
    fn admit<I: PeerIdentity>(&mut self, message: &SignalMessage<I>) -> bool {
        if message.seq == 0 {
            return true;
        }
        let key = (message.call_id.clone(), message.sender_id.routing_key());
        if self
            .finished
            .iter()
            .any(|(done, last)| *done == key && message.seq <= *last)
        {
            return false;
        }

        let slot = self.live.entry(key.clone()).or_insert(0);
        if message.seq <= *slot {
            return false;
        }
        *slot = message.seq;

        if message.kind() == SignalKind::Hangup {
            self.live.remove(&key);
            if self.finished.len() == FINISHED_SEQUENCE_MEMORY {
                self.finished.pop_front();
            }
            self.finished.push_back((key, message.seq));
        }
        true
    }
}

/// Decode relay payloads, drop redeliveries, forward in order
async fn pump_messages<I: PeerIdentity>(
    key: String,
    mut raw: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<SignalMessage<I>>,
) {
    let mut seen = SeenSequences::default();

    while let Some(payload) = raw.recv().await {
        let message = match SignalMessage::<I>::decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(recipient = %key, error = %e, "Dropping undecodable signaling payload");
                continue;
            }
        };

        if message.recipient_id.routing_key() != key {
            tracing::warn!(
                recipient = %key,
                addressed_to = %message.recipient_id,
                "Dropping misrouted signaling message"
            );
            continue;
        }

        if !seen.admit(&message) {
            tracing::trace!(call_id = %message.call_id, seq = message.seq, "Dropping redelivered message");
            continue;
        }

        if tx.send(message).is_err() {
            break;
        }
    }
}
