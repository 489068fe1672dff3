//! Relay transport layer
//!
//! The signaling channel sits on top of a relay that moves opaque byte
//! payloads to a recipient mailbox. Delivery is at-least-once and FIFO per
//! recipient.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum relay payload size (64KB)
pub const MAX_RELAY_PAYLOAD_SIZE: usize = 64 * 1024;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Relay cannot be reached
    #[error("Relay unavailable: {0}")]
    Unavailable(String),

    /// Send error
    #[error("Send error: {0}")]
    SendError(String),

    /// Listen error
    #[error("Listen error: {0}")]
    ListenError(String),
}

/// Publish/subscribe relay keyed by recipient
///
/// Implement this for the transport that carries signaling between the two
/// participants' processes (websocket relay, realtime database channel, etc.).
#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Deliver a payload to the recipient's mailbox
    async fn send(&self, recipient: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Start receiving payloads addressed to `recipient`
    ///
    /// A new listen for the same recipient replaces the previous receiver.
    async fn listen(&self, recipient: &str) -> Result<mpsc::UnboundedReceiver<Bytes>, TransportError>;

    /// Stop receiving payloads for `recipient`
    async fn unlisten(&self, recipient: &str);
}

#[derive(Default)]
struct RelayState {
    mailboxes: HashMap<String, mpsc::UnboundedSender<Bytes>>,
    pending: HashMap<String, VecDeque<Bytes>>,
    offline: bool,
    duplicate_delivery: bool,
    delivered: u64,
}

/// In-process relay
///
/// Payloads for recipients that are not listening yet are held and flushed
/// in order once they listen. Cloning shares the same relay.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle relay availability; sends fail while unavailable
    pub fn set_available(&self, available: bool) {
        self.state.lock().offline = !available;
    }

    /// Deliver every payload twice, as an at-least-once relay may
    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.state.lock().duplicate_delivery = enabled;
    }

    /// Number of payloads handed to listeners so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.state.lock().delivered
    }

    /// Number of payloads held for recipients that are not listening
    #[must_use]
    pub fn pending_for(&self, recipient: &str) -> usize {
        self.state
            .lock()
            .pending
            .get(recipient)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl RelayTransport for MemoryRelay {
    async fn send(&self, recipient: &str, payload: Bytes) -> Result<(), TransportError> {
        if recipient.is_empty() {
            return Err(TransportError::SendError(
                "Recipient cannot be empty".to_string(),
            ));
        }
        if payload.len() > MAX_RELAY_PAYLOAD_SIZE {
            return Err(TransportError::SendError(format!(
                "Payload too large: {} bytes",
                payload.len()
            )));
        }

        let mut state = self.state.lock();
        if state.offline {
            return Err(TransportError::Unavailable("relay offline".to_string()));
        }

        let copies = if state.duplicate_delivery { 2 } else { 1 };
        for _ in 0..copies {
            let delivered = match state.mailboxes.get(recipient) {
                Some(tx) => tx.send(payload.clone()).is_ok(),
                None => false,
            };
            if delivered {
                state.delivered += 1;
            } else {
                state.mailboxes.remove(recipient);
                state
                    .pending
                    .entry(recipient.to_string())
                    .or_default()
                    .push_back(payload.clone());
            }
        }

        tracing::trace!(recipient, len = payload.len(), "Relay payload accepted");
        Ok(())
    }

    async fn listen(&self, recipient: &str) -> Result<mpsc::UnboundedReceiver<Bytes>, TransportError> {
        if recipient.is_empty() {
            return Err(TransportError::ListenError(
                "Recipient cannot be empty".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        if let Some(backlog) = state.pending.remove(recipient) {
            tracing::debug!(recipient, backlog = backlog.len(), "Flushing held payloads");
            for payload in backlog {
                if tx.send(payload).is_ok() {
                    state.delivered += 1;
                }
            }
        }
        state.mailboxes.insert(recipient.to_string(), tx);
        Ok(rx)
    }

    async fn unlisten(&self, recipient: &str) {
        self.state.lock().mailboxes.remove(recipient);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_in_order() {
        let relay = MemoryRelay::new();
        let mut rx = relay.listen("bob").await.unwrap();

        for i in 0..5u8 {
            relay.send("bob", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
        assert_eq!(relay.delivered(), 5);
    }

    #[tokio::test]
    async fn test_holds_until_listen() {
        let relay = MemoryRelay::new();
        relay.send("bob", Bytes::from_static(b"one")).await.unwrap();
        relay.send("bob", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(relay.pending_for("bob"), 2);

        let mut rx = relay.listen("bob").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(relay.pending_for("bob"), 0);
    }

    #[tokio::test]
    async fn test_unavailable_relay_fails_send() {
        let relay = MemoryRelay::new();
        relay.set_available(false);
        let err = relay.send("bob", Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));

        relay.set_available(true);
        assert!(relay.send("bob", Bytes::from_static(b"x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_delivery() {
        let relay = MemoryRelay::new();
        relay.set_duplicate_delivery(true);
        let mut rx = relay.listen("bob").await.unwrap();
        relay.send("bob", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_rejects_empty_recipient_and_oversized_payload() {
        let relay = MemoryRelay::new();
        assert!(relay.send("", Bytes::from_static(b"x")).await.is_err());
        let big = Bytes::from(vec![0u8; MAX_RELAY_PAYLOAD_SIZE + 1]);
        assert!(relay.send("bob", big).await.is_err());
    }
}
