//! Participant identity
//!
//! The engine is generic over the identity scheme used by the surrounding
//! application. Identities are opaque to the engine apart from their string
//! form, which doubles as the relay routing key.

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identity of a call participant
///
/// Implementations must round-trip through [`to_string_repr`] and
/// [`from_string_repr`]; the string form is what the relay transport keys
/// mailboxes on.
///
/// [`to_string_repr`]: PeerIdentity::to_string_repr
/// [`from_string_repr`]: PeerIdentity::from_string_repr
pub trait PeerIdentity:
    Clone + Debug + Display + Serialize + for<'de> Deserialize<'de> + Send + Sync + 'static
{
    /// Convert the identity to its string representation
    fn to_string_repr(&self) -> String;

    /// Parse an identity from its string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;

    /// Key used to address this participant on the signaling relay
    fn routing_key(&self) -> String {
        self.to_string_repr()
    }

    /// Whether two identities name the same participant
    fn same_as(&self, other: &Self) -> bool {
        self.routing_key() == other.routing_key()
    }
}

/// Plain string user identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    /// Create a user identifier
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PeerIdentity for UserId {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            anyhow::bail!("user id cannot be empty");
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_repr() {
        let id = UserId::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.routing_key(), "alice");
        assert!(id.same_as(&UserId::from("alice")));
        assert!(!id.same_as(&UserId::from("bob")));
    }

    #[test]
    fn test_user_id_rejects_blank() {
        assert!(UserId::from_string_repr("   ").is_err());
        assert_eq!(UserId::from_string_repr(" bob ").unwrap().as_str(), "bob");
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&UserId::new("carol")).unwrap();
        assert_eq!(json, "\"carol\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, UserId::new("carol"));
    }
}
