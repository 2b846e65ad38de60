//! Shared newtypes used across the client.
//!
//! These types are serialization-transparent: they serialize/deserialize identically
//! to the raw string the backend sends, so they can be used directly in wire types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

// ─── Channel ─────────────────────────────────────────────────────────────────

/// Key of a logical stream multiplexed over the connection.
///
/// Either an instrument symbol (e.g. `"RELIANCE"`) or the reserved
/// [`Channel::NOTIFICATIONS`] key for the per-user notification feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    /// Reserved key for the per-user notification stream.
    pub const NOTIFICATIONS: &'static str = "notifications";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// The notification channel.
    pub fn notifications() -> Self {
        Self(Self::NOTIFICATIONS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_notifications(&self) -> bool {
        self.0 == Self::NOTIFICATIONS
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Channel {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Channel {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&Channel> for Channel {
    fn from(c: &Channel) -> Self {
        c.clone()
    }
}

impl FromStr for Channel {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Channel(s.to_string()))
    }
}

impl Serialize for Channel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Channel(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_serializes_as_plain_string() {
        let json = serde_json::to_string(&Channel::new("RELIANCE")).unwrap();
        assert_eq!(json, "\"RELIANCE\"");
    }

    #[test]
    fn test_notifications_channel() {
        let channel = Channel::notifications();
        assert!(channel.is_notifications());
        assert_eq!(channel.as_str(), "notifications");
        assert!(!Channel::from("TCS").is_notifications());
    }
}
