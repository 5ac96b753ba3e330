//! Channel ids and the lock namespaces derived from them.
//!
//! A channel id names one request/reply conversation. Two lock names are
//! derived from it, one per role, in disjoint namespaces:
//! - `request-<id>` is held by the requester while the call is active
//! - `response-<id>` is held by the responder while it is replying

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Prefix of every generated channel id.
pub const CHANNEL_PREFIX: &str = "channel-";

/// Namespace of request-side liveness locks.
pub const REQUEST_LOCK_PREFIX: &str = "request-";

/// Namespace of response-side liveness locks.
pub const RESPONSE_LOCK_PREFIX: &str = "response-";

/// Error name surfaced when the responding peer vanished without closing.
pub const LOSE_CHANNEL: &str = "LoseChannel";

/// Error name surfaced when the provider shut its registration down.
pub const ABORT_CHANNEL: &str = "AbortChannel";

/// Correlation token binding one request to its replies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Generate a fresh id carrying 128 random bits.
    pub fn random() -> Self {
        let token: u128 = rand::thread_rng().gen();
        Self(format!("{CHANNEL_PREFIX}{token:032x}"))
    }

    /// Wrap an id received from the wire.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the lock the requester holds for this channel.
    pub fn request_lock_name(&self) -> String {
        format!("{REQUEST_LOCK_PREFIX}{}", self.0)
    }

    /// Name of the lock the responder holds for this channel.
    pub fn response_lock_name(&self) -> String {
        format!("{RESPONSE_LOCK_PREFIX}{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}
