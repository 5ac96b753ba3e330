use portmux_envelope::{ABORT_CHANNEL, LOSE_CHANNEL};

/// Errors surfaced on a caller's response stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The responder vanished without closing the channel.
    #[error("LoseChannel")]
    LoseChannel,

    /// The provider shut its registration down while replying.
    #[error("AbortChannel")]
    AbortChannel,

    /// The reply stream failed on the responder side.
    #[error("remote error: {0}")]
    Remote(String),

    /// A reply could not be decoded.
    #[error("malformed reply: {0}")]
    Decode(String),

    /// The request payload could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),
}

impl ChannelError {
    /// Map an error message received on the wire to its variant.
    pub fn from_remote(message: String) -> Self {
        match message.as_str() {
            LOSE_CHANNEL => Self::LoseChannel,
            ABORT_CHANNEL => Self::AbortChannel,
            _ => Self::Remote(message),
        }
    }
}

/// Error type produced by reply streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, ChannelError>;
