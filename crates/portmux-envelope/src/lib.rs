//! Envelope framing with channel-id multiplexing for portmux.
//!
//! Every protocol message on a port is an envelope:
//! - an `id` correlating one request with all of its replies
//! - a `type` separating independent protocols sharing one port
//! - a `payload`, or the reserved [`CLOSE`] sentinel
//!
//! Reply streams travel as [`Notification`]s, one envelope per event.

pub mod channel;
pub mod envelope;
pub mod error;
pub mod notification;

pub use channel::{
    ChannelId, ABORT_CHANNEL, CHANNEL_PREFIX, LOSE_CHANNEL, REQUEST_LOCK_PREFIX,
    RESPONSE_LOCK_PREFIX,
};
pub use envelope::{Envelope, CLOSE};
pub use error::{EnvelopeError, Result};
pub use notification::Notification;
