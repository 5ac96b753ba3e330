//! Multiplexed streaming request/response over message ports.
//!
//! # Crate Structure
//!
//! - [`transport`]: port and hub abstractions with in-memory implementations
//! - [`envelope`]: wire envelope, channel ids and notifications
//! - [`protocol`]: readiness handshake, locks, requesters and responders
//! - [`logging`]: stderr subscriber setup (behind the `logging` feature)

/// Re-export transport types.
pub mod transport {
    pub use portmux_transport::*;
}

/// Re-export envelope types.
pub mod envelope {
    pub use portmux_envelope::*;
}

/// Re-export protocol types.
pub mod protocol {
    pub use portmux_protocol::*;
}

#[cfg(feature = "logging")]
pub mod logging;

pub use portmux_protocol::{
    ChannelError, PortRegistry, PortSource, Protocol, ProtocolConfig, ReplyStream, Services,
};
