//! Streaming request/response over message ports.
//!
//! A requester broadcasts a request to every port of a [`PortSource`] and
//! streams back the replies of whichever responder answers first. Replies
//! travel as materialized notifications inside envelopes; liveness of both
//! sides is tracked with named locks from a [`LockManager`].

pub mod config;
pub mod error;
pub mod handshake;
pub mod link;
pub mod locks;
pub mod protocol;
pub mod request;
pub mod response;
pub mod services;
pub mod source;

pub use config::{ConfigError, ProtocolConfig, DEFAULT_GRACE_PERIOD, DEFAULT_PROBE_INTERVAL};
pub use error::{BoxError, ChannelError, Result};
pub use handshake::{Readiness, ACK, PROBE};
pub use link::{Link, Subscription};
pub use locks::{LocalLockManager, LockGuard, LockManager};
pub use protocol::Protocol;
pub use request::{Requester, ResponseStream};
pub use response::{ReplyStream, Responder, ServeHandle};
pub use services::Services;
pub use source::{PortRegistry, PortSource, PortStream};
