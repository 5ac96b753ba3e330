//! Message-port abstraction for portmux.
//!
//! A [`Port`] is one end of a bidirectional, order-preserving channel that
//! carries structured messages between execution contexts:
//! - [`MemoryPort`] pairs connect two endpoints inside one process
//! - [`MemoryHub`] is a broadcast context that hands out a fresh port per
//!   connecting client and announces the hub-side end through [`HubEvent`]s
//!
//! This is the lowest layer of portmux. The envelope and protocol crates only
//! depend on the [`Port`] and [`Hub`] contracts defined here.

pub mod error;
pub mod hub;
pub mod memory;
pub mod traits;

pub use error::{Result, TransportError};
pub use hub::{Hub, HubEvent, MemoryHub};
pub use memory::MemoryPort;
pub use traits::{
    Listener, ListenerKey, ListenerSet, Message, Port, PortId, PortRef, WeakPortRef,
};
