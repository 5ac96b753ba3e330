use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::debug;

use crate::memory::MemoryPort;
use crate::traits::{Port, PortId, PortRef};

/// Connection lifecycle event published by a [`Hub`].
#[derive(Clone)]
pub enum HubEvent {
    /// A new endpoint is available on the hub side.
    Connected(PortRef),
    /// The endpoint with this id is gone.
    Disconnected(PortId),
}

impl fmt::Debug for HubEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubEvent::Connected(port) => f.debug_tuple("Connected").field(&port.id()).finish(),
            HubEvent::Disconnected(id) => f.debug_tuple("Disconnected").field(id).finish(),
        }
    }
}

/// A broadcast context: one local side talking to many connected peers.
pub trait Hub: Send + Sync {
    /// Subscribe to connection events published from now on.
    ///
    /// Every subscriber gets every event; nothing is dropped for slow
    /// readers.
    fn events(&self) -> mpsc::UnboundedReceiver<HubEvent>;
}

/// In-process hub handing out [`MemoryPort`] pairs.
///
/// The hub owns the hub-side end of every live connection until
/// [`MemoryHub::disconnect`] is called for it.
pub struct MemoryHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<HubEvent>>>,
    connections: Mutex<HashMap<PortId, Arc<MemoryPort>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn publish(&self, event: HubEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Connect a new client. Returns the client-side end; the hub-side end
    /// is announced as [`HubEvent::Connected`].
    pub fn connect(&self) -> Arc<MemoryPort> {
        let (client, hub_side) = MemoryPort::pair();
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client.id(), hub_side.clone());

        debug!(client = %client.id(), hub_side = %hub_side.id(), "client connected to hub");
        self.publish(HubEvent::Connected(hub_side));
        client
    }

    /// Drop the connection of the client with `client_id`.
    ///
    /// Closes the hub-side end and announces [`HubEvent::Disconnected`].
    /// Returns `false` if no such client is connected.
    pub fn disconnect(&self, client_id: PortId) -> bool {
        let removed = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&client_id);

        match removed {
            Some(hub_side) => {
                hub_side.close();
                debug!(client = %client_id, hub_side = %hub_side.id(), "client disconnected from hub");
                self.publish(HubEvent::Disconnected(hub_side.id()));
                true
            }
            None => false,
        }
    }

    /// Hub-side end serving the client with `client_id`.
    pub fn hub_side(&self, client_id: PortId) -> Option<PortRef> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client_id)
            .map(|port| port.clone() as PortRef)
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub for MemoryHub {
    fn events(&self) -> mpsc::UnboundedReceiver<HubEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }
}

impl fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHub")
            .field("connections", &self.connection_count())
            .finish()
    }
}
