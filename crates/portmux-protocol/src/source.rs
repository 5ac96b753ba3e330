//! Where requests go and where requests come from.
//!
//! A [`PortSource`] is either a single fixed port or a [`PortRegistry`] of
//! every peer that connected to a broadcast context. Consumers iterate it
//! as a [`PortStream`]: peers seen so far first, then peers connecting
//! later.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use futures_core::Stream;
use portmux_transport::{Hub, HubEvent, PortId, PortRef, WeakPortRef};
use tokio::sync::mpsc;
use tracing::debug;

/// The set of ports a requester broadcasts to or a responder listens on.
#[derive(Clone)]
pub enum PortSource {
    Fixed(PortRef),
    Broadcast(PortRegistry),
}

impl PortSource {
    pub fn fixed(port: PortRef) -> Self {
        Self::Fixed(port)
    }

    pub fn broadcast(registry: PortRegistry) -> Self {
        Self::Broadcast(registry)
    }

    /// Every port of this source: known ones first, then live connections.
    pub fn ports(&self) -> PortStream {
        match self {
            Self::Fixed(port) => PortStream::fixed(port.clone()),
            Self::Broadcast(registry) => registry.ports(),
        }
    }
}

impl std::fmt::Debug for PortSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(port) => f.debug_tuple("Fixed").field(&port.id()).finish(),
            Self::Broadcast(registry) => f.debug_tuple("Broadcast").field(registry).finish(),
        }
    }
}

/// Stream of ports produced by [`PortSource::ports`].
///
/// Holds peers weakly; a peer dropped before it is polled is skipped. A
/// fixed source ends after its port, a broadcast source ends when its
/// registry is dropped.
pub struct PortStream {
    fixed: Option<PortRef>,
    backlog: VecDeque<WeakPortRef>,
    live: Option<mpsc::UnboundedReceiver<WeakPortRef>>,
}

impl PortStream {
    fn fixed(port: PortRef) -> Self {
        Self {
            fixed: Some(port),
            backlog: VecDeque::new(),
            live: None,
        }
    }
}

impl Stream for PortStream {
    type Item = PortRef;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<PortRef>> {
        let this = self.get_mut();
        if let Some(port) = this.fixed.take() {
            return Poll::Ready(Some(port));
        }
        while let Some(weak) = this.backlog.pop_front() {
            if let Some(port) = weak.upgrade() {
                return Poll::Ready(Some(port));
            }
        }
        let Some(live) = this.live.as_mut() else {
            return Poll::Ready(None);
        };
        loop {
            match live.poll_recv(cx) {
                Poll::Ready(Some(weak)) => {
                    if let Some(port) = weak.upgrade() {
                        return Poll::Ready(Some(port));
                    }
                }
                Poll::Ready(None) => {
                    this.live = None;
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl std::fmt::Debug for PortStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortStream")
            .field("backlog", &self.backlog.len())
            .field("live", &self.live.is_some())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    peers: Vec<(PortId, WeakPortRef)>,
    watchers: Vec<mpsc::UnboundedSender<WeakPortRef>>,
}

impl RegistryInner {
    fn compact(&mut self) {
        self.peers.retain(|(_, weak)| weak.strong_count() > 0);
    }
}

/// Replay-since-start record of peers connected to a broadcast context.
///
/// Peers are kept weakly and leave on [`PortRegistry::disconnect`] or when
/// dropped.
#[derive(Clone, Default)]
pub struct PortRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, RegistryInner> {
        lock_inner(&self.inner)
    }

    /// Record a new peer and hand it to every open [`PortStream`].
    ///
    /// Connecting the same port twice is a no-op.
    pub fn connect(&self, port: &PortRef) {
        let id = port.id();
        let weak = Arc::downgrade(port);
        let mut inner = self.inner();
        if inner.peers.iter().any(|(known, _)| *known == id) {
            return;
        }
        inner.peers.push((id, weak.clone()));
        inner.watchers.retain(|watcher| watcher.send(weak.clone()).is_ok());
        debug!(port = %id, watchers = inner.watchers.len(), "peer registered");
    }

    /// Forget the peer `id`. Returns whether it was known.
    pub fn disconnect(&self, id: PortId) -> bool {
        let mut inner = self.inner();
        let before = inner.peers.len();
        inner.peers.retain(|(known, _)| *known != id);
        let removed = inner.peers.len() != before;
        if removed {
            debug!(port = %id, "peer unregistered");
        }
        removed
    }

    /// Peers seen so far followed by every peer connecting later.
    pub fn ports(&self) -> PortStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner();
        inner.compact();
        inner.watchers.retain(|watcher| !watcher.is_closed());
        let backlog = inner.peers.iter().map(|(_, weak)| weak.clone()).collect();
        inner.watchers.push(tx);
        PortStream {
            fixed: None,
            backlog,
            live: Some(rx),
        }
    }

    /// Peers currently alive.
    pub fn live(&self) -> Vec<PortRef> {
        let mut inner = self.inner();
        inner.compact();
        inner.peers.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner();
        inner.compact();
        inner.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed this registry from `hub`'s connection events.
    ///
    /// `on_disconnect` runs for every peer the hub reports gone. The pump
    /// task stops when the hub closes its event channel or the registry is
    /// dropped. Must be called from within a tokio runtime.
    pub fn attach<F>(&self, hub: &dyn Hub, on_disconnect: F)
    where
        F: Fn(PortId) + Send + 'static,
    {
        let events = hub.events();
        let registry = Arc::downgrade(&self.inner);
        tokio::spawn(pump_hub_events(events, registry, on_disconnect));
    }
}

async fn pump_hub_events<F>(
    mut events: mpsc::UnboundedReceiver<HubEvent>,
    registry: Weak<Mutex<RegistryInner>>,
    on_disconnect: F,
) where
    F: Fn(PortId) + Send + 'static,
{
    while let Some(event) = events.recv().await {
        let Some(inner) = registry.upgrade() else { break };
        let registry = PortRegistry { inner };
        match event {
            HubEvent::Connected(port) => registry.connect(&port),
            HubEvent::Disconnected(id) => {
                registry.disconnect(id);
                on_disconnect(id);
            }
        }
    }
    debug!("hub event pump finished");
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("PortRegistry")
            .field("peers", &inner.peers.len())
            .field("watchers", &inner.watchers.len())
            .finish()
    }
}

fn lock_inner(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}
