use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use portmux_envelope::Envelope;
use portmux_transport::{Listener, ListenerKey, Message, PortId, PortRef, WeakPortRef};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ProtocolConfig;
use crate::handshake::{auto_reply_listener, Readiness};

/// Raw envelope transport over ports.
///
/// Owns the per-port side tables (readiness cache, probe auto-reply
/// registrations, outboxes) instead of keeping them in globals.
pub struct Link {
    readiness: Readiness,
    readiness_timeout: Option<Duration>,
    auto_reply: Mutex<HashSet<PortId>>,
    outboxes: Mutex<HashMap<PortId, mpsc::UnboundedSender<Message>>>,
}

impl Link {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            readiness: Readiness::new(config.probe_interval),
            readiness_timeout: config.readiness_timeout,
            auto_reply: Mutex::new(HashSet::new()),
            outboxes: Mutex::new(HashMap::new()),
        }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Listen for envelopes arriving on `port`.
    ///
    /// Messages that are not shaped like an envelope never reach `callback`.
    /// Dropping the returned [`Subscription`] removes exactly this listener;
    /// the probe auto-reply installed on first use stays in place.
    pub fn subscribe<F>(&self, port: &PortRef, callback: F) -> Subscription
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.install_auto_reply(port);

        let listener: Listener = Arc::new(move |message: &Message| {
            if let Some(envelope) = Envelope::from_message(message) {
                callback(envelope);
            }
        });
        let key = port.add_listener(listener);
        port.start();

        Subscription {
            port: Arc::downgrade(port),
            port_id: port.id(),
            key: Some(key),
        }
    }

    /// Send `envelope` on `port` once the peer is ready.
    ///
    /// Fire-and-forget: envelopes for one port go out in dispatch order,
    /// a failed post is logged and swallowed.
    pub fn dispatch(&self, port: &PortRef, envelope: &Envelope) {
        let message = match envelope.to_message() {
            Ok(message) => message,
            Err(err) => {
                error!(port = %port.id(), channel = %envelope.id, error = %err, "failed to encode envelope");
                return;
            }
        };

        let id = port.id();
        let mut outboxes = lock(&self.outboxes);
        let message = match outboxes.get(&id) {
            Some(outbox) => match outbox.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let outbox = self.spawn_outbox(port);
        if outbox.send(message).is_err() {
            warn!(port = %id, "outbox closed before first envelope");
        }
        outboxes.insert(id, outbox);
    }

    /// Drop every side-table entry for `id`.
    pub fn forget(&self, id: PortId) {
        self.readiness.forget(id);
        lock(&self.auto_reply).remove(&id);
        lock(&self.outboxes).remove(&id);
    }

    /// Drop every side-table entry.
    pub fn reset(&self) {
        self.readiness.reset();
        lock(&self.auto_reply).clear();
        lock(&self.outboxes).clear();
    }

    fn install_auto_reply(&self, port: &PortRef) {
        if lock(&self.auto_reply).insert(port.id()) {
            port.add_listener(auto_reply_listener(Arc::downgrade(port)));
        }
    }

    fn spawn_outbox(&self, port: &PortRef) -> mpsc::UnboundedSender<Message> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let id = port.id();
        let weak = Arc::downgrade(port);
        let readiness = self.readiness.clone();
        let readiness_timeout = self.readiness_timeout;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let waiter = match weak.upgrade() {
                    Some(port) => readiness.wait_ready(&port),
                    None => break,
                };
                let ready = match readiness_timeout {
                    None => waiter.await,
                    Some(limit) => tokio::time::timeout(limit, waiter).await.unwrap_or(false),
                };
                if !ready {
                    warn!(port = %id, "dropping envelope: peer never became ready");
                    continue;
                }

                let Some(port) = weak.upgrade() else { break };
                if let Err(err) = port.post(message) {
                    error!(port = %id, error = %err, "failed to post envelope");
                }
            }
            debug!(port = %id, "outbox finished");
        });

        tx
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("readiness", &self.readiness)
            .field("readiness_timeout", &self.readiness_timeout)
            .field("outboxes", &lock(&self.outboxes).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scoped listener registration returned by [`Link::subscribe`].
///
/// Holds the port weakly; removing the listener of a port that is already
/// gone is a no-op.
#[must_use = "dropping a subscription removes its listener"]
pub struct Subscription {
    port: WeakPortRef,
    port_id: PortId,
    key: Option<ListenerKey>,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(key) = self.key.take() {
            if let Some(port) = self.port.upgrade() {
                port.remove_listener(key);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("port", &self.port_id)
            .field("active", &self.key.is_some())
            .finish()
    }
}
