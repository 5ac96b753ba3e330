//! Port readiness handshake.
//!
//! Before the first envelope goes out on a port, the sender makes sure
//! somebody is listening on the other end: it posts the raw probe token
//! [`PROBE`] every probe interval until the raw acknowledgement [`ACK`]
//! comes back. Every port wired into a [`Link`](crate::Link) answers probes,
//! so both ends of a conversation run the same logic.
//!
//! The outcome is cached per port identity. There is no negative outcome:
//! a peer that never answers keeps the port pending until it is forgotten.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use portmux_transport::{Listener, Message, PortId, PortRef, WeakPortRef};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Raw probe token. Never wrapped in an envelope.
pub const PROBE: &str = "__PING__";

/// Raw acknowledgement token. Never wrapped in an envelope.
pub const ACK: &str = "__PONG__";

pub fn is_probe(message: &Message) -> bool {
    message.as_str() == Some(PROBE)
}

pub fn is_ack(message: &Message) -> bool {
    message.as_str() == Some(ACK)
}

/// Listener answering every probe arriving on `port` with an acknowledgement.
pub fn auto_reply_listener(port: WeakPortRef) -> Listener {
    Arc::new(move |message: &Message| {
        if !is_probe(message) {
            return;
        }
        if let Some(port) = port.upgrade() {
            if let Err(err) = port.post(Message::String(ACK.to_string())) {
                trace!(port = %port.id(), error = %err, "failed to acknowledge probe");
            }
        }
    })
}

enum PortState {
    Pending {
        ready: watch::Receiver<bool>,
        cancel: CancellationToken,
        generation: u64,
    },
    Ready,
}

/// Per-port readiness cache keyed by port identity.
#[derive(Clone)]
pub struct Readiness {
    inner: Arc<ReadinessInner>,
}

struct ReadinessInner {
    probe_interval: Duration,
    states: Mutex<HashMap<PortId, PortState>>,
    generations: AtomicU64,
}

impl ReadinessInner {
    fn states(&self) -> MutexGuard<'_, HashMap<PortId, PortState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of the probe loop started as `generation`.
    ///
    /// A loop that was forgotten and replaced by a newer one leaves the
    /// newer entry alone.
    fn settle(&self, id: PortId, generation: u64, ready: bool) {
        let mut states = self.states();
        let current = matches!(
            states.get(&id),
            Some(PortState::Pending { generation: g, .. }) if *g == generation
        );
        if !current {
            return;
        }
        if ready {
            states.insert(id, PortState::Ready);
        } else {
            states.remove(&id);
        }
    }
}

impl Readiness {
    pub fn new(probe_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ReadinessInner {
                probe_interval,
                states: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Whether the handshake with `id` has completed.
    pub fn is_ready(&self, id: PortId) -> bool {
        matches!(self.inner.states().get(&id), Some(PortState::Ready))
    }

    /// Whether a handshake with `id` is in progress.
    pub fn is_pending(&self, id: PortId) -> bool {
        matches!(self.inner.states().get(&id), Some(PortState::Pending { .. }))
    }

    /// Wait until `port` has acknowledged a probe, starting the handshake
    /// if this is the first time the port is seen.
    ///
    /// The returned future does not keep the port alive. It resolves to
    /// `false` if the port is forgotten or dropped before acknowledging.
    pub fn wait_ready(&self, port: &PortRef) -> impl Future<Output = bool> + Send + 'static {
        let pending = self.pending_state(port);
        async move {
            match pending {
                None => true,
                Some(mut ready) => ready.wait_for(|ready| *ready).await.is_ok(),
            }
        }
    }

    /// Drop the cached state of `id` and stop a pending probe loop.
    pub fn forget(&self, id: PortId) {
        if let Some(PortState::Pending { cancel, .. }) = self.inner.states().remove(&id) {
            cancel.cancel();
        }
    }

    /// Forget every port.
    pub fn reset(&self) {
        let drained: Vec<PortState> = self.inner.states().drain().map(|(_, s)| s).collect();
        for state in drained {
            if let PortState::Pending { cancel, .. } = state {
                cancel.cancel();
            }
        }
    }

    fn pending_state(&self, port: &PortRef) -> Option<watch::Receiver<bool>> {
        let id = port.id();
        let mut states = self.inner.states();
        match states.get(&id) {
            Some(PortState::Ready) => None,
            Some(PortState::Pending { ready, .. }) => Some(ready.clone()),
            None => {
                let (tx, rx) = watch::channel(false);
                let cancel = CancellationToken::new();
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                states.insert(
                    id,
                    PortState::Pending {
                        ready: rx.clone(),
                        cancel: cancel.clone(),
                        generation,
                    },
                );
                drop(states);
                self.spawn_probe(port, tx, cancel, generation);
                Some(rx)
            }
        }
    }

    fn spawn_probe(
        &self,
        port: &PortRef,
        tx: watch::Sender<bool>,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let id = port.id();
        let tx = Arc::new(tx);

        let on_ack = tx.clone();
        let key = port.add_listener(Arc::new(move |message: &Message| {
            if is_ack(message) {
                on_ack.send_replace(true);
            }
        }));
        port.start();

        let weak = Arc::downgrade(port);
        let inner = self.inner.clone();
        let probe_interval = inner.probe_interval;
        debug!(port = %id, "starting readiness handshake");

        tokio::spawn(async move {
            let mut acked = tx.subscribe();
            // The first tick fires immediately, which defers the first probe
            // until after the acknowledgement listener is in place.
            let mut ticker = tokio::time::interval(probe_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let ready = loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break false,
                    acked = async { acked.wait_for(|ready| *ready).await.is_ok() } => break acked,
                    _ = ticker.tick() => {
                        let Some(port) = weak.upgrade() else { break false };
                        if let Err(err) = port.post(Message::String(PROBE.to_string())) {
                            trace!(port = %id, error = %err, "readiness probe not delivered");
                        }
                    }
                }
            };

            if let Some(port) = weak.upgrade() {
                port.remove_listener(key);
            }
            inner.settle(id, generation, ready);
            debug!(port = %id, ready, "readiness handshake finished");
        });
    }
}

impl std::fmt::Debug for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Readiness")
            .field("probe_interval", &self.inner.probe_interval)
            .field("ports", &self.inner.states().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use portmux_transport::{MemoryPort, Port};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    fn wire_auto_reply(port: &Arc<MemoryPort>) {
        let port_ref: PortRef = port.clone();
        port.add_listener(auto_reply_listener(Arc::downgrade(&port_ref)));
        port.start();
    }

    #[test]
    fn token_predicates() {
        assert!(is_probe(&json!("__PING__")));
        assert!(is_ack(&json!("__PONG__")));
        assert!(!is_probe(&json!({"id": "__PING__"})));
        assert!(!is_ack(&json!("__PING__")));
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_once_peer_answers() {
        let (local, remote) = MemoryPort::pair();
        wire_auto_reply(&remote);

        let readiness = Readiness::new(Duration::from_millis(25));
        let local: PortRef = local;
        assert!(readiness.wait_ready(&local).await);
        assert!(readiness.is_ready(local.id()));

        // cached: resolves without another round trip
        assert!(readiness.wait_ready(&local).await);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_probing_until_peer_appears() {
        let (local, remote) = MemoryPort::pair();
        let (tx, mut probes) = mpsc::unbounded_channel();
        remote.add_listener(Arc::new(move |m: &Message| {
            if is_probe(m) {
                let _ = tx.send(());
            }
        }));
        remote.start();

        let readiness = Readiness::new(Duration::from_millis(25));
        let local: PortRef = local;
        let waiter = tokio::spawn(readiness.wait_ready(&local));

        for _ in 0..3 {
            probes.recv().await.unwrap();
        }
        assert!(readiness.is_pending(local.id()));
        assert!(!waiter.is_finished());

        let remote_ref: PortRef = remote.clone();
        remote.add_listener(auto_reply_listener(Arc::downgrade(&remote_ref)));
        assert!(waiter.await.unwrap());
        assert!(readiness.is_ready(local.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_share_one_handshake() {
        let (local, remote) = MemoryPort::pair();
        wire_auto_reply(&remote);

        let readiness = Readiness::new(Duration::from_millis(25));
        let local: PortRef = local;
        let first = readiness.wait_ready(&local);
        let second = readiness.wait_ready(&local);
        assert!(readiness.is_pending(local.id()));

        let (a, b) = tokio::join!(first, second);
        assert!(a && b);
    }

    #[tokio::test(start_paused = true)]
    async fn forget_releases_pending_waiters() {
        let (local, _remote) = MemoryPort::pair();
        let readiness = Readiness::new(Duration::from_millis(25));
        let local: PortRef = local;

        let waiter = tokio::spawn(readiness.wait_ready(&local));
        tokio::time::sleep(Duration::from_millis(100)).await;
        readiness.forget(local.id());

        assert!(!waiter.await.unwrap());
        assert!(!readiness.is_pending(local.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn acknowledgement_listener_is_removed_after_handshake() {
        let (local, remote) = MemoryPort::pair();
        wire_auto_reply(&remote);

        let readiness = Readiness::new(Duration::from_millis(25));
        let local_ref: PortRef = local.clone();
        assert!(readiness.wait_ready(&local_ref).await);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(local.listener_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_after_reset_is_cached_again() {
        let (local, remote) = MemoryPort::pair();
        remote.start();
        let readiness = Readiness::new(Duration::from_millis(25));
        let local: PortRef = local;

        // nobody answers yet; the reset cancels the first probe loop
        let stale = tokio::spawn(readiness.wait_ready(&local));
        tokio::time::sleep(Duration::from_millis(60)).await;
        readiness.reset();

        let remote_ref: PortRef = remote.clone();
        remote.add_listener(auto_reply_listener(Arc::downgrade(&remote_ref)));
        assert!(readiness.wait_ready(&local).await);
        assert!(!stale.await.unwrap());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(readiness.is_ready(local.id()));
        assert!(!readiness.is_pending(local.id()));
    }
}
