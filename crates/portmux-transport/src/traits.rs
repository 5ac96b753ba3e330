use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::Result;

/// A structured message carried by a port.
///
/// Ports move JSON values, not bytes: envelopes are JSON objects and the
/// readiness probe/acknowledgement tokens are bare JSON strings.
pub type Message = serde_json::Value;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one port endpoint.
///
/// Two handles refer to the same endpoint exactly when their ids are equal;
/// the content of a port never participates in equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(u64);

impl PortId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// Callback invoked for every message delivered to a port.
pub type Listener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Handle returned by [`Port::add_listener`], used to remove that listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

/// One endpoint of a bidirectional, order-preserving message channel.
///
/// Delivery is asynchronous: a message posted on one end is handed to the
/// listeners of the other end later, never from inside `post`. Messages
/// posted before the receiving end is started are queued.
pub trait Port: Send + Sync + 'static {
    /// Identity of this endpoint.
    fn id(&self) -> PortId;

    /// Post a message to the peer endpoint (at most once, in order).
    fn post(&self, message: Message) -> Result<()>;

    /// Register a listener for messages arriving at this endpoint.
    fn add_listener(&self, listener: Listener) -> ListenerKey;

    /// Remove a listener. Returns `false` if it was already gone.
    fn remove_listener(&self, key: ListenerKey) -> bool;

    /// Activate delivery of queued and future messages. Idempotent.
    fn start(&self);
}

/// Shared handle to a port.
pub type PortRef = Arc<dyn Port>;

/// Non-owning handle to a port.
pub type WeakPortRef = Weak<dyn Port>;

/// Listener registry shared by port implementations.
///
/// Emission works on a snapshot so listeners may add or remove listeners
/// (including themselves) while being called.
#[derive(Default)]
pub struct ListenerSet {
    next_key: AtomicU64,
    listeners: Mutex<Vec<(ListenerKey, Listener)>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Listener) -> ListenerKey {
        let key = ListenerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.lock().push((key, listener));
        key
    }

    pub fn remove(&self, key: ListenerKey) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(k, _)| *k != key);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Call every registered listener with `message`.
    pub fn emit(&self, message: &Message) {
        let snapshot: Vec<Listener> = self.lock().iter().map(|(_, l)| l.clone()).collect();
        for listener in snapshot {
            listener(message);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerKey, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use super::*;

    #[test]
    fn port_ids_are_unique() {
        let a = PortId::next();
        let b = PortId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("port-"));
    }

    #[test]
    fn remove_detaches_only_that_listener() {
        let set = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h1 = hits.clone();
        let first = set.add(Arc::new(move |_| {
            h1.fetch_add(1, Ordering::SeqCst);
        }));
        let h2 = hits.clone();
        let _second = set.add(Arc::new(move |_| {
            h2.fetch_add(10, Ordering::SeqCst);
        }));

        set.emit(&json!("x"));
        assert_eq!(hits.load(Ordering::SeqCst), 11);

        assert!(set.remove(first));
        assert!(!set.remove(first));
        set.emit(&json!("x"));
        assert_eq!(hits.load(Ordering::SeqCst), 21);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn listener_may_remove_itself_during_emit() {
        let set = Arc::new(ListenerSet::new());
        let key_slot: Arc<Mutex<Option<ListenerKey>>> = Arc::new(Mutex::new(None));

        let set_clone = set.clone();
        let slot_clone = key_slot.clone();
        let key = set.add(Arc::new(move |_| {
            if let Some(key) = *slot_clone.lock().unwrap() {
                set_clone.remove(key);
            }
        }));
        *key_slot.lock().unwrap() = Some(key);

        set.emit(&json!(1));
        assert!(set.is_empty());
    }
}
