use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{Listener, ListenerKey, ListenerSet, Message, Port, PortId};

/// In-process port endpoint.
///
/// Created in connected pairs by [`MemoryPort::pair`]. Each endpoint owns an
/// inbox that buffers messages until [`Port::start`] spawns the delivery
/// task on the current tokio runtime.
pub struct MemoryPort {
    id: PortId,
    listeners: Arc<ListenerSet>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    started: AtomicBool,
    closed: Arc<AtomicBool>,
}

impl MemoryPort {
    /// Create two connected endpoints.
    pub fn pair() -> (Arc<MemoryPort>, Arc<MemoryPort>) {
        let (to_right, right_inbox) = mpsc::unbounded_channel();
        let (to_left, left_inbox) = mpsc::unbounded_channel();

        let left = Arc::new(Self::new(to_right, left_inbox));
        let right = Arc::new(Self::new(to_left, right_inbox));
        (left, right)
    }

    fn new(outbound: mpsc::UnboundedSender<Message>, inbound: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            id: PortId::next(),
            listeners: Arc::new(ListenerSet::new()),
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            started: AtomicBool::new(false),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Disconnect this endpoint.
    ///
    /// Further posts from either side fail with [`TransportError::Closed`]
    /// once the peer notices, and no more messages are delivered here.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut inbox) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            inbox.close();
        }
        debug!(port = %self.id, "memory port closed");
    }

    /// Whether [`MemoryPort::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Whether delivery has been activated.
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Port for MemoryPort {
    fn id(&self) -> PortId {
        self.id
    }

    fn post(&self, message: Message) -> Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| TransportError::Closed(self.id)),
            None => Err(TransportError::Closed(self.id)),
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerKey {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, key: ListenerKey) -> bool {
        self.listeners.remove(key)
    }

    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(port = %self.id, "start called outside a tokio runtime; port stays inactive");
                self.started.store(false, Ordering::SeqCst);
                return;
            }
        };

        let Some(mut inbox) = self
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };

        let listeners = self.listeners.clone();
        let closed = self.closed.clone();
        let id = self.id;
        handle.spawn(async move {
            while let Some(message) = inbox.recv().await {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                listeners.emit(&message);
            }
            debug!(port = %id, "memory port delivery finished");
        });
    }
}

impl fmt::Debug for MemoryPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPort")
            .field("id", &self.id)
            .field("started", &self.is_started())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn collector(port: &MemoryPort) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        port.add_listener(Arc::new(move |message: &Message| {
            let _ = tx.send(message.clone());
        }));
        rx
    }

    #[tokio::test]
    async fn delivers_in_order_after_start() {
        let (left, right) = MemoryPort::pair();
        let mut received = collector(&right);

        left.post(json!(1)).unwrap();
        left.post(json!(2)).unwrap();
        left.post(json!(3)).unwrap();
        right.start();

        for expected in 1..=3 {
            assert_eq!(received.recv().await.unwrap(), json!(expected));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queues_until_started() {
        let (left, right) = MemoryPort::pair();
        let mut received = collector(&right);

        left.post(json!("early")).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(received.try_recv().is_err());

        right.start();
        right.start();
        assert_eq!(received.recv().await.unwrap(), json!("early"));
    }

    #[tokio::test]
    async fn post_after_close_fails() {
        let (left, right) = MemoryPort::pair();
        left.close();
        assert!(matches!(
            left.post(json!("x")),
            Err(TransportError::Closed(id)) if id == left.id()
        ));

        right.close();
        assert!(right.post(json!("y")).is_err());
    }

    #[tokio::test]
    async fn peer_post_fails_once_receiver_closed() {
        let (left, right) = MemoryPort::pair();
        right.close();
        assert!(left.post(json!("lost")).is_err());
    }

    #[test]
    fn start_outside_runtime_leaves_port_inactive() {
        let (_left, right) = MemoryPort::pair();
        right.start();
        assert!(!right.is_started());
    }
}
