//! Request side: broadcast a request, keep the first responder, stream its
//! replies back.
//!
//! Every call runs one driver task through three phases:
//!
//! - *broadcasting*: each port of the source gets its own attempt (fresh
//!   channel id, request lock held, listener on that id, request sent)
//! - *streaming*: the first reply promotes its attempt to winner, every
//!   other attempt is closed, replies of the winner are forwarded
//! - *terminated*: completion, error, lost channel or cancellation; the
//!   winner (or every open attempt) is closed and its lock released

use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_core::Stream;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use portmux_envelope::{ChannelId, Envelope, Notification};
use portmux_transport::PortRef;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, trace, warn};

use crate::error::ChannelError;
use crate::link::{Link, Subscription};
use crate::locks::{LockGuard, LockManager};
use crate::services::Services;
use crate::source::{PortSource, PortStream};

/// Typed request side of a protocol.
pub struct Requester<Req, Resp> {
    kind: Arc<str>,
    source: PortSource,
    services: Arc<Services>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for Requester<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            source: self.source.clone(),
            services: self.services.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> Requester<Req, Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned + Send + 'static,
{
    pub fn new(kind: impl Into<Arc<str>>, source: PortSource, services: Arc<Services>) -> Self {
        Self {
            kind: kind.into(),
            source,
            services,
            _types: PhantomData,
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Send `payload` to every port of the source and stream the replies
    /// of whichever responder answers first.
    ///
    /// Dropping the returned stream cancels the call. Must be called from
    /// within a tokio runtime.
    pub fn request(&self, payload: &Req) -> ResponseStream<Resp> {
        let payload = match serde_json::to_value(payload) {
            Ok(payload) => payload,
            Err(err) => return ResponseStream::failed(ChannelError::Encode(err.to_string())),
        };

        let (out, replies) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let driver = Driver {
            kind: self.kind.clone(),
            payload,
            link: self.services.link().clone(),
            locks: self.services.locks().clone(),
            grace_period: self.services.config().grace_period,
            out,
            cancel: cancel.clone(),
            events_tx,
        };
        tokio::spawn(driver.run(self.source.ports(), events));

        ResponseStream {
            replies,
            _cancel: Some(cancel.drop_guard()),
        }
    }
}

impl<Req, Resp> std::fmt::Debug for Requester<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Requester")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

/// Replies of one call. Ends after completion or the first error.
///
/// Dropping it cancels the call: the responder gets a close and the
/// request lock is released.
pub struct ResponseStream<T> {
    replies: mpsc::UnboundedReceiver<Result<T, ChannelError>>,
    _cancel: Option<DropGuard>,
}

impl<T> ResponseStream<T> {
    fn failed(error: ChannelError) -> Self {
        let (tx, replies) = mpsc::unbounded_channel();
        let _ = tx.send(Err(error));
        Self {
            replies,
            _cancel: None,
        }
    }

    /// Stop the call now. Dropping the stream fires its cancellation guard.
    pub fn cancel(self) {
        drop(self);
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.replies.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for ResponseStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("cancellable", &self._cancel.is_some())
            .finish()
    }
}

/// One port's share of a broadcast request.
struct Attempt {
    port: PortRef,
    id: ChannelId,
    lock: LockGuard,
    subscription: Subscription,
}

impl Attempt {
    fn close(self, link: &Link, kind: &str) {
        let Attempt {
            port,
            id,
            lock,
            subscription,
        } = self;
        subscription.unsubscribe();
        link.dispatch(&port, &Envelope::close(id.clone(), kind));
        lock.release();
        trace!(port = %port.id(), channel = %id, "attempt closed");
    }
}

enum Outcome {
    Complete,
    Failed,
    Lost,
    Cancelled,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Complete => "complete",
            Outcome::Failed => "error",
            Outcome::Lost => "lost",
            Outcome::Cancelled => "cancelled",
        }
    }
}

struct Driver<Resp> {
    kind: Arc<str>,
    payload: Value,
    link: Arc<Link>,
    locks: Arc<dyn LockManager>,
    grace_period: Duration,
    out: mpsc::UnboundedSender<Result<Resp, ChannelError>>,
    cancel: CancellationToken,
    events_tx: mpsc::UnboundedSender<Envelope>,
}

impl<Resp> Driver<Resp>
where
    Resp: DeserializeOwned + Send + 'static,
{
    async fn run(self, ports: PortStream, mut events: mpsc::UnboundedReceiver<Envelope>) {
        let mut ports = Some(ports);
        let mut attempts: HashMap<ChannelId, Attempt> = HashMap::new();
        let mut winner: Option<Attempt> = None;
        let mut lost: Option<BoxFuture<'static, ()>> = None;

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Outcome::Cancelled,
                Some(envelope) = events.recv() => {
                    if winner.is_none() {
                        let Some(first) = attempts.remove(&envelope.id) else {
                            continue;
                        };
                        debug!(protocol = %self.kind, port = %first.port.id(), channel = %first.id, losers = attempts.len(), "winner selected");
                        for (_, loser) in attempts.drain() {
                            loser.close(&self.link, &self.kind);
                        }
                        ports = None;
                        lost = Some(self.watch_loss(&first.id));
                        winner = Some(first);
                    }
                    if winner.as_ref().is_some_and(|w| w.id != envelope.id) {
                        continue;
                    }
                    if let Some(outcome) = self.forward(&envelope) {
                        break outcome;
                    }
                }
                port = next_port(&mut ports), if ports.is_some() => match port {
                    Some(port) => {
                        let attempt = self.open(port).await;
                        attempts.insert(attempt.id.clone(), attempt);
                    }
                    None => ports = None,
                },
                _ = wait(&mut lost), if lost.is_some() => {
                    let _ = self.out.send(Err(ChannelError::LoseChannel));
                    break Outcome::Lost;
                }
            }
        };

        if let Some(winner) = winner {
            debug!(protocol = %self.kind, channel = %winner.id, outcome = outcome.as_str(), "request finished");
            winner.close(&self.link, &self.kind);
        } else {
            debug!(protocol = %self.kind, attempts = attempts.len(), outcome = outcome.as_str(), "request finished without a winner");
        }
        for (_, attempt) in attempts.drain() {
            attempt.close(&self.link, &self.kind);
        }
    }

    async fn open(&self, port: PortRef) -> Attempt {
        let id = ChannelId::random();
        let lock = self.locks.acquire(&id.request_lock_name()).await;

        let kind = self.kind.clone();
        let expected = id.clone();
        let events = self.events_tx.clone();
        let subscription = self.link.subscribe(&port, move |envelope| {
            if envelope.kind == *kind && envelope.id == expected && !envelope.is_close() {
                let _ = events.send(envelope);
            }
        });

        let request = Envelope::new(id.clone(), &*self.kind, self.payload.clone());
        self.link.dispatch(&port, &request);
        trace!(protocol = %self.kind, port = %port.id(), channel = %id, "request sent");

        Attempt {
            port,
            id,
            lock,
            subscription,
        }
    }

    /// Resolves once the winner's response lock was released and the
    /// grace period passed without a formal end.
    fn watch_loss(&self, id: &ChannelId) -> BoxFuture<'static, ()> {
        let released = self.locks.on_release(&id.response_lock_name());
        let grace = self.grace_period;
        async move {
            released.await;
            tokio::time::sleep(grace).await;
        }
        .boxed()
    }

    /// Deliver one reply of the winner. Returns the outcome if it ended
    /// the call.
    fn forward(&self, envelope: &Envelope) -> Option<Outcome> {
        match envelope.decode_payload::<Notification<Resp>>() {
            Ok(Notification::Next { value }) => {
                if self.out.send(Ok(value)).is_err() {
                    return Some(Outcome::Cancelled);
                }
                None
            }
            Ok(Notification::Error { error }) => {
                let _ = self.out.send(Err(ChannelError::from_remote(error)));
                Some(Outcome::Failed)
            }
            Ok(Notification::Complete) => Some(Outcome::Complete),
            Err(err) => {
                warn!(protocol = %self.kind, channel = %envelope.id, error = %err, "undecodable reply");
                let _ = self.out.send(Err(ChannelError::Decode(err.to_string())));
                Some(Outcome::Failed)
            }
        }
    }
}

async fn next_port(ports: &mut Option<PortStream>) -> Option<PortRef> {
    match ports {
        Some(ports) => ports.next().await,
        None => std::future::pending().await,
    }
}

async fn wait(future: &mut Option<BoxFuture<'static, ()>>) {
    match future {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use portmux_transport::MemoryPort;
    use serde_json::json;

    use super::*;
    use crate::locks::LocalLockManager;

    /// Scripted responder on the far end of a port pair, built directly on
    /// the link so each test controls exactly what goes back.
    struct FakeResponder {
        port: PortRef,
        link: Arc<Link>,
        requests: mpsc::UnboundedReceiver<Envelope>,
        _sub: Subscription,
    }

    impl FakeResponder {
        fn new(services: &Services, port: PortRef) -> Self {
            let (tx, requests) = mpsc::unbounded_channel();
            let sub = services.link().subscribe(&port, move |envelope| {
                let _ = tx.send(envelope);
            });
            Self {
                port,
                link: services.link().clone(),
                requests,
                _sub: sub,
            }
        }

        fn reply(&self, id: &ChannelId, notification: Notification<Value>) {
            let payload = serde_json::to_value(notification).unwrap();
            self.link
                .dispatch(&self.port, &Envelope::new(id.clone(), "first", payload));
        }
    }

    fn setup() -> (Arc<Services>, PortRef, PortRef) {
        let services = Arc::new(Services::local());
        let (local, remote) = MemoryPort::pair();
        (services, local, remote)
    }

    #[tokio::test(start_paused = true)]
    async fn streams_values_until_complete() {
        let (services, local, remote) = setup();
        let mut responder = FakeResponder::new(&services, remote);
        let requester: Requester<String, String> =
            Requester::new("first", PortSource::fixed(local), services.clone());

        let mut replies = requester.request(&"ping".to_string());
        let request = responder.requests.recv().await.unwrap();
        assert_eq!(request.kind, "first");
        assert_eq!(request.payload, json!("ping"));

        responder.reply(&request.id, Notification::next(json!("a")));
        responder.reply(&request.id, Notification::next(json!("b")));
        responder.reply(&request.id, Notification::Complete);

        assert_eq!(replies.next().await, Some(Ok("a".to_string())));
        assert_eq!(replies.next().await, Some(Ok("b".to_string())));
        assert_eq!(replies.next().await, None);

        // the finished channel is closed
        let close = responder.requests.recv().await.unwrap();
        assert_eq!(close.id, request.id);
        assert!(close.is_close());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_ends_stream() {
        let (services, local, remote) = setup();
        let mut responder = FakeResponder::new(&services, remote);
        let requester: Requester<u32, u32> =
            Requester::new("first", PortSource::fixed(local), services.clone());

        let mut replies = requester.request(&1);
        let request = responder.requests.recv().await.unwrap();
        responder.reply(&request.id, Notification::error("boom"));
        responder.reply(&request.id, Notification::next(json!(7)));

        assert_eq!(
            replies.next().await,
            Some(Err(ChannelError::Remote("boom".to_string())))
        );
        assert_eq!(replies.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_reply_is_a_decode_error() {
        let (services, local, remote) = setup();
        let mut responder = FakeResponder::new(&services, remote);
        let requester: Requester<u32, u32> =
            Requester::new("first", PortSource::fixed(local), services.clone());

        let mut replies = requester.request(&1);
        let request = responder.requests.recv().await.unwrap();
        responder.reply(&request.id, Notification::next(json!("not a number")));

        assert!(matches!(
            replies.next().await,
            Some(Err(ChannelError::Decode(_)))
        ));
        assert_eq!(replies.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn foreign_types_and_ids_are_ignored() {
        let (services, local, remote) = setup();
        let mut responder = FakeResponder::new(&services, remote.clone());
        let requester: Requester<u32, u32> =
            Requester::new("first", PortSource::fixed(local), services.clone());

        let mut replies = requester.request(&1);
        let request = responder.requests.recv().await.unwrap();
        let stray = serde_json::to_value(Notification::next(json!(99))).unwrap();
        services.link().dispatch(
            &remote,
            &Envelope::new(request.id.clone(), "second", stray.clone()),
        );
        services
            .link()
            .dispatch(&remote, &Envelope::new(ChannelId::random(), "first", stray));
        responder.reply(&request.id, Notification::next(json!(1)));
        responder.reply(&request.id, Notification::Complete);

        assert_eq!(replies.next().await, Some(Ok(1)));
        assert_eq!(replies.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn unencodable_payload_fails_immediately() {
        let services = Arc::new(Services::local());
        let (local, _remote) = MemoryPort::pair();
        let requester: Requester<HashMap<(u8, u8), u8>, u8> =
            Requester::new("first", PortSource::fixed(local), services);

        let mut key_map = HashMap::new();
        key_map.insert((1, 2), 3);
        let mut replies = requester.request(&key_map);
        assert!(matches!(
            replies.next().await,
            Some(Err(ChannelError::Encode(_)))
        ));
        assert_eq!(replies.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_responder_times_out_after_grace() {
        let locks = LocalLockManager::new();
        let services = Arc::new(Services::new(Default::default(), Arc::new(locks.clone())).unwrap());
        let (local, remote) = MemoryPort::pair();
        let local: PortRef = local;
        let mut responder = FakeResponder::new(&services, remote);
        let requester: Requester<u32, u32> =
            Requester::new("first", PortSource::fixed(local), services.clone());

        let mut replies = requester.request(&1);
        let request = responder.requests.recv().await.unwrap();
        let response_lock = locks.acquire(&request.id.response_lock_name()).await;
        responder.reply(&request.id, Notification::next(json!(5)));
        assert_eq!(replies.next().await, Some(Ok(5)));

        let released_at = tokio::time::Instant::now();
        drop(response_lock);
        assert_eq!(replies.next().await, Some(Err(ChannelError::LoseChannel)));
        let elapsed = released_at.elapsed();
        assert!(elapsed >= services.config().grace_period);
        assert!(elapsed < services.config().grace_period + Duration::from_millis(50));
        assert_eq!(replies.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_closes_and_releases() {
        let locks = LocalLockManager::new();
        let services = Arc::new(Services::new(Default::default(), Arc::new(locks.clone())).unwrap());
        let (local, remote) = MemoryPort::pair();
        let mut responder = FakeResponder::new(&services, remote);
        let requester: Requester<u32, u32> =
            Requester::new("first", PortSource::fixed(local), services.clone());

        let replies = requester.request(&1);
        let request = responder.requests.recv().await.unwrap();
        assert!(locks.is_held(&request.id.request_lock_name()));

        replies.cancel();
        let close = responder.requests.recv().await.unwrap();
        assert_eq!(close.id, request.id);
        assert!(close.is_close());
        assert!(!locks.is_held(&request.id.request_lock_name()));
    }

    #[tokio::test(start_paused = true)]
    async fn winner_takes_the_call_and_losers_get_closed() {
        let services = Arc::new(Services::local());
        let registry = crate::source::PortRegistry::new();
        let (a_local, a_remote) = MemoryPort::pair();
        let (b_local, b_remote) = MemoryPort::pair();
        let (a_local, b_local): (PortRef, PortRef) = (a_local, b_local);
        registry.connect(&a_local);
        registry.connect(&b_local);

        let mut a = FakeResponder::new(&services, a_remote);
        let mut b = FakeResponder::new(&services, b_remote);
        let requester: Requester<u32, String> =
            Requester::new("first", PortSource::broadcast(registry), services.clone());

        let mut replies = requester.request(&1);
        let a_request = a.requests.recv().await.unwrap();
        let b_request = b.requests.recv().await.unwrap();
        assert_ne!(a_request.id, b_request.id);

        b.reply(&b_request.id, Notification::next(json!("from b")));
        assert_eq!(replies.next().await, Some(Ok("from b".to_string())));

        let close = a.requests.recv().await.unwrap();
        assert_eq!(close.id, a_request.id);
        assert!(close.is_close());

        a.reply(&a_request.id, Notification::next(json!("from a")));
        b.reply(&b_request.id, Notification::Complete);
        assert_eq!(replies.next().await, None);
    }
}
