//! Response side: answer requests arriving on a set of ports.
//!
//! A serve loop watches every port of the source and groups incoming
//! envelopes by (port, channel id). The first request of a group is handed
//! to its own reply task, which takes the response lock, asks the handler
//! and forwards the handler's stream as notifications until the stream
//! ends, the requester closes or goes away, or the registration is stopped.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use portmux_envelope::{ChannelId, Envelope, Notification, ABORT_CHANNEL};
use portmux_transport::{PortId, PortRef, WeakPortRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::BoxError;
use crate::link::{Link, Subscription};
use crate::locks::{LockGuard, LockManager};
use crate::services::Services;
use crate::source::{PortSource, PortStream};

/// Stream of replies produced by a handler for one request.
pub type ReplyStream<T> = BoxStream<'static, Result<T, BoxError>>;

type Handler<Req, Resp> = dyn Fn(Req) -> Option<ReplyStream<Resp>> + Send + Sync;

type ChannelKey = (PortId, ChannelId);

/// Typed response side of a protocol.
pub struct Responder<Req, Resp> {
    kind: Arc<str>,
    source: PortSource,
    services: Arc<Services>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Clone for Responder<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            source: self.source.clone(),
            services: self.services.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> Responder<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
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

    /// Start answering requests with `handler`.
    ///
    /// The handler returns `None` to decline a request; the requester then
    /// keeps waiting for another responder. The registration lives until
    /// [`ServeHandle::stop`]; dropping the handle leaves it running. Must be
    /// called from within a tokio runtime.
    pub fn serve<H>(&self, handler: H) -> ServeHandle
    where
        H: Fn(Req) -> Option<ReplyStream<Resp>> + Send + Sync + 'static,
    {
        let abort = CancellationToken::new();
        let detach = CancellationToken::new();
        let serve = ServeLoop {
            kind: self.kind.clone(),
            link: self.services.link().clone(),
            locks: self.services.locks().clone(),
            grace_period: self.services.config().grace_period,
            handler: Arc::new(handler),
            abort: abort.clone(),
        };
        tokio::spawn(serve.run(self.source.ports(), detach.clone()));
        debug!(protocol = %self.kind, source = ?self.source, "responder registered");

        ServeHandle { abort, detach }
    }
}

impl<Req, Resp> std::fmt::Debug for Responder<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

/// Handle of one [`Responder::serve`] registration.
#[derive(Debug)]
pub struct ServeHandle {
    abort: CancellationToken,
    detach: CancellationToken,
}

impl ServeHandle {
    /// Abort every unfinished reply with `AbortChannel` and stop listening.
    ///
    /// Other registrations on the same ports are unaffected.
    pub fn stop(&self) {
        self.abort.cancel();
        self.detach.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.detach.is_cancelled()
    }
}

struct ActiveChannel {
    generation: u64,
    close: CancellationToken,
}

struct ServeLoop<Req, Resp> {
    kind: Arc<str>,
    link: Arc<Link>,
    locks: Arc<dyn LockManager>,
    grace_period: Duration,
    handler: Arc<Handler<Req, Resp>>,
    abort: CancellationToken,
}

impl<Req, Resp> ServeLoop<Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    async fn run(self, ports: PortStream, detach: CancellationToken) {
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel::<(WeakPortRef, Envelope)>();
        let (done_tx, mut done) = mpsc::unbounded_channel::<(ChannelKey, u64)>();
        let mut ports = Some(ports);
        let mut subscriptions: Vec<Subscription> = Vec::new();
        let mut channels: HashMap<ChannelKey, ActiveChannel> = HashMap::new();
        let mut generation = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = detach.cancelled() => break,
                Some((key, finished)) = done.recv() => {
                    if channels.get(&key).is_some_and(|c| c.generation == finished) {
                        channels.remove(&key);
                    }
                }
                Some((port, envelope)) = inbox.recv() => {
                    let Some(port) = port.upgrade() else { continue };
                    let key = (port.id(), envelope.id.clone());
                    if envelope.is_close() {
                        if let Some(active) = channels.get(&key) {
                            active.close.cancel();
                        }
                        continue;
                    }
                    if channels.contains_key(&key) {
                        debug!(protocol = %self.kind, port = %key.0, channel = %key.1, "duplicate request ignored");
                        continue;
                    }
                    generation += 1;
                    let close = CancellationToken::new();
                    channels.insert(key.clone(), ActiveChannel { generation, close: close.clone() });
                    let channel = ReplyChannel {
                        kind: self.kind.clone(),
                        link: self.link.clone(),
                        port: Arc::downgrade(&port),
                        id: envelope.id.clone(),
                        close,
                        abort: self.abort.clone(),
                        requester_gone: self.watch_requester(&key.1),
                    };
                    let accept = self.accept(port.id(), envelope);
                    let done = done_tx.clone();
                    let finished = generation;
                    tokio::spawn(async move {
                        channel.serve(accept).await;
                        let _ = done.send((key, finished));
                    });
                }
                port = next_port(&mut ports), if ports.is_some() => match port {
                    Some(port) => subscriptions.push(self.listen(&port, inbox_tx.clone())),
                    None => ports = None,
                },
            }
        }

        debug!(protocol = %self.kind, ports = subscriptions.len(), active = channels.len(), "responder detached");
    }

    fn listen(
        &self,
        port: &PortRef,
        inbox: mpsc::UnboundedSender<(WeakPortRef, Envelope)>,
    ) -> Subscription {
        let kind = self.kind.clone();
        let weak = Arc::downgrade(port);
        trace!(protocol = %self.kind, port = %port.id(), "listening for requests");
        self.link.subscribe(port, move |envelope| {
            if envelope.kind == *kind {
                let _ = inbox.send((weak.clone(), envelope));
            }
        })
    }

    /// Take the response lock and ask the handler. `None` means declined,
    /// in which case the lock is already released.
    fn accept(
        &self,
        port: PortId,
        envelope: Envelope,
    ) -> impl Future<Output = Option<(LockGuard, ReplyStream<Resp>)>> + Send + 'static {
        let lock = self.locks.acquire(&envelope.id.response_lock_name());
        let handler = self.handler.clone();
        let kind = self.kind.clone();
        async move {
            let lock = lock.await;

            let request: Req = match envelope.decode_payload() {
                Ok(request) => request,
                Err(err) => {
                    warn!(protocol = %kind, port = %port, channel = %envelope.id, error = %err, "undecodable request declined");
                    return None;
                }
            };

            match handler(request) {
                Some(stream) => {
                    debug!(protocol = %kind, port = %port, channel = %envelope.id, "request accepted");
                    Some((lock, stream))
                }
                None => {
                    debug!(protocol = %kind, port = %port, channel = %envelope.id, "request declined");
                    None
                }
            }
        }
    }

    /// Resolves once the requester's lock was released and the grace period
    /// passed.
    fn watch_requester(&self, id: &ChannelId) -> BoxFuture<'static, ()> {
        let released = self.locks.on_release(&id.request_lock_name());
        let grace = self.grace_period;
        Box::pin(async move {
            released.await;
            tokio::time::sleep(grace).await;
        })
    }
}

/// State of one accepted request.
struct ReplyChannel {
    kind: Arc<str>,
    link: Arc<Link>,
    port: WeakPortRef,
    id: ChannelId,
    close: CancellationToken,
    abort: CancellationToken,
    requester_gone: BoxFuture<'static, ()>,
}

impl ReplyChannel {
    /// Wait for `accept`, then stream the reply. A close or stop arriving
    /// before the request is accepted drops it without a reply.
    async fn serve<Resp, A>(self, accept: A)
    where
        Resp: Serialize + Send + 'static,
        A: Future<Output = Option<(LockGuard, ReplyStream<Resp>)>>,
    {
        let accepted = tokio::select! {
            biased;
            _ = self.close.cancelled() => None,
            _ = self.abort.cancelled() => None,
            accepted = accept => accepted,
        };
        match accepted {
            Some(reply) => self.run(reply).await,
            None => trace!(protocol = %self.kind, channel = %self.id, "request not accepted"),
        }
    }

    async fn run<Resp>(mut self, (lock, mut stream): (LockGuard, ReplyStream<Resp>))
    where
        Resp: Serialize + Send + 'static,
    {
        let reason = loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => break "closed by requester",
                _ = self.abort.cancelled() => {
                    self.send(Notification::<Resp>::error(ABORT_CHANNEL));
                    break "aborted";
                }
                _ = &mut self.requester_gone => break "requester lost",
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        if !self.send(Notification::next(value)) {
                            break "reply not encodable";
                        }
                    }
                    Some(Err(err)) => {
                        self.send(Notification::<Resp>::error(err.to_string()));
                        break "failed";
                    }
                    None => {
                        self.send(Notification::<Resp>::Complete);
                        break "complete";
                    }
                },
            }
        };

        drop(stream);
        lock.release();
        debug!(protocol = %self.kind, channel = %self.id, reason, "reply channel finished");
    }

    /// Dispatch one notification. Returns `false` if it could not be
    /// encoded, after telling the requester.
    fn send<Resp: Serialize>(&self, notification: Notification<Resp>) -> bool {
        let Some(port) = self.port.upgrade() else {
            return true;
        };
        let (payload, encoded) = match serde_json::to_value(&notification) {
            Ok(payload) => (payload, true),
            Err(err) => {
                warn!(protocol = %self.kind, channel = %self.id, error = %err, "reply not encodable");
                let fallback = Notification::<()>::error(err.to_string());
                match serde_json::to_value(&fallback) {
                    Ok(payload) => (payload, false),
                    Err(_) => return false,
                }
            }
        };
        self.link
            .dispatch(&port, &Envelope::new(self.id.clone(), &*self.kind, payload));
        encoded
    }
}

async fn next_port(ports: &mut Option<PortStream>) -> Option<PortRef> {
    match ports {
        Some(ports) => ports.next().await,
        None => std::future::pending().await,
    }
}
