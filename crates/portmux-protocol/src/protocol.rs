use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::request::Requester;
use crate::response::Responder;
use crate::services::Services;
use crate::source::PortSource;

/// A named request/response protocol.
///
/// The name is the envelope `type`; it multiplexes independent protocols
/// over the same ports. Collisions are not detected: two protocols sharing
/// a port must use distinct names.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use portmux_protocol::{Protocol, PortSource, Services};
/// # fn demo(port: portmux_transport::PortRef) {
/// let services = Arc::new(Services::local());
/// let ping: Protocol<String, String> = Protocol::new("first", services);
/// let requester = ping.requester(PortSource::fixed(port));
/// let replies = requester.request(&"ping 1".to_string());
/// # drop(replies);
/// # }
/// ```
pub struct Protocol<Req, Resp> {
    name: Arc<str>,
    services: Arc<Services>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> Protocol<Req, Resp> {
    pub fn new(name: impl Into<Arc<str>>, services: Arc<Services>) -> Self {
        Self {
            name: name.into(),
            services,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }
}

impl<Req, Resp> Protocol<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + 'static,
    Resp: Serialize + DeserializeOwned + Send + 'static,
{
    /// Request side sending to `source`.
    pub fn requester(&self, source: PortSource) -> Requester<Req, Resp> {
        Requester::new(self.name.clone(), source, self.services.clone())
    }

    /// Response side answering requests from `source`.
    pub fn responder(&self, source: PortSource) -> Responder<Req, Resp> {
        Responder::new(self.name.clone(), source, self.services.clone())
    }
}

impl<Req, Resp> Clone for Protocol<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            services: self.services.clone(),
            _types: PhantomData,
        }
    }
}

impl<Req, Resp> std::fmt::Debug for Protocol<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol").field("name", &self.name).finish()
    }
}
