use std::sync::Arc;

use portmux_transport::Hub;

use crate::config::{ConfigError, ProtocolConfig};
use crate::link::Link;
use crate::locks::{LocalLockManager, LockManager};
use crate::source::PortRegistry;

/// Shared state behind every requester and responder of one application:
/// the envelope link with its per-port tables, the lock manager and the
/// tunables.
pub struct Services {
    link: Arc<Link>,
    locks: Arc<dyn LockManager>,
    config: ProtocolConfig,
}

impl Services {
    pub fn new(config: ProtocolConfig, locks: Arc<dyn LockManager>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            link: Arc::new(Link::new(&config)),
            locks,
            config,
        })
    }

    /// Default configuration with an in-process lock manager.
    pub fn local() -> Self {
        let config = ProtocolConfig::default();
        Self {
            link: Arc::new(Link::new(&config)),
            locks: Arc::new(LocalLockManager::new()),
            config,
        }
    }

    pub fn link(&self) -> &Arc<Link> {
        &self.link
    }

    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Build a registry of every peer connecting to `hub` from now on.
    ///
    /// Ports the hub reports disconnected leave the registry and their
    /// readiness and outbox state is dropped. Must be called from within a
    /// tokio runtime.
    pub fn watch_hub(&self, hub: &dyn Hub) -> PortRegistry {
        let registry = PortRegistry::new();
        let link = Arc::downgrade(&self.link);
        registry.attach(hub, move |id| {
            if let Some(link) = link.upgrade() {
                link.forget(id);
            }
        });
        registry
    }

    /// Drop all cached readiness and outbox state.
    pub fn reset(&self) {
        self.link.reset();
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("link", &self.link)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use portmux_envelope::{ChannelId, Envelope};
    use portmux_transport::{MemoryHub, Port, PortRef};
    use serde_json::json;

    use super::*;

    #[test]
    fn new_rejects_invalid_config() {
        let config = ProtocolConfig {
            probe_interval: Duration::ZERO,
            ..ProtocolConfig::default()
        };
        assert!(Services::new(config, Arc::new(LocalLockManager::new())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_hub_forgets_disconnected_ports() {
        let services = Services::local();
        let hub = MemoryHub::new();
        let registry = services.watch_hub(&hub);
        let mut ports = registry.ports();

        let client = hub.connect();
        let hub_side = ports.next().await.unwrap();
        // peer never answers, so the hub side stays pending
        services
            .link()
            .dispatch(&hub_side, &Envelope::new(ChannelId::from("c"), "t", json!(1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(services.link().readiness().is_pending(hub_side.id()));

        hub.disconnect(client.id());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(!services.link().readiness().is_pending(hub_side.id()));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_link_state() {
        let services = Services::local();
        let (left, _right) = portmux_transport::MemoryPort::pair();
        let left: PortRef = left;
        services
            .link()
            .dispatch(&left, &Envelope::new(ChannelId::from("c"), "t", json!(1)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(services.link().readiness().is_pending(left.id()));

        services.reset();
        assert!(!services.link().readiness().is_pending(left.id()));
    }
}
