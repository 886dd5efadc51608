//! Connectors: the user-facing server endpoint.
//!
//! A [`Connector`] owns one [`ServerInvoker`]. The [`ConnectorRegistry`]
//! refuses a second live connector for an equivalent locator, which would
//! make dispatch on the shared bind address ambiguous.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use remora_core::Configuration;
use remora_core::InvokerLocator;
use remora_core::LocatorKey;
use remora_core::RemotingError;
use remora_core::Result;
use remora_core::ServerInvocationHandler;
use remora_lease::ConnectionListener;
use tracing::debug;
use tracing::info;

use crate::server_invoker::ServerInvoker;
use crate::server_invoker::ServerServices;
use crate::server_invoker::ServerState;

/// Live server invokers keyed by locator signature.
#[derive(Default)]
pub struct ConnectorRegistry {
    servers: Mutex<HashMap<LocatorKey, Weak<ServerInvoker>>>,
}

impl ConnectorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the signature of `server`'s locator.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if a live, undestroyed server already holds it.
    pub fn register(&self, server: &Arc<ServerInvoker>) -> Result<()> {
        let key = server.locator().key(false);
        let mut servers = self.servers.lock();
        let taken = servers
            .get(&key)
            .and_then(Weak::upgrade)
            .is_some_and(|existing| existing.state() != ServerState::Destroyed);
        if taken {
            return Err(RemotingError::Configuration {
                reason: format!("a connector for {key} already exists"),
            });
        }
        servers.insert(key.clone(), Arc::downgrade(server));
        debug!(key = %key, "connector registered");
        Ok(())
    }

    /// Release the signature held by `server`.
    pub fn unregister(&self, server: &Arc<ServerInvoker>) -> bool {
        let key = server.locator().key(false);
        let mut servers = self.servers.lock();
        let held = servers.get(&key).is_some_and(|current| std::ptr::eq(current.as_ptr(), Arc::as_ptr(server)));
        if held {
            servers.remove(&key);
        }
        held
    }

    /// Number of live connectors.
    pub fn len(&self) -> usize {
        self.servers.lock().values().filter(|server| server.strong_count() > 0).count()
    }

    /// Whether no connector is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry").field("live", &self.len()).finish()
    }
}

/// A server endpoint on one locator.
pub struct Connector {
    server: Arc<ServerInvoker>,
    registry: Arc<ConnectorRegistry>,
}

impl Connector {
    /// Create a connector; it accepts invocations after [`Connector::start`].
    ///
    /// # Errors
    ///
    /// - `Configuration` if a connector for an equivalent locator exists
    /// - `InvalidConfig` / `UnknownTransport` from server invoker creation
    pub fn create(
        locator: InvokerLocator,
        config: Configuration,
        services: ServerServices,
        registry: Arc<ConnectorRegistry>,
    ) -> Result<Self> {
        let server = ServerInvoker::new(locator, config, services)?;
        registry.register(&server)?;
        info!(locator = %server.locator(), "connector created");
        Ok(Self { server, registry })
    }

    /// Bind the locator and begin accepting invocations.
    pub async fn start(&self) -> Result<()> {
        self.server.start().await
    }

    /// Stop accepting invocations; the connector can be started again.
    pub fn stop(&self) {
        self.server.stop();
    }

    /// Destroy the server invoker and release the locator.
    pub async fn destroy(&self) {
        self.server.destroy().await;
        self.registry.unregister(&self.server);
    }

    /// Register `handler` for `subsystem`, returning the replaced handler.
    pub fn add_invocation_handler(
        &self,
        subsystem: &str,
        handler: Arc<dyn ServerInvocationHandler>,
    ) -> Option<Arc<dyn ServerInvocationHandler>> {
        self.server.add_invocation_handler(subsystem, handler)
    }

    /// Unregister the handler for `subsystem`.
    pub fn remove_invocation_handler(&self, subsystem: &str) -> Option<Arc<dyn ServerInvocationHandler>> {
        self.server.remove_invocation_handler(subsystem)
    }

    /// Register a listener told when a leasing client is lost.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.server.add_connection_listener(listener)
    }

    /// Unregister a connection listener.
    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.server.remove_connection_listener(listener)
    }

    /// Locator this connector serves.
    pub fn locator(&self) -> &InvokerLocator {
        self.server.locator()
    }

    /// The server invoker behind this connector.
    pub fn server_invoker(&self) -> &Arc<ServerInvoker> {
        &self.server
    }

    /// Whether the connector accepts invocations.
    pub fn is_started(&self) -> bool {
        self.server.state() == ServerState::Started
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").field("server", &self.server).finish()
    }
}

#[cfg(test)]
mod tests {
    use remora_client::InvokerRegistry;
    use remora_core::Codec;
    use remora_core::JsonCodec;
    use remora_core::RemotingConfig;
    use remora_lease::TimerService;
    use remora_transport::LocalNetwork;
    use remora_transport::LocalTransport;
    use remora_transport::TransportRegistry;

    use super::*;

    fn services(network: &LocalNetwork) -> ServerServices {
        let transports = Arc::new(TransportRegistry::new());
        transports.register(Arc::new(LocalTransport::new(network.clone())));
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        ServerServices {
            client_registry: InvokerRegistry::new(
                transports.clone(),
                codec.clone(),
                TimerService::new("lease"),
                TimerService::new("destruction"),
            ),
            transports,
            codec,
            lease_timer: TimerService::new("lease"),
            defaults: RemotingConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_equivalent_locator_is_rejected_until_destroyed() {
        let network = LocalNetwork::new();
        let registry = Arc::new(ConnectorRegistry::new());
        let locator = InvokerLocator::parse("local://server:7/").unwrap();

        let first =
            Connector::create(locator.clone(), Configuration::new(), services(&network), registry.clone()).unwrap();
        first.start().await.unwrap();
        assert!(network.is_bound("server:7"));

        let equivalent = InvokerLocator::parse("local://SERVER:7/?timeout=5").unwrap();
        let duplicate = Connector::create(equivalent.clone(), Configuration::new(), services(&network), registry.clone());
        assert!(matches!(duplicate, Err(RemotingError::Configuration { .. })));

        first.destroy().await;
        assert!(!network.is_bound("server:7"));
        assert!(registry.is_empty());
        let second = Connector::create(equivalent, Configuration::new(), services(&network), registry).unwrap();
        second.start().await.unwrap();
    }
}
