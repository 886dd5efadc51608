//! The remoting context.
//!
//! Every process-wide service lives here and is injected into the components
//! that need it: the transport registry, the codec, the client invoker
//! registry with its deferred-destruction timer, the lease timer and the
//! connector registry. Nothing is reachable through ambient global state, so
//! two contexts in one process (or one test) never interfere.

use std::sync::Arc;

use remora_client::Client;
use remora_client::InvokerRegistry;
use remora_core::Codec;
use remora_core::Configuration;
use remora_core::InvokerLocator;
use remora_core::JsonCodec;
use remora_core::RemotingConfig;
use remora_core::Result;
use remora_lease::TimerService;
use remora_server::Connector;
use remora_server::ConnectorRegistry;
use remora_server::ServerServices;
use remora_transport::LocalNetwork;
use remora_transport::LocalTransport;
use remora_transport::Transport;
use remora_transport::TransportRegistry;
use tracing::info;

/// Owner of the shared remoting services.
pub struct Remoting {
    config: RemotingConfig,
    network: LocalNetwork,
    transports: Arc<TransportRegistry>,
    codec: Arc<dyn Codec>,
    lease_timer: TimerService,
    invokers: Arc<InvokerRegistry>,
    connectors: Arc<ConnectorRegistry>,
}

impl Remoting {
    /// Context with default settings and the `local` transport registered.
    pub fn new() -> Self {
        Self::build(RemotingConfig::default())
    }

    /// Context with `config` as process defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` is out of bounds.
    pub fn with_config(config: RemotingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    /// Context with defaults overridden by `REMORA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::with_config(RemotingConfig::load()?)
    }

    fn build(config: RemotingConfig) -> Self {
        let network = LocalNetwork::new();
        let transports = Arc::new(TransportRegistry::new());
        transports.register(Arc::new(LocalTransport::new(network.clone())));
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec);
        let lease_timer = TimerService::new("lease");
        let invokers = InvokerRegistry::new(
            transports.clone(),
            codec.clone(),
            lease_timer.clone(),
            TimerService::new("invoker-destruction"),
        );
        info!(codec = codec.name(), transports = ?transports.names(), "remoting context created");
        Self {
            config,
            network,
            transports,
            codec,
            lease_timer,
            invokers,
            connectors: Arc::new(ConnectorRegistry::new()),
        }
    }

    /// Create a disconnected client for `locator`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for malformed settings.
    pub fn client(&self, locator: InvokerLocator, config: Configuration) -> Result<Client> {
        Client::new(locator, &config, &self.config, self.invokers.clone())
    }

    /// Create an unstarted connector for `locator`.
    ///
    /// # Errors
    ///
    /// - `Configuration` if a connector for an equivalent locator exists
    /// - `InvalidConfig` / `UnknownTransport` for a bad locator
    pub fn connector(&self, locator: InvokerLocator, config: Configuration) -> Result<Connector> {
        Connector::create(locator, config, self.server_services(), self.connectors.clone())
    }

    fn server_services(&self) -> ServerServices {
        ServerServices {
            transports: self.transports.clone(),
            codec: self.codec.clone(),
            client_registry: self.invokers.clone(),
            lease_timer: self.lease_timer.clone(),
            defaults: self.config.clone(),
        }
    }

    /// Make another transport available, returning the one it replaced.
    pub fn register_transport(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        self.transports.register(transport)
    }

    /// In-process network behind the `local` transport.
    pub fn local_network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn config(&self) -> &RemotingConfig {
        &self.config
    }

    pub fn invoker_registry(&self) -> &Arc<InvokerRegistry> {
        &self.invokers
    }

    pub fn connector_registry(&self) -> &Arc<ConnectorRegistry> {
        &self.connectors
    }

    pub fn lease_timer(&self) -> &TimerService {
        &self.lease_timer
    }

    /// Destroy every client invoker, pending destructions included.
    /// Connectors are owned by their creators and destroyed by them.
    pub async fn shutdown(&self) {
        self.invokers.shutdown().await;
        info!("remoting context shut down");
    }
}

impl Default for Remoting {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Remoting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remoting")
            .field("transports", &self.transports.names())
            .field("invokers", &self.invokers)
            .field("connectors", &self.connectors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use remora_core::RemotingError;

    use super::*;

    #[test]
    fn test_with_config_rejects_out_of_range_values() {
        let config = RemotingConfig {
            max_pool_size: 0,
            ..RemotingConfig::default()
        };
        assert!(matches!(Remoting::with_config(config), Err(RemotingError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_unknown_transport_is_reported_at_connector_creation() {
        let remoting = Remoting::new();
        let locator = InvokerLocator::parse("socket://server:1/").unwrap();
        let result = remoting.connector(locator, Configuration::new());
        assert!(matches!(result, Err(RemotingError::UnknownTransport { .. })));
    }
}
