//! Pluggable connection providers for remora.
//!
//! A [`Transport`] knows how to connect to a locator and how to bind a
//! listening endpoint. Client invokers only see [`Connection`]s; server
//! invokers only see a [`Binding`] that feeds frames to their
//! [`FrameHandler`]. Wire marshalling is done above this layer.
//!
//! The [`local`] transport is an in-process network used by tests and by
//! applications that host client and server in one process.

pub mod local;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use remora_core::InvokerLocator;
use remora_core::RemotingError;
use remora_core::TransportError;
use tracing::debug;

pub use local::LocalNetwork;
pub use local::LocalTransport;

/// One physical connection to a remote endpoint.
///
/// A connection carries one request at a time: `send` a frame, then
/// `receive` its response. Concurrency comes from pooling connections.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Send one request frame.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Receive the response to the last sent frame.
    async fn receive(&self) -> Result<Bytes, TransportError>;

    /// Close the connection. Idempotent.
    async fn close(&self);

    /// Whether the connection can still be used.
    fn is_open(&self) -> bool;

    /// `host:port` of the remote endpoint.
    fn remote_address(&self) -> &str;
}

/// Receiver of request frames on a bound endpoint.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Turn one request frame into one response frame.
    async fn handle_frame(&self, frame: Bytes) -> Result<Bytes, TransportError>;
}

/// A listening endpoint. Closing or dropping it unbinds the address.
pub trait Binding: Send + Sync {
    /// Bound `host:port`.
    fn address(&self) -> &str;

    /// Stop accepting connections. Idempotent.
    fn close(&self);
}

/// Connection provider for one transport name.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name as it appears in locators.
    fn name(&self) -> &str;

    /// Open a connection to the endpoint named by `locator`.
    async fn connect(&self, locator: &InvokerLocator) -> Result<Box<dyn Connection>, TransportError>;

    /// Bind a listening endpoint at `locator` that feeds `handler`.
    async fn bind(
        &self,
        locator: &InvokerLocator,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Box<dyn Binding>, TransportError>;
}

/// Transports available to a remoting context, keyed by name.
#[derive(Default)]
pub struct TransportRegistry {
    transports: RwLock<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport under its name, returning the one it replaced.
    pub fn register(&self, transport: Arc<dyn Transport>) -> Option<Arc<dyn Transport>> {
        let name = transport.name().to_ascii_lowercase();
        debug!(transport = %name, "registering transport");
        self.transports.write().insert(name, transport)
    }

    /// Transport serving `locator`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTransport` if nothing is registered under the
    /// locator's transport name.
    pub fn resolve(&self, locator: &InvokerLocator) -> Result<Arc<dyn Transport>, RemotingError> {
        self.get(locator.transport()).ok_or_else(|| RemotingError::UnknownTransport {
            transport: locator.transport().to_string(),
        })
    }

    /// Transport by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Transport>> {
        self.transports.read().get(&name.to_ascii_lowercase()).cloned()
    }

    /// Registered transport names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.transports.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry").field("transports", &self.names()).finish()
    }
}
