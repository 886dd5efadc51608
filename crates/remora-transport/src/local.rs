//! In-process transport.
//!
//! A [`LocalNetwork`] is a directory of bound endpoints keyed by
//! `host:port`. Connections deliver frames straight to the bound
//! [`FrameHandler`]. Endpoints can be marked unreachable: connects and sends
//! then hang until the endpoint becomes reachable again or is unbound, the
//! way a silently dropped network path behaves, so callers' timeouts decide
//! how long they wait.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use parking_lot::RwLock;
use remora_core::InvokerLocator;
use remora_core::TransportError;
use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use crate::Binding;
use crate::Connection;
use crate::FrameHandler;
use crate::Transport;

/// Transport name of the in-process transport.
pub const LOCAL_TRANSPORT: &str = "local";

#[derive(Clone)]
struct Endpoint {
    binding_id: u64,
    handler: Arc<dyn FrameHandler>,
    reachable: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: RwLock<HashMap<String, Endpoint>>,
    connects: Mutex<HashMap<String, u64>>,
    next_binding_id: AtomicU64,
}

/// Shared in-process network. Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

impl LocalNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a bound endpoint reachable or unreachable.
    ///
    /// Returns false if nothing is bound at `address`.
    pub fn set_reachable(&self, address: &str, reachable: bool) -> bool {
        let endpoints = self.inner.endpoints.read();
        match endpoints.get(&normalize(address)) {
            Some(endpoint) => {
                info!(address, reachable, "local endpoint reachability changed");
                endpoint.reachable.send_replace(reachable);
                true
            }
            None => false,
        }
    }

    /// Whether an endpoint is bound at `address`.
    pub fn is_bound(&self, address: &str) -> bool {
        self.inner.endpoints.read().contains_key(&normalize(address))
    }

    /// Bound addresses, sorted.
    pub fn bound_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.inner.endpoints.read().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Number of connections ever opened to `address`.
    pub fn connect_count(&self, address: &str) -> u64 {
        self.inner.connects.lock().get(&normalize(address)).copied().unwrap_or(0)
    }

    fn endpoint(&self, address: &str) -> Option<Endpoint> {
        self.inner.endpoints.read().get(address).cloned()
    }

    fn reachability(&self, address: &str) -> Option<watch::Receiver<bool>> {
        self.inner.endpoints.read().get(address).map(|e| e.reachable.subscribe())
    }

    fn unbind(&self, address: &str, binding_id: u64) {
        let mut endpoints = self.inner.endpoints.write();
        if endpoints.get(address).is_some_and(|e| e.binding_id == binding_id) {
            endpoints.remove(address);
            debug!(address, "local endpoint unbound");
        }
    }
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork").field("bound", &self.bound_addresses()).finish()
    }
}

fn normalize(address: &str) -> String {
    address.to_ascii_lowercase()
}

/// Waits until the endpoint is reachable. Fails if it is unbound meanwhile.
async fn wait_reachable(mut reachable: watch::Receiver<bool>, address: &str) -> Result<(), TransportError> {
    let is_reachable = *reachable.borrow();
    if is_reachable {
        return Ok(());
    }
    debug!(address, "local endpoint unreachable, waiting");
    reachable.wait_for(|r| *r).await.map(|_| ()).map_err(|_| TransportError::Closed {
        address: address.to_string(),
    })
}

/// [`Transport`] over a [`LocalNetwork`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    network: LocalNetwork,
}

impl LocalTransport {
    /// Transport over `network`.
    pub fn new(network: LocalNetwork) -> Self {
        Self { network }
    }

    /// The underlying network.
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn name(&self) -> &str {
        LOCAL_TRANSPORT
    }

    async fn connect(&self, locator: &InvokerLocator) -> Result<Box<dyn Connection>, TransportError> {
        let address = normalize(&locator.address());
        let reachable = self.network.reachability(&address).ok_or_else(|| TransportError::Unreachable {
            address: address.clone(),
        })?;
        wait_reachable(reachable, &address).await?;

        *self.network.inner.connects.lock().entry(address.clone()).or_insert(0) += 1;
        debug!(address = %address, "local connection opened");
        Ok(Box::new(LocalConnection {
            address,
            network: self.network.clone(),
            open: AtomicBool::new(true),
            responses: Mutex::new(VecDeque::new()),
        }))
    }

    async fn bind(
        &self,
        locator: &InvokerLocator,
        handler: Arc<dyn FrameHandler>,
    ) -> Result<Box<dyn Binding>, TransportError> {
        let address = normalize(&locator.address());
        let binding_id = self.network.inner.next_binding_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut endpoints = self.network.inner.endpoints.write();
            if endpoints.contains_key(&address) {
                return Err(TransportError::AddressInUse { address });
            }
            let (reachable, _) = watch::channel(true);
            endpoints.insert(address.clone(), Endpoint {
                binding_id,
                handler,
                reachable: Arc::new(reachable),
            });
        }
        info!(address = %address, "local endpoint bound");
        Ok(Box::new(LocalBinding {
            address,
            binding_id,
            network: self.network.clone(),
        }))
    }
}

struct LocalConnection {
    address: String,
    network: LocalNetwork,
    open: AtomicBool,
    responses: Mutex<VecDeque<Bytes>>,
}

impl LocalConnection {
    fn closed(&self) -> TransportError {
        TransportError::Closed {
            address: self.address.clone(),
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(self.closed());
        }
        let Some(reachable) = self.network.reachability(&self.address) else {
            self.open.store(false, Ordering::Release);
            return Err(self.closed());
        };
        wait_reachable(reachable, &self.address).await?;
        let Some(endpoint) = self.network.endpoint(&self.address) else {
            self.open.store(false, Ordering::Release);
            return Err(self.closed());
        };

        let response = endpoint.handler.handle_frame(frame).await?;
        self.responses.lock().push_back(response);
        Ok(())
    }

    async fn receive(&self) -> Result<Bytes, TransportError> {
        self.responses.lock().pop_front().ok_or_else(|| self.closed())
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.responses.lock().clear();
            debug!(address = %self.address, "local connection closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn remote_address(&self) -> &str {
        &self.address
    }
}

struct LocalBinding {
    address: String,
    binding_id: u64,
    network: LocalNetwork,
}

impl Binding for LocalBinding {
    fn address(&self) -> &str {
        &self.address
    }

    fn close(&self) {
        self.network.unbind(&self.address, self.binding_id);
    }
}

impl Drop for LocalBinding {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Upper;

    #[async_trait]
    impl FrameHandler for Upper {
        async fn handle_frame(&self, frame: Bytes) -> Result<Bytes, TransportError> {
            Ok(Bytes::from(frame.to_ascii_uppercase()))
        }
    }

    fn locator() -> InvokerLocator {
        InvokerLocator::parse("local://server:7000/").unwrap()
    }

    #[tokio::test]
    async fn test_send_receive_through_bound_handler() {
        let network = LocalNetwork::new();
        let transport = LocalTransport::new(network.clone());
        let _binding = transport.bind(&locator(), Arc::new(Upper)).await.unwrap();

        let connection = transport.connect(&locator()).await.unwrap();
        connection.send(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(connection.receive().await.unwrap(), Bytes::from_static(b"ABC"));
        assert_eq!(network.connect_count("server:7000"), 1);
    }

    #[tokio::test]
    async fn test_connect_to_unbound_address_is_refused() {
        let transport = LocalTransport::new(LocalNetwork::new());
        let err = transport.connect(&locator()).await.err().unwrap();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_bind_is_rejected_and_drop_unbinds() {
        let network = LocalNetwork::new();
        let transport = LocalTransport::new(network.clone());
        let binding = transport.bind(&locator(), Arc::new(Upper)).await.unwrap();
        let err = transport.bind(&locator(), Arc::new(Upper)).await.err().unwrap();
        assert!(matches!(err, TransportError::AddressInUse { .. }));

        drop(binding);
        assert!(!network.is_bound("server:7000"));
        assert!(transport.bind(&locator(), Arc::new(Upper)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_endpoint_hangs_until_restored() {
        let network = LocalNetwork::new();
        let transport = LocalTransport::new(network.clone());
        let _binding = transport.bind(&locator(), Arc::new(Upper)).await.unwrap();
        let connection = transport.connect(&locator()).await.unwrap();

        assert!(network.set_reachable("server:7000", false));
        let stalled = tokio::time::timeout(Duration::from_millis(100), connection.send(Bytes::from_static(b"x"))).await;
        assert!(stalled.is_err());

        network.set_reachable("server:7000", true);
        connection.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(connection.receive().await.unwrap(), Bytes::from_static(b"X"));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_send() {
        let network = LocalNetwork::new();
        let transport = LocalTransport::new(network);
        let binding = transport.bind(&locator(), Arc::new(Upper)).await.unwrap();
        let connection = transport.connect(&locator()).await.unwrap();

        binding.close();
        assert!(connection.send(Bytes::from_static(b"x")).await.is_err());
        assert!(!connection.is_open());
    }
}
