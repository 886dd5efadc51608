//! Pooled physical connections of one client invoker.
//!
//! Each in-flight invocation checks out one connection. The pool is bounded
//! by `maxPoolSize` permits; callers wait up to `poolWaitTimeout` for a free
//! permit, then reuse an idle connection or open a new one within
//! `connectTimeout`.
//!
//! Tiger Style: bounded connection count, bounded waits, RAII return.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use remora_core::InvokerLocator;
use remora_core::RemotingError;
use remora_core::Result;
use remora_transport::Connection;
use remora_transport::Transport;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tracing::debug;
use tracing::trace;

/// Bounded set of connections to one locator.
pub struct ConnectionPool {
    locator: InvokerLocator,
    transport: Arc<dyn Transport>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    active: AtomicU32,
    max_size: u32,
    connect_timeout: Duration,
    pool_wait_timeout: Duration,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Create an empty pool. Connections are opened lazily.
    pub fn new(
        locator: InvokerLocator,
        transport: Arc<dyn Transport>,
        max_size: u32,
        connect_timeout: Duration,
        pool_wait_timeout: Duration,
    ) -> Self {
        Self {
            locator,
            transport,
            permits: Arc::new(Semaphore::new(max_size as usize)),
            idle: Mutex::new(Vec::new()),
            active: AtomicU32::new(0),
            max_size,
            connect_timeout,
            pool_wait_timeout,
            closed: AtomicBool::new(false),
        }
    }

    /// Check out a connection.
    ///
    /// # Errors
    ///
    /// - `Timeout` if no permit frees up within the pool wait timeout or the
    ///   connect does not finish within the connect timeout
    /// - `ConnectionFailed` if the transport refuses the connection
    /// - `NotConnected` if the pool is closed
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = match tokio::time::timeout(self.pool_wait_timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(self.closed_error()),
            Err(_) => {
                return Err(RemotingError::Timeout {
                    operation: format!("connection pool checkout for {}", self.locator),
                    timeout_ms: self.pool_wait_timeout.as_millis() as u64,
                });
            }
        };

        let reused = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(connection) = idle.pop() {
                if connection.is_open() {
                    found = Some(connection);
                    break;
                }
            }
            found
        };

        let connection = match reused {
            Some(connection) => {
                trace!(locator = %self.locator, "reusing pooled connection");
                connection
            }
            None => self.open().await?,
        };

        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(locator = %self.locator, active, max = self.max_size, "connection checked out");
        Ok(PooledConnection {
            connection: Some(connection),
            pool: Arc::clone(self),
            reusable: true,
            _permit: permit,
        })
    }

    async fn open(&self) -> Result<Box<dyn Connection>> {
        match tokio::time::timeout(self.connect_timeout, self.transport.connect(&self.locator)).await {
            Ok(Ok(connection)) => {
                debug!(locator = %self.locator, "connection opened");
                Ok(connection)
            }
            Ok(Err(source)) => Err(RemotingError::ConnectionFailed {
                locator: self.locator.uri(),
                source,
            }),
            Err(_) => Err(RemotingError::Timeout {
                operation: format!("connect to {}", self.locator),
                timeout_ms: self.connect_timeout.as_millis() as u64,
            }),
        }
    }

    /// Close the pool and every idle connection. Checked-out connections
    /// are closed when they come back.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let idle: Vec<Box<dyn Connection>> = std::mem::take(&mut *self.idle.lock());
        let count = idle.len();
        for connection in idle {
            connection.close().await;
        }
        debug!(locator = %self.locator, closed = count, "connection pool closed");
    }

    /// Whether the pool is closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connections waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().len()
    }

    /// Connections currently checked out.
    pub fn active_connections(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    /// Maximum simultaneously checked out connections.
    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    fn closed_error(&self) -> RemotingError {
        RemotingError::NotConnected {
            reason: format!("connection pool for {} is closed", self.locator),
        }
    }

    fn give_back(&self, connection: Box<dyn Connection>, reusable: bool) {
        if reusable && connection.is_open() && !self.is_closed() {
            self.idle.lock().push(connection);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { connection.close().await });
            }
            Err(_) => drop(connection),
        }
    }
}

/// A checked-out connection. Returns to the pool on drop.
pub struct PooledConnection {
    connection: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
    reusable: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// The underlying connection.
    pub fn connection(&self) -> Option<&dyn Connection> {
        self.connection.as_deref()
    }

    /// Do not return this connection to the pool; it is closed instead.
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(connection) = self.connection.take() {
            self.pool.give_back(connection, self.reusable);
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use remora_core::TransportError;
    use remora_transport::FrameHandler;
    use remora_transport::LocalNetwork;
    use remora_transport::LocalTransport;

    use super::*;

    struct Echo;

    #[async_trait]
    impl FrameHandler for Echo {
        async fn handle_frame(&self, frame: Bytes) -> std::result::Result<Bytes, TransportError> {
            Ok(frame)
        }
    }

    fn locator() -> InvokerLocator {
        InvokerLocator::parse("local://pool:1/").unwrap()
    }

    fn pool(network: &LocalNetwork, max: u32) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            locator(),
            Arc::new(LocalTransport::new(network.clone())),
            max,
            Duration::from_millis(100),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connections_are_reused() {
        let network = LocalNetwork::new();
        let _binding = LocalTransport::new(network.clone()).bind(&locator(), Arc::new(Echo)).await.unwrap();
        let pool = pool(&network, 2);

        drop(pool.acquire().await.unwrap());
        drop(pool.acquire().await.unwrap());
        assert_eq!(network.connect_count("pool:1"), 1);
        assert_eq!(pool.idle_connections(), 1);
        assert_eq!(pool.active_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let network = LocalNetwork::new();
        let _binding = LocalTransport::new(network.clone()).bind(&locator(), Arc::new(Echo)).await.unwrap();
        let pool = pool(&network, 1);

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.err().unwrap();
        assert!(err.is_timeout());
        drop(held);
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discarded_connection_is_not_reused() {
        let network = LocalNetwork::new();
        let _binding = LocalTransport::new(network.clone()).bind(&locator(), Arc::new(Echo)).await.unwrap();
        let pool = pool(&network, 2);

        let mut conn = pool.acquire().await.unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.idle_connections(), 0);
        drop(pool.acquire().await.unwrap());
        assert_eq!(network.connect_count("pool:1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failures_are_classified() {
        let network = LocalNetwork::new();
        let pool = pool(&network, 1);
        let refused = pool.acquire().await.err().unwrap();
        assert!(matches!(refused, RemotingError::ConnectionFailed { .. }));

        let _binding = LocalTransport::new(network.clone()).bind(&locator(), Arc::new(Echo)).await.unwrap();
        network.set_reachable("pool:1", false);
        let hung = pool.acquire().await.err().unwrap();
        assert!(hung.is_timeout());

        pool.close_all().await;
        assert!(matches!(pool.acquire().await.err().unwrap(), RemotingError::NotConnected { .. }));
    }
}
