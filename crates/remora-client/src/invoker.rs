//! Client invoker: the connection-owning object on the client side.
//!
//! One invoker exists per pooling signature (see
//! [`remora_core::InvokerLocator::key`]) and is shared by every [`Client`]
//! facade addressing that locator. It owns the connection pool and, once a
//! leasing client connects, the [`LeasePinger`] of the physical connection.
//!
//! [`Client`]: crate::Client

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use remora_core::Codec;
use remora_core::InvocationKind;
use remora_core::InvocationRequest;
use remora_core::InvocationResponse;
use remora_core::InvokerLocator;
use remora_core::InvokerSettings;
use remora_core::LeaseAck;
use remora_core::LeaseEntry;
use remora_core::LocatorKey;
use remora_core::Payload;
use remora_core::RemotingError;
use remora_core::Result;
use remora_core::constants::INVOKER_SESSION_ID;
use remora_core::constants::MIN_LEASE_PERIOD_MS;
use remora_lease::ConnectionListener;
use remora_lease::LeasePinger;
use remora_lease::PingSender;
use remora_lease::TimerService;
use remora_transport::Transport;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::pool::ConnectionPool;

static NEXT_INVOKER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a client invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokerState {
    /// Created, not yet validated.
    Unconnected,
    /// Usable.
    Connected,
    /// Tearing down.
    Disconnecting,
    /// Gone for good.
    Destroyed,
}

/// Connection-owning client invoker for one locator.
pub struct ClientInvoker {
    id: u64,
    locator: InvokerLocator,
    key: LocatorKey,
    settings: InvokerSettings,
    codec: Arc<dyn Codec>,
    pool: Arc<ConnectionPool>,
    state: RwLock<InvokerState>,
    lease_timer: TimerService,
    pinger: Mutex<Option<Arc<LeasePinger>>>,
    weak_self: Weak<ClientInvoker>,
}

impl ClientInvoker {
    /// Create an unconnected invoker.
    pub fn new(
        locator: InvokerLocator,
        settings: InvokerSettings,
        transport: Arc<dyn Transport>,
        codec: Arc<dyn Codec>,
        lease_timer: TimerService,
    ) -> Arc<Self> {
        let key = locator.key(settings.use_all_params);
        let pool = Arc::new(ConnectionPool::new(
            locator.clone(),
            transport,
            settings.max_pool_size,
            settings.connect_timeout,
            settings.pool_wait_timeout,
        ));
        Arc::new_cyclic(|weak_self| Self {
            id: NEXT_INVOKER_ID.fetch_add(1, Ordering::Relaxed),
            locator,
            key,
            settings,
            codec,
            pool,
            state: RwLock::new(InvokerState::Unconnected),
            lease_timer,
            pinger: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Open and validate one pooled connection.
    ///
    /// # Errors
    ///
    /// Propagates connect failures; the invoker stays `Unconnected`.
    pub async fn connect(&self) -> Result<()> {
        match self.state() {
            InvokerState::Connected => return Ok(()),
            InvokerState::Unconnected => {}
            state => {
                return Err(RemotingError::NotConnected {
                    reason: format!("invoker {} is {state:?}", self.id),
                });
            }
        }
        drop(self.pool.acquire().await?);
        *self.state.write() = InvokerState::Connected;
        info!(invoker_id = self.id, locator = %self.locator, "client invoker connected");
        Ok(())
    }

    /// Send one request and wait for its response for at most `timeout`.
    ///
    /// Connection checkout is bounded separately by the pool wait and
    /// connect timeouts. A connection that fails or times out is discarded.
    pub async fn invoke(&self, request: InvocationRequest, timeout: Duration) -> Result<InvocationResponse> {
        if self.state() != InvokerState::Connected {
            return Err(RemotingError::NotConnected {
                reason: format!("invoker for {} is {:?}", self.locator, self.state()),
            });
        }
        let operation = request.kind_name();
        let frame = self.codec.encode_request(&request)?;

        let mut pooled = self.pool.acquire().await?;
        let exchange = async {
            let Some(connection) = pooled.connection() else {
                return Err(RemotingError::NotConnected {
                    reason: "pooled connection missing".to_string(),
                });
            };
            let locator = self.locator.uri();
            connection.send(frame).await.map_err(|source| RemotingError::ConnectionFailed {
                locator: locator.clone(),
                source,
            })?;
            connection.receive().await.map_err(|source| RemotingError::ConnectionFailed { locator, source })
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => {
                pooled.discard();
                return Err(error);
            }
            Err(_) => {
                pooled.discard();
                debug!(locator = %self.locator, operation, timeout_ms = timeout.as_millis() as u64, "invocation timed out");
                return Err(RemotingError::Timeout {
                    operation: operation.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };
        drop(pooled);
        self.codec.decode_response(&reply)
    }

    /// Like [`ClientInvoker::invoke`], but `timeout` also bounds connection
    /// checkout. Used for control traffic that must not outlive its bound.
    pub async fn invoke_bounded(&self, request: InvocationRequest, timeout: Duration) -> Result<InvocationResponse> {
        let operation = request.kind_name();
        match tokio::time::timeout(timeout, self.invoke(request, timeout)).await {
            Ok(response) => response,
            Err(_) => Err(RemotingError::Timeout {
                operation: operation.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Register a leasing logical client.
    ///
    /// Sends an initial lease ping so a failure surfaces synchronously. If the
    /// server has leasing disabled, nothing is registered and `None` is
    /// returned. Otherwise the client is added to this invoker's pinger
    /// (created and started on first use) and the ping period is returned.
    ///
    /// # Errors
    ///
    /// Returns `LeaseSetupFailed` if the initial ping fails.
    pub async fn add_lease_client(
        &self,
        session_id: &str,
        listener: Arc<dyn ConnectionListener>,
        requested_period: Option<Duration>,
    ) -> Result<Option<Duration>> {
        let probe = LeaseEntry {
            session_id: session_id.to_string(),
            period_ms: requested_period.map_or(0, |p| p.as_millis() as u64),
        };
        let ack = self.send_ping(vec![probe], self.settings.lease_ping_timeout).await.map_err(|source| {
            RemotingError::LeaseSetupFailed {
                locator: self.locator.uri(),
                source: Box::new(source),
            }
        })?;
        if !ack.leasing_enabled {
            debug!(session_id, locator = %self.locator, "server has leasing disabled");
            return Ok(None);
        }

        let period = requested_period
            .unwrap_or(Duration::from_millis(ack.lease_period_ms))
            .max(Duration::from_millis(MIN_LEASE_PERIOD_MS));
        self.attach_lease_client(session_id, listener, period);
        info!(session_id, locator = %self.locator, period_ms = period.as_millis() as u64, "lease established");
        Ok(Some(period))
    }

    /// Unregister a leasing logical client, telling the server within
    /// `disconnect_timeout`. Drops the pinger once no client remains.
    pub async fn remove_lease_client(&self, session_id: &str, disconnect_timeout: Option<Duration>) -> bool {
        let Some(pinger) = self.pinger.lock().clone() else {
            return false;
        };
        if !pinger.has_client(session_id) {
            return false;
        }
        if pinger.remove_client(session_id, disconnect_timeout).await {
            self.release_idle_pinger(&pinger);
        }
        true
    }

    /// Add `session_id` to the pinger in the slot, creating it if needed,
    /// and start pinging.
    ///
    /// Runs under the slot lock so a concurrent [`Self::release_idle_pinger`]
    /// cannot drop the pinger between lookup and registration.
    fn attach_lease_client(&self, session_id: &str, listener: Arc<dyn ConnectionListener>, period: Duration) {
        let mut slot = self.pinger.lock();
        let pinger = slot.get_or_insert_with(|| {
            let sender: Weak<dyn PingSender> = self.weak_self.clone();
            Arc::new(LeasePinger::new(sender, self.lease_timer.clone(), self.settings.lease_ping_timeout))
        });
        pinger.add_client(session_id, listener, period);
        pinger.start_ping();
    }

    /// Clear the slot if it still holds `pinger` and no client remains.
    /// Returns true when the pinger was dropped from the slot.
    pub fn release_idle_pinger(&self, pinger: &Arc<LeasePinger>) -> bool {
        let mut slot = self.pinger.lock();
        if slot.as_ref().is_some_and(|p| Arc::ptr_eq(p, pinger) && p.client_count() == 0) {
            slot.take();
            debug!(invoker_id = self.id, locator = %self.locator, "idle lease pinger released");
            return true;
        }
        false
    }

    /// The lease pinger of this invoker, while any client is leasing.
    pub fn lease_pinger(&self) -> Option<Arc<LeasePinger>> {
        self.pinger.lock().clone()
    }

    /// Effective lease ping interval, if any client is leasing.
    pub fn lease_ping_interval(&self) -> Option<Duration> {
        self.pinger.lock().as_ref().and_then(|p| p.effective_interval())
    }

    /// Whether `session_id` is registered for leasing.
    pub fn has_lease_client(&self, session_id: &str) -> bool {
        self.pinger.lock().as_ref().is_some_and(|p| p.has_client(session_id))
    }

    /// Tear the invoker down: stop pinging and close every connection,
    /// waiting at most `bound` for connections to close.
    pub async fn disconnect(&self, bound: Option<Duration>) {
        {
            let mut state = self.state.write();
            if matches!(*state, InvokerState::Disconnecting | InvokerState::Destroyed) {
                return;
            }
            *state = InvokerState::Disconnecting;
        }
        if let Some(pinger) = self.pinger.lock().take() {
            pinger.stop();
        }
        match bound {
            Some(bound) => {
                if tokio::time::timeout(bound, self.pool.close_all()).await.is_err() {
                    warn!(locator = %self.locator, "closing connections exceeded disconnect timeout");
                }
            }
            None => self.pool.close_all().await,
        }
        *self.state.write() = InvokerState::Destroyed;
        info!(invoker_id = self.id, locator = %self.locator, "client invoker destroyed");
    }

    /// Process-unique invoker id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> InvokerState {
        *self.state.read()
    }

    /// Locator this invoker connects to.
    pub fn locator(&self) -> &InvokerLocator {
        &self.locator
    }

    /// Pooling signature.
    pub fn key(&self) -> &LocatorKey {
        &self.key
    }

    /// Resolved settings.
    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    /// Idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.pool.idle_connections()
    }

    /// Checked-out pooled connections.
    pub fn active_connections(&self) -> u32 {
        self.pool.active_connections()
    }
}

/// Turn a response into its payload, mapping remote failures to errors.
pub fn response_payload(response: InvocationResponse) -> Result<Payload> {
    response.result.map_err(|error| RemotingError::Remote {
        kind: error.kind,
        message: error.message,
    })
}

#[async_trait]
impl PingSender for ClientInvoker {
    async fn send_ping(&self, clients: Vec<LeaseEntry>, timeout: Duration) -> Result<LeaseAck> {
        let request = InvocationRequest::new(INVOKER_SESSION_ID, None, InvocationKind::LeasePing { clients });
        let payload = response_payload(self.invoke_bounded(request, timeout).await?)?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn send_disconnect(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let request = InvocationRequest::new(session_id, None, InvocationKind::Disconnect {
            session_id: session_id.to_string(),
        });
        response_payload(self.invoke_bounded(request, timeout).await?).map(|_| ())
    }

    fn locator_uri(&self) -> String {
        self.locator.uri()
    }
}

impl std::fmt::Debug for ClientInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientInvoker")
            .field("id", &self.id)
            .field("locator", &self.locator.uri())
            .field("state", &self.state())
            .finish()
    }
}
