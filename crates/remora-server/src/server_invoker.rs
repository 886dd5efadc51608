//! Server invoker: receives invocations on one locator and dispatches them.
//!
//! Responsibilities:
//!
//! - Route `Invoke` requests to the handler registered for the subsystem,
//!   converting handler errors and panics into typed remote errors
//! - Track one [`Lease`] per leasing client session, refreshed by batched
//!   `LeasePing` requests and ended by `Disconnect`
//! - Own the [`ServerCallbackHandler`]s created by `AddListener`
//!
//! # Subsystem resolution
//!
//! Subsystem names are case-insensitive. A request naming a subsystem goes to
//! that handler. A request without one goes to the only registered handler;
//! with several registered it fails with `AmbiguousSubsystem`.
//!
//! # Tiger Style
//!
//! - Handler and callback maps are read-mostly (`RwLock`); dispatch never
//!   holds a lock across an await
//! - Every teardown step is bounded by the disconnect timeout when set

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use remora_client::InvokerRegistry;
use remora_core::Callback;
use remora_core::Codec;
use remora_core::Configuration;
use remora_core::InvocationKind;
use remora_core::InvocationRequest;
use remora_core::InvocationResponse;
use remora_core::InvokerCallbackHandler;
use remora_core::InvokerLocator;
use remora_core::InvokerSettings;
use remora_core::LeaseAck;
use remora_core::LeaseEntry;
use remora_core::Metadata;
use remora_core::Payload;
use remora_core::PushedCallback;
use remora_core::RemoteError;
use remora_core::RemoteErrorKind;
use remora_core::RemotingConfig;
use remora_core::RemotingError;
use remora_core::Result;
use remora_core::ServerInvocation;
use remora_core::ServerInvocationHandler;
use remora_core::TransportError;
use remora_core::constants::CALLBACK_SUBSYSTEM;
use remora_core::constants::MIN_LEASE_PERIOD_MS;
use remora_core::error::ConfigError;
use remora_core::keys;
use remora_core::verified::resolve_callback_timeout;
use remora_lease::ConnectionListener;
use remora_lease::ConnectionLostEvent;
use remora_lease::ConnectionNotifier;
use remora_lease::Lease;
use remora_lease::TimerService;
use remora_transport::Binding;
use remora_transport::FrameHandler;
use remora_transport::Transport;
use remora_transport::TransportRegistry;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::callback_handler::ServerCallbackHandler;

/// Shared services a server invoker is built from.
#[derive(Clone)]
pub struct ServerServices {
    /// Transports available for binding.
    pub transports: Arc<TransportRegistry>,
    /// Frame codec.
    pub codec: Arc<dyn Codec>,
    /// Registry used by push callback clients.
    pub client_registry: Arc<InvokerRegistry>,
    /// Timer running lease checks.
    pub lease_timer: TimerService,
    /// Process defaults.
    pub defaults: RemotingConfig,
}

/// Lifecycle of a server invoker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Created, not bound.
    Created,
    /// Bound and accepting invocations.
    Started,
    /// Unbound; can be started again.
    Stopped,
    /// Gone for good.
    Destroyed,
}

struct CallbackRegistration {
    handler: Arc<ServerCallbackHandler>,
    owner: Arc<dyn ServerInvocationHandler>,
}

/// Receives invocations for one locator and dispatches them to handlers.
pub struct ServerInvoker {
    locator: InvokerLocator,
    config: Configuration,
    settings: InvokerSettings,
    services: ServerServices,
    transport: Arc<dyn Transport>,
    handlers: RwLock<BTreeMap<String, Arc<dyn ServerInvocationHandler>>>,
    notifier: Arc<ConnectionNotifier>,
    lease_listener: Arc<dyn ConnectionListener>,
    leases: Mutex<HashMap<String, Lease>>,
    callbacks: RwLock<HashMap<String, CallbackRegistration>>,
    binding: Mutex<Option<Box<dyn Binding>>>,
    state: RwLock<ServerState>,
    weak_self: Weak<ServerInvoker>,
}

impl ServerInvoker {
    /// Create an unbound server invoker.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` for malformed settings
    /// - `UnknownTransport` if no transport serves the locator
    pub fn new(locator: InvokerLocator, config: Configuration, services: ServerServices) -> Result<Arc<Self>> {
        let settings = InvokerSettings::resolve(&locator, &config, &services.defaults)?;
        let transport = services.transports.resolve(&locator)?;
        Ok(Arc::new_cyclic(|weak_self: &Weak<ServerInvoker>| {
            let lease_listener: Arc<dyn ConnectionListener> = Arc::new(LeaseTracker {
                server: weak_self.clone(),
            });
            Self {
                locator,
                config,
                settings,
                services,
                transport,
                handlers: RwLock::new(BTreeMap::new()),
                notifier: Arc::new(ConnectionNotifier::new()),
                lease_listener,
                leases: Mutex::new(HashMap::new()),
                callbacks: RwLock::new(HashMap::new()),
                binding: Mutex::new(None),
                state: RwLock::new(ServerState::Created),
                weak_self: weak_self.clone(),
            }
        }))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Bind the locator's address and start accepting invocations.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` if the address cannot be bound.
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            ServerState::Started => return Ok(()),
            ServerState::Destroyed => {
                return Err(RemotingError::NotConnected {
                    reason: format!("server invoker for {} is destroyed", self.locator),
                });
            }
            ServerState::Created | ServerState::Stopped => {}
        }
        let frames: Arc<dyn FrameHandler> = Arc::new(ServerFrameHandler {
            server: self.weak_self.clone(),
            codec: self.services.codec.clone(),
            address: self.locator.address(),
        });
        let binding =
            self.transport.bind(&self.locator, frames).await.map_err(|source| RemotingError::ConnectionFailed {
                locator: self.locator.uri(),
                source,
            })?;
        *self.binding.lock() = Some(binding);
        *self.state.write() = ServerState::Started;
        info!(locator = %self.locator, handlers = ?self.handler_subsystems(), "server invoker started");
        Ok(())
    }

    /// Unbind and stop every client lease without notifying listeners.
    /// Handlers and callback listeners stay registered.
    pub fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state != ServerState::Started {
                return;
            }
            *state = ServerState::Stopped;
        }
        if let Some(binding) = self.binding.lock().take() {
            binding.close();
        }
        let leases: Vec<Lease> = self.leases.lock().drain().map(|(_, lease)| lease).collect();
        for lease in &leases {
            lease.stop();
        }
        info!(locator = %self.locator, stopped_leases = leases.len(), "server invoker stopped");
    }

    /// Stop, destroy every callback handler and drop all handlers.
    pub async fn destroy(&self) {
        if self.state() == ServerState::Destroyed {
            return;
        }
        self.stop();
        *self.state.write() = ServerState::Destroyed;

        let registrations: Vec<CallbackRegistration> =
            self.callbacks.write().drain().map(|(_, registration)| registration).collect();
        let bound = self.teardown_timeout();
        for registration in &registrations {
            let listener: Arc<dyn InvokerCallbackHandler> = registration.handler.clone();
            registration.owner.remove_listener(&listener).await;
            registration.handler.destroy(bound).await;
        }
        self.handlers.write().clear();
        info!(locator = %self.locator, callback_handlers = registrations.len(), "server invoker destroyed");
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServerState {
        *self.state.read()
    }

    /// Locator this server is bound to.
    pub fn locator(&self) -> &InvokerLocator {
        &self.locator
    }

    /// Settings resolved from the locator and configuration.
    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    fn teardown_timeout(&self) -> Duration {
        self.settings.teardown_timeout(self.settings.timeout)
    }

    // ========================================================================
    // Handler registration
    // ========================================================================

    /// Register `handler` for `subsystem`, returning the handler it replaced.
    pub fn add_invocation_handler(
        &self,
        subsystem: &str,
        handler: Arc<dyn ServerInvocationHandler>,
    ) -> Option<Arc<dyn ServerInvocationHandler>> {
        let key = subsystem.to_ascii_lowercase();
        debug!(locator = %self.locator, subsystem = %key, handler = handler.name(), "adding invocation handler");
        let previous = self.handlers.write().insert(key, handler);
        if let Some(previous) = &previous {
            info!(locator = %self.locator, subsystem, replaced = previous.name(), "invocation handler replaced");
        }
        previous
    }

    /// Unregister the handler for `subsystem`.
    pub fn remove_invocation_handler(&self, subsystem: &str) -> Option<Arc<dyn ServerInvocationHandler>> {
        self.handlers.write().remove(&subsystem.to_ascii_lowercase())
    }

    /// Registered subsystem names, lowercased and sorted.
    pub fn handler_subsystems(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    /// Register a listener told when a leasing client is lost.
    ///
    /// Registering any listener enables leasing even without `leasePeriod`.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.notifier.add_listener(listener)
    }

    /// Unregister a connection listener. Returns whether it was registered.
    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.notifier.remove_listener(listener)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Whether clients are asked to lease.
    pub fn leasing_enabled(&self) -> bool {
        self.settings.lease_period.is_some() || self.notifier.has_listeners()
    }

    /// Lease period advertised to clients.
    pub fn lease_period(&self) -> Duration {
        self.settings.lease_period.unwrap_or(Duration::from_millis(self.services.defaults.lease_period_ms))
    }

    /// Session ids holding a live lease, sorted.
    pub fn active_leases(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .leases
            .lock()
            .iter()
            .filter(|(_, lease)| !lease.is_terminal())
            .map(|(session, _)| session.clone())
            .collect();
        sessions.sort();
        sessions
    }

    /// Period of the live lease held by `session_id`.
    pub fn client_lease_period(&self, session_id: &str) -> Option<Duration> {
        self.leases.lock().get(session_id).filter(|lease| !lease.is_terminal()).map(Lease::period)
    }

    /// Server-side callback handler registered under `listener_id`.
    pub fn callback_handler(&self, listener_id: &str) -> Option<Arc<ServerCallbackHandler>> {
        self.callbacks.read().get(listener_id).map(|registration| registration.handler.clone())
    }

    /// Number of registered callback handlers.
    pub fn callback_handler_count(&self) -> usize {
        self.callbacks.read().len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Service one request. Failures are reported in the response.
    pub async fn invoke(&self, request: InvocationRequest) -> InvocationResponse {
        let InvocationRequest {
            session_id,
            subsystem,
            kind,
            request_metadata,
        } = request;
        match kind {
            InvocationKind::Invoke { payload } => {
                self.dispatch(session_id, subsystem, payload, request_metadata).await
            }
            InvocationKind::LeasePing { clients } => self.handle_lease_ping(clients, request_metadata),
            InvocationKind::Disconnect { session_id } => self.handle_disconnect(&session_id).await,
            InvocationKind::AddListener {
                listener_id,
                callback_locator,
                push,
            } => {
                self.handle_add_listener(session_id, subsystem, listener_id, callback_locator, push, &request_metadata)
                    .await
            }
            InvocationKind::RemoveListener { listener_id } => self.handle_remove_listener(&listener_id).await,
            InvocationKind::PollCallbacks { listener_id } => self.handle_poll(&listener_id),
            InvocationKind::PushCallback { listener_id, callback } => {
                self.handle_push(session_id, listener_id, callback, request_metadata).await
            }
        }
    }

    fn resolve_handler(
        &self,
        subsystem: Option<&str>,
    ) -> std::result::Result<Arc<dyn ServerInvocationHandler>, RemoteError> {
        let handlers = self.handlers.read();
        match subsystem {
            Some(name) => handlers.get(&name.to_ascii_lowercase()).cloned().ok_or_else(|| RemoteError {
                kind: RemoteErrorKind::NoHandler,
                message: format!("no handler for subsystem {name} on {}", self.locator),
            }),
            None => {
                let mut all = handlers.values();
                match (all.next(), all.next()) {
                    (Some(only), None) => Ok(only.clone()),
                    (None, _) => Err(RemoteError {
                        kind: RemoteErrorKind::NoHandler,
                        message: format!("no handlers registered on {}", self.locator),
                    }),
                    (Some(_), Some(_)) => Err(RemoteError {
                        kind: RemoteErrorKind::AmbiguousSubsystem,
                        message: format!(
                            "request names no subsystem and {} handlers are registered on {}",
                            handlers.len(),
                            self.locator
                        ),
                    }),
                }
            }
        }
    }

    async fn dispatch(
        &self,
        session_id: String,
        subsystem: Option<String>,
        payload: Payload,
        request_metadata: Metadata,
    ) -> InvocationResponse {
        let handler = match self.resolve_handler(subsystem.as_deref()) {
            Ok(handler) => handler,
            Err(error) => {
                debug!(session_id = %session_id, subsystem = ?subsystem, error = %error.message, "invocation not routable");
                return InvocationResponse::err(error.kind, error.message);
            }
        };
        let mut invocation = ServerInvocation {
            session_id,
            subsystem,
            payload,
            request_metadata,
            return_metadata: Metadata::new(),
            locator: self.locator.clone(),
        };
        run_handler(handler.as_ref(), &mut invocation).await
    }

    fn handle_lease_ping(&self, clients: Vec<LeaseEntry>, request_metadata: Metadata) -> InvocationResponse {
        let enabled = self.leasing_enabled();
        let server_period = self.lease_period();
        let ack = LeaseAck {
            leasing_enabled: enabled,
            lease_period_ms: server_period.as_millis() as u64,
        };
        if enabled {
            for entry in clients {
                let period = if entry.period_ms == 0 {
                    server_period
                } else {
                    Duration::from_millis(entry.period_ms.max(MIN_LEASE_PERIOD_MS))
                };
                self.refresh_lease(&entry.session_id, period, &request_metadata);
            }
        }
        match serde_json::to_value(ack) {
            Ok(payload) => InvocationResponse::ok(payload),
            Err(error) => InvocationResponse::err(RemoteErrorKind::Rejected, error.to_string()),
        }
    }

    fn refresh_lease(&self, session_id: &str, period: Duration, metadata: &Metadata) {
        {
            let mut leases = self.leases.lock();
            let renewed = leases.get(session_id).is_some_and(|lease| lease.update(period));
            if !renewed {
                let lease = Lease::new(
                    session_id,
                    period,
                    self.locator.uri(),
                    metadata.clone(),
                    self.lease_listener.clone(),
                    self.services.lease_timer.clone(),
                );
                lease.start();
                if let Some(stale) = leases.insert(session_id.to_string(), lease) {
                    stale.stop();
                }
                info!(session_id, locator = %self.locator, period_ms = period.as_millis() as u64, "client lease established");
            }
        }
        for registration in self.callbacks.read().values() {
            if registration.handler.session_id() == session_id {
                registration.handler.refresh_lease(period);
            }
        }
    }

    async fn handle_disconnect(&self, session_id: &str) -> InvocationResponse {
        let lease = self.leases.lock().remove(session_id);
        match lease {
            Some(lease) => {
                lease.terminate().await;
            }
            None => debug!(session_id, "disconnect from client without lease"),
        }
        InvocationResponse::ok(Payload::Null)
    }

    async fn handle_add_listener(
        &self,
        session_id: String,
        subsystem: Option<String>,
        listener_id: String,
        callback_locator: Option<InvokerLocator>,
        push: bool,
        request_metadata: &Metadata,
    ) -> InvocationResponse {
        let owner = match self.resolve_handler(subsystem.as_deref()) {
            Ok(owner) => owner,
            Err(error) => return InvocationResponse::err(error.kind, error.message),
        };
        if self.callbacks.read().contains_key(&listener_id) {
            return InvocationResponse::err(RemoteErrorKind::Rejected, format!("listener {listener_id} already registered"));
        }

        let handler = if push {
            let Some(callback_locator) = callback_locator else {
                return InvocationResponse::err(RemoteErrorKind::Rejected, "push listener without callback locator");
            };
            let settings = match self.callback_client_settings(&callback_locator, request_metadata) {
                Ok(settings) => settings,
                Err(error) => return InvocationResponse::err(RemoteErrorKind::Rejected, error.to_string()),
            };
            match ServerCallbackHandler::connect_push(
                listener_id.clone(),
                session_id.clone(),
                subsystem.clone(),
                callback_locator,
                settings,
                self.services.client_registry.clone(),
            )
            .await
            {
                Ok(handler) => handler,
                Err(error) => {
                    warn!(listener_id = %listener_id, error = %error, "push callback handler setup failed");
                    return InvocationResponse::err(
                        RemoteErrorKind::Rejected,
                        format!("callback connection failed: {error}"),
                    );
                }
            }
        } else {
            ServerCallbackHandler::pull(
                listener_id.clone(),
                session_id.clone(),
                subsystem.clone(),
                self.settings.callback_store_max as usize,
            )
        };

        let handler = Arc::new(handler);
        if let Some(period) = self.client_lease_period(&session_id) {
            let lease_listener: Arc<dyn ConnectionListener> = Arc::new(CallbackLeaseListener {
                server: self.weak_self.clone(),
                listener_id: listener_id.clone(),
            });
            handler.attach_lease(Lease::new(
                session_id.clone(),
                period,
                self.locator.uri(),
                request_metadata.clone(),
                lease_listener,
                self.services.lease_timer.clone(),
            ));
        }

        let listener: Arc<dyn InvokerCallbackHandler> = handler.clone();
        owner.add_listener(listener).await;
        self.callbacks.write().insert(listener_id.clone(), CallbackRegistration {
            handler,
            owner: owner.clone(),
        });
        info!(session_id = %session_id, listener_id = %listener_id, push, handler = owner.name(), "callback listener added");
        InvocationResponse::ok(Payload::Null)
    }

    /// Settings of a push callback client; the timeout follows callback
    /// timeout precedence, falling back to this invoker's timeout.
    fn callback_client_settings(
        &self,
        callback_locator: &InvokerLocator,
        request_metadata: &Metadata,
    ) -> std::result::Result<InvokerSettings, ConfigError> {
        let mut settings = InvokerSettings::resolve(callback_locator, &Configuration::new(), &self.services.defaults)?;
        let timeout_ms = resolve_callback_timeout(
            metadata_ms(request_metadata, keys::CALLBACK_TIMEOUT)?,
            self.locator.param(keys::CALLBACK_TIMEOUT).map(|raw| parse_ms(keys::CALLBACK_TIMEOUT, raw)).transpose()?,
            self.config.get_u64(keys::CALLBACK_TIMEOUT)?,
            self.config.get_u64(keys::TIMEOUT)?,
        );
        settings.timeout = timeout_ms.map(Duration::from_millis).unwrap_or(self.settings.timeout);
        settings.disconnect_timeout = self.settings.disconnect_timeout;
        settings.enable_lease = false;
        Ok(settings)
    }

    async fn handle_remove_listener(&self, listener_id: &str) -> InvocationResponse {
        if self.remove_callback_handler(listener_id).await {
            InvocationResponse::ok(Payload::Null)
        } else {
            InvocationResponse::err(RemoteErrorKind::UnknownListener, format!("no listener {listener_id}"))
        }
    }

    async fn remove_callback_handler(&self, listener_id: &str) -> bool {
        let Some(registration) = self.callbacks.write().remove(listener_id) else {
            return false;
        };
        let listener: Arc<dyn InvokerCallbackHandler> = registration.handler.clone();
        registration.owner.remove_listener(&listener).await;
        registration.handler.destroy(self.teardown_timeout()).await;
        info!(listener_id, "callback listener removed");
        true
    }

    fn handle_poll(&self, listener_id: &str) -> InvocationResponse {
        let Some(handler) = self.callback_handler(listener_id) else {
            return InvocationResponse::err(RemoteErrorKind::UnknownListener, format!("no listener {listener_id}"));
        };
        if handler.is_push() {
            return InvocationResponse::err(RemoteErrorKind::Rejected, format!("listener {listener_id} is push mode"));
        }
        let callbacks = handler.drain();
        match serde_json::to_value(&callbacks) {
            Ok(payload) => InvocationResponse::ok(payload),
            Err(error) => InvocationResponse::err(RemoteErrorKind::Rejected, error.to_string()),
        }
    }

    async fn handle_push(
        &self,
        session_id: String,
        listener_id: String,
        callback: Callback,
        request_metadata: Metadata,
    ) -> InvocationResponse {
        let pushed = PushedCallback { listener_id, callback };
        let payload = match serde_json::to_value(&pushed) {
            Ok(payload) => payload,
            Err(error) => return InvocationResponse::err(RemoteErrorKind::Rejected, error.to_string()),
        };
        self.dispatch(session_id, Some(CALLBACK_SUBSYSTEM.to_string()), payload, request_metadata).await
    }

    async fn expire_callback_handler(&self, listener_id: &str) {
        if self.remove_callback_handler(listener_id).await {
            info!(listener_id, "callback listener removed after lease expiry");
        }
    }

    async fn on_client_lost(&self, event: &ConnectionLostEvent) {
        {
            let mut leases = self.leases.lock();
            let terminal = leases.get(&event.client_session_id).is_some_and(Lease::is_terminal);
            if terminal {
                leases.remove(&event.client_session_id);
            }
        }
        self.notifier.handle_connection_lost(event).await;
    }
}

impl std::fmt::Debug for ServerInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInvoker")
            .field("locator", &self.locator.uri())
            .field("state", &self.state())
            .field("handlers", &self.handler_subsystems())
            .field("callback_handlers", &self.callback_handler_count())
            .finish()
    }
}

async fn run_handler(handler: &dyn ServerInvocationHandler, invocation: &mut ServerInvocation) -> InvocationResponse {
    let outcome = AssertUnwindSafe(handler.invoke(invocation)).catch_unwind().await;
    let return_metadata = std::mem::take(&mut invocation.return_metadata);
    let response = match outcome {
        Ok(Ok(payload)) => InvocationResponse::ok(payload),
        Ok(Err(error)) => {
            debug!(handler = handler.name(), session_id = %invocation.session_id, error = %error, "handler failed");
            InvocationResponse::err(RemoteErrorKind::HandlerFailed, format!("{error:#}"))
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(handler = handler.name(), session_id = %invocation.session_id, panic = %message, "handler panicked");
            InvocationResponse::err(RemoteErrorKind::HandlerPanicked, message)
        }
    };
    response.with_return_metadata(return_metadata)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn parse_ms(key: &str, raw: &str) -> std::result::Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn metadata_ms(metadata: &Metadata, key: &str) -> std::result::Result<Option<u64>, ConfigError> {
    metadata.get(key).map(|raw| parse_ms(key, raw)).transpose()
}

/// Removes finished client leases and forwards the loss to connection
/// listeners.
struct LeaseTracker {
    server: Weak<ServerInvoker>,
}

#[async_trait]
impl ConnectionListener for LeaseTracker {
    async fn handle_connection_lost(&self, event: &ConnectionLostEvent) {
        if let Some(server) = self.server.upgrade() {
            server.on_client_lost(event).await;
        }
    }
}

/// Removes a callback handler whose lease expired.
struct CallbackLeaseListener {
    server: Weak<ServerInvoker>,
    listener_id: String,
}

#[async_trait]
impl ConnectionListener for CallbackLeaseListener {
    async fn handle_connection_lost(&self, _event: &ConnectionLostEvent) {
        if let Some(server) = self.server.upgrade() {
            server.expire_callback_handler(&self.listener_id).await;
        }
    }
}

/// Decodes frames, dispatches them and encodes the responses.
struct ServerFrameHandler {
    server: Weak<ServerInvoker>,
    codec: Arc<dyn Codec>,
    address: String,
}

#[async_trait]
impl FrameHandler for ServerFrameHandler {
    async fn handle_frame(&self, frame: Bytes) -> std::result::Result<Bytes, TransportError> {
        let Some(server) = self.server.upgrade() else {
            return Err(TransportError::Closed {
                address: self.address.clone(),
            });
        };
        let response = match self.codec.decode_request(&frame) {
            Ok(request) => server.invoke(request).await,
            Err(error) => {
                warn!(address = %self.address, codec = self.codec.name(), error = %error, "undecodable request frame");
                InvocationResponse::err(RemoteErrorKind::Rejected, error.to_string())
            }
        };
        self.codec.encode_response(&response).map_err(|error| TransportError::Rejected {
            address: self.address.clone(),
            reason: error.to_string(),
        })
    }
}
