//! The `Client` facade.
//!
//! A client is one logical session against one locator. Clients addressing
//! equivalent locators share a [`ClientInvoker`] through the
//! [`InvokerRegistry`]; each keeps its own session id, lease registration,
//! connection listeners and callback listeners.
//!
//! Normal operations use the configured invocation timeout. Teardown
//! (`disconnect`, `remove_listener`) is bounded by the disconnect timeout
//! when one is set, so shutdown cannot hang on a dead peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use remora_core::Callback;
use remora_core::Configuration;
use remora_core::InvocationKind;
use remora_core::InvocationRequest;
use remora_core::InvokerCallbackHandler;
use remora_core::InvokerLocator;
use remora_core::InvokerSettings;
use remora_core::Metadata;
use remora_core::Payload;
use remora_core::RemotingConfig;
use remora_core::RemotingError;
use remora_core::Result;
use remora_core::constants::CALLBACK_SUBSYSTEM;
use remora_core::error::ConfigError;
use remora_core::keys;
use remora_lease::ConnectionListener;
use remora_lease::ConnectionNotifier;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use crate::dispatcher::CallbackDispatcher;
use crate::invoker::ClientInvoker;
use crate::invoker::response_payload;
use crate::poller::CallbackPoller;
use crate::poller::PollTarget;
use crate::registry::InvokerRegistry;

struct ListenerRegistration {
    push: bool,
    poller: Option<CallbackPoller>,
}

/// One logical client session against one locator.
pub struct Client {
    session_id: String,
    locator: InvokerLocator,
    subsystem: Option<String>,
    settings: InvokerSettings,
    registry: Arc<InvokerRegistry>,
    invoker: RwLock<Option<Arc<ClientInvoker>>>,
    lifecycle: AsyncMutex<()>,
    lease_period: Mutex<Option<Duration>>,
    disconnect_timeout: Mutex<Option<Duration>>,
    notifier: Arc<ConnectionNotifier>,
    dispatcher: Arc<CallbackDispatcher>,
    listeners: Mutex<HashMap<String, ListenerRegistration>>,
}

impl Client {
    /// Create a disconnected client, resolving settings from the locator,
    /// `config` and `defaults`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unparseable or out-of-range settings.
    pub fn new(
        locator: InvokerLocator,
        config: &Configuration,
        defaults: &RemotingConfig,
        registry: Arc<InvokerRegistry>,
    ) -> Result<Self> {
        let settings = InvokerSettings::resolve(&locator, config, defaults)?;
        Ok(Self::from_settings(locator, settings, registry))
    }

    /// Create a disconnected client with already resolved settings.
    pub fn from_settings(locator: InvokerLocator, settings: InvokerSettings, registry: Arc<InvokerRegistry>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            locator,
            subsystem: None,
            settings,
            registry,
            invoker: RwLock::new(None),
            lifecycle: AsyncMutex::new(()),
            lease_period: Mutex::new(None),
            disconnect_timeout: Mutex::new(None),
            notifier: Arc::new(ConnectionNotifier::new()),
            dispatcher: Arc::new(CallbackDispatcher::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Route invocations to `subsystem`.
    pub fn with_subsystem(mut self, subsystem: impl Into<String>) -> Self {
        self.subsystem = Some(subsystem.into());
        self
    }

    /// Obtain the shared invoker and, if `enableLease` is set, establish the
    /// lease. Idempotent.
    ///
    /// # Errors
    ///
    /// Connect and lease setup failures propagate; the client then stays
    /// disconnected and can retry.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.invoker.read().is_some() {
            return Ok(());
        }

        let invoker = self.registry.get_invoker(&self.locator, &self.settings).await?;
        if self.settings.enable_lease {
            let listener: Arc<dyn ConnectionListener> = self.notifier.clone();
            match invoker.add_lease_client(&self.session_id, listener, self.settings.client_lease_period).await {
                Ok(period) => *self.lease_period.lock() = period,
                Err(error) => {
                    warn!(session_id = %self.session_id, locator = %self.locator, error = %error, "lease setup failed, aborting connect");
                    self.registry.release_invoker(&invoker).await;
                    return Err(error);
                }
            }
        }

        info!(
            session_id = %self.session_id,
            locator = %self.locator,
            invoker_id = invoker.id(),
            leasing = self.lease_period.lock().is_some(),
            "client connected"
        );
        *self.invoker.write() = Some(invoker);
        Ok(())
    }

    /// Invoke the handler with `payload` and return its result.
    pub async fn invoke(&self, payload: Payload) -> Result<Payload> {
        self.invoke_with_metadata(payload, Metadata::new()).await
    }

    /// Invoke with request metadata. A `timeout` entry overrides the
    /// invocation timeout for this call.
    ///
    /// # Errors
    ///
    /// - `NotConnected` before `connect`
    /// - `ConnectionFailed` / `Timeout` on transport failure
    /// - `Remote` when the handler fails or no handler matches
    pub async fn invoke_with_metadata(&self, payload: Payload, metadata: Metadata) -> Result<Payload> {
        let invoker = self.require_invoker()?;
        let timeout = match metadata.get(keys::TIMEOUT) {
            Some(raw) => Duration::from_millis(raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: keys::TIMEOUT.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })?),
            None => self.settings.timeout,
        };
        let request =
            InvocationRequest::invoke(self.session_id.clone(), self.subsystem.clone(), payload).with_metadata(metadata);
        response_payload(invoker.invoke(request, timeout).await?)
    }

    /// Remove every callback listener, end the lease and release the invoker.
    ///
    /// Never fails. Each remote step is bounded by the disconnect timeout
    /// when set; transport errors are logged and swallowed.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        let Some(invoker) = self.invoker.write().take() else {
            return;
        };
        let bound = self.effective_disconnect_timeout();
        let listener_ids: Vec<String> = self.listeners.lock().keys().cloned().collect();

        let remove_listeners = async {
            for listener_id in &listener_ids {
                self.remove_listener_on(Some(&invoker), listener_id).await;
            }
        };
        let end_lease = async {
            if invoker.has_lease_client(&self.session_id) {
                invoker.remove_lease_client(&self.session_id, bound).await;
            }
        };
        tokio::join!(remove_listeners, end_lease);

        *self.lease_period.lock() = None;
        self.registry.release_invoker(&invoker).await;
        info!(session_id = %self.session_id, locator = %self.locator, "client disconnected");
    }

    /// Whether `connect` succeeded and `disconnect` has not run.
    pub fn is_connected(&self) -> bool {
        self.invoker.read().is_some()
    }

    /// Bound every teardown step by `timeout`, overriding configuration.
    pub fn set_disconnect_timeout(&self, timeout: Duration) {
        *self.disconnect_timeout.lock() = Some(timeout);
    }

    /// Disconnect timeout in force, if any.
    pub fn effective_disconnect_timeout(&self) -> Option<Duration> {
        (*self.disconnect_timeout.lock()).or(self.settings.disconnect_timeout)
    }

    fn teardown_timeout(&self) -> Duration {
        self.effective_disconnect_timeout().unwrap_or(self.settings.timeout)
    }

    /// Register a listener told when this client's connection is lost.
    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        self.notifier.add_listener(listener)
    }

    /// Unregister a connection listener.
    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.notifier.remove_listener(listener)
    }

    /// Register a callback handler with the server.
    ///
    /// In push mode the server calls back through `callback_locator`, where
    /// [`Client::callback_dispatcher`] must be mounted under the callback
    /// subsystem. In pull mode a poller fetches queued callbacks every
    /// `callbackPollPeriod`.
    ///
    /// Returns the listener id.
    ///
    /// # Errors
    ///
    /// - `Configuration` if push mode has no callback locator
    /// - Any invocation error from the registration request
    pub async fn add_listener(
        &self,
        handler: Arc<dyn InvokerCallbackHandler>,
        metadata: Metadata,
        callback_locator: Option<InvokerLocator>,
        push: bool,
    ) -> Result<String> {
        let invoker = self.require_invoker()?;
        if push && callback_locator.is_none() {
            return Err(RemotingError::Configuration {
                reason: "push callbacks need a callback locator".to_string(),
            });
        }

        let listener_id = Uuid::new_v4().to_string();
        if push {
            self.dispatcher.register(listener_id.clone(), handler.clone());
        }
        let request = InvocationRequest::new(self.session_id.clone(), self.subsystem.clone(), InvocationKind::AddListener {
            listener_id: listener_id.clone(),
            callback_locator,
            push,
        })
        .with_metadata(metadata);

        let registered = match invoker.invoke(request, self.settings.timeout).await {
            Ok(response) => response_payload(response),
            Err(error) => Err(error),
        };
        if let Err(error) = registered {
            if push {
                self.dispatcher.unregister(&listener_id);
            }
            return Err(error);
        }

        let poller = (!push).then(|| {
            CallbackPoller::start(
                invoker.clone(),
                PollTarget {
                    session_id: self.session_id.clone(),
                    subsystem: self.subsystem.clone(),
                    listener_id: listener_id.clone(),
                },
                handler,
                self.settings.callback_poll_period,
                self.settings.timeout,
            )
        });
        self.listeners.lock().insert(listener_id.clone(), ListenerRegistration { push, poller });
        debug!(session_id = %self.session_id, listener_id = %listener_id, push, "callback listener added");
        Ok(listener_id)
    }

    /// Remove a callback listener. Returns false if it was not registered.
    ///
    /// Stopping the poller and telling the server run concurrently, each
    /// bounded by the teardown timeout; failures are logged and swallowed.
    pub async fn remove_listener(&self, listener_id: &str) -> bool {
        let invoker = self.invoker.read().clone();
        self.remove_listener_on(invoker.as_ref(), listener_id).await
    }

    async fn remove_listener_on(&self, invoker: Option<&Arc<ClientInvoker>>, listener_id: &str) -> bool {
        let Some(registration) = self.listeners.lock().remove(listener_id) else {
            return false;
        };
        if registration.push {
            self.dispatcher.unregister(listener_id);
        }
        let bound = self.teardown_timeout();

        let stop_poller = async {
            if let Some(poller) = registration.poller {
                poller.stop(bound).await;
            }
        };
        let tell_server = async {
            let Some(invoker) = invoker else {
                return;
            };
            let request =
                InvocationRequest::new(self.session_id.clone(), self.subsystem.clone(), InvocationKind::RemoveListener {
                    listener_id: listener_id.to_string(),
                });
            let outcome = match invoker.invoke_bounded(request, bound).await {
                Ok(response) => response_payload(response).map(|_| ()),
                Err(error) => Err(error),
            };
            if let Err(error) = outcome {
                warn!(listener_id, error = %error, "remove listener request failed, ignoring");
            }
        };
        tokio::join!(stop_poller, tell_server);
        debug!(session_id = %self.session_id, listener_id, "callback listener removed");
        true
    }

    /// Deliver a callback to `listener_id` on the remote callback connector.
    ///
    /// Used by a server-side push handler whose client targets the callback
    /// locator of the original caller.
    pub async fn push_callback(&self, listener_id: &str, callback: Callback) -> Result<()> {
        let invoker = self.require_invoker()?;
        let request =
            InvocationRequest::new(self.session_id.clone(), Some(CALLBACK_SUBSYSTEM.to_string()), InvocationKind::PushCallback {
                listener_id: listener_id.to_string(),
                callback,
            });
        response_payload(invoker.invoke(request, self.settings.timeout).await?).map(|_| ())
    }

    /// Handler to mount on a callback connector under the callback subsystem.
    pub fn callback_dispatcher(&self) -> Arc<CallbackDispatcher> {
        self.dispatcher.clone()
    }

    /// Ids of the callback listeners this client registered, sorted.
    pub fn callback_listener_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.listeners.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Session id sent with every invocation.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Target locator.
    pub fn locator(&self) -> &InvokerLocator {
        &self.locator
    }

    /// Target subsystem.
    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    /// Resolved settings.
    pub fn settings(&self) -> &InvokerSettings {
        &self.settings
    }

    /// Invocation timeout.
    pub fn timeout(&self) -> Duration {
        self.settings.timeout
    }

    /// Lease ping period, if the lease is established.
    pub fn lease_period(&self) -> Option<Duration> {
        *self.lease_period.lock()
    }

    /// Shared invoker, while connected.
    pub fn invoker(&self) -> Option<Arc<ClientInvoker>> {
        self.invoker.read().clone()
    }

    fn require_invoker(&self) -> Result<Arc<ClientInvoker>> {
        self.invoker.read().clone().ok_or_else(|| RemotingError::NotConnected {
            reason: format!("client {} is not connected to {}", self.session_id, self.locator),
        })
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session_id", &self.session_id)
            .field("locator", &self.locator.uri())
            .field("subsystem", &self.subsystem)
            .field("connected", &self.is_connected())
            .finish()
    }
}
