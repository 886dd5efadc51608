//! Server-side proxy delivering callbacks to one remote listener.
//!
//! A handler is created for every `AddListener` request and lives until the
//! listener is removed, its lease expires, or the server is destroyed.
//!
//! - **Push**: a [`Client`] back to the caller's callback locator. Creation
//!   connects it and delivers a handshake callback, so an unreachable
//!   callback connector fails the registration instead of the first event.
//! - **Pull**: a bounded queue drained by `PollCallbacks` requests. When the
//!   queue is full the oldest callback is dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use remora_client::Client;
use remora_client::InvokerRegistry;
use remora_core::Callback;
use remora_core::InvokerCallbackHandler;
use remora_core::InvokerLocator;
use remora_core::InvokerSettings;
use remora_core::Result;
use remora_lease::Lease;
use tracing::debug;
use tracing::info;
use tracing::warn;

enum Delivery {
    Push { client: Client },
    Pull { queue: Mutex<VecDeque<Callback>>, capacity: usize },
}

/// Delivers callbacks for one listener, by push or by queueing for polls.
pub struct ServerCallbackHandler {
    listener_id: String,
    session_id: String,
    subsystem: Option<String>,
    delivery: Delivery,
    lease: Mutex<Option<Lease>>,
}

impl ServerCallbackHandler {
    /// Push-mode handler.
    ///
    /// `settings` are the resolved settings of the callback client; their
    /// `timeout` is the callback timeout.
    ///
    /// # Errors
    ///
    /// Fails if the callback connector cannot be reached or rejects the
    /// handshake. Nothing stays connected in that case.
    pub async fn connect_push(
        listener_id: impl Into<String>,
        session_id: impl Into<String>,
        subsystem: Option<String>,
        callback_locator: InvokerLocator,
        settings: InvokerSettings,
        registry: Arc<InvokerRegistry>,
    ) -> Result<Self> {
        let listener_id = listener_id.into();
        let client = Client::from_settings(callback_locator, settings, registry);
        client.connect().await?;
        if let Err(error) = client.push_callback(&listener_id, Callback::handshake(&listener_id)).await {
            client.disconnect().await;
            return Err(error);
        }
        info!(
            listener_id = %listener_id,
            callback_locator = %client.locator(),
            callback_timeout_ms = client.timeout().as_millis() as u64,
            "push callback handler connected"
        );
        Ok(Self {
            listener_id,
            session_id: session_id.into(),
            subsystem,
            delivery: Delivery::Push { client },
            lease: Mutex::new(None),
        })
    }

    /// Pull-mode handler keeping at most `capacity` callbacks.
    pub fn pull(
        listener_id: impl Into<String>,
        session_id: impl Into<String>,
        subsystem: Option<String>,
        capacity: usize,
    ) -> Self {
        Self {
            listener_id: listener_id.into(),
            session_id: session_id.into(),
            subsystem,
            delivery: Delivery::Pull {
                queue: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
            },
            lease: Mutex::new(None),
        }
    }

    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subsystem(&self) -> Option<&str> {
        self.subsystem.as_deref()
    }

    pub fn is_push(&self) -> bool {
        matches!(self.delivery, Delivery::Push { .. })
    }

    /// Invocation timeout of the push client. `None` in pull mode.
    pub fn callback_client_timeout(&self) -> Option<Duration> {
        match &self.delivery {
            Delivery::Push { client } => Some(client.timeout()),
            Delivery::Pull { .. } => None,
        }
    }

    /// Take every queued callback in arrival order. Empty in push mode.
    pub fn drain(&self) -> Vec<Callback> {
        match &self.delivery {
            Delivery::Pull { queue, .. } => queue.lock().drain(..).collect(),
            Delivery::Push { .. } => Vec::new(),
        }
    }

    /// Number of queued callbacks.
    pub fn queued(&self) -> usize {
        match &self.delivery {
            Delivery::Pull { queue, .. } => queue.lock().len(),
            Delivery::Push { .. } => 0,
        }
    }

    /// Tie this handler to `lease`; its expiry removes the handler.
    pub fn attach_lease(&self, lease: Lease) {
        lease.start();
        if let Some(previous) = self.lease.lock().replace(lease) {
            previous.stop();
        }
    }

    /// Refresh the attached lease, if any.
    pub fn refresh_lease(&self, period: Duration) -> bool {
        self.lease.lock().as_ref().is_some_and(|lease| lease.update(period))
    }

    pub fn has_lease(&self) -> bool {
        self.lease.lock().as_ref().is_some_and(|lease| !lease.is_terminal())
    }

    /// Stop the lease and, in push mode, disconnect the callback client
    /// within `bound`. Never fails.
    pub async fn destroy(&self, bound: Duration) {
        if let Some(lease) = self.lease.lock().take() {
            lease.stop();
        }
        match &self.delivery {
            Delivery::Push { client } => {
                client.set_disconnect_timeout(bound);
                if tokio::time::timeout(bound, client.disconnect()).await.is_err() {
                    warn!(listener_id = %self.listener_id, bound_ms = bound.as_millis() as u64, "callback client disconnect exceeded bound");
                }
            }
            Delivery::Pull { queue, .. } => {
                let dropped = {
                    let mut queue = queue.lock();
                    let dropped = queue.len();
                    queue.clear();
                    dropped
                };
                if dropped > 0 {
                    debug!(listener_id = %self.listener_id, dropped, "discarded undelivered callbacks");
                }
            }
        }
        debug!(listener_id = %self.listener_id, "callback handler destroyed");
    }
}

#[async_trait]
impl InvokerCallbackHandler for ServerCallbackHandler {
    async fn handle_callback(&self, callback: Callback) -> anyhow::Result<()> {
        match &self.delivery {
            Delivery::Push { client } => client
                .push_callback(&self.listener_id, callback)
                .await
                .with_context(|| format!("pushing callback to listener {}", self.listener_id)),
            Delivery::Pull { queue, capacity } => {
                let mut queue = queue.lock();
                if queue.len() >= *capacity {
                    queue.pop_front();
                    warn!(listener_id = %self.listener_id, capacity = *capacity, "callback store full, dropping oldest");
                }
                queue.push_back(callback);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for ServerCallbackHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCallbackHandler")
            .field("listener_id", &self.listener_id)
            .field("session_id", &self.session_id)
            .field("push", &self.is_push())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_pull_queue_keeps_order_and_drops_oldest() {
        let handler = ServerCallbackHandler::pull("l1", "s1", None, 2);
        for n in 0..3 {
            handler.handle_callback(Callback::new(json!(n))).await.unwrap();
        }
        assert_eq!(handler.queued(), 2);
        let drained: Vec<_> = handler.drain().into_iter().map(|c| c.payload).collect();
        assert_eq!(drained, vec![json!(1), json!(2)]);
        assert!(handler.drain().is_empty());
        assert_eq!(handler.callback_client_timeout(), None);
    }
}
