//! Connection-lost notification.
//!
//! A lease that expires, a client that disconnects explicitly, or a pinger
//! that can no longer reach its server produce one [`ConnectionLostEvent`]
//! delivered to [`ConnectionListener`]s. The `cause` tells the cases apart:
//! `None` means the peer stopped sending heartbeats, `Some` carries the
//! explicit reason.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use remora_core::Metadata;
use tracing::debug;

/// Explicit reason for a lost connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossCause {
    /// The client disconnected explicitly.
    ClientDisconnected,
    /// Consecutive lease pings failed on the client side.
    PingFailed {
        /// Failures in a row when the loss was reported.
        consecutive_failures: u32,
        /// Last ping error.
        last_error: String,
    },
}

impl fmt::Display for LossCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LossCause::ClientDisconnected => f.write_str("client disconnected"),
            LossCause::PingFailed {
                consecutive_failures,
                last_error,
            } => write!(f, "{consecutive_failures} consecutive lease pings failed: {last_error}"),
        }
    }
}

/// One connection-lost notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionLostEvent {
    /// Logical client whose connection was lost.
    pub client_session_id: String,
    /// Locator URI of the invoker that observed the loss.
    pub locator_uri: String,
    /// Metadata attached to the client's lease.
    pub client_metadata: Metadata,
    /// `None` when the lease expired without heartbeats.
    pub cause: Option<LossCause>,
}

impl ConnectionLostEvent {
    /// True when the loss was detected by missing heartbeats.
    pub fn is_expiry(&self) -> bool {
        self.cause.is_none()
    }
}

/// Receiver of connection-lost notifications.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Called once per lost connection.
    async fn handle_connection_lost(&self, event: &ConnectionLostEvent);
}

/// Compares the data pointers of two listeners.
pub fn same_listener(a: &Arc<dyn ConnectionListener>, b: &Arc<dyn ConnectionListener>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Fan-out of connection-lost events to registered listeners.
#[derive(Default)]
pub struct ConnectionNotifier {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionNotifier {
    /// Notifier without listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns false if it was already registered.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.write();
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether any listener is registered.
    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }
}

#[async_trait]
impl ConnectionListener for ConnectionNotifier {
    async fn handle_connection_lost(&self, event: &ConnectionLostEvent) {
        let listeners: Vec<Arc<dyn ConnectionListener>> = self.listeners.read().clone();
        debug!(
            session_id = %event.client_session_id,
            listeners = listeners.len(),
            expiry = event.is_expiry(),
            "notifying connection listeners"
        );
        for listener in listeners {
            listener.handle_connection_lost(event).await;
        }
    }
}

impl fmt::Debug for ConnectionNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionNotifier").field("listeners", &self.listener_count()).finish()
    }
}
