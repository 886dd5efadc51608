//! Client-side receiver of pushed callbacks.
//!
//! Mounted on a callback connector under
//! [`remora_core::constants::CALLBACK_SUBSYSTEM`], it routes every pushed
//! callback to the local handler registered for its listener id.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use remora_core::InvokerCallbackHandler;
use remora_core::Payload;
use remora_core::PushedCallback;
use remora_core::ServerInvocation;
use remora_core::ServerInvocationHandler;
use tracing::debug;

/// Routes pushed callbacks to local handlers by listener id.
#[derive(Default)]
pub struct CallbackDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn InvokerCallbackHandler>>>,
}

impl CallbackDispatcher {
    /// Dispatcher without handlers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route callbacks for `listener_id` to `handler`.
    pub fn register(&self, listener_id: impl Into<String>, handler: Arc<dyn InvokerCallbackHandler>) {
        self.handlers.write().insert(listener_id.into(), handler);
    }

    /// Stop routing callbacks for `listener_id`.
    pub fn unregister(&self, listener_id: &str) -> bool {
        self.handlers.write().remove(listener_id).is_some()
    }

    /// Registered listener ids, sorted.
    pub fn listener_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn handler(&self, listener_id: &str) -> Option<Arc<dyn InvokerCallbackHandler>> {
        self.handlers.read().get(listener_id).cloned()
    }
}

#[async_trait]
impl ServerInvocationHandler for CallbackDispatcher {
    async fn invoke(&self, invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
        let pushed: PushedCallback =
            serde_json::from_value(invocation.payload.clone()).context("malformed pushed callback")?;
        if pushed.callback.handshake {
            debug!(listener_id = %pushed.listener_id, "callback handshake received");
            return Ok(Payload::Null);
        }
        let handler = self
            .handler(&pushed.listener_id)
            .with_context(|| format!("no callback handler for listener {}", pushed.listener_id))?;
        handler.handle_callback(pushed.callback).await?;
        Ok(Payload::Null)
    }

    fn name(&self) -> &'static str {
        "CallbackDispatcher"
    }
}

impl std::fmt::Debug for CallbackDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackDispatcher").field("listeners", &self.listener_ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use remora_core::Callback;
    use remora_core::InvokerLocator;
    use remora_core::Metadata;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<Payload>>,
    }

    #[async_trait]
    impl InvokerCallbackHandler for Collect {
        async fn handle_callback(&self, callback: Callback) -> anyhow::Result<()> {
            self.seen.lock().push(callback.payload);
            Ok(())
        }
    }

    fn invocation(pushed: &PushedCallback) -> ServerInvocation {
        ServerInvocation {
            session_id: "server".to_string(),
            subsystem: Some("$callback$".to_string()),
            payload: serde_json::to_value(pushed).unwrap(),
            request_metadata: Metadata::new(),
            return_metadata: Metadata::new(),
            locator: InvokerLocator::parse("local://client:1/").unwrap(),
        }
    }

    #[tokio::test]
    async fn test_routes_by_listener_and_swallows_handshake() {
        let dispatcher = CallbackDispatcher::new();
        let collect = Arc::new(Collect::default());
        dispatcher.register("l1", collect.clone());

        let handshake = PushedCallback {
            listener_id: "l1".to_string(),
            callback: Callback::handshake("l1"),
        };
        dispatcher.invoke(&mut invocation(&handshake)).await.unwrap();

        let pushed = PushedCallback {
            listener_id: "l1".to_string(),
            callback: Callback::new(json!("event")),
        };
        dispatcher.invoke(&mut invocation(&pushed)).await.unwrap();
        assert_eq!(collect.seen.lock().as_slice(), [json!("event")]);

        assert!(dispatcher.unregister("l1"));
        assert!(dispatcher.invoke(&mut invocation(&pushed)).await.is_err());
    }
}
