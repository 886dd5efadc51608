//! Server invocation handlers with fixed behavior.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use parking_lot::Mutex;
use remora_core::Callback;
use remora_core::InvokerCallbackHandler;
use remora_core::Payload;
use remora_core::ServerInvocation;
use remora_core::ServerInvocationHandler;

/// Returns the payload unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ServerInvocationHandler for EchoHandler {
    async fn invoke(&self, invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
        Ok(invocation.payload.clone())
    }

    fn name(&self) -> &'static str {
        "EchoHandler"
    }
}

/// Sleeps, then echoes.
#[derive(Debug, Clone, Copy)]
pub struct DelayHandler {
    delay: Duration,
}

impl DelayHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ServerInvocationHandler for DelayHandler {
    async fn invoke(&self, invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
        tokio::time::sleep(self.delay).await;
        Ok(invocation.payload.clone())
    }

    fn name(&self) -> &'static str {
        "DelayHandler"
    }
}

/// Always fails with its message.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl ServerInvocationHandler for FailingHandler {
    async fn invoke(&self, _invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
        bail!("{}", self.message)
    }

    fn name(&self) -> &'static str {
        "FailingHandler"
    }
}

/// Always panics.
#[derive(Debug, Default, Clone, Copy)]
pub struct PanickingHandler;

#[async_trait]
impl ServerInvocationHandler for PanickingHandler {
    async fn invoke(&self, _invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
        panic!("handler exploded");
    }

    fn name(&self) -> &'static str {
        "PanickingHandler"
    }
}

/// Echo handler that keeps its callback listeners and emits to them.
#[derive(Default)]
pub struct CallbackSourceHandler {
    listeners: Mutex<Vec<Arc<dyn InvokerCallbackHandler>>>,
}

impl CallbackSourceHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Deliver `payload` to every listener. Returns how many accepted it.
    pub async fn emit(&self, payload: Payload) -> usize {
        let listeners: Vec<_> = self.listeners.lock().clone();
        let mut delivered = 0;
        for listener in listeners {
            if listener.handle_callback(Callback::new(payload.clone())).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[async_trait]
impl ServerInvocationHandler for CallbackSourceHandler {
    async fn invoke(&self, invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
        Ok(invocation.payload.clone())
    }

    async fn add_listener(&self, listener: Arc<dyn InvokerCallbackHandler>) {
        self.listeners.lock().push(listener);
    }

    async fn remove_listener(&self, listener: &Arc<dyn InvokerCallbackHandler>) {
        self.listeners.lock().retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    fn name(&self) -> &'static str {
        "CallbackSourceHandler"
    }
}
