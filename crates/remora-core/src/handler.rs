//! Server-side invocation handler trait.
//!
//! A handler services every invocation addressed to the subsystem it is
//! registered under. Handlers may keep state; the server invoker calls them
//! concurrently from any number of connections.
//!
//! # Implementing a Handler
//!
//! ```ignore
//! use remora_core::{Payload, ServerInvocation, ServerInvocationHandler};
//! use async_trait::async_trait;
//!
//! pub struct Echo;
//!
//! #[async_trait]
//! impl ServerInvocationHandler for Echo {
//!     async fn invoke(&self, invocation: &mut ServerInvocation) -> anyhow::Result<Payload> {
//!         Ok(invocation.payload.clone())
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "Echo"
//!     }
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::callback::InvokerCallbackHandler;
use crate::invocation::Metadata;
use crate::invocation::Payload;
use crate::locator::InvokerLocator;

/// Invocation as seen by a handler.
///
/// `payload` is immutable by convention; `return_metadata` is scratch space
/// copied into the response.
#[derive(Debug, Clone)]
pub struct ServerInvocation {
    /// Logical client session that issued the call.
    pub session_id: String,
    /// Subsystem the call was routed by, if named.
    pub subsystem: Option<String>,
    /// Application payload.
    pub payload: Payload,
    /// Metadata sent with the request.
    pub request_metadata: Metadata,
    /// Metadata returned to the caller.
    pub return_metadata: Metadata,
    /// Locator of the server invoker that received the call.
    pub locator: InvokerLocator,
}

/// Handler for one subsystem on a server invoker.
///
/// # Tiger Style
///
/// - Errors are returned, never panicked; a panic is caught at the dispatch
///   boundary and reported as `HandlerPanicked`
/// - Callback listeners are owned by the server invoker; the handler only
///   receives shared references
#[async_trait]
pub trait ServerInvocationHandler: Send + Sync {
    /// Service one invocation.
    async fn invoke(&self, invocation: &mut ServerInvocation) -> Result<Payload>;

    /// A callback listener was registered for this handler's subsystem.
    ///
    /// The listener delivers callbacks to one remote client, by push or by
    /// queueing for polls.
    async fn add_listener(&self, _listener: Arc<dyn InvokerCallbackHandler>) {}

    /// A callback listener was removed or its lease expired.
    async fn remove_listener(&self, _listener: &Arc<dyn InvokerCallbackHandler>) {}

    /// Handler name for logging.
    fn name(&self) -> &'static str;
}
