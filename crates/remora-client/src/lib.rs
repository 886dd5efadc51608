//! Client side of remora.
//!
//! - [`ClientInvoker`] / [`ConnectionPool`]: pooled connections to one locator
//! - [`InvokerRegistry`]: at most one live invoker per locator, with
//!   deferred destruction
//! - [`Client`]: the per-session facade (invoke, leasing, callbacks)
//! - [`CallbackPoller`] / [`CallbackDispatcher`]: pull and push callback delivery

pub mod client;
pub mod dispatcher;
pub mod invoker;
pub mod poller;
pub mod pool;
pub mod registry;

pub use client::Client;
pub use dispatcher::CallbackDispatcher;
pub use invoker::ClientInvoker;
pub use invoker::InvokerState;
pub use invoker::response_payload;
pub use poller::CallbackPoller;
pub use poller::PollTarget;
pub use pool::ConnectionPool;
pub use pool::PooledConnection;
pub use registry::InvokerRegistry;
