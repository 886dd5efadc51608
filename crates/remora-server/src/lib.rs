//! Server side of remora.
//!
//! - [`ServerInvoker`]: dispatch, client leases, callback handler ownership
//! - [`ServerCallbackHandler`]: push or pull delivery to one remote listener
//! - [`Connector`] / [`ConnectorRegistry`]: the user-facing endpoint and the
//!   one-connector-per-locator rule

pub mod callback_handler;
pub mod connector;
pub mod server_invoker;

pub use callback_handler::ServerCallbackHandler;
pub use connector::Connector;
pub use connector::ConnectorRegistry;
pub use server_invoker::ServerInvoker;
pub use server_invoker::ServerServices;
pub use server_invoker::ServerState;
