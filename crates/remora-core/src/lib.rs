//! Core types for remora: locators, the invocation model, configuration
//! resolution, errors and the handler seams shared by clients and servers.

pub mod callback;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod handler;
pub mod invocation;
pub mod locator;
pub mod verified;

pub use callback::Callback;
pub use callback::InvokerCallbackHandler;
pub use codec::Codec;
pub use codec::JsonCodec;
pub use config::Configuration;
pub use config::InvokerSettings;
pub use config::RemotingConfig;
pub use config::keys;
pub use error::ConfigError;
pub use error::RemotingError;
pub use error::Result;
pub use error::TransportError;
pub use handler::ServerInvocation;
pub use handler::ServerInvocationHandler;
pub use invocation::InvocationKind;
pub use invocation::InvocationRequest;
pub use invocation::InvocationResponse;
pub use invocation::LeaseAck;
pub use invocation::LeaseEntry;
pub use invocation::Metadata;
pub use invocation::Payload;
pub use invocation::PushedCallback;
pub use invocation::RemoteError;
pub use invocation::RemoteErrorKind;
pub use locator::InvokerLocator;
pub use locator::LocatorKey;
