//! remora: transport-agnostic remote invocation.
//!
//! Clients invoke handlers on servers addressed by an [`InvokerLocator`].
//! The framework pools client connections and shares them between clients,
//! keeps clients and servers aware of each other through leases, and carries
//! callbacks from servers back to clients by push or by polling.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use remora::Configuration;
//! use remora::InvokerLocator;
//! use remora::Remoting;
//!
//! let remoting = Remoting::new();
//! let locator = InvokerLocator::parse("local://server:5400/?leasePeriod=1000")?;
//!
//! let connector = remoting.connector(locator.clone(), Configuration::new())?;
//! connector.add_invocation_handler("echo", Arc::new(MyHandler));
//! connector.start().await?;
//!
//! let client = remoting.client(locator, Configuration::new().with("enableLease", true))?
//!     .with_subsystem("echo");
//! client.connect().await?;
//! let reply = client.invoke(serde_json::json!("abc")).await?;
//! client.disconnect().await;
//! ```

pub mod context;

pub use context::Remoting;
pub use remora_client::CallbackDispatcher;
pub use remora_client::Client;
pub use remora_client::ClientInvoker;
pub use remora_client::InvokerRegistry;
pub use remora_core::Callback;
pub use remora_core::Codec;
pub use remora_core::Configuration;
pub use remora_core::InvokerCallbackHandler;
pub use remora_core::InvokerLocator;
pub use remora_core::InvokerSettings;
pub use remora_core::Metadata;
pub use remora_core::Payload;
pub use remora_core::RemoteErrorKind;
pub use remora_core::RemotingConfig;
pub use remora_core::RemotingError;
pub use remora_core::Result;
pub use remora_core::ServerInvocation;
pub use remora_core::ServerInvocationHandler;
pub use remora_core::constants;
pub use remora_core::keys;
pub use remora_lease::ConnectionListener;
pub use remora_lease::ConnectionLostEvent;
pub use remora_lease::LossCause;
pub use remora_server::Connector;
pub use remora_server::ServerInvoker;
pub use remora_transport::LocalNetwork;
pub use remora_transport::Transport;
