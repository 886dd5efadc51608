//! Shared helpers for remora integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use remora::Client;
use remora::Configuration;
use remora::Connector;
use remora::InvokerLocator;
use remora::Remoting;
use remora::ServerInvocationHandler;

/// Parse a locator, panicking on malformed test input.
pub fn locator(uri: &str) -> InvokerLocator {
    InvokerLocator::parse(uri).expect("test locator must parse")
}

/// Start a connector at `uri` with `handler` registered under `subsystem`.
pub async fn start_server(
    remoting: &Remoting,
    uri: &str,
    config: Configuration,
    subsystem: &str,
    handler: Arc<dyn ServerInvocationHandler>,
) -> Connector {
    let connector = remoting.connector(locator(uri), config).expect("connector creation");
    connector.add_invocation_handler(subsystem, handler);
    connector.start().await.expect("connector start");
    connector
}

/// Create and connect a client at `uri` targeting `subsystem`.
pub async fn connected_client(remoting: &Remoting, uri: &str, config: Configuration, subsystem: &str) -> Client {
    let client = remoting.client(locator(uri), config).expect("client creation").with_subsystem(subsystem);
    client.connect().await.expect("client connect");
    client
}
