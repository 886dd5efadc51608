//! End-to-end invocation tests over the in-process transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::connected_client;
use common::locator;
use common::start_server;
use remora::Configuration;
use remora::Metadata;
use remora::RemoteErrorKind;
use remora::Remoting;
use remora::RemotingError;
use remora::keys;
use remora_testing::DelayHandler;
use remora_testing::EchoHandler;
use remora_testing::FailingHandler;
use remora_testing::PanickingHandler;
use serde_json::json;

/// Test that the echo handler returns exactly what was sent.
#[tokio::test]
async fn test_echo_round_trip() {
    remora_testing::init_tracing();
    let remoting = Remoting::new();
    let _server = start_server(&remoting, "local://echo:5400/", Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let client = connected_client(&remoting, "local://echo:5400/", Configuration::new(), "echo").await;

    assert_eq!(client.invoke(json!("abc")).await.unwrap(), json!("abc"));
    assert_eq!(client.invoke(json!(17)).await.unwrap(), json!(17));

    client.disconnect().await;
    assert!(!client.is_connected());
}

/// Test that handler errors and panics reach the caller as typed remote
/// errors and leave the server usable.
#[tokio::test]
async fn test_handler_failures_are_remote_errors() {
    let remoting = Remoting::new();
    let server =
        start_server(&remoting, "local://faulty:5401/", Configuration::new(), "fail", Arc::new(FailingHandler::new("boom")))
            .await;
    server.add_invocation_handler("panic", Arc::new(PanickingHandler));
    server.add_invocation_handler("echo", Arc::new(EchoHandler));

    let failing = connected_client(&remoting, "local://faulty:5401/", Configuration::new(), "fail").await;
    let error = failing.invoke(json!(1)).await.unwrap_err();
    assert_eq!(error.remote_kind(), Some(RemoteErrorKind::HandlerFailed));
    assert!(error.to_string().contains("boom"));

    let panicking = connected_client(&remoting, "local://faulty:5401/", Configuration::new(), "panic").await;
    let error = panicking.invoke(json!(1)).await.unwrap_err();
    assert_eq!(error.remote_kind(), Some(RemoteErrorKind::HandlerPanicked));

    let echo = connected_client(&remoting, "local://faulty:5401/", Configuration::new(), "echo").await;
    assert_eq!(echo.invoke(json!("still alive")).await.unwrap(), json!("still alive"));

    // Three clients on one locator share a single invoker.
    assert_eq!(remoting.invoker_registry().registered_count(), 1);
    for client in [failing, panicking, echo] {
        client.disconnect().await;
    }
    assert_eq!(remoting.invoker_registry().registered_count(), 0);
}

/// Test that a call without a subsystem is rejected when several handlers
/// are registered, and routed when only one is.
#[tokio::test]
async fn test_unnamed_subsystem_dispatch() {
    let remoting = Remoting::new();
    let server = start_server(&remoting, "local://multi:5402/", Configuration::new(), "a", Arc::new(EchoHandler)).await;

    let client = remoting.client(locator("local://multi:5402/"), Configuration::new()).unwrap();
    client.connect().await.unwrap();
    assert_eq!(client.invoke(json!("only")).await.unwrap(), json!("only"));

    server.add_invocation_handler("b", Arc::new(EchoHandler));
    let error = client.invoke(json!("which")).await.unwrap_err();
    assert_eq!(error.remote_kind(), Some(RemoteErrorKind::AmbiguousSubsystem));

    let named = connected_client(&remoting, "local://multi:5402/", Configuration::new(), "missing").await;
    let error = named.invoke(json!(0)).await.unwrap_err();
    assert_eq!(error.remote_kind(), Some(RemoteErrorKind::NoHandler));

    client.disconnect().await;
    named.disconnect().await;
}

/// Test that replacing a handler returns the previous one.
#[tokio::test]
async fn test_add_invocation_handler_returns_previous() {
    let remoting = Remoting::new();
    let connector = remoting.connector(locator("local://replace:5403/"), Configuration::new()).unwrap();
    assert!(connector.add_invocation_handler("echo", Arc::new(EchoHandler)).is_none());
    let previous = connector.add_invocation_handler("ECHO", Arc::new(FailingHandler::new("x"))).unwrap();
    assert_eq!(previous.name(), "EchoHandler");
    assert_eq!(connector.server_invoker().handler_subsystems(), vec!["echo".to_string()]);
}

/// Test that a second connector on an equivalent locator fails at creation.
#[tokio::test]
async fn test_duplicate_connector_is_a_configuration_error() {
    let remoting = Remoting::new();
    let _first = start_server(&remoting, "local://dup:5404/", Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let second = remoting.connector(locator("local://dup:5404/?timeout=1000"), Configuration::new());
    assert!(matches!(second, Err(RemotingError::Configuration { .. })));
}

/// Test that invoking before connect and connecting to nothing both fail.
#[tokio::test]
async fn test_connection_errors() {
    let remoting = Remoting::new();
    let client = remoting.client(locator("local://nowhere:5405/"), Configuration::new()).unwrap();

    let error = client.invoke(json!(1)).await.unwrap_err();
    assert!(matches!(error, RemotingError::NotConnected { .. }));

    let error = client.connect().await.unwrap_err();
    assert!(error.is_connection_error(), "unexpected error: {error}");
    assert!(!client.is_connected());
    assert_eq!(remoting.invoker_registry().registered_count(), 0);
}

/// Test that a `timeout` metadata entry overrides the invocation timeout.
#[tokio::test(start_paused = true)]
async fn test_per_call_timeout_override() {
    let remoting = Remoting::new();
    let _server = start_server(
        &remoting,
        "local://slow:5406/",
        Configuration::new(),
        "slow",
        Arc::new(DelayHandler::new(Duration::from_millis(500))),
    )
    .await;
    let client = connected_client(&remoting, "local://slow:5406/", Configuration::new(), "slow").await;

    let mut metadata = Metadata::new();
    metadata.insert(keys::TIMEOUT.to_string(), "100".to_string());
    let error = client.invoke_with_metadata(json!(1), metadata).await.unwrap_err();
    assert!(error.is_timeout(), "unexpected error: {error}");

    assert_eq!(client.invoke(json!(2)).await.unwrap(), json!(2));
    client.disconnect().await;
}
