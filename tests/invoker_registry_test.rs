//! Client invoker sharing, deferred destruction and failure isolation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::connected_client;
use common::locator;
use common::start_server;
use remora::Configuration;
use remora::Remoting;
use remora::keys;
use remora_testing::EchoHandler;
use serde_json::json;

const URI: &str = "local://registry:5500/";

fn invoker_id(client: &remora::Client) -> u64 {
    client.invoker().expect("client is connected").id()
}

/// Test that connects racing on several worker threads for one locator
/// share a single invoker.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_get_invoker_returns_same_instance() {
    let remoting = Remoting::new();
    let _server = start_server(&remoting, URI, Configuration::new(), "echo", Arc::new(EchoHandler)).await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = remoting.client(locator(URI), Configuration::new()).unwrap();
            tokio::spawn(async move {
                client.connect().await.map(|()| client)
            })
        })
        .collect();
    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap().unwrap());
    }

    let shared = clients[0].invoker().unwrap();
    for client in &clients {
        assert!(Arc::ptr_eq(&client.invoker().unwrap(), &shared));
    }
    assert_eq!(remoting.invoker_registry().registered_count(), 1);
    assert_eq!(remoting.local_network().connect_count("registry:5500"), 1);

    let (last, rest) = clients.split_last().unwrap();
    for client in rest {
        client.disconnect().await;
    }
    assert_eq!(remoting.invoker_registry().registered_count(), 1);
    last.disconnect().await;
    assert_eq!(remoting.invoker_registry().registered_count(), 0);
}

/// Test that with no destruction delay a released invoker is destroyed at
/// once and the next connect builds a new one.
#[tokio::test]
async fn test_zero_delay_destroys_immediately() {
    let remoting = Remoting::new();
    let _server = start_server(&remoting, URI, Configuration::new(), "echo", Arc::new(EchoHandler)).await;

    let client = connected_client(&remoting, URI, Configuration::new(), "echo").await;
    let first_id = invoker_id(&client);
    client.disconnect().await;
    assert!(!remoting.invoker_registry().is_registered(&locator(URI), false));
    assert!(!remoting.invoker_registry().destruction_timer_active());

    let client = connected_client(&remoting, URI, Configuration::new(), "echo").await;
    assert_ne!(invoker_id(&client), first_id);
    client.disconnect().await;
}

/// Test that a positive delay keeps the invoker for reuse until it elapses.
#[tokio::test(start_paused = true)]
async fn test_positive_delay_reuses_then_destroys() {
    let remoting = Remoting::new();
    let _server = start_server(&remoting, URI, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let config = || Configuration::new().with(keys::INVOKER_DESTRUCTION_DELAY, 1000);
    let registry = remoting.invoker_registry().clone();

    let client = connected_client(&remoting, URI, config(), "echo").await;
    let first_id = invoker_id(&client);
    client.disconnect().await;
    assert_eq!(registry.registered_count(), 1);
    assert!(registry.destruction_timer_active());

    tokio::time::sleep(Duration::from_millis(500)).await;
    let client = connected_client(&remoting, URI, config(), "echo").await;
    assert_eq!(invoker_id(&client), first_id);
    assert!(!registry.destruction_timer_active());
    client.disconnect().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(registry.registered_count(), 0);
    assert!(!registry.destruction_timer_active());

    let client = connected_client(&remoting, URI, config(), "echo").await;
    assert_ne!(invoker_id(&client), first_id);
    client.disconnect().await;
}

/// Test that a failed connect leaves nothing registered and a later connect
/// succeeds once the server is up.
#[tokio::test]
async fn test_failed_connect_is_not_registered() {
    let remoting = Remoting::new();
    let client = remoting.client(locator(URI), Configuration::new()).unwrap();
    assert!(client.connect().await.is_err());
    assert_eq!(remoting.invoker_registry().registered_count(), 0);

    let _server = start_server(&remoting, URI, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    client.connect().await.unwrap();
    assert_eq!(client.invoke(json!("up")).await.unwrap(), json!("up"));
    client.disconnect().await;
}

/// Test that many short-lived leasing clients leave no invoker and no
/// destruction timer behind once the delay has passed.
#[tokio::test(start_paused = true)]
async fn test_short_lived_leasing_clients_leave_nothing_behind() {
    let remoting = Remoting::new();
    let server_config = Configuration::new().with(keys::LEASE_PERIOD, 1000);
    let server = start_server(&remoting, URI, server_config, "echo", Arc::new(EchoHandler)).await;
    let client_config = || {
        Configuration::new().with(keys::ENABLE_LEASE, true).with(keys::INVOKER_DESTRUCTION_DELAY, 5000)
    };

    for n in 0..50 {
        let client = connected_client(&remoting, URI, client_config(), "echo").await;
        assert!(client.lease_period().is_some());
        assert_eq!(client.invoke(json!(n)).await.unwrap(), json!(n));
        client.disconnect().await;
    }
    assert_eq!(remoting.invoker_registry().registered_count(), 1);
    assert!(server.server_invoker().active_leases().is_empty());

    tokio::time::sleep(Duration::from_millis(5500)).await;
    let registry = remoting.invoker_registry();
    assert_eq!(registry.registered_count(), 0);
    assert!(!registry.destruction_timer_active());
    assert_eq!(registry.pending_destructions(), 0);
}

/// Test that shutdown destroys pending invokers immediately.
#[tokio::test(start_paused = true)]
async fn test_shutdown_destroys_pending_invokers() {
    let remoting = Remoting::new();
    let _server = start_server(&remoting, URI, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let client =
        connected_client(&remoting, URI, Configuration::new().with(keys::INVOKER_DESTRUCTION_DELAY, 60_000), "echo").await;
    client.disconnect().await;
    assert_eq!(remoting.invoker_registry().registered_count(), 1);

    remoting.shutdown().await;
    assert_eq!(remoting.invoker_registry().registered_count(), 0);
    tokio::task::yield_now().await;
    assert!(!remoting.invoker_registry().destruction_timer_active());
}
