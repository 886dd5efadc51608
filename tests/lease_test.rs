//! Lease establishment, expiry and ping scheduling across client and server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::connected_client;
use common::start_server;
use remora::Configuration;
use remora::LossCause;
use remora::Remoting;
use remora::keys;
use remora_testing::EchoHandler;
use remora_testing::RecordingConnectionListener;
use tokio::time::Instant;

/// Test that a client that stops pinging is reported with a null cause
/// roughly two periods later.
#[tokio::test(start_paused = true)]
async fn test_silent_client_expires_within_window() {
    let remoting = Remoting::new();
    let uri = "local://lease:5600/?leasePeriod=1000";
    let server = start_server(&remoting, uri, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let recorder = Arc::new(RecordingConnectionListener::default());
    server.add_connection_listener(recorder.clone());

    let client = connected_client(&remoting, uri, Configuration::new().with(keys::ENABLE_LEASE, true), "echo").await;
    assert_eq!(client.lease_period(), Some(Duration::from_millis(1000)));
    assert_eq!(server.server_invoker().active_leases(), vec![client.session_id().to_string()]);

    let silenced_at = Instant::now();
    remoting.local_network().set_reachable("lease:5600", false);
    assert!(recorder.wait_for(1, Duration::from_secs(10)).await);

    let (fired_at, event) = recorder.timed_events().remove(0);
    let elapsed = fired_at - silenced_at;
    assert!(elapsed >= Duration::from_millis(1500), "fired too early: {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(2500), "fired too late: {elapsed:?}");
    assert!(event.is_expiry());
    assert_eq!(event.client_session_id, client.session_id());
    assert!(server.server_invoker().active_leases().is_empty());

    // The server stays unreachable; teardown is bounded and adds no event.
    client.set_disconnect_timeout(Duration::from_millis(100));
    let started = Instant::now();
    client.disconnect().await;
    assert!(started.elapsed() <= Duration::from_millis(200));
    assert_eq!(recorder.count(), 1);
}

/// Test that pings keep the lease alive and an explicit disconnect is
/// reported with a non-null cause.
#[tokio::test(start_paused = true)]
async fn test_explicit_disconnect_has_cause() {
    let remoting = Remoting::new();
    let uri = "local://lease:5601/?leasePeriod=1000";
    let server = start_server(&remoting, uri, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let recorder = Arc::new(RecordingConnectionListener::default());
    server.add_connection_listener(recorder.clone());

    let client = connected_client(&remoting, uri, Configuration::new().with(keys::ENABLE_LEASE, true), "echo").await;
    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(recorder.count(), 0);
    assert_eq!(server.server_invoker().active_leases().len(), 1);

    client.disconnect().await;
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cause, Some(LossCause::ClientDisconnected));
    assert!(server.server_invoker().active_leases().is_empty());
}

/// Test that leasing stays off when the server neither configures a lease
/// period nor has connection listeners.
#[tokio::test]
async fn test_leasing_disabled_server() {
    let remoting = Remoting::new();
    let uri = "local://lease:5602/";
    let server = start_server(&remoting, uri, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let client = connected_client(&remoting, uri, Configuration::new().with(keys::ENABLE_LEASE, true), "echo").await;
    assert_eq!(client.lease_period(), None);
    assert!(server.server_invoker().active_leases().is_empty());
    client.disconnect().await;
}

/// Test that the ping interval follows the shortest registered client
/// period, and grows again when that client leaves.
#[tokio::test(start_paused = true)]
async fn test_ping_interval_tracks_minimum_period() {
    let remoting = Remoting::new();
    let uri = "local://lease:5603/?leasePeriod=5000";
    let server = start_server(&remoting, uri, Configuration::new(), "echo", Arc::new(EchoHandler)).await;

    let leasing = |period: u64| {
        Configuration::new().with(keys::ENABLE_LEASE, true).with(keys::CLIENT_LEASE_PERIOD, period)
    };
    let slow = connected_client(&remoting, uri, leasing(10_000), "echo").await;
    let invoker = slow.invoker().unwrap();
    assert_eq!(invoker.lease_ping_interval(), Some(Duration::from_millis(10_000)));

    let medium = connected_client(&remoting, uri, leasing(5_000), "echo").await;
    let fast = connected_client(&remoting, uri, leasing(3_000), "echo").await;
    assert_eq!(invoker.lease_ping_interval(), Some(Duration::from_millis(3_000)));
    assert_eq!(server.server_invoker().client_lease_period(fast.session_id()), Some(Duration::from_millis(3_000)));

    fast.disconnect().await;
    assert_eq!(invoker.lease_ping_interval(), Some(Duration::from_millis(5_000)));

    medium.disconnect().await;
    slow.disconnect().await;
    assert_eq!(invoker.lease_ping_interval(), None);
    assert_eq!(remoting.invoker_registry().registered_count(), 0);
}

/// Test that clients registered at a long period stay leased while pings
/// run at the shorter shared interval.
#[tokio::test(start_paused = true)]
async fn test_shared_pings_refresh_every_client() {
    let remoting = Remoting::new();
    let uri = "local://lease:5604/?leasePeriod=1000";
    let server = start_server(&remoting, uri, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let recorder = Arc::new(RecordingConnectionListener::default());
    server.add_connection_listener(recorder.clone());

    let config = || Configuration::new().with(keys::ENABLE_LEASE, true);
    let clients = [
        connected_client(&remoting, uri, config(), "echo").await,
        connected_client(&remoting, uri, config(), "echo").await,
        connected_client(&remoting, uri, config(), "echo").await,
    ];
    tokio::time::sleep(Duration::from_millis(8_000)).await;
    assert_eq!(server.server_invoker().active_leases().len(), 3);
    assert_eq!(recorder.count(), 0);

    for client in &clients {
        client.disconnect().await;
    }
    assert_eq!(recorder.count(), 3);
}

/// Test that a client joining an invoker whose pinger just lost its last
/// client keeps that pinger alive and stays leased.
#[tokio::test(start_paused = true)]
async fn test_join_after_last_client_left_keeps_pinger() {
    let remoting = Remoting::new();
    let uri = "local://lease:5605/?leasePeriod=1000";
    let server = start_server(&remoting, uri, Configuration::new(), "echo", Arc::new(EchoHandler)).await;
    let recorder = Arc::new(RecordingConnectionListener::default());
    server.add_connection_listener(recorder.clone());

    let config = || Configuration::new().with(keys::ENABLE_LEASE, true);
    let first = connected_client(&remoting, uri, config(), "echo").await;
    let invoker = first.invoker().unwrap();
    let pinger = invoker.lease_pinger().unwrap();

    // The first client's lease is gone but the slot has not been cleared yet.
    assert!(pinger.remove_client(first.session_id(), Some(Duration::from_millis(100))).await);
    assert_eq!(pinger.client_count(), 0);
    assert_eq!(recorder.count(), 1);

    let second = connected_client(&remoting, uri, config(), "echo").await;
    assert!(Arc::ptr_eq(&second.invoker().unwrap(), &invoker));
    assert!(Arc::ptr_eq(&invoker.lease_pinger().unwrap(), &pinger));
    assert!(!invoker.release_idle_pinger(&pinger));
    assert!(invoker.has_lease_client(second.session_id()));
    assert!(pinger.is_pinging());

    tokio::time::sleep(Duration::from_millis(10_000)).await;
    assert_eq!(recorder.count(), 1);
    assert_eq!(server.server_invoker().active_leases(), vec![second.session_id().to_string()]);

    second.disconnect().await;
    assert_eq!(recorder.count(), 2);
    assert_eq!(recorder.events()[1].cause, Some(LossCause::ClientDisconnected));
    assert_eq!(invoker.lease_pinger().map(|p| p.client_count()), None);

    first.disconnect().await;
    assert_eq!(remoting.invoker_registry().registered_count(), 0);
}
