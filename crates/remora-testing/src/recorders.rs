//! Recorders capturing notifications and callbacks.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use remora_core::Callback;
use remora_core::InvokerCallbackHandler;
use remora_core::Payload;
use remora_lease::ConnectionListener;
use remora_lease::ConnectionLostEvent;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Records every connection-lost event with the time it arrived.
#[derive(Default)]
pub struct RecordingConnectionListener {
    events: Mutex<Vec<(Instant, ConnectionLostEvent)>>,
    notify: Notify,
}

impl RecordingConnectionListener {
    pub fn events(&self) -> Vec<ConnectionLostEvent> {
        self.events.lock().iter().map(|(_, event)| event.clone()).collect()
    }

    /// Events with their arrival time.
    pub fn timed_events(&self) -> Vec<(Instant, ConnectionLostEvent)> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    /// Wait until at least `n` events arrived. Returns false on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ConnectionListener for RecordingConnectionListener {
    async fn handle_connection_lost(&self, event: &ConnectionLostEvent) {
        self.events.lock().push((Instant::now(), event.clone()));
        self.notify.notify_waiters();
    }
}

/// Records every callback delivered to it.
#[derive(Default)]
pub struct RecordingCallbackHandler {
    callbacks: Mutex<Vec<Callback>>,
    notify: Notify,
}

impl RecordingCallbackHandler {
    pub fn callbacks(&self) -> Vec<Callback> {
        self.callbacks.lock().clone()
    }

    pub fn payloads(&self) -> Vec<Payload> {
        self.callbacks.lock().iter().map(|c| c.payload.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Wait until at least `n` callbacks arrived. Returns false on timeout.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.count() >= n {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl InvokerCallbackHandler for RecordingCallbackHandler {
    async fn handle_callback(&self, callback: Callback) -> anyhow::Result<()> {
        self.callbacks.lock().push(callback);
        self.notify.notify_waiters();
        Ok(())
    }
}
