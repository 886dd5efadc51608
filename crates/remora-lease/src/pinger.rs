//! Client-side lease maintenance.
//!
//! One [`LeasePinger`] exists per physical client invoker. Every logical
//! client sharing that invoker registers with the pinger, and a single
//! periodic task refreshes all of their server-side leases in one batched
//! ping. The ping interval is the smallest registered period.
//!
//! # Tiger Style
//!
//! - Exactly one ping task per pinger; replacing it cancels the old task
//!   before the new one is installed
//! - Every tick checks the schedule generation it was created for, so a
//!   replaced task that is already running cannot act
//! - Ping failures are logged and retried; clients are only removed
//!   explicitly

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use remora_core::LeaseAck;
use remora_core::LeaseEntry;
use remora_core::Metadata;
use remora_core::RemotingError;
use remora_core::Result;
use remora_core::verified::compute_ping_interval;
use remora_core::verified::should_reschedule_on_add;
use remora_core::verified::should_report_ping_failure;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::notifier::ConnectionListener;
use crate::notifier::ConnectionLostEvent;
use crate::notifier::LossCause;
use crate::timer::TickOutcome;
use crate::timer::TimerService;
use crate::timer::TimerTask;

/// The physical connection a pinger sends through.
#[async_trait]
pub trait PingSender: Send + Sync {
    /// Refresh the leases of `clients` in one round trip.
    async fn send_ping(&self, clients: Vec<LeaseEntry>, timeout: Duration) -> Result<LeaseAck>;

    /// Tell the server that `session_id` disconnected.
    async fn send_disconnect(&self, session_id: &str, timeout: Duration) -> Result<()>;

    /// Locator URI reported in notifications.
    fn locator_uri(&self) -> String;
}

#[derive(Clone)]
struct PingClient {
    listener: Arc<dyn ConnectionListener>,
    period_ms: u64,
}

#[derive(Default)]
struct PingerState {
    clients: BTreeMap<String, PingClient>,
    started: bool,
    stopped: bool,
    interval_ms: Option<u64>,
    generation: u64,
    task: Option<TimerTask>,
    consecutive_failures: u32,
}

struct PingerInner {
    sender: Weak<dyn PingSender>,
    timer: TimerService,
    ping_timeout: Duration,
    state: Mutex<PingerState>,
}

/// Batching lease refresher for the logical clients of one physical invoker.
pub struct LeasePinger {
    inner: Arc<PingerInner>,
}

impl LeasePinger {
    /// Create an idle pinger. Pinging starts with [`LeasePinger::start_ping`].
    pub fn new(sender: Weak<dyn PingSender>, timer: TimerService, ping_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PingerInner {
                sender,
                timer,
                ping_timeout,
                state: Mutex::new(PingerState::default()),
            }),
        }
    }

    /// Register a logical client pinging at `period`.
    ///
    /// Once pinging has started, a period shorter than the current interval
    /// replaces the ping task; a longer or equal one leaves it untouched.
    pub fn add_client(&self, session_id: impl Into<String>, listener: Arc<dyn ConnectionListener>, period: Duration) {
        let session_id = session_id.into();
        let period_ms = period.as_millis() as u64;
        let mut state = self.inner.state.lock();
        let replaced = state.clients.insert(session_id.clone(), PingClient { listener, period_ms });
        debug!(session_id = %session_id, period_ms, clients = state.clients.len(), "lease client added");

        if !state.started || state.stopped {
            return;
        }
        let reschedule = match replaced {
            None => should_reschedule_on_add(state.interval_ms, period_ms),
            Some(_) => compute_ping_interval(state.clients.values().map(|c| c.period_ms)) != state.interval_ms,
        };
        if reschedule {
            let interval_ms = compute_ping_interval(state.clients.values().map(|c| c.period_ms));
            self.inner.reschedule(&mut state, interval_ms);
        }
    }

    /// Begin periodic pinging. No-op if already started or no client is registered.
    pub fn start_ping(&self) {
        let mut state = self.inner.state.lock();
        if state.started || state.stopped || state.clients.is_empty() {
            return;
        }
        state.started = true;
        let interval_ms = compute_ping_interval(state.clients.values().map(|c| c.period_ms));
        self.inner.reschedule(&mut state, interval_ms);
        info!(
            locator = %self.locator_uri(),
            interval_ms = ?state.interval_ms,
            clients = state.clients.len(),
            "lease pinging started"
        );
    }

    /// Unregister a logical client and tell the server, bounded by
    /// `disconnect_timeout` (the ping timeout if `None`).
    ///
    /// The disconnect is best effort: failures are logged and swallowed.
    /// Returns true when no client remains, in which case the ping task is
    /// stopped.
    pub async fn remove_client(&self, session_id: &str, disconnect_timeout: Option<Duration>) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let removed = state.clients.remove(session_id).is_some();
            if removed && state.started {
                if state.clients.is_empty() {
                    state.generation = state.generation.wrapping_add(1);
                    state.task.take();
                    state.interval_ms = None;
                    state.started = false;
                    debug!(session_id, "last lease client removed, ping task stopped");
                } else {
                    let interval_ms = compute_ping_interval(state.clients.values().map(|c| c.period_ms));
                    if interval_ms != state.interval_ms {
                        self.inner.reschedule(&mut state, interval_ms);
                    }
                }
            }
            removed
        };

        if removed {
            let timeout = disconnect_timeout.unwrap_or(self.inner.ping_timeout);
            match self.inner.sender.upgrade() {
                Some(sender) => {
                    if let Err(error) = sender.send_disconnect(session_id, timeout).await {
                        warn!(session_id, error = %error, "lease disconnect failed, ignoring");
                    }
                }
                None => debug!(session_id, "invoker gone, skipping lease disconnect"),
            }
        }

        self.client_count() == 0
    }

    /// Ping once right now, outside the schedule.
    pub async fn ping_now(&self) -> Result<LeaseAck> {
        self.inner.ping().await
    }

    /// Current effective ping interval, if pinging.
    pub fn effective_interval(&self) -> Option<Duration> {
        self.inner.state.lock().interval_ms.map(Duration::from_millis)
    }

    /// Number of registered logical clients.
    pub fn client_count(&self) -> usize {
        self.inner.state.lock().clients.len()
    }

    /// Whether `session_id` is registered.
    pub fn has_client(&self, session_id: &str) -> bool {
        self.inner.state.lock().clients.contains_key(session_id)
    }

    /// Whether the ping task runs.
    pub fn is_pinging(&self) -> bool {
        self.inner.state.lock().task.is_some()
    }

    /// Locator URI of the physical invoker.
    pub fn locator_uri(&self) -> String {
        self.inner.sender.upgrade().map(|s| s.locator_uri()).unwrap_or_default()
    }

    /// Stop pinging and forget every client. Sends nothing.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        state.generation = state.generation.wrapping_add(1);
        state.task.take();
        state.interval_ms = None;
        state.clients.clear();
        debug!("lease pinger stopped");
    }
}

impl Drop for LeasePinger {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for LeasePinger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LeasePinger")
            .field("clients", &state.clients.len())
            .field("interval_ms", &state.interval_ms)
            .field("generation", &state.generation)
            .finish()
    }
}

impl PingerInner {
    /// Cancel the current task, then install one at `interval_ms`.
    fn reschedule(self: &Arc<Self>, state: &mut PingerState, interval_ms: Option<u64>) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(old) = state.task.take() {
            old.cancel();
        }
        state.interval_ms = interval_ms;
        let Some(interval_ms) = interval_ms else {
            return;
        };

        let generation = state.generation;
        let weak = Arc::downgrade(self);
        state.task = Some(self.timer.schedule_repeating(Duration::from_millis(interval_ms), move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.tick(generation).await,
                    None => TickOutcome::Stop,
                }
            }
        }));
        debug!(interval_ms, generation, "lease ping task scheduled");
    }

    async fn tick(&self, generation: u64) -> TickOutcome {
        {
            let state = self.state.lock();
            if state.stopped || state.generation != generation {
                return TickOutcome::Stop;
            }
        }
        if self.sender.upgrade().is_none() {
            return TickOutcome::Stop;
        }
        // Failures are recorded inside ping().
        let _ = self.ping().await;
        TickOutcome::Continue
    }

    async fn ping(&self) -> Result<LeaseAck> {
        let entries: Vec<LeaseEntry> = {
            let state = self.state.lock();
            state
                .clients
                .iter()
                .map(|(session_id, client)| LeaseEntry {
                    session_id: session_id.clone(),
                    period_ms: client.period_ms,
                })
                .collect()
        };
        let Some(sender) = self.sender.upgrade() else {
            return Err(RemotingError::NotConnected {
                reason: "client invoker destroyed".to_string(),
            });
        };
        if entries.is_empty() {
            return Err(RemotingError::NotConnected {
                reason: "no lease clients registered".to_string(),
            });
        }

        let locator = sender.locator_uri();
        match sender.send_ping(entries, self.ping_timeout).await {
            Ok(ack) => {
                let recovered = {
                    let mut state = self.state.lock();
                    std::mem::take(&mut state.consecutive_failures)
                };
                if recovered > 0 {
                    info!(locator = %locator, failures = recovered, "lease ping recovered");
                }
                Ok(ack)
            }
            Err(error) => {
                let (failures, to_notify) = {
                    let mut state = self.state.lock();
                    state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                    let failures = state.consecutive_failures;
                    let to_notify: Vec<(String, Arc<dyn ConnectionListener>)> = if should_report_ping_failure(failures)
                    {
                        state.clients.iter().map(|(id, c)| (id.clone(), c.listener.clone())).collect()
                    } else {
                        Vec::new()
                    };
                    (failures, to_notify)
                };
                warn!(locator = %locator, failures, error = %error, "lease ping failed");

                for (session_id, listener) in to_notify {
                    let event = ConnectionLostEvent {
                        client_session_id: session_id,
                        locator_uri: locator.clone(),
                        client_metadata: Metadata::new(),
                        cause: Some(LossCause::PingFailed {
                            consecutive_failures: failures,
                            last_error: error.to_string(),
                        }),
                    };
                    listener.handle_connection_lost(&event).await;
                }
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    struct FakeSender {
        pings: Mutex<Vec<(Instant, Vec<LeaseEntry>)>>,
        disconnects: Mutex<Vec<String>>,
        failing: AtomicBool,
        hang_disconnect: AtomicBool,
    }

    #[async_trait]
    impl PingSender for FakeSender {
        async fn send_ping(&self, clients: Vec<LeaseEntry>, _timeout: Duration) -> Result<LeaseAck> {
            self.pings.lock().push((Instant::now(), clients));
            if self.failing.load(Ordering::SeqCst) {
                return Err(RemotingError::Timeout {
                    operation: "lease ping".to_string(),
                    timeout_ms: 1,
                });
            }
            Ok(LeaseAck {
                leasing_enabled: true,
                lease_period_ms: 5000,
            })
        }

        async fn send_disconnect(&self, session_id: &str, timeout: Duration) -> Result<()> {
            if self.hang_disconnect.load(Ordering::SeqCst) {
                tokio::time::sleep(timeout).await;
                return Err(RemotingError::Timeout {
                    operation: "disconnect".to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            self.disconnects.lock().push(session_id.to_string());
            Ok(())
        }

        fn locator_uri(&self) -> String {
            "local://server:1/".to_string()
        }
    }

    #[derive(Default)]
    struct CountingListener {
        lost: AtomicU32,
    }

    #[async_trait]
    impl ConnectionListener for CountingListener {
        async fn handle_connection_lost(&self, event: &ConnectionLostEvent) {
            assert!(matches!(event.cause, Some(LossCause::PingFailed { .. })));
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pinger(sender: &Arc<FakeSender>, timer: &TimerService) -> LeasePinger {
        let weak: Weak<dyn PingSender> = Arc::downgrade(sender) as Weak<dyn PingSender>;
        LeasePinger::new(weak, timer.clone(), Duration::from_millis(2000))
    }

    fn listener() -> Arc<CountingListener> {
        Arc::new(CountingListener::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_is_minimum_and_follows_removal() {
        let sender = Arc::new(FakeSender::default());
        let timer = TimerService::new("ping");
        let pinger = pinger(&sender, &timer);

        pinger.add_client("a", listener(), Duration::from_millis(5000));
        pinger.add_client("b", listener(), Duration::from_millis(10000));
        assert_eq!(pinger.effective_interval(), None);
        pinger.start_ping();
        assert_eq!(pinger.effective_interval(), Some(Duration::from_millis(5000)));

        pinger.add_client("c", listener(), Duration::from_millis(3000));
        assert_eq!(pinger.effective_interval(), Some(Duration::from_millis(3000)));
        assert_eq!(timer.pending_tasks(), 1);

        assert!(!pinger.remove_client("c", None).await);
        assert_eq!(pinger.effective_interval(), Some(Duration::from_millis(5000)));
        assert_eq!(timer.pending_tasks(), 1);
        assert_eq!(sender.disconnects.lock().as_slice(), ["c".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_longer_period_keeps_schedule() {
        let sender = Arc::new(FakeSender::default());
        let timer = TimerService::new("ping");
        let pinger = pinger(&sender, &timer);

        pinger.add_client("a", listener(), Duration::from_millis(1000));
        pinger.start_ping();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        pinger.add_client("b", listener(), Duration::from_millis(4000));

        tokio::time::sleep(Duration::from_millis(600)).await;
        let pings = sender.pings.lock();
        assert_eq!(pings.len(), 2, "schedule must not restart when a longer period is added");
        assert_eq!(pings[1].1.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replacement_never_leaves_two_tasks() {
        let sender = Arc::new(FakeSender::default());
        let timer = TimerService::new("ping");
        let pinger = pinger(&sender, &timer);

        pinger.add_client("a", listener(), Duration::from_millis(1000));
        pinger.start_ping();
        for (i, period) in [900u64, 800, 700, 600, 500].into_iter().enumerate() {
            pinger.add_client(format!("c{i}"), listener(), Duration::from_millis(period));
            assert_eq!(timer.pending_tasks(), 1);
        }

        tokio::time::sleep(Duration::from_millis(2050)).await;
        assert_eq!(sender.pings.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removing_last_client_stops_timer() {
        let sender = Arc::new(FakeSender::default());
        let timer = TimerService::new("ping");
        let pinger = pinger(&sender, &timer);

        pinger.add_client("a", listener(), Duration::from_millis(1000));
        pinger.start_ping();
        assert!(timer.has_timer());
        assert!(pinger.remove_client("a", None).await);
        assert!(!timer.has_timer());
        assert!(!pinger.is_pinging());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_retried_and_reported_once() {
        let sender = Arc::new(FakeSender::default());
        sender.failing.store(true, Ordering::SeqCst);
        let timer = TimerService::new("ping");
        let pinger = pinger(&sender, &timer);
        let watcher = listener();

        pinger.add_client("a", watcher.clone(), Duration::from_millis(100));
        pinger.start_ping();
        tokio::time::sleep(Duration::from_millis(1050)).await;

        assert_eq!(sender.pings.lock().len(), 10);
        assert_eq!(watcher.lost.load(Ordering::SeqCst), 1);
        assert_eq!(pinger.client_count(), 1);

        sender.failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        sender.failing.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(watcher.lost.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_bounded_by_timeout() {
        let sender = Arc::new(FakeSender::default());
        sender.hang_disconnect.store(true, Ordering::SeqCst);
        let timer = TimerService::new("ping");
        let pinger = pinger(&sender, &timer);

        pinger.add_client("a", listener(), Duration::from_millis(1000));
        let started = Instant::now();
        assert!(pinger.remove_client("a", Some(Duration::from_millis(50))).await);
        assert!(started.elapsed() <= Duration::from_millis(100));
    }
}
