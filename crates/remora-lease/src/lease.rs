//! Server-observed liveness of one remote client.
//!
//! ```text
//! Created --start--> Active --(update)*--> Expired      (no heartbeat, cause None)
//!                       \------terminate-> Terminated   (explicit, cause Some)
//!                        \-----stop------> Terminated   (silent, server shutdown)
//! ```
//!
//! An active lease checks itself every quarter period. Once the time since
//! the last update exceeds the window, the listener is notified exactly once
//! and the lease is terminal. A new [`Lease`] must be created to track the
//! same client again.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use remora_core::Metadata;
use remora_core::verified::compute_initial_lease_window;
use remora_core::verified::compute_lease_check_interval;
use remora_core::verified::compute_updated_lease_window;
use remora_core::verified::is_lease_expired;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;

use crate::notifier::ConnectionListener;
use crate::notifier::ConnectionLostEvent;
use crate::notifier::LossCause;
use crate::timer::TickOutcome;
use crate::timer::TimerService;
use crate::timer::TimerTask;

/// Lifecycle phase of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeasePhase {
    /// Constructed, not yet checking.
    Created,
    /// Checking for expiry.
    Active,
    /// Expired without heartbeat; the listener was notified.
    Expired,
    /// Ended explicitly.
    Terminated,
}

impl LeasePhase {
    /// Whether the lease can no longer fire.
    pub fn is_terminal(self) -> bool {
        matches!(self, LeasePhase::Expired | LeasePhase::Terminated)
    }
}

struct LeaseState {
    phase: LeasePhase,
    period_ms: u64,
    window_ms: u64,
    last_update: Instant,
    check_task: Option<TimerTask>,
}

struct LeaseInner {
    client_session_id: String,
    locator_uri: String,
    client_metadata: Metadata,
    listener: Arc<dyn ConnectionListener>,
    timer: TimerService,
    state: Mutex<LeaseState>,
}

/// Liveness countdown for one remote client.
pub struct Lease {
    inner: Arc<LeaseInner>,
}

impl Lease {
    /// Create a lease in the `Created` phase.
    pub fn new(
        client_session_id: impl Into<String>,
        period: Duration,
        locator_uri: impl Into<String>,
        client_metadata: Metadata,
        listener: Arc<dyn ConnectionListener>,
        timer: TimerService,
    ) -> Self {
        let period_ms = period.as_millis() as u64;
        Self {
            inner: Arc::new(LeaseInner {
                client_session_id: client_session_id.into(),
                locator_uri: locator_uri.into(),
                client_metadata,
                listener,
                timer,
                state: Mutex::new(LeaseState {
                    phase: LeasePhase::Created,
                    period_ms,
                    window_ms: compute_initial_lease_window(period_ms),
                    last_update: Instant::now(),
                    check_task: None,
                }),
            }),
        }
    }

    /// Enter `Active` and start checking for expiry. No-op unless `Created`.
    pub fn start(&self) {
        let mut state = self.inner.state.lock();
        if state.phase != LeasePhase::Created {
            return;
        }
        state.phase = LeasePhase::Active;
        state.last_update = Instant::now();
        state.window_ms = compute_initial_lease_window(state.period_ms);
        state.check_task = Some(self.inner.schedule_check(state.period_ms));
        debug!(
            session_id = %self.inner.client_session_id,
            period_ms = state.period_ms,
            window_ms = state.window_ms,
            "lease started"
        );
    }

    /// Record a heartbeat carrying `period`.
    ///
    /// Returns false if the lease is terminal and the update was ignored.
    pub fn update(&self, period: Duration) -> bool {
        let new_period_ms = period.as_millis() as u64;
        let mut state = self.inner.state.lock();
        if state.phase.is_terminal() {
            return false;
        }

        let now = Instant::now();
        let gap_ms = now.saturating_duration_since(state.last_update).as_millis() as u64;
        let old_period_ms = state.period_ms;
        let old_window_ms = state.window_ms;
        state.window_ms = compute_updated_lease_window(old_window_ms, old_period_ms, new_period_ms, gap_ms);
        state.period_ms = new_period_ms;
        state.last_update = now;

        if state.phase == LeasePhase::Active && new_period_ms != old_period_ms {
            // Replace before install so only one check task exists.
            state.check_task.take();
            state.check_task = Some(self.inner.schedule_check(new_period_ms));
        }
        if state.window_ms != old_window_ms {
            debug!(
                session_id = %self.inner.client_session_id,
                gap_ms,
                old_window_ms,
                window_ms = state.window_ms,
                "lease window changed"
            );
        }
        true
    }

    /// End the lease because the client disconnected explicitly.
    ///
    /// Notifies the listener with a non-null cause unless the lease is
    /// already terminal. Returns whether a notification was sent.
    pub async fn terminate(&self) -> bool {
        if !self.inner.finish(LeasePhase::Terminated) {
            return false;
        }
        info!(session_id = %self.inner.client_session_id, "lease terminated by client disconnect");
        self.inner.notify(Some(LossCause::ClientDisconnected)).await;
        true
    }

    /// End the lease without notifying anyone.
    pub fn stop(&self) {
        if self.inner.finish(LeasePhase::Terminated) {
            debug!(session_id = %self.inner.client_session_id, "lease stopped");
        }
    }

    /// Current phase.
    pub fn phase(&self) -> LeasePhase {
        self.inner.state.lock().phase
    }

    /// Whether the lease can no longer fire.
    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Current lease period.
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.inner.state.lock().period_ms)
    }

    /// Current expiry window.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.inner.state.lock().window_ms)
    }

    /// Session id of the tracked client.
    pub fn client_session_id(&self) -> &str {
        &self.inner.client_session_id
    }

    /// Locator URI reported in notifications.
    pub fn locator_uri(&self) -> &str {
        &self.inner.locator_uri
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.state.lock().check_task.take();
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Lease")
            .field("client_session_id", &self.inner.client_session_id)
            .field("phase", &state.phase)
            .field("period_ms", &state.period_ms)
            .field("window_ms", &state.window_ms)
            .finish()
    }
}

impl LeaseInner {
    fn schedule_check(self: &Arc<Self>, period_ms: u64) -> TimerTask {
        let interval = Duration::from_millis(compute_lease_check_interval(period_ms));
        let weak: Weak<LeaseInner> = Arc::downgrade(self);
        self.timer.schedule_repeating(interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(inner) => inner.check().await,
                    None => TickOutcome::Stop,
                }
            }
        })
    }

    async fn check(&self) -> TickOutcome {
        let elapsed_ms = {
            let mut state = self.state.lock();
            if state.phase != LeasePhase::Active {
                return TickOutcome::Stop;
            }
            let elapsed_ms = state.last_update.elapsed().as_millis() as u64;
            if !is_lease_expired(elapsed_ms, state.window_ms) {
                return TickOutcome::Continue;
            }
            state.phase = LeasePhase::Expired;
            state.check_task.take();
            elapsed_ms
        };

        info!(
            session_id = %self.client_session_id,
            locator = %self.locator_uri,
            elapsed_ms,
            "lease expired, no heartbeat received"
        );
        self.notify(None).await;
        TickOutcome::Stop
    }

    /// Move to a terminal phase. Returns false if already terminal.
    fn finish(&self, phase: LeasePhase) -> bool {
        let mut state = self.state.lock();
        if state.phase.is_terminal() {
            return false;
        }
        state.phase = phase;
        state.check_task.take();
        true
    }

    async fn notify(&self, cause: Option<LossCause>) {
        let event = ConnectionLostEvent {
            client_session_id: self.client_session_id.clone(),
            locator_uri: self.locator_uri.clone(),
            client_metadata: self.client_metadata.clone(),
            cause,
        };
        self.listener.handle_connection_lost(&event).await;
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct Recording {
        events: Mutex<Vec<(Instant, ConnectionLostEvent)>>,
    }

    #[async_trait]
    impl ConnectionListener for Recording {
        async fn handle_connection_lost(&self, event: &ConnectionLostEvent) {
            self.events.lock().push((Instant::now(), event.clone()));
        }
    }

    fn lease(period_ms: u64, listener: Arc<Recording>, timer: &TimerService) -> Lease {
        Lease::new(
            "client-1",
            Duration::from_millis(period_ms),
            "local://server:1/",
            Metadata::new(),
            listener,
            timer.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrefreshed_lease_fires_once_within_window_bounds() {
        let timer = TimerService::new("lease");
        let listener = Arc::new(Recording::default());
        let lease = lease(1000, listener.clone(), &timer);
        let started = Instant::now();
        lease.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(listener.events.lock().is_empty(), "fired before 1.5 periods");

        tokio::time::sleep(Duration::from_millis(3000)).await;
        let events = listener.events.lock();
        assert_eq!(events.len(), 1);
        let fired_after = events[0].0.duration_since(started);
        assert!(fired_after >= Duration::from_millis(1500) && fired_after <= Duration::from_millis(2500));
        assert!(events[0].1.cause.is_none());
        drop(events);

        assert_eq!(lease.phase(), LeasePhase::Expired);
        assert!(!lease.update(Duration::from_millis(1000)));
        assert!(!timer.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_keep_lease_alive() {
        let timer = TimerService::new("lease");
        let listener = Arc::new(Recording::default());
        let lease = lease(1000, listener.clone(), &timer);
        lease.start();

        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(900)).await;
            assert!(lease.update(Duration::from_millis(1000)));
        }
        assert!(listener.events.lock().is_empty());
        assert_eq!(lease.window(), Duration::from_millis(2000));
        assert_eq!(lease.phase(), LeasePhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_notifies_with_cause_and_blocks_expiry() {
        let timer = TimerService::new("lease");
        let listener = Arc::new(Recording::default());
        let lease = lease(100, listener.clone(), &timer);
        lease.start();

        assert!(lease.terminate().await);
        assert!(!lease.terminate().await);
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let events = listener.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1.cause, Some(LossCause::ClientDisconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_silent() {
        let timer = TimerService::new("lease");
        let listener = Arc::new(Recording::default());
        let lease = lease(100, listener.clone(), &timer);
        lease.start();
        lease.stop();

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(listener.events.lock().is_empty());
        assert!(!timer.has_timer());
    }

    #[tokio::test(start_paused = true)]
    async fn test_period_change_resets_window_and_schedule() {
        let timer = TimerService::new("lease");
        let listener = Arc::new(Recording::default());
        let lease = lease(1000, listener.clone(), &timer);
        lease.start();

        assert!(lease.update(Duration::from_millis(200)));
        assert_eq!(lease.window(), Duration::from_millis(400));
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(listener.events.lock().len(), 1);
        assert_eq!(timer.pending_tasks(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_update_widens_window_and_on_time_update_holds_it() {
        let timer = TimerService::new("lease");
        let listener = Arc::new(Recording::default());
        let lease = lease(1000, listener.clone(), &timer);
        lease.start();
        assert_eq!(lease.window(), Duration::from_millis(2000));

        // Checks run every 250ms; 2100ms is past the window but before the
        // check at 2250ms that would expire it.
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(lease.update(Duration::from_millis(1000)));
        assert_eq!(lease.window(), Duration::from_millis(3100));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(lease.update(Duration::from_millis(1000)));
        assert_eq!(lease.window(), Duration::from_millis(3100));

        // The wider window tolerates a gap the initial one would not.
        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(listener.events.lock().is_empty());
        assert_eq!(lease.phase(), LeasePhase::Active);
        assert!(lease.update(Duration::from_millis(1000)));
        assert_eq!(lease.window(), Duration::from_millis(3100));
    }
}
