//! Shared timer facility.
//!
//! Every lease check, every ping schedule and every deferred invoker
//! destruction runs as a task on a [`TimerService`]. The service keeps a
//! timer handle only while at least one task is pending: the handle is
//! created on the first schedule and torn down when the last task completes
//! or is cancelled, so an idle service holds nothing.
//!
//! # Tiger Style
//!
//! - One tokio task per scheduled task, stopped through a `CancellationToken`
//! - Fixed-delay scheduling: the next period starts after a tick completes
//! - Cancellation is observed between ticks; a running tick is not aborted

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// What a repeating task wants after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep the schedule.
    Continue,
    /// End the task.
    Stop,
}

struct TimerState {
    tasks: HashMap<u64, CancellationToken>,
    created_at: Instant,
}

/// Lazily created, self-dismantling timer facility.
///
/// Cloning yields another handle to the same facility.
#[derive(Clone)]
pub struct TimerService {
    name: &'static str,
    state: Arc<Mutex<Option<TimerState>>>,
}

impl TimerService {
    /// Create an idle service. `name` labels its log lines.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether the timer handle exists, i.e. at least one task is pending.
    pub fn has_timer(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Number of pending tasks.
    pub fn pending_tasks(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.tasks.len())
    }

    /// Run `tick` every `period` until it returns [`TickOutcome::Stop`] or the
    /// returned handle is cancelled or dropped.
    ///
    /// The first tick runs one period after scheduling.
    pub fn schedule_repeating<F, Fut>(&self, period: Duration, mut tick: F) -> TimerTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickOutcome> + Send + 'static,
    {
        let (id, cancel) = self.register();
        let handle = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                if token.is_cancelled() {
                    break;
                }
                if tick().await == TickOutcome::Stop {
                    break;
                }
            }
            handle.deregister(id);
        });
        TimerTask {
            id,
            cancel,
            service: self.clone(),
        }
    }

    /// Run `task` once after `delay` unless the returned handle is cancelled
    /// or dropped first.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, task: F) -> TimerTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, cancel) = self.register();
        let handle = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if !token.is_cancelled() {
                        task().await;
                    }
                }
            }
            handle.deregister(id);
        });
        TimerTask {
            id,
            cancel,
            service: self.clone(),
        }
    }

    fn register(&self) -> (u64, CancellationToken) {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut state = self.state.lock();
        let timer = state.get_or_insert_with(|| {
            debug!(timer = self.name, "timer created");
            TimerState {
                tasks: HashMap::new(),
                created_at: Instant::now(),
            }
        });
        timer.tasks.insert(id, token.clone());
        trace!(timer = self.name, task_id = id, pending = timer.tasks.len(), "timer task scheduled");
        (id, token)
    }

    fn deregister(&self, id: u64) {
        let mut state = self.state.lock();
        let Some(timer) = state.as_mut() else {
            return;
        };
        if timer.tasks.remove(&id).is_none() {
            return;
        }
        if timer.tasks.is_empty() {
            debug!(
                timer = self.name,
                lifetime_ms = timer.created_at.elapsed().as_millis() as u64,
                "timer torn down, no pending tasks"
            );
            *state = None;
        }
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerService")
            .field("name", &self.name)
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}

/// Handle to a scheduled task. Dropping it cancels the task.
pub struct TimerTask {
    id: u64,
    cancel: CancellationToken,
    service: TimerService,
}

impl TimerTask {
    /// Task identifier, unique across services.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the task was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the task. The timer forgets it immediately.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for TimerTask {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.service.deregister(self.id);
    }
}

impl std::fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTask").field("id", &self.id).field("cancelled", &self.is_cancelled()).finish()
    }
}
