//! Pull-mode callback retrieval.
//!
//! When callbacks cannot be pushed, the client polls the server for the
//! callbacks queued for one listener and hands them to the local handler in
//! arrival order.

use std::sync::Arc;
use std::time::Duration;

use remora_core::Callback;
use remora_core::InvocationKind;
use remora_core::InvocationRequest;
use remora_core::InvokerCallbackHandler;
use remora_core::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::invoker::ClientInvoker;
use crate::invoker::response_payload;

/// What one poll targets.
#[derive(Debug, Clone)]
pub struct PollTarget {
    /// Session that registered the listener.
    pub session_id: String,
    /// Subsystem the listener was registered on.
    pub subsystem: Option<String>,
    /// Listener whose queue is drained.
    pub listener_id: String,
}

/// Background task polling one listener's callback queue.
pub struct CallbackPoller {
    listener_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl CallbackPoller {
    /// Start polling every `period`, each poll bounded by `timeout`.
    pub fn start(
        invoker: Arc<ClientInvoker>,
        target: PollTarget,
        handler: Arc<dyn InvokerCallbackHandler>,
        period: Duration,
        timeout: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let listener_id = target.listener_id.clone();
        let task = tokio::spawn(async move {
            debug!(listener_id = %target.listener_id, period_ms = period.as_millis() as u64, "callback poller started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                let callbacks = tokio::select! {
                    _ = token.cancelled() => break,
                    result = poll_once(&invoker, &target, timeout) => result,
                };
                match callbacks {
                    Ok(callbacks) => {
                        for callback in callbacks {
                            if token.is_cancelled() {
                                break;
                            }
                            if let Err(error) = handler.handle_callback(callback).await {
                                warn!(listener_id = %target.listener_id, error = %error, "callback handler failed");
                            }
                        }
                    }
                    Err(error) => {
                        warn!(listener_id = %target.listener_id, error = %error, "callback poll failed");
                    }
                }
            }
            debug!(listener_id = %target.listener_id, "callback poller stopped");
        });
        Self {
            listener_id,
            cancel,
            task: Some(task),
        }
    }

    /// Listener this poller serves.
    pub fn listener_id(&self) -> &str {
        &self.listener_id
    }

    /// Stop polling. An in-flight poll is abandoned; the task gets at most
    /// `bound` to finish before it is aborted.
    pub async fn stop(mut self, bound: Duration) {
        self.cancel.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(bound, &mut task).await.is_err() {
            warn!(listener_id = %self.listener_id, bound_ms = bound.as_millis() as u64, "callback poller did not stop in time, aborting");
            task.abort();
        }
    }
}

impl Drop for CallbackPoller {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Drain the queued callbacks of one listener.
pub async fn poll_once(invoker: &ClientInvoker, target: &PollTarget, timeout: Duration) -> Result<Vec<Callback>> {
    let request = InvocationRequest::new(target.session_id.clone(), target.subsystem.clone(), InvocationKind::PollCallbacks {
        listener_id: target.listener_id.clone(),
    });
    let payload = response_payload(invoker.invoke_bounded(request, timeout).await?)?;
    Ok(serde_json::from_value(payload)?)
}
