//! Process-wide registry of client invokers.
//!
//! Guarantees at most one live [`ClientInvoker`] per pooling signature.
//! Creation, reuse, release and destruction are serialized per signature by
//! an async slot lock; different signatures never contend beyond a short
//! map lookup.
//!
//! # Deferred destruction
//!
//! Releasing the last reference destroys the invoker immediately when
//! `invokerDestructionDelay` is zero. Otherwise destruction is scheduled on
//! the registry's destruction [`TimerService`]; a `get_invoker` for the same
//! signature before it fires cancels it and hands back the same instance.
//! The timer exists only while a destruction is pending.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use parking_lot::RwLock;
use remora_core::Codec;
use remora_core::InvokerLocator;
use remora_core::InvokerSettings;
use remora_core::LocatorKey;
use remora_core::Result;
use remora_lease::TimerService;
use remora_lease::TimerTask;
use remora_transport::TransportRegistry;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::invoker::ClientInvoker;
use crate::invoker::InvokerState;

struct PendingDestruction {
    generation: u64,
    _task: TimerTask,
}

#[derive(Default)]
struct SlotState {
    invoker: Option<Arc<ClientInvoker>>,
    ref_count: usize,
    pending: Option<PendingDestruction>,
    generation: u64,
    removed: bool,
}

#[derive(Default)]
struct Slot {
    state: AsyncMutex<SlotState>,
}

/// Registry of shared client invokers keyed by pooling signature.
pub struct InvokerRegistry {
    transports: Arc<TransportRegistry>,
    codec: Arc<dyn Codec>,
    lease_timer: TimerService,
    destruction_timer: TimerService,
    slots: Mutex<HashMap<LocatorKey, Arc<Slot>>>,
    invokers: RwLock<HashMap<LocatorKey, Arc<ClientInvoker>>>,
    weak_self: Weak<InvokerRegistry>,
}

impl InvokerRegistry {
    /// Create an empty registry.
    ///
    /// `lease_timer` runs the pingers of created invokers;
    /// `destruction_timer` runs deferred destructions.
    pub fn new(
        transports: Arc<TransportRegistry>,
        codec: Arc<dyn Codec>,
        lease_timer: TimerService,
        destruction_timer: TimerService,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            transports,
            codec,
            lease_timer,
            destruction_timer,
            slots: Mutex::new(HashMap::new()),
            invokers: RwLock::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Return the live invoker for `locator`, creating and connecting one if
    /// needed. Each successful call takes one reference that must be given
    /// back with [`InvokerRegistry::release_invoker`].
    ///
    /// # Errors
    ///
    /// Propagates transport resolution and connect failures. A failed
    /// invoker is never visible to other callers.
    pub async fn get_invoker(&self, locator: &InvokerLocator, settings: &InvokerSettings) -> Result<Arc<ClientInvoker>> {
        let key = locator.key(settings.use_all_params);
        loop {
            let slot = self.slots.lock().entry(key.clone()).or_default().clone();
            let mut state = slot.state.lock().await;
            if state.removed {
                continue;
            }

            if let Some(invoker) = state.invoker.clone() {
                if state.pending.take().is_some() {
                    debug!(key = %key, invoker_id = invoker.id(), "cancelled pending invoker destruction");
                }
                if invoker.state() == InvokerState::Connected {
                    state.ref_count += 1;
                    debug!(key = %key, invoker_id = invoker.id(), refs = state.ref_count, "reusing client invoker");
                    return Ok(invoker);
                }
                warn!(key = %key, invoker_id = invoker.id(), state = ?invoker.state(), "discarding unusable client invoker");
                state.invoker = None;
                state.ref_count = 0;
                self.invokers.write().remove(&key);
            }

            let created = match self.transports.resolve(locator) {
                Ok(transport) => {
                    let invoker = ClientInvoker::new(
                        locator.clone(),
                        settings.clone(),
                        transport,
                        self.codec.clone(),
                        self.lease_timer.clone(),
                    );
                    invoker.connect().await.map(|()| invoker)
                }
                Err(error) => Err(error),
            };

            return match created {
                Ok(invoker) => {
                    state.invoker = Some(invoker.clone());
                    state.ref_count = 1;
                    self.invokers.write().insert(key.clone(), invoker.clone());
                    info!(key = %key, invoker_id = invoker.id(), "client invoker registered");
                    Ok(invoker)
                }
                Err(error) => {
                    state.removed = true;
                    self.remove_slot(&key, &slot);
                    debug!(key = %key, error = %error, "client invoker creation failed");
                    Err(error)
                }
            };
        }
    }

    /// Give back one reference. The last release destroys the invoker now or
    /// after the configured destruction delay.
    pub async fn release_invoker(&self, invoker: &Arc<ClientInvoker>) {
        let key = invoker.key().clone();
        let Some(slot) = self.slots.lock().get(&key).cloned() else {
            warn!(key = %key, invoker_id = invoker.id(), "released invoker is not registered");
            return;
        };

        let mut state = slot.state.lock().await;
        if !state.invoker.as_ref().is_some_and(|current| Arc::ptr_eq(current, invoker)) {
            warn!(key = %key, invoker_id = invoker.id(), "released invoker is not the registered instance");
            return;
        }
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count > 0 {
            debug!(key = %key, refs = state.ref_count, "client invoker released");
            return;
        }

        let delay = invoker.settings().invoker_destruction_delay;
        if delay.is_zero() {
            let invoker = self.unregister(&key, &slot, &mut state);
            drop(state);
            if let Some(invoker) = invoker {
                invoker.disconnect(invoker.settings().disconnect_timeout).await;
            }
            return;
        }

        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let registry = self.weak_self.clone();
        let task_key = key.clone();
        let task = self.destruction_timer.schedule_once(delay, move || async move {
            if let Some(registry) = registry.upgrade() {
                registry.destroy_if_pending(&task_key, generation).await;
            }
        });
        state.pending = Some(PendingDestruction {
            generation,
            _task: task,
        });
        debug!(key = %key, delay_ms = delay.as_millis() as u64, "client invoker destruction scheduled");
    }

    async fn destroy_if_pending(&self, key: &LocatorKey, generation: u64) {
        let Some(slot) = self.slots.lock().get(key).cloned() else {
            return;
        };
        let mut state = slot.state.lock().await;
        let still_pending = state.pending.as_ref().is_some_and(|p| p.generation == generation);
        if !still_pending || state.ref_count > 0 {
            return;
        }
        state.pending.take();
        let invoker = self.unregister(key, &slot, &mut state);
        drop(state);
        if let Some(invoker) = invoker {
            info!(key = %key, invoker_id = invoker.id(), "destroying idle client invoker");
            invoker.disconnect(invoker.settings().disconnect_timeout).await;
        }
    }

    fn unregister(&self, key: &LocatorKey, slot: &Arc<Slot>, state: &mut SlotState) -> Option<Arc<ClientInvoker>> {
        state.removed = true;
        state.ref_count = 0;
        state.pending.take();
        let invoker = state.invoker.take();
        self.invokers.write().remove(key);
        self.remove_slot(key, slot);
        invoker
    }

    fn remove_slot(&self, key: &LocatorKey, slot: &Arc<Slot>) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(key);
        }
    }

    /// Number of registered invokers.
    pub fn registered_count(&self) -> usize {
        self.invokers.read().len()
    }

    /// Whether an invoker is registered for `locator`.
    pub fn is_registered(&self, locator: &InvokerLocator, use_all_params: bool) -> bool {
        self.invokers.read().contains_key(&locator.key(use_all_params))
    }

    /// The registered invoker for `locator`, without taking a reference.
    pub fn registered_invoker(&self, locator: &InvokerLocator, use_all_params: bool) -> Option<Arc<ClientInvoker>> {
        self.invokers.read().get(&locator.key(use_all_params)).cloned()
    }

    /// Whether the deferred-destruction timer exists.
    pub fn destruction_timer_active(&self) -> bool {
        self.destruction_timer.has_timer()
    }

    /// Number of pending deferred destructions.
    pub fn pending_destructions(&self) -> usize {
        self.destruction_timer.pending_tasks()
    }

    /// Destroy every invoker now, pending or referenced.
    pub async fn shutdown(&self) {
        let slots: Vec<(LocatorKey, Arc<Slot>)> = self.slots.lock().iter().map(|(k, s)| (k.clone(), s.clone())).collect();
        let mut destroyed = 0usize;
        for (key, slot) in slots {
            let invoker = {
                let mut state = slot.state.lock().await;
                self.unregister(&key, &slot, &mut state)
            };
            if let Some(invoker) = invoker {
                invoker.disconnect(invoker.settings().disconnect_timeout).await;
                destroyed += 1;
            }
        }
        info!(destroyed, "invoker registry shut down");
    }
}

impl std::fmt::Debug for InvokerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokerRegistry")
            .field("registered", &self.registered_count())
            .field("destruction_timer_active", &self.destruction_timer_active())
            .finish()
    }
}
