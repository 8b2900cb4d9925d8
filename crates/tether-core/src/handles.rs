//! Reattachable task handles.
//!
//! A task handle ties one asynchronous call to an `(owner, slot)` key so a
//! consumer can go away (a screen being rebuilt, say) and come back later to
//! collect the result. While no consumer is attached the registry buffers
//! the latest progress and the terminal outcome; [`TaskHandleRegistry::reattach`]
//! replays them and retires the handle.
//!
//! Only one handle may live per key. Subscribing again cancels the previous
//! operation with [`CancelReason::Superseded`], and its late results are
//! dropped by the generation check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info};

use crate::call::{Completion, Outcome, ProgressSink};
use crate::cancel::{CancelHandle, CancelReason, CancelToken};
use crate::error::RpcError;
use crate::observable::{deliver, PrimaryContext};

/// Receives the progress and outcome of a subscribed operation.
pub trait TaskConsumer: Send + Sync + 'static {
    /// Progress in percent.
    fn on_progress(&self, _percent: u8) {}

    /// The operation finished with `value`.
    fn on_success(&self, value: Value);

    /// The operation failed or was cancelled.
    fn on_error(&self, error: RpcError);
}

/// Registry key: the owner's identity plus a caller-chosen slot name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    /// Component owning the slot.
    pub owner: String,
    /// Slot name within the owner.
    pub slot: String,
}

impl SlotKey {
    /// Key for `slot` of `owner`.
    pub fn new(owner: impl Into<String>, slot: impl Into<String>) -> Self {
        SlotKey {
            owner: owner.into(),
            slot: slot.into(),
        }
    }
}

/// Returned by [`TaskHandleRegistry::subscribe`]; identifies one generation
/// of a slot.
#[derive(Debug, Clone)]
pub struct Ticket {
    key: SlotKey,
    generation: u64,
    token: CancelToken,
}

impl Ticket {
    /// Slot this ticket belongs to.
    pub fn key(&self) -> &SlotKey {
        &self.key
    }

    /// Increases on each subscribe to the slot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Token cancelled when the handle is cancelled or superseded.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

struct Slot {
    generation: u64,
    cancel: CancelHandle,
    consumer: Option<Arc<dyn TaskConsumer>>,
    progress: u8,
    outcome: Option<Outcome>,
}

/// Registry of live task handles.
pub struct TaskHandleRegistry {
    slots: Mutex<HashMap<SlotKey, Slot>>,
    next_generation: AtomicU64,
    context: Option<Arc<dyn PrimaryContext>>,
}

fn notify_outcome(
    context: Option<&Arc<dyn PrimaryContext>>,
    consumer: Arc<dyn TaskConsumer>,
    progress: u8,
    outcome: Option<Outcome>,
) {
    deliver(context, move || {
        if progress > 0 {
            consumer.on_progress(progress);
        }
        match outcome {
            Some(Ok(value)) => consumer.on_success(value),
            Some(Err(error)) => consumer.on_error(error),
            None => {}
        }
    });
}

impl TaskHandleRegistry {
    /// Empty registry delivering through `context`, or inline without one.
    pub fn new(context: Option<Arc<dyn PrimaryContext>>) -> Self {
        TaskHandleRegistry {
            slots: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            context,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SlotKey, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install a handle for `key`, cancelling whatever held it before.
    ///
    /// The returned ticket's token is a child of `parent`.
    pub fn subscribe(&self, key: SlotKey, consumer: Arc<dyn TaskConsumer>, parent: &CancelToken) -> Ticket {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (token, cancel) = parent.child();
        let mut slots = self.lock();
        if let Some(previous) = slots.remove(&key) {
            info!(owner = %key.owner, slot = %key.slot, "superseding running task");
            previous.cancel.cancel(CancelReason::Superseded);
        }
        slots.insert(
            key.clone(),
            Slot {
                generation,
                cancel,
                consumer: Some(consumer),
                progress: 0,
                outcome: None,
            },
        );
        drop(slots);
        Ticket {
            key,
            generation,
            token,
        }
    }

    /// Stop delivering to the current consumer; results are buffered.
    pub fn detach(&self, key: &SlotKey) -> bool {
        match self.lock().get_mut(key) {
            Some(slot) => {
                slot.consumer = None;
                true
            }
            None => false,
        }
    }

    /// Attach `consumer` to the handle for `key`.
    ///
    /// Buffered progress and, if the operation already finished, its outcome
    /// are replayed before this returns; a finished handle is retired.
    pub fn reattach(&self, key: &SlotKey, consumer: Arc<dyn TaskConsumer>) -> bool {
        let (progress, outcome) = {
            let mut slots = self.lock();
            let slot = match slots.get_mut(key) {
                Some(slot) => slot,
                None => return false,
            };
            let buffered = (slot.progress, slot.outcome.take());
            if buffered.1.is_some() {
                slots.remove(key);
            } else {
                slot.consumer = Some(consumer.clone());
            }
            buffered
        };
        debug!(owner = %key.owner, slot = %key.slot, finished = outcome.is_some(), "reattached");
        notify_outcome(self.context.as_ref(), consumer, progress, outcome);
        true
    }

    /// Cancel and forget the handle for `key`.
    pub fn cancel(&self, key: &SlotKey) -> bool {
        let removed = self.lock().remove(key);
        match removed {
            Some(slot) => {
                info!(owner = %key.owner, slot = %key.slot, "task cancelled");
                slot.cancel.cancel(CancelReason::UserRequested);
                true
            }
            None => false,
        }
    }

    /// True while the slot holds a live operation.
    pub fn is_active(&self, key: &SlotKey) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of live slots.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no slot is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every handle.
    pub fn cancel_all(&self) {
        let slots: Vec<Slot> = self.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            slot.cancel.cancel(CancelReason::Shutdown);
        }
    }

    fn progress(&self, ticket: &Ticket, percent: u8) {
        let consumer = {
            let mut slots = self.lock();
            match slots.get_mut(&ticket.key) {
                Some(slot) if slot.generation == ticket.generation => {
                    slot.progress = percent;
                    slot.consumer.clone()
                }
                _ => return,
            }
        };
        if let Some(consumer) = consumer {
            deliver(self.context.as_ref(), move || consumer.on_progress(percent));
        }
    }

    fn finish(&self, ticket: &Ticket, outcome: Outcome) {
        let consumer = {
            let mut slots = self.lock();
            let slot = match slots.get_mut(&ticket.key) {
                Some(slot) if slot.generation == ticket.generation => slot,
                _ => {
                    debug!(owner = %ticket.key.owner, slot = %ticket.key.slot, "discarding stale result");
                    return;
                }
            };
            match slot.consumer.clone() {
                Some(consumer) => {
                    slots.remove(&ticket.key);
                    consumer
                }
                None => {
                    slot.outcome = Some(outcome);
                    return;
                }
            }
        };
        notify_outcome(self.context.as_ref(), consumer, 0, Some(outcome));
    }

    /// Progress sink feeding the handle identified by `ticket`.
    pub fn progress_sink(self: &Arc<Self>, ticket: &Ticket) -> ProgressSink {
        let registry = Arc::clone(self);
        let ticket = ticket.clone();
        Arc::new(move |percent| registry.progress(&ticket, percent))
    }

    /// Completion routing the outcome to the handle identified by `ticket`.
    pub fn completion(self: &Arc<Self>, ticket: &Ticket) -> Completion {
        let registry = Arc::clone(self);
        let ticket = ticket.clone();
        Box::new(move |outcome| registry.finish(&ticket, outcome))
    }
}

impl Default for TaskHandleRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}
