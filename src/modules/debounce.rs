//! Cancellable per-key delayed tasks
//!
//! Scheduling a key again before its window elapses replaces the pending
//! task. All tasks hang off a parent token, so cancelling the parent (module
//! destroy) drops everything still pending.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Pending {
    generation: u64,
    cancel: CancellationToken,
}

struct Slots<K> {
    next_generation: u64,
    pending: HashMap<K, Pending>,
}

pub struct Debouncer<K> {
    window: Duration,
    parent: CancellationToken,
    slots: Arc<Mutex<Slots<K>>>,
}

fn lock<K>(slots: &Mutex<Slots<K>>) -> MutexGuard<'_, Slots<K>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K> Debouncer<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(window: Duration, parent: CancellationToken) -> Self {
        Self {
            window,
            parent,
            slots: Arc::new(Mutex::new(Slots {
                next_generation: 0,
                pending: HashMap::new(),
            })),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Run `fire` after the window unless `key` is scheduled again or cancelled first
    pub fn schedule<F>(&self, key: K, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_after(key, self.window, fire);
    }

    /// Like [`schedule`](Self::schedule) with an explicit delay
    pub fn schedule_after<F>(&self, key: K, delay: Duration, fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.parent.is_cancelled() {
            return;
        }
        let cancel = self.parent.child_token();
        let generation = {
            let mut slots = lock(&self.slots);
            slots.next_generation += 1;
            let generation = slots.next_generation;
            let previous = slots.pending.insert(
                key.clone(),
                Pending {
                    generation,
                    cancel: cancel.clone(),
                },
            );
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            generation
        };

        let slots = self.slots.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let current = {
                        let mut slots = lock(&slots);
                        let current = slots
                            .pending
                            .get(&key)
                            .is_some_and(|p| p.generation == generation);
                        if current {
                            slots.pending.remove(&key);
                        }
                        current
                    };
                    if current {
                        fire();
                    }
                }
            }
        });
    }

    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.slots).pending.remove(key) {
            Some(pending) => {
                pending.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for (_, pending) in lock(&self.slots).pending.drain() {
            pending.cancel.cancel();
        }
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.slots).pending.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.slots).pending.len()
    }
}
