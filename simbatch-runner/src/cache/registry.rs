//! In-process registry of in-flight cache keys
//!
//! Every runner sharing a [`super::ResultCache`] serializes work on a key
//! through one slot. The first holder executes; holders that acquire the
//! slot afterwards find the published result and reuse it. A holder that
//! finishes without publishing (cancelled) lets the next waiter execute.

use parking_lot::Mutex;
use simbatch_core::{CacheKey, SimResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as SlotMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

type Slot = SlotMutex<Option<SimResult>>;

#[derive(Debug, Default)]
pub struct InFlightRegistry {
    slots: Mutex<HashMap<CacheKey, Arc<Slot>>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: CacheKey) -> Arc<Slot> {
        self.slots
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(SlotMutex::new(None)))
            .clone()
    }

    /// Waits for exclusive ownership of `key`
    ///
    /// Returns `None` if `cancel` fires first.
    pub async fn acquire(
        &self,
        key: CacheKey,
        cancel: &CancellationToken,
    ) -> Option<KeyGuard<'_>> {
        let slot = self.slot(key);
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = slot.clone().lock_owned() => Some(guard),
        };

        match guard {
            Some(guard) => Some(KeyGuard {
                registry: self,
                key,
                guard: Some(guard),
            }),
            None => {
                self.release(&key, slot);
                None
            }
        }
    }

    /// Blocking variant of [`InFlightRegistry::acquire`]
    ///
    /// Must not be called from inside an async context.
    pub fn acquire_blocking(
        &self,
        key: CacheKey,
        cancel: &CancellationToken,
    ) -> Option<KeyGuard<'_>> {
        futures::executor::block_on(self.acquire(key, cancel))
    }

    /// Drops the map entry for `key` once `slot` is its last user
    fn release(&self, key: &CacheKey, slot: Arc<Slot>) {
        let mut slots = self.slots.lock();
        if Arc::strong_count(&slot) == 2
            && slots
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &slot))
        {
            slots.remove(key);
        }
    }

    /// Keys currently held or awaited
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

/// Exclusive hold on one key; released on drop
pub struct KeyGuard<'a> {
    registry: &'a InFlightRegistry,
    key: CacheKey,
    guard: Option<OwnedMutexGuard<Option<SimResult>>>,
}

impl KeyGuard<'_> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Result published by an earlier holder of this key
    pub fn completed(&self) -> Option<&SimResult> {
        self.guard.as_ref().and_then(|g| g.as_ref())
    }

    /// Makes `result` available to every later holder
    pub fn publish(&mut self, result: SimResult) {
        if let Some(guard) = self.guard.as_mut() {
            **guard = Some(result);
        }
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let slot = OwnedMutexGuard::mutex(&guard).clone();
        drop(guard);
        self.registry.release(&self.key, slot);
    }
}
