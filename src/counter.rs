//! Up/down counter of outstanding per-file pipelines.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::watch;

use crate::error::CounterError;

type ZeroCallback = Box<dyn FnOnce() + Send>;

/// Counts operations still in flight and signals when none remain.
///
/// A counter belongs to exactly one request.
pub struct CompletionCounter {
    count: watch::Sender<usize>,
    on_zero: Mutex<Vec<ZeroCallback>>,
}

impl fmt::Debug for CompletionCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionCounter")
            .field("count", &*self.count.borrow())
            .finish()
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionCounter {
    /// Creates a counter at zero.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count,
            on_zero: Mutex::new(Vec::new()),
        }
    }

    /// Returns the current count.
    pub fn value(&self) -> usize {
        *self.count.borrow()
    }

    /// Returns `true` when nothing is in flight.
    pub fn is_zero(&self) -> bool {
        self.value() == 0
    }

    /// Registers one more operation in flight.
    pub fn increment(&self) {
        self.count.send_modify(|count| *count += 1);
    }

    /// Marks one operation as finished.
    pub fn decrement(&self) -> Result<(), CounterError> {
        let mut underflow = false;
        let mut reached_zero = false;
        self.count.send_if_modified(|count| {
            if *count == 0 {
                underflow = true;
                return false;
            }
            *count -= 1;
            reached_zero = *count == 0;
            true
        });

        if underflow {
            return Err(CounterError::Underflow);
        }
        if reached_zero {
            self.fire_zero_callbacks();
        }
        Ok(())
    }

    /// Runs `callback` now when the count is zero, otherwise once the count
    /// next returns to zero.
    pub fn once_zero<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.on_zero.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_zero() {
            drop(pending);
            callback();
            return;
        }
        pending.push(Box::new(callback));
    }

    /// Waits until the count is zero.
    pub async fn zero(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Increments now and returns a guard that decrements on drop.
    pub fn track(self: &Arc<Self>) -> PendingGuard {
        self.increment();
        PendingGuard {
            counter: Arc::clone(self),
        }
    }

    fn fire_zero_callbacks(&self) {
        let callbacks = {
            let mut pending = self.on_zero.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_zero() {
                return;
            }
            std::mem::take(&mut *pending)
        };
        for callback in callbacks {
            callback();
        }
    }
}

/// Keeps one slot of a [`CompletionCounter`] occupied until dropped.
#[must_use = "dropping the guard releases the slot immediately"]
#[derive(Debug)]
pub struct PendingGuard {
    counter: Arc<CompletionCounter>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        // A guard always pairs with its own increment.
        let released = self.counter.decrement();
        debug_assert!(released.is_ok(), "pending guard released an empty counter");
    }
}
