//! Resizable counting semaphore bounding concurrent handler invocations.
//!
//! Growing adds permits immediately. Shrinking forgets whatever permits are
//! idle and records the remainder as debt; permits returned by in-flight
//! handlers pay the debt off instead of going back to the pool. In-flight
//! work is never interrupted and the pool converges on the new size as
//! handlers finish.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

pub(crate) struct SlotLimiter {
    semaphore: Arc<Semaphore>,
    state: Mutex<SlotState>,
}

struct SlotState {
    slots: usize,
    debt: usize,
}

impl SlotLimiter {
    pub(crate) fn new(slots: usize) -> Arc<Self> {
        let slots = slots.max(1);
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(slots)),
            state: Mutex::new(SlotState { slots, debt: 0 }),
        })
    }

    pub(crate) fn slots(&self) -> usize {
        self.state.lock().slots
    }

    /// Wait for a free slot.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<SlotPermit, AcquireError> {
        let permit = self.semaphore.clone().acquire_owned().await?;
        Ok(SlotPermit {
            permit: Some(permit),
            limiter: self.clone(),
        })
    }

    /// Change the slot count. Zero, or the current count, is a no-op.
    /// Returns the previous count when something changed.
    pub(crate) fn resize(&self, slots: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let previous = state.slots;
        if slots == 0 || slots == previous {
            return None;
        }

        if slots > previous {
            let extra = slots - previous;
            let repaid = extra.min(state.debt);
            state.debt -= repaid;
            self.semaphore.add_permits(extra - repaid);
        } else {
            let excess = previous - slots;
            let mut forgotten = 0;
            while forgotten < excess {
                match self.semaphore.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        forgotten += 1;
                    }
                    Err(_) => break,
                }
            }
            state.debt += excess - forgotten;
        }

        state.slots = slots;
        Some(previous)
    }
}

/// A held handler slot. Released on drop, or retired if the limiter shrank.
pub(crate) struct SlotPermit {
    permit: Option<OwnedSemaphorePermit>,
    limiter: Arc<SlotLimiter>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else { return };
        let mut state = self.limiter.state.lock();
        if state.debt > 0 {
            state.debt -= 1;
            permit.forget();
        }
        // Otherwise the permit returns to the semaphore as it drops here.
    }
}
