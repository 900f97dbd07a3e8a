//! Mount exclusivity guard.
//!
//! The external imaging tool and the on-disk mount directory are
//! process-wide exclusive resources; concurrent mounts corrupt state. The
//! guard is a semaphore sized to the number of independent mount slots
//! (default 1). Waiters queue FIFO. The permit is an owned RAII value so
//! every exit path, panics included, releases the slot.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct MountGuard {
    slots: Arc<Semaphore>,
    capacity: usize,
}

/// Held for the whole mount-critical section (mount through unmount).
pub struct MountSlot {
    _permit: OwnedSemaphorePermit,
}

impl MountGuard {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a slot, bailing out if the job is cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<MountSlot> {
        tokio::select! {
            permit = self.slots.clone().acquire_owned() => {
                // The semaphore is never closed while the guard is alive.
                permit.ok().map(|permit| MountSlot { _permit: permit })
            }
            _ = cancel.cancelled() => None,
        }
    }
}
