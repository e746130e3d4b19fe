use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Guest-visible monotonic completion counter for one ring.
///
/// Sync workers bump it when a wait finishes; the guest (or anything standing in for it) parks
/// on a target value.
#[derive(Debug, Default)]
pub struct SyncTimeline {
    value: Mutex<u64>,
    advanced: Condvar,
}

impl SyncTimeline {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn value(&self) -> u64 {
        *self.value.lock()
    }

    pub fn inc(&self, step: u64) {
        let mut value = self.value.lock();
        *value = value.saturating_add(step);
        drop(value);
        self.advanced.notify_all();
    }

    /// Block until the counter reaches `target`. Returns `false` on timeout.
    pub fn wait_for(&self, target: u64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut value = self.value.lock();
        while *value < target {
            match deadline {
                Some(deadline) => {
                    if self.advanced.wait_until(&mut value, deadline).timed_out() {
                        return *value >= target;
                    }
                }
                // Past what an Instant can hold: no deadline at all.
                None => self.advanced.wait(&mut value),
            }
        }
        true
    }
}
