use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::config::HostConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostSyncTiming {
    pub wake_interval: Duration,
    pub timeout: Duration,
}

impl Default for HostSyncTiming {
    fn default() -> Self {
        Self::from_config(&HostConfig::default())
    }
}

impl HostSyncTiming {
    pub fn from_config(config: &HostConfig) -> Self {
        Self {
            wake_interval: config.host_sync_wake_interval(),
            timeout: config.host_sync_timeout(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The predecessor finished; this unit runs in guest program order.
    InOrder,
    /// Gave up waiting for the predecessor and ran anyway.
    TimedOut,
}

/// Sequence counter for one submission-capable handle.
///
/// Guest threads number their units of work when they enqueue them. A unit that needs host
/// sync waits here until unit `seqno - 1` has advanced the counter. Sequence numbers are 32-bit
/// and compared with wrapping arithmetic.
#[derive(Debug, Default)]
pub struct OrderLedger {
    sequence: Mutex<u32>,
    turn: Condvar,
    holders: AtomicU32,
}

/// `a` is at or after `b` in wrapping sequence order.
#[inline]
fn seq_reached(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

impl OrderLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a counted reference for an in-flight unit of work.
    pub fn acquire(self: &Arc<Self>) -> LedgerRef {
        self.holders.fetch_add(1, Ordering::AcqRel);
        LedgerRef {
            ledger: Arc::clone(self),
            released: false,
        }
    }

    pub fn sequence(&self) -> u32 {
        *self.sequence.lock()
    }

    /// In-flight units currently holding this ledger.
    pub fn holders(&self) -> u32 {
        self.holders.load(Ordering::Acquire)
    }
}

/// Counted reference to an [`OrderLedger`].
///
/// Callers release it explicitly with [`LedgerRef::release`] once their unit is done; dropping
/// it releases too, so early returns cannot leak a holder.
#[derive(Debug)]
pub struct LedgerRef {
    ledger: Arc<OrderLedger>,
    released: bool,
}

impl LedgerRef {
    pub fn ledger(&self) -> &Arc<OrderLedger> {
        &self.ledger
    }

    /// Block until unit `seqno - 1` has completed, waking every `timing.wake_interval` and
    /// giving up after `timing.timeout`.
    pub fn wait_for_turn(&self, seqno: u32, timing: HostSyncTiming) -> TurnOutcome {
        let start = Instant::now();
        let predecessor = seqno.wrapping_sub(1);
        let mut sequence = self.ledger.sequence.lock();
        loop {
            if seq_reached(*sequence, predecessor) {
                return TurnOutcome::InOrder;
            }
            let elapsed = start.elapsed();
            if elapsed >= timing.timeout {
                warn!(
                    seqno,
                    current = *sequence,
                    timeout_ms = timing.timeout.as_millis() as u64,
                    "host sync wait timed out; running out of order"
                );
                return TurnOutcome::TimedOut;
            }
            let slice = timing.wake_interval.min(timing.timeout - elapsed);
            self.ledger.turn.wait_for(&mut sequence, slice);
        }
    }

    /// Record `seqno` as completed and wake every waiter. The counter never moves backwards.
    pub fn advance(&self, seqno: u32) {
        let mut sequence = self.ledger.sequence.lock();
        if !seq_reached(*sequence, seqno) {
            *sequence = seqno;
        }
        drop(sequence);
        self.ledger.turn.notify_all();
    }

    /// Run `f` as unit `seqno`: wait for the predecessor if `needs_host_sync`, then advance.
    pub fn run_in_order<T>(
        &self,
        seqno: u32,
        needs_host_sync: bool,
        timing: HostSyncTiming,
        f: impl FnOnce() -> T,
    ) -> T {
        if needs_host_sync {
            self.wait_for_turn(seqno, timing);
        }
        let out = f();
        self.advance(seqno);
        out
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.ledger.holders.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for LedgerRef {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn quick() -> HostSyncTiming {
        HostSyncTiming {
            wake_interval: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn first_unit_does_not_wait() {
        let ledger = OrderLedger::new();
        let r = ledger.acquire();
        assert_eq!(r.wait_for_turn(1, quick()), TurnOutcome::InOrder);
    }

    #[test]
    fn holder_count_tracks_release_paths() {
        let ledger = OrderLedger::new();
        let a = ledger.acquire();
        let b = ledger.acquire();
        assert_eq!(ledger.holders(), 2);
        a.release();
        assert_eq!(ledger.holders(), 1);
        drop(b);
        assert_eq!(ledger.holders(), 0);
    }

    #[test]
    fn counter_is_monotonic() {
        let ledger = OrderLedger::new();
        let r = ledger.acquire();
        r.advance(5);
        r.advance(3);
        assert_eq!(ledger.sequence(), 5);
    }

    #[test]
    fn counter_wraps() {
        let ledger = OrderLedger::new();
        let r = ledger.acquire();
        for step in [0x7000_0000, 0xe000_0000, u32::MAX] {
            r.advance(step);
        }
        assert_eq!(ledger.sequence(), u32::MAX);
        assert_eq!(r.wait_for_turn(0, quick()), TurnOutcome::InOrder);
        r.advance(0);
        assert_eq!(ledger.sequence(), 0);
    }

    #[test]
    fn missing_predecessor_times_out_and_proceeds() {
        let ledger = OrderLedger::new();
        let r = ledger.acquire();
        let timing = HostSyncTiming {
            wake_interval: Duration::from_millis(1),
            timeout: Duration::from_millis(20),
        };
        let ran = r.run_in_order(3, true, timing, || true);
        assert!(ran);
        assert_eq!(ledger.sequence(), 3);
    }

    #[test]
    fn later_unit_waits_for_earlier_one() {
        let ledger = OrderLedger::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let second = {
            let r = ledger.acquire();
            let order = Arc::clone(&order);
            thread::spawn(move || r.run_in_order(2, true, quick(), || order.lock().push(2)))
        };
        thread::sleep(Duration::from_millis(20));
        ledger
            .acquire()
            .run_in_order(1, true, quick(), || order.lock().push(1));
        second.join().unwrap();

        assert_eq!(*order.lock(), vec![1, 2]);
    }
}
