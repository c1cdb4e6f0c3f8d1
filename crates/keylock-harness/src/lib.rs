//! Concurrency test harness for the lock manager.
//!
//! Provides the pieces the scenario and stress suites share: a tracing
//! bootstrap for debugging failed runs and an exclusivity probe that
//! checks the central safety invariant (at most one writer, or any
//! number of readers and no writer) from inside the critical sections a
//! workload executes.

use std::sync::atomic::{AtomicU32, Ordering};

/// Install a test-friendly tracing subscriber. Idempotent; later calls
/// are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Per-key occupancy counters updated by lock holders.
///
/// A workload calls [`ExclusivityProbe::enter`] after a grant and drops
/// the returned guard before releasing the lock. The counters are only
/// consistent if the lock manager actually serialized the conflicting
/// holders, so any exclusivity bug trips an assertion right at the
/// offending access.
pub struct ExclusivityProbe {
    slots: Vec<KeySlot>,
}

struct KeySlot {
    readers: AtomicU32,
    writers: AtomicU32,
}

impl ExclusivityProbe {
    /// Probe for keys `0..keys`.
    #[must_use]
    pub fn new(keys: usize) -> Self {
        Self {
            slots: (0..keys)
                .map(|_| KeySlot {
                    readers: AtomicU32::new(0),
                    writers: AtomicU32::new(0),
                })
                .collect(),
        }
    }

    /// Record entry into the critical section for `key`.
    ///
    /// # Panics
    ///
    /// Panics when the entry is incompatible with the current occupancy,
    /// i.e. when the lock manager handed out conflicting grants.
    pub fn enter(&self, key: usize, for_write: bool) -> HoldGuard<'_> {
        let slot = &self.slots[key];
        if for_write {
            let prior_writers = slot.writers.fetch_add(1, Ordering::SeqCst);
            assert_eq!(prior_writers, 0, "two writers inside key {key}");
            assert_eq!(
                slot.readers.load(Ordering::SeqCst),
                0,
                "writer joined readers inside key {key}"
            );
        } else {
            slot.readers.fetch_add(1, Ordering::SeqCst);
            assert_eq!(
                slot.writers.load(Ordering::SeqCst),
                0,
                "reader joined a writer inside key {key}"
            );
        }
        HoldGuard {
            probe: self,
            key,
            for_write,
        }
    }

    fn exit(&self, key: usize, for_write: bool) {
        let slot = &self.slots[key];
        if for_write {
            slot.writers.fetch_sub(1, Ordering::SeqCst);
        } else {
            slot.readers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// True once every critical section has exited.
    #[must_use]
    pub fn quiescent(&self) -> bool {
        self.slots.iter().all(|slot| {
            slot.readers.load(Ordering::SeqCst) == 0 && slot.writers.load(Ordering::SeqCst) == 0
        })
    }
}

/// Active occupancy of one critical section; exits on drop.
pub struct HoldGuard<'a> {
    probe: &'a ExclusivityProbe,
    key: usize,
    for_write: bool,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.probe.exit(self.key, self.for_write);
    }
}
