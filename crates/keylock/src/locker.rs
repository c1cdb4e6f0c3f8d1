//! Locker handles: the actors that acquire and hold locks.
//!
//! A locker is an opaque actor identity — one transaction, one locker.
//! The library owns the per-locker machinery ([`LockerCore`]: identity,
//! wait cell, injected-conflict slot); consumers customize behavior
//! through the [`Locker`] trait's provided hooks. [`BasicLocker`] is the
//! stock implementation with no overrides.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::discipline;
use crate::manager::LockManager;
use crate::types::{
    ConflictKind, LockAttemptResult, LockConflict, LockKey, LockRequest, LockerId, ManagerToken,
};

// ---------------------------------------------------------------------------
// WaitCell
// ---------------------------------------------------------------------------

/// The mutex/condvar pair a blocked locker parks on.
///
/// This is the "locker monitor" of the synchronization scheme. The wait
/// loop holds `state` across its grant checks and parks on `granted`;
/// the release path acquires `state` (holding no shard monitor) purely
/// to publish a wakeup, so a waiter between its grant check and its park
/// cannot miss the signal.
pub(crate) struct WaitCell<K> {
    pub(crate) state: Mutex<Option<LockAttemptResult<K>>>,
    pub(crate) granted: Condvar,
}

impl<K: LockKey> WaitCell<K> {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            granted: Condvar::new(),
        }
    }

    /// Snapshot of the pending attempt, if any.
    pub(crate) fn waiting_for(&self, id: LockerId) -> Option<LockAttemptResult<K>> {
        let _sync = discipline::locker_sync(id);
        self.state.lock().clone()
    }

    /// Record (or clear) the pending attempt. A recorded attempt must
    /// carry its blocking request.
    pub(crate) fn set_waiting_for(&self, id: LockerId, value: Option<LockAttemptResult<K>>) {
        if let Some(result) = &value {
            assert!(
                result.conflict().is_some(),
                "a pending attempt must record a conflict"
            );
        }
        let _sync = discipline::locker_sync(id);
        *self.state.lock() = value;
    }

    /// Publish a wakeup to a possibly-parked locker.
    pub(crate) fn notify(&self, id: LockerId) {
        let _sync = discipline::locker_sync(id);
        let _guard = self.state.lock();
        self.granted.notify_all();
    }
}

// ---------------------------------------------------------------------------
// LockerCore
// ---------------------------------------------------------------------------

/// Per-locker state allocated by
/// [`LockManager::register`](crate::LockManager::register).
///
/// Holds the owning manager's token, the locker identity, the wait cell,
/// and the slot an external deadlock arbiter writes verdicts into.
pub struct LockerCore<K> {
    manager: ManagerToken,
    id: LockerId,
    wait: Arc<WaitCell<K>>,
    // Leaf lock: taken last, never held across another acquisition.
    conflict: Mutex<Option<LockConflict<K>>>,
}

impl<K: LockKey> LockerCore<K> {
    pub(crate) fn new(manager: ManagerToken, id: LockerId) -> Self {
        Self {
            manager,
            id,
            wait: Arc::new(WaitCell::new()),
            conflict: Mutex::new(None),
        }
    }

    /// This locker's identity.
    #[inline]
    #[must_use]
    pub fn id(&self) -> LockerId {
        self.id
    }

    pub(crate) fn manager_token(&self) -> ManagerToken {
        self.manager
    }

    pub(crate) fn wait(&self) -> &WaitCell<K> {
        &self.wait
    }

    pub(crate) fn wait_handle(&self) -> Arc<WaitCell<K>> {
        Arc::clone(&self.wait)
    }

    /// The attempt this locker is currently blocked on, if any.
    #[must_use]
    pub fn waiting_for(&self) -> Option<LockAttemptResult<K>> {
        self.wait.waiting_for(self.id)
    }

    /// Store an arbiter verdict for this locker and wake it if it is
    /// parked.
    ///
    /// A stored [`ConflictKind::Deadlock`] verdict is never displaced:
    /// later injections of any kind are ignored once a locker has been
    /// declared a deadlock victim.
    pub fn inject_conflict(&self, conflict: LockConflict<K>) {
        {
            let mut slot = self.conflict.lock();
            if slot
                .as_ref()
                .is_some_and(|held| held.kind() == ConflictKind::Deadlock)
            {
                return;
            }
            *slot = Some(conflict);
        }
        self.wait.notify(self.id);
    }

    /// The injected verdict, if any.
    #[must_use]
    pub fn injected_conflict(&self) -> Option<LockConflict<K>> {
        self.conflict.lock().clone()
    }

    /// Dismiss a non-deadlock verdict. A deadlock verdict is sticky and
    /// survives dismissal.
    pub fn dismiss_conflict(&self) {
        let mut slot = self.conflict.lock();
        if slot
            .as_ref()
            .is_some_and(|held| held.kind() != ConflictKind::Deadlock)
        {
            *slot = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Locker trait
// ---------------------------------------------------------------------------

/// An actor that acquires locks from a
/// [`LockManager`](crate::LockManager).
///
/// Implementations customize behavior through the provided hooks. Every
/// hook must be non-blocking, must not synchronize on any monitor, and
/// must not touch state outside the locker itself; `new_request` in
/// particular runs under a shard monitor and has to stay pure.
pub trait Locker<K: LockKey>: Send + Sync {
    /// The shared state allocated for this locker by
    /// [`LockManager::register`](crate::LockManager::register).
    fn core(&self) -> &LockerCore<K>;

    /// The conflict currently standing against this locker, if any.
    /// Usually a deadlock verdict written by an external arbiter.
    fn conflict(&self) -> Option<LockConflict<K>> {
        self.core().injected_conflict()
    }

    /// Dismiss a non-deadlock conflict.
    fn clear_conflict(&self) {
        self.core().dismiss_conflict();
    }

    /// Absolute deadline for a wait starting at `now`. The default
    /// applies the manager-wide timeout; overrides typically enforce a
    /// transaction deadline instead.
    fn timeout_deadline(&self, now: Instant, default_timeout: Duration) -> Instant {
        saturating_deadline(now, default_timeout)
    }

    /// Build the request recorded for one acquisition attempt.
    fn new_request(&self, key: K, for_write: bool, upgrade: bool) -> LockRequest<K> {
        LockRequest::new(self.core().id(), key, for_write, upgrade)
    }
}

/// `now + timeout`, pinned to a far-future instant instead of
/// overflowing.
#[must_use]
pub fn saturating_deadline(now: Instant, timeout: Duration) -> Instant {
    // A year out is past any plausible wait; good enough as "unbounded".
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 60 * 60))
}

// ---------------------------------------------------------------------------
// BasicLocker
// ---------------------------------------------------------------------------

/// The stock locker: one outstanding request at a time, no hook
/// overrides.
pub struct BasicLocker<K> {
    core: LockerCore<K>,
}

impl<K: LockKey> BasicLocker<K> {
    /// Register a new locker with `manager`.
    #[must_use]
    pub fn new(manager: &LockManager<K>) -> Self {
        Self {
            core: manager.register(),
        }
    }
}

impl<K: LockKey> Locker<K> for BasicLocker<K> {
    fn core(&self) -> &LockerCore<K> {
        &self.core
    }
}
