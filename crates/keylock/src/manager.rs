//! The lock manager: sharded key maps, the public API, and the wait
//! loop.
//!
//! # Synchronization scheme
//!
//! Synchronization happens on exactly two kinds of monitor: a locker's
//! wait cell and a shard map. A thread holds at most one of each at any
//! instant, and when it holds both the locker monitor came first. Lock
//! records have no monitor of their own; all access to them goes through
//! the shard monitor, and code holding a shard monitor never
//! synchronizes on a locker. The one routine that needs both is
//! [`LockManager::wait_for_lock`], which parks on the locker monitor and
//! takes the shard monitor briefly inside its loop. Release grants are
//! published to promoted lockers only after the shard monitor is
//! dropped. Debug builds assert the ordering on every acquisition.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{debug, trace};
use xxhash_rust::xxh3::Xxh3;

use crate::discipline;
use crate::error::LockError;
use crate::lock::KeyLock;
use crate::locker::{Locker, LockerCore};
use crate::types::{ConflictKind, LockConflict, LockKey, LockRequest, LockerId, ManagerToken};

/// Pads a shard out to its own cache line so adjacent shards never
/// false-share.
#[repr(C, align(64))]
struct CacheAligned<T> {
    value: T,
}

impl<T> CacheAligned<T> {
    const fn new(value: T) -> Self {
        Self { value }
    }
}

type Shard<K> = CacheAligned<Mutex<HashMap<K, KeyLock<K>>>>;

/// A key-based lock manager for transactional actors.
///
/// Mediates shared/read and exclusive/write access to a dynamic universe
/// of keys on behalf of [`Locker`]s. Supports read-to-write upgrade,
/// bounded waits with per-locker deadlines, FIFO fairness with
/// writer-starvation avoidance, and externally arbitrated deadlock
/// verdicts (see [`LockerCore::inject_conflict`]).
///
/// The key space is partitioned across `num_shards` independent maps;
/// operations on keys in different shards never contend.
pub struct LockManager<K: LockKey> {
    token: ManagerToken,
    default_timeout: Duration,
    shards: Box<[Shard<K>]>,
    next_locker: AtomicU64,
}

impl<K: LockKey> LockManager<K> {
    /// Create a manager.
    ///
    /// `default_timeout` bounds every wait unless a locker's
    /// [`timeout_deadline`](Locker::timeout_deadline) overrides it.
    ///
    /// # Panics
    ///
    /// Panics if `default_timeout` is zero or `num_shards` is zero.
    #[must_use]
    pub fn new(default_timeout: Duration, num_shards: usize) -> Self {
        assert!(
            !default_timeout.is_zero(),
            "default_timeout must be positive"
        );
        assert!(num_shards >= 1, "num_shards must be at least 1");
        let shards = (0..num_shards)
            .map(|_| CacheAligned::new(Mutex::new(HashMap::new())))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        debug!(
            num_shards,
            timeout_ms = default_timeout.as_millis() as u64,
            "lock manager created"
        );
        Self {
            token: ManagerToken::next(),
            default_timeout,
            shards,
            next_locker: AtomicU64::new(1),
        }
    }

    /// Allocate the shared state for a new locker owned by this manager.
    #[must_use]
    pub fn register(&self) -> LockerCore<K> {
        let id = LockerId::new(self.next_locker.fetch_add(1, Ordering::Relaxed));
        LockerCore::new(self.token, id)
    }

    /// The wait bound applied when a locker does not override it.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Acquire a lock, waiting if needed.
    ///
    /// Returns `Ok(None)` once the lock is held. A returned conflict
    /// means the lock was not acquired; a [`ConflictKind::Deadlock`]
    /// verdict additionally requires the caller to abort — every later
    /// call for this locker repeats it. Any other conflict may simply be
    /// retried.
    ///
    /// # Errors
    ///
    /// [`LockError::ForeignLocker`] if `locker` belongs to another
    /// manager; [`LockError::AlreadyWaiting`] if an earlier blocked
    /// attempt is still unresolved.
    pub fn lock(
        &self,
        locker: &impl Locker<K>,
        key: K,
        for_write: bool,
    ) -> Result<Option<LockConflict<K>>, LockError> {
        self.check_locker(locker)?;
        match self.lock_no_wait_internal(locker, key, for_write)? {
            Some(conflict) if conflict.kind() == ConflictKind::Blocked => {
                Ok(self.wait_for_lock_internal(locker))
            }
            outcome => Ok(outcome),
        }
    }

    /// Acquire a lock, returning immediately.
    ///
    /// Never blocks. A [`ConflictKind::Blocked`] conflict means the
    /// locker has been queued and **must** resolve the attempt with
    /// [`wait_for_lock`](Self::wait_for_lock) (or observe it time out
    /// there) before issuing another acquisition.
    ///
    /// # Errors
    ///
    /// As for [`lock`](Self::lock).
    pub fn lock_no_wait(
        &self,
        locker: &impl Locker<K>,
        key: K,
        for_write: bool,
    ) -> Result<Option<LockConflict<K>>, LockError> {
        self.check_locker(locker)?;
        self.lock_no_wait_internal(locker, key, for_write)
    }

    /// Resolve a previously blocked attempt, waiting as needed.
    ///
    /// Returns `Ok(None)` if the lock is now held or the locker was not
    /// waiting at all.
    ///
    /// # Errors
    ///
    /// [`LockError::ForeignLocker`] if `locker` belongs to another
    /// manager.
    pub fn wait_for_lock(
        &self,
        locker: &impl Locker<K>,
    ) -> Result<Option<LockConflict<K>>, LockError> {
        self.check_locker(locker)?;
        Ok(self.wait_for_lock_internal(locker))
    }

    fn lock_no_wait_internal(
        &self,
        locker: &impl Locker<K>,
        key: K,
        for_write: bool,
    ) -> Result<Option<LockConflict<K>>, LockError> {
        let core = locker.core();
        let id = core.id();
        trace!(locker = %id, key = ?key, for_write, "lock attempt");

        if core.wait().waiting_for(id).is_some() {
            return Err(LockError::AlreadyWaiting {
                locker: id,
                key: format!("{key:?}"),
            });
        }
        if let Some(conflict) = locker.conflict() {
            if conflict.kind() == ConflictKind::Deadlock {
                debug!(locker = %id, key = ?key, for_write, outcome = %conflict.kind(),
                       "lock returns sticky deadlock");
                return Ok(Some(conflict));
            }
            // A leftover transient verdict dies with the new attempt.
            locker.clear_conflict();
        }

        let result = {
            let index = self.shard_index(&key);
            let _sync = discipline::shard_sync(index);
            let mut map = self.shards[index].value.lock();
            map.entry(key.clone())
                .or_insert_with(KeyLock::new)
                .request(locker, &key, for_write)
        };

        let Some(result) = result else {
            debug!(locker = %id, key = ?key, for_write, "lock returns: already granted");
            return Ok(None);
        };
        let Some(blocking) = result.conflict().cloned() else {
            debug!(locker = %id, key = ?key, for_write, "lock returns: granted");
            return Ok(None);
        };

        // Queued: record the pending attempt for wait_for_lock to resolve.
        core.wait().set_waiting_for(id, Some(result));
        let conflict = LockConflict::new(ConflictKind::Blocked, blocking);
        debug!(locker = %id, key = ?key, for_write, outcome = %conflict.kind(),
               "lock returns: blocked");
        Ok(Some(conflict))
    }

    /// The wait loop. This is the only code path that holds a locker
    /// monitor and a shard monitor at once, always in that order.
    fn wait_for_lock_internal(&self, locker: &impl Locker<K>) -> Option<LockConflict<K>> {
        let core = locker.core();
        let id = core.id();
        let cell = core.wait();
        trace!(locker = %id, "wait for lock");

        let _locker_sync = discipline::locker_sync(id);
        let mut waiting = cell.state.lock();
        let Some(result) = waiting.clone() else {
            // Not waiting. A standing deadlock verdict still echoes so an
            // aborting caller cannot observe a spurious success.
            let verdict = locker
                .conflict()
                .filter(|c| c.kind() == ConflictKind::Deadlock);
            trace!(locker = %id, deadlocked = verdict.is_some(), "wait returns: not waiting");
            return verdict;
        };
        let key = result.request().key().clone();
        let for_write = result.request().for_write();
        let upgrade = result.request().upgrade();
        let index = self.shard_index(&key);

        let start = Instant::now();
        let mut now = start;
        let deadline = locker.timeout_deadline(now, self.default_timeout);
        let mut conflict: Option<LockConflict<K>> = None;

        let outcome = loop {
            if conflict.is_none() {
                conflict = locker.conflict();
            }
            let (is_owner, timed_out, upgrade_denied) = {
                let _shard_sync = discipline::shard_sync(index);
                let mut map = self.shards[index].value.lock();
                let mut entry = map.get_mut(&key);
                let (owner_present, owner_upgraded) =
                    match entry.as_deref().and_then(|e| e.owner_for(id)) {
                        Some(owner) => (true, owner.upgrade()),
                        None => (false, false),
                    };
                // An upgrade only counts as granted once its entry
                // carries the write mode.
                let is_owner = owner_present && (!upgrade || owner_upgraded);
                let mut timed_out = false;
                let mut upgrade_denied = false;
                if !is_owner {
                    if conflict.is_some() {
                        if let Some(e) = entry.as_deref_mut() {
                            e.flush_waiter(id);
                        }
                    } else if now >= deadline {
                        timed_out = true;
                        if let Some(e) = entry.as_deref_mut() {
                            e.flush_waiter(id);
                        }
                    } else if upgrade && !owner_present {
                        // The base read ownership vanished; this upgrade
                        // can never be granted.
                        upgrade_denied = true;
                        if let Some(e) = entry.as_deref_mut() {
                            e.flush_waiter(id);
                        }
                    }
                }
                if entry.is_some_and(|e| !e.in_use()) {
                    map.remove(&key);
                }
                (is_owner, timed_out, upgrade_denied)
            };

            if is_owner {
                if conflict
                    .as_ref()
                    .is_some_and(|c| c.kind() == ConflictKind::Deadlock)
                {
                    // The deadlock verdict wins even over a grant that
                    // has already happened: the transaction must abort.
                    break conflict;
                }
                *waiting = None;
                locker.clear_conflict();
                debug!(locker = %id, key = ?key, for_write,
                       elapsed_ms = start.elapsed().as_millis() as u64,
                       "wait returns: granted");
                return None;
            }
            if timed_out {
                break Some(LockConflict::new(
                    ConflictKind::Timeout,
                    result
                        .conflict()
                        .cloned()
                        .expect("a pending attempt records its blocker"),
                ));
            }
            if upgrade_denied {
                break Some(LockConflict::new(
                    ConflictKind::Denied,
                    result
                        .conflict()
                        .cloned()
                        .expect("a pending attempt records its blocker"),
                ));
            }
            if conflict.is_some() {
                break conflict;
            }

            debug!(locker = %id, key = ?key, for_write,
                   wait_ms = deadline.saturating_duration_since(now).as_millis() as u64,
                   "waiting for lock");
            let _ = cell.granted.wait_until(&mut waiting, deadline);
            now = Instant::now();
        };

        *waiting = None;
        let kind = outcome.as_ref().map_or(ConflictKind::Blocked, LockConflict::kind);
        if kind != ConflictKind::Deadlock {
            // A deadlock verdict outlives the wait; everything else is
            // spent once reported.
            locker.clear_conflict();
        }
        debug!(locker = %id, key = ?key, for_write,
               elapsed_ms = start.elapsed().as_millis() as u64,
               outcome = %kind,
               "wait returns");
        outcome
    }

    // -----------------------------------------------------------------------
    // Release
    // -----------------------------------------------------------------------

    /// Release whatever this locker holds on `key`. Unknown keys and
    /// non-owning lockers are tolerated silently.
    ///
    /// # Errors
    ///
    /// [`LockError::ForeignLocker`] if `locker` belongs to another
    /// manager.
    pub fn release_lock(&self, locker: &impl Locker<K>, key: &K) -> Result<(), LockError> {
        debug!(locker = %locker.core().id(), key = ?key, "release lock");
        self.release_lock_internal(locker, key, false)
    }

    /// Convert this locker's write ownership of `key` into read
    /// ownership, promoting any waiters the downgrade admits. A no-op if
    /// the locker does not hold a write lock on `key`.
    ///
    /// # Errors
    ///
    /// [`LockError::ForeignLocker`] if `locker` belongs to another
    /// manager.
    pub fn downgrade_lock(&self, locker: &impl Locker<K>, key: &K) -> Result<(), LockError> {
        debug!(locker = %locker.core().id(), key = ?key, "downgrade lock");
        self.release_lock_internal(locker, key, true)
    }

    fn release_lock_internal(
        &self,
        locker: &impl Locker<K>,
        key: &K,
        downgrade: bool,
    ) -> Result<(), LockError> {
        self.check_locker(locker)?;
        let id = locker.core().id();
        // Built before the shard section so no hook runs under the monitor.
        let replacement = downgrade.then(|| locker.new_request(key.clone(), false, false));

        let granted = {
            let index = self.shard_index(key);
            let _sync = discipline::shard_sync(index);
            let mut map = self.shards[index].value.lock();
            let Some(entry) = map.get_mut(key) else {
                return Ok(());
            };
            let granted = if entry.release(id, replacement) {
                entry.promote_waiters()
            } else {
                SmallVec::new()
            };
            if !entry.in_use() {
                map.remove(key);
            }
            granted
        };

        // Wakeups happen outside the shard monitor: one monitor at a
        // time, locker monitors only while no shard monitor is held.
        for (request, cell) in granted {
            trace!(locker = %request.locker(), key = ?key,
                   for_write = request.for_write(), "notify new owner");
            cell.notify(request.locker());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// Snapshot of the current owners of `key`.
    #[must_use]
    pub fn get_owners(&self, key: &K) -> Vec<LockRequest<K>> {
        self.snapshot(key, KeyLock::copy_owners)
    }

    /// Snapshot of the current waiters for `key`, in queue order.
    #[must_use]
    pub fn get_waiters(&self, key: &K) -> Vec<LockRequest<K>> {
        self.snapshot(key, KeyLock::copy_waiters)
    }

    fn snapshot(
        &self,
        key: &K,
        copy: impl FnOnce(&KeyLock<K>) -> Vec<LockRequest<K>>,
    ) -> Vec<LockRequest<K>> {
        let index = self.shard_index(key);
        let _sync = discipline::shard_sync(index);
        let map = self.shards[index].value.lock();
        map.get(key).map(copy).unwrap_or_default()
    }

    /// Number of keys with live lock state across all shards.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.shard_distribution().iter().sum()
    }

    /// Per-shard key occupancy, for contention analysis.
    #[must_use]
    pub fn shard_distribution(&self) -> Vec<usize> {
        (0..self.shards.len())
            .map(|index| {
                let _sync = discipline::shard_sync(index);
                self.shards[index].value.lock().len()
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = Xxh3::new();
        std::hash::Hash::hash(key, &mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn check_locker(&self, locker: &impl Locker<K>) -> Result<(), LockError> {
        let core = locker.core();
        if core.manager_token() != self.token {
            return Err(LockError::ForeignLocker { locker: core.id() });
        }
        Ok(())
    }
}

impl<K: LockKey> fmt::Debug for LockManager<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("shard_count", &self.shards.len())
            .field("lock_count", &self.lock_count())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}
