//! Per-key lock state: granted owners, queued waiters, and the grant
//! rule.
//!
//! A [`KeyLock`] carries no monitor of its own. Every method must be
//! reached through the owning shard's mutex; the manager enforces that
//! ordering (see the crate docs and `discipline`).
//!
//! Owner/waiter invariants:
//!
//! - a write owner owns alone; read owners coexist freely;
//! - a locker appears at most once among owners (an upgrade replaces its
//!   read entry in place);
//! - a locker that both owns and waits is an upgrader, nothing else;
//! - waiters are scanned in insertion order when grants open up, with
//!   upgrades parked at the head of the queue.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use crate::locker::{Locker, WaitCell};
use crate::types::{LockAttemptResult, LockKey, LockRequest, LockerId};

/// A queued request plus the handle used to wake its locker on
/// promotion.
pub(crate) struct Waiter<K> {
    request: LockRequest<K>,
    cell: Arc<WaitCell<K>>,
}

/// Lock state for a single key.
pub(crate) struct KeyLock<K> {
    owners: SmallVec<[LockRequest<K>; 2]>,
    waiters: SmallVec<[Waiter<K>; 2]>,
}

impl<K: LockKey> KeyLock<K> {
    pub(crate) fn new() -> Self {
        Self {
            owners: SmallVec::new(),
            waiters: SmallVec::new(),
        }
    }

    /// The grant rule, applied to a fresh attempt by `locker`.
    ///
    /// Returns `None` when the locker already holds the key in a
    /// sufficient mode (nothing new is recorded). Otherwise the returned
    /// result is either granted (`conflict == None`; the locker is now an
    /// owner) or blocked (the request was queued and the result names a
    /// representative blocker).
    pub(crate) fn request<L: Locker<K> + ?Sized>(
        &mut self,
        locker: &L,
        key: &K,
        for_write: bool,
    ) -> Option<LockAttemptResult<K>> {
        let id = locker.core().id();
        let mut upgrade = false;
        let mut own_idx = None;
        let mut conflict_idx = None;
        for (i, owner) in self.owners.iter().enumerate() {
            if owner.locker() == id {
                if owner.for_write() || !for_write {
                    return None; // already holds a sufficient mode
                }
                upgrade = true;
                own_idx = Some(i);
            } else if for_write || owner.for_write() {
                conflict_idx = Some(i);
            }
        }

        // Sole-owner upgrade: promote the read entry in place.
        if upgrade && conflict_idx.is_none() {
            let request = locker.new_request(key.clone(), true, true);
            let own = own_idx.expect("upgrade without a base read entry");
            self.owners[own] = request.clone();
            self.debug_validate();
            return Some(LockAttemptResult::new(request, None));
        }

        // A compatible request still queues behind existing waiters so a
        // queued writer cannot starve. Upgrades never take this path:
        // the upgrader's read ownership blocks every queued request
        // anyway, so jumping the queue loses nothing.
        if conflict_idx.is_none() && !self.waiters.is_empty() {
            let request = locker.new_request(key.clone(), for_write, false);
            let blocking = self.waiters[0].request.clone();
            self.enqueue(Waiter {
                request: request.clone(),
                cell: locker.core().wait_handle(),
            });
            self.debug_validate();
            return Some(LockAttemptResult::new(request, Some(blocking)));
        }

        match conflict_idx {
            None => {
                let request = locker.new_request(key.clone(), for_write, false);
                self.owners.push(request.clone());
                self.debug_validate();
                Some(LockAttemptResult::new(request, None))
            }
            Some(i) => {
                let blocking = self.owners[i].clone();
                let request = locker.new_request(key.clone(), for_write, upgrade);
                self.enqueue(Waiter {
                    request: request.clone(),
                    cell: locker.core().wait_handle(),
                });
                self.debug_validate();
                Some(LockAttemptResult::new(request, Some(blocking)))
            }
        }
    }

    /// Upgrades park at the head of the queue; everything else is FIFO.
    fn enqueue(&mut self, waiter: Waiter<K>) {
        if waiter.request.upgrade() {
            self.waiters.insert(0, waiter);
        } else {
            self.waiters.push(waiter);
        }
    }

    /// Remove (or, with `replacement`, downgrade) the owner entry for
    /// `locker`. A downgrade only applies to a write entry and installs
    /// the caller-built read request in its place. Returns whether an
    /// entry changed; promoting waiters is the caller's next step.
    pub(crate) fn release(
        &mut self,
        locker: LockerId,
        replacement: Option<LockRequest<K>>,
    ) -> bool {
        let Some(idx) = self.owners.iter().position(|o| o.locker() == locker) else {
            return false;
        };
        match replacement {
            Some(read) => {
                if !self.owners[idx].for_write() {
                    return false;
                }
                self.owners[idx] = read;
            }
            None => {
                self.owners.remove(idx);
            }
        }
        self.debug_validate();
        true
    }

    /// Scan waiters front-to-back, promoting every request the remaining
    /// owners admit. Stops at the first still-blocked waiter so nobody
    /// passes it in line. Returns the promoted requests with the wake
    /// handles of their lockers; wakeups must happen after the shard
    /// monitor is released.
    pub(crate) fn promote_waiters(&mut self) -> SmallVec<[(LockRequest<K>, Arc<WaitCell<K>>); 2]> {
        let mut granted = SmallVec::new();
        while !self.waiters.is_empty() {
            if !self.admits(&self.waiters[0].request) {
                break;
            }
            let Waiter { request, cell } = self.waiters.remove(0);
            trace!(locker = %request.locker(), for_write = request.for_write(), "waiter promoted to owner");
            if let Some(own) = self
                .owners
                .iter()
                .position(|o| o.locker() == request.locker())
            {
                // An upgrader's base read entry becomes the write entry.
                self.owners[own] = request.clone();
            } else {
                self.owners.push(request.clone());
            }
            granted.push((request, cell));
        }
        self.debug_validate();
        granted
    }

    /// Whether the current owners are compatible with `request`. The
    /// requester's own entry (an upgrade base) never counts against it.
    fn admits(&self, request: &LockRequest<K>) -> bool {
        self.owners.iter().all(|owner| {
            owner.locker() == request.locker() || !(request.for_write() || owner.for_write())
        })
    }

    /// Drop `locker`'s queued request, if any.
    pub(crate) fn flush_waiter(&mut self, locker: LockerId) {
        self.waiters.retain(|w| w.request.locker() != locker);
    }

    /// The owner entry for `locker`, if it owns this key.
    pub(crate) fn owner_for(&self, locker: LockerId) -> Option<&LockRequest<K>> {
        self.owners.iter().find(|o| o.locker() == locker)
    }

    /// Whether any state remains. An idle record is removed from its
    /// shard map.
    pub(crate) fn in_use(&self) -> bool {
        !self.owners.is_empty() || !self.waiters.is_empty()
    }

    pub(crate) fn copy_owners(&self) -> Vec<LockRequest<K>> {
        self.owners.to_vec()
    }

    pub(crate) fn copy_waiters(&self) -> Vec<LockRequest<K>> {
        self.waiters.iter().map(|w| w.request.clone()).collect()
    }

    /// Structural invariants, checked after every mutation in debug
    /// builds.
    fn debug_validate(&self) {
        if cfg!(debug_assertions) {
            if self.owners.iter().any(LockRequest::for_write) {
                assert_eq!(self.owners.len(), 1, "a write owner must own alone");
            }
            for (i, owner) in self.owners.iter().enumerate() {
                assert!(
                    self.owners[i + 1..]
                        .iter()
                        .all(|other| other.locker() != owner.locker()),
                    "duplicate owner entry for {}",
                    owner.locker()
                );
            }
            for (i, waiter) in self.waiters.iter().enumerate() {
                assert!(
                    self.waiters[i + 1..]
                        .iter()
                        .all(|other| other.request.locker() != waiter.request.locker()),
                    "duplicate waiter entry for {}",
                    waiter.request.locker()
                );
                assert!(
                    waiter.request.upgrade() || self.owner_for(waiter.request.locker()).is_none(),
                    "only an upgrader may own and wait at once"
                );
            }
        }
    }
}
