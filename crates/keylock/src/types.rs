//! Value types shared across the lock manager.
//!
//! Everything in this module is immutable after construction and safe to
//! share between threads: identities, requests, and the conflict
//! envelopes that report how an acquisition ended. The mutable machinery
//! lives in the per-key lock records and the manager itself.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounds a type must satisfy to name a lockable resource.
///
/// Blanket-implemented for every eligible type; callers never implement
/// it by hand.
pub trait LockKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static> LockKey for T {}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Identity of a locker within its manager.
///
/// Issued by [`LockManager::register`](crate::LockManager::register) as a
/// monotonically increasing serial. Two lockers of the same manager never
/// share an id; ids are not reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockerId(u64);

impl LockerId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw serial value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LockerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locker#{}", self.0)
    }
}

/// Process-unique identity of one manager instance.
///
/// Recorded in every locker core so a manager can reject lockers that
/// were registered elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ManagerToken(u64);

impl ManagerToken {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// ConflictKind
// ---------------------------------------------------------------------------

/// The kind of conflict blocking, or having ended, an acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictKind {
    /// The request could not be granted synchronously; the locker is
    /// queued and must resolve the attempt with
    /// [`wait_for_lock`](crate::LockManager::wait_for_lock).
    Blocked,
    /// An external arbiter declared this locker a deadlock victim.
    /// Sticky: the locker keeps reporting it until torn down.
    Deadlock,
    /// The wait deadline elapsed before a grant.
    Timeout,
    /// An upgrade whose base read ownership vanished mid-wait.
    Denied,
    /// The wait was cut short by an injected transient verdict. The next
    /// acquisition attempt dismisses it.
    Interrupted,
}

impl ConflictKind {
    /// Whether this verdict terminates the locker (the caller must abort
    /// and tear the locker down).
    #[must_use]
    pub fn is_sticky(self) -> bool {
        matches!(self, Self::Deadlock)
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Blocked => "blocked",
            Self::Deadlock => "deadlock",
            Self::Timeout => "timeout",
            Self::Denied => "denied",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// LockRequest
// ---------------------------------------------------------------------------

/// Immutable record of one acquisition attempt.
///
/// An upgrade request is created when a locker that already holds read
/// ownership of `key` asks for write ownership; `upgrade` implies
/// `for_write`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest<K> {
    locker: LockerId,
    key: K,
    for_write: bool,
    upgrade: bool,
}

impl<K: LockKey> LockRequest<K> {
    /// Build a request.
    ///
    /// # Panics
    ///
    /// Panics if `upgrade` is set without `for_write`.
    #[must_use]
    pub fn new(locker: LockerId, key: K, for_write: bool, upgrade: bool) -> Self {
        assert!(for_write || !upgrade, "an upgrade request is always for write");
        Self {
            locker,
            key,
            for_write,
            upgrade,
        }
    }

    /// The requesting locker.
    #[inline]
    #[must_use]
    pub fn locker(&self) -> LockerId {
        self.locker
    }

    /// The key being locked.
    #[inline]
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether write ownership was requested.
    #[inline]
    #[must_use]
    pub fn for_write(&self) -> bool {
        self.for_write
    }

    /// Whether this is a read-to-write upgrade.
    #[inline]
    #[must_use]
    pub fn upgrade(&self) -> bool {
        self.upgrade
    }
}

// ---------------------------------------------------------------------------
// LockConflict
// ---------------------------------------------------------------------------

/// Why an acquisition is (or stayed) unsatisfied, paired with a
/// representative request it collided with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConflict<K> {
    kind: ConflictKind,
    conflicting: LockRequest<K>,
}

impl<K: LockKey> LockConflict<K> {
    /// Build a conflict envelope.
    #[must_use]
    pub fn new(kind: ConflictKind, conflicting: LockRequest<K>) -> Self {
        Self { kind, conflicting }
    }

    /// The conflict kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> ConflictKind {
        self.kind
    }

    /// The request this one collided with.
    #[inline]
    #[must_use]
    pub fn conflicting_request(&self) -> &LockRequest<K> {
        &self.conflicting
    }
}

// ---------------------------------------------------------------------------
// LockAttemptResult
// ---------------------------------------------------------------------------

/// Outcome of one synchronous attempt computed under the shard monitor.
///
/// `conflict == None` means the request was granted on the spot.
/// Otherwise the request was queued and `conflict` names a representative
/// blocking owner; the final verdict (timeout, deadlock, ...) is attached
/// later by the wait loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockAttemptResult<K> {
    request: LockRequest<K>,
    conflict: Option<LockRequest<K>>,
}

impl<K: LockKey> LockAttemptResult<K> {
    pub(crate) fn new(request: LockRequest<K>, conflict: Option<LockRequest<K>>) -> Self {
        Self { request, conflict }
    }

    /// The request this attempt recorded.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &LockRequest<K> {
        &self.request
    }

    /// The owner that blocked the attempt, if it blocked.
    #[inline]
    #[must_use]
    pub fn conflict(&self) -> Option<&LockRequest<K>> {
        self.conflict.as_ref()
    }

    /// Whether the attempt was granted synchronously.
    #[inline]
    #[must_use]
    pub fn granted(&self) -> bool {
        self.conflict.is_none()
    }
}
