//! Key-based lock manager for transactional actors.
//!
//! A [`LockManager`] mediates concurrent access from many independent
//! actors ([`Locker`]s) to a dynamic universe of named resources (keys),
//! with shared/read and exclusive/write modes, read-to-write upgrade,
//! bounded waits, and FIFO fairness that keeps writers from starving.
//! Deadlock *detection* is delegated to an external arbiter, which
//! reports verdicts through [`LockerCore::inject_conflict`]; a deadlock
//! verdict is sticky and dominant until the victim is torn down.
//!
//! The manager is an embeddable library: no wire protocol, no persisted
//! state, no I/O. Contention outcomes are ordinary [`LockConflict`]
//! values; only API misuse surfaces as [`LockError`].
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use keylock::{BasicLocker, LockManager};
//!
//! let manager: LockManager<&str> = LockManager::new(Duration::from_millis(100), 16);
//! let txn = BasicLocker::new(&manager);
//!
//! assert!(manager.lock(&txn, "accounts/42", false).unwrap().is_none());
//! assert!(manager.lock(&txn, "accounts/42", true).unwrap().is_none()); // upgrade
//! manager.release_lock(&txn, &"accounts/42").unwrap();
//! ```
//!
//! # Synchronization scheme
//!
//! The implementation synchronizes on exactly two kinds of monitor —
//! locker wait cells and shard maps — under rules that make internal
//! deadlock impossible:
//!
//! - a thread holds at most one locker monitor and at most one shard
//!   monitor at any instant;
//! - when it holds both, the locker monitor was acquired first;
//! - per-key lock records carry no monitor of their own and are only
//!   touched under their shard's monitor;
//! - code holding a shard monitor never synchronizes on a locker: grant
//!   notifications are published after the shard monitor is dropped.
//!
//! Debug builds assert these rules on every acquisition; release builds
//! compile the bookkeeping out.
//!
//! # Logging
//!
//! Structured events are emitted through `tracing`: `debug` for coarse
//! flow (releases, request results, wait outcomes with elapsed times)
//! and `trace` for fine detail (initial attempts, waiter promotion,
//! new-owner notification).

pub mod error;
pub mod locker;
pub mod manager;
pub mod types;

mod discipline;
mod lock;

pub use error::LockError;
pub use locker::{saturating_deadline, BasicLocker, Locker, LockerCore};
pub use manager::LockManager;
pub use types::{
    ConflictKind, LockAttemptResult, LockConflict, LockKey, LockRequest, LockerId,
};
