//! Monitor-ordering assertions.
//!
//! The scheme that keeps the manager free of internal deadlock:
//!
//! - a thread holds at most one locker monitor and at most one shard
//!   monitor at any instant;
//! - when it holds both, the locker monitor was acquired first;
//! - per-key lock records carry no monitor of their own, so the ordering
//!   above is a total description of the monitors in play.
//!
//! Debug builds track the held monitors in thread-locals and panic on a
//! violation — such a panic is a library bug, not a recoverable
//! condition. Release builds compile this module down to nothing.
//!
//! Acquisitions are recorded through RAII guards so the bookkeeping is
//! unwound on every exit path, panics included.

pub(crate) use imp::{locker_sync, shard_sync, LockerSync, ShardSync};

#[cfg(debug_assertions)]
mod imp {
    use std::cell::Cell;

    use crate::types::LockerId;

    thread_local! {
        static HELD_LOCKER: Cell<Option<LockerId>> = const { Cell::new(None) };
        static HELD_SHARD: Cell<Option<usize>> = const { Cell::new(None) };
    }

    /// Records that the current thread holds the monitor of one locker.
    pub(crate) struct LockerSync {
        id: LockerId,
    }

    /// Records that the current thread holds one shard monitor.
    pub(crate) struct ShardSync {
        index: usize,
    }

    /// Note a locker-monitor acquisition. Must be the first monitor the
    /// thread takes.
    pub(crate) fn locker_sync(id: LockerId) -> LockerSync {
        HELD_SHARD.with(|shard| {
            assert!(
                shard.get().is_none(),
                "attempt to synchronize on {id} while holding shard {:?}",
                shard.get()
            );
        });
        HELD_LOCKER.with(|locker| {
            assert!(
                locker.get().is_none(),
                "attempt to synchronize on {id} while already synchronized on {}",
                locker.get().unwrap()
            );
            locker.set(Some(id));
        });
        LockerSync { id }
    }

    /// Note a shard-monitor acquisition. A locker monitor may already be
    /// held; a second shard monitor may not.
    pub(crate) fn shard_sync(index: usize) -> ShardSync {
        HELD_SHARD.with(|shard| {
            assert!(
                shard.get().is_none(),
                "attempt to synchronize on shard {index} while holding shard {}",
                shard.get().unwrap()
            );
            shard.set(Some(index));
        });
        ShardSync { index }
    }

    impl Drop for LockerSync {
        fn drop(&mut self) {
            HELD_LOCKER.with(|locker| {
                assert_eq!(
                    locker.get(),
                    Some(self.id),
                    "locker monitor bookkeeping out of balance"
                );
                locker.set(None);
            });
        }
    }

    impl Drop for ShardSync {
        fn drop(&mut self) {
            HELD_SHARD.with(|shard| {
                assert_eq!(
                    shard.get(),
                    Some(self.index),
                    "shard monitor bookkeeping out of balance"
                );
                shard.set(None);
            });
        }
    }
}

#[cfg(not(debug_assertions))]
mod imp {
    use crate::types::LockerId;

    pub(crate) struct LockerSync;
    pub(crate) struct ShardSync;

    #[inline(always)]
    pub(crate) fn locker_sync(_id: LockerId) -> LockerSync {
        LockerSync
    }

    #[inline(always)]
    pub(crate) fn shard_sync(_index: usize) -> ShardSync {
        ShardSync
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LockerId;

    #[test]
    fn locker_then_shard_is_permitted() {
        let _locker = locker_sync(LockerId::new(1));
        let _shard = shard_sync(0);
    }

    #[test]
    fn monitors_can_be_retaken_after_release() {
        {
            let _locker = locker_sync(LockerId::new(1));
        }
        {
            let _locker = locker_sync(LockerId::new(2));
            let _shard = shard_sync(3);
        }
        let _shard = shard_sync(3);
    }

    #[test]
    #[should_panic(expected = "while holding shard")]
    fn shard_then_locker_panics() {
        let _shard = shard_sync(0);
        let _locker = locker_sync(LockerId::new(1));
    }

    #[test]
    #[should_panic(expected = "while already synchronized")]
    fn two_lockers_panic() {
        let _a = locker_sync(LockerId::new(1));
        let _b = locker_sync(LockerId::new(2));
    }

    #[test]
    #[should_panic(expected = "while holding shard")]
    fn two_shards_panic() {
        let _a = shard_sync(0);
        let _b = shard_sync(1);
    }
}
