//! API-misuse errors.
//!
//! Contention outcomes ([`LockConflict`](crate::LockConflict)) are
//! ordinary return values, never errors, and the release path never
//! fails; this enum covers only calls the library refuses to perform.

use thiserror::Error;

use crate::types::LockerId;

/// Errors raised at the call site for misuse of the API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    /// The locker was registered with a different manager.
    #[error("{locker} belongs to a different lock manager")]
    ForeignLocker {
        /// The offending locker.
        locker: LockerId,
    },

    /// A new acquisition was attempted while an earlier blocked attempt
    /// is still pending; resolve it with
    /// [`wait_for_lock`](crate::LockManager::wait_for_lock) first.
    #[error("{locker} attempted to obtain a new lock on {key} while waiting")]
    AlreadyWaiting {
        /// The offending locker.
        locker: LockerId,
        /// Debug rendering of the newly requested key.
        key: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_locker() {
        let err = LockError::ForeignLocker {
            locker: LockerId::new(4),
        };
        assert_eq!(err.to_string(), "locker#4 belongs to a different lock manager");

        let err = LockError::AlreadyWaiting {
            locker: LockerId::new(9),
            key: "\"acct\"".to_owned(),
        };
        assert!(err.to_string().contains("locker#9"));
        assert!(err.to_string().contains("while waiting"));
    }
}
