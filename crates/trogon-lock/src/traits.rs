use std::future::Future;
use std::time::Duration;

/// Outcome of an atomic compare-and-delete against the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Nothing stored under the key (expired or never set).
    Absent,
    /// Stored value matched and the key was removed.
    Deleted,
    /// Another token is stored; the key was left untouched.
    Mismatch,
}

/// The two store primitives the lock engine needs.
///
/// Both operations must be atomic on the store side: the conditional set is the
/// only cross-process arbitration, and compare-and-delete must not be split into
/// separate read and delete round trips.
pub trait LockStore: Send + Sync + Clone + 'static {
    type Error: std::error::Error + Send + Sync;

    /// Set `key` to `value` only if it does not exist, expiring after `ttl`.
    /// Returns `Ok(false)` when the key is already present.
    fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    /// Delete `key` only if its current value equals `expected`.
    fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> impl Future<Output = Result<DeleteOutcome, Self::Error>> + Send;
}
