//! In-memory lock store for unit testing without a Redis server.
//!
//! Enabled with the `test-support` feature:
//!
//! ```toml
//! [dev-dependencies]
//! trogon-lock = { path = "...", features = ["test-support"] }
//! ```
//!
//! Expiry uses `tokio::time::Instant`, so tests running with
//! `#[tokio::test(start_paused = true)]` can move past a TTL instantly.

use std::collections::HashMap;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::Duration;

use tokio::time::Instant;

use crate::traits::{DeleteOutcome, LockStore};

#[derive(Debug)]
pub struct MockStoreError(pub &'static str);

impl std::fmt::Display for MockStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for MockStoreError {}

#[derive(Debug, Clone)]
struct Record {
    value: String,
    expires_at: Instant,
}

/// Shared map standing in for the remote cache. Clones see the same records,
/// so two engines built on clones behave like two replicas.
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    records: Arc<Mutex<HashMap<String, Record>>>,
    set_calls: Arc<AtomicUsize>,
    delete_calls: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired value under `key`.
    pub fn value(&self, key: &str) -> Option<String> {
        let records = self.records.lock().unwrap();
        records
            .get(key)
            .filter(|r| r.expires_at > Instant::now())
            .map(|r| r.value.clone())
    }

    /// Overwrite `key` as if another holder had acquired it.
    pub fn insert(&self, key: &str, value: &str, ttl: Duration) {
        self.records.lock().unwrap().insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop `key` as if its TTL had run out.
    pub fn expire(&self, key: &str) {
        self.records.lock().unwrap().remove(key);
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail as if the store were unreachable.
    pub fn go_down(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn come_back(&self) {
        self.unavailable.store(false, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), MockStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(MockStoreError("store unavailable"))
        } else {
            Ok(())
        }
    }
}

impl LockStore for MemoryLockStore {
    type Error = MockStoreError;

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, MockStoreError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Instant::now();
        let mut records = self.records.lock().unwrap();
        if records.get(key).is_some_and(|r| r.expires_at > now) {
            return Ok(false);
        }
        records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
    ) -> Result<DeleteOutcome, MockStoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = Instant::now();
        let mut records = self.records.lock().unwrap();
        match records.get(key) {
            Some(r) if r.expires_at > now => {
                if r.value == expected {
                    records.remove(key);
                    Ok(DeleteOutcome::Deleted)
                } else {
                    Ok(DeleteOutcome::Mismatch)
                }
            }
            _ => {
                records.remove(key);
                Ok(DeleteOutcome::Absent)
            }
        }
    }
}
