//! Acquire / wait-acquire / release over a [`LockStore`].
//!
//! The store's conditional set is the only arbiter between replicas. The
//! ownership map kept here only records which token this process must present
//! when it releases; it says nothing authoritative about who holds a key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LockDefaults;
use crate::token::LockToken;
use crate::traits::{DeleteOutcome, LockStore};

/// Result of [`LockEngine::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseStatus {
    /// This process never acquired the key (or already released it); the store
    /// was not contacted.
    NotTrackedLocally,
    /// The record had already expired.
    AbsentRemote,
    Released,
    /// Another holder owns the key now; it was left in place.
    TokenMismatch,
    /// The store call failed. The record will lapse at its TTL.
    StoreError,
}

impl ReleaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotTrackedLocally => "not_tracked_locally",
            Self::AbsentRemote => "absent_remote",
            Self::Released => "released",
            Self::TokenMismatch => "token_mismatch",
            Self::StoreError => "store_error",
        }
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timings for [`LockEngine::wait_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub ttl: Duration,
    pub poll_interval: Duration,
    pub max_wait: Duration,
}

impl From<LockDefaults> for WaitOptions {
    fn from(d: LockDefaults) -> Self {
        Self {
            ttl: d.ttl,
            poll_interval: d.poll_interval,
            max_wait: d.max_wait,
        }
    }
}

impl Default for WaitOptions {
    fn default() -> Self {
        LockDefaults::default().into()
    }
}

#[derive(Debug, Clone)]
struct OwnershipEntry {
    token: LockToken,
    ttl: Duration,
    acquired_at: Instant,
}

#[derive(Clone)]
pub struct LockEngine<S: LockStore> {
    store: S,
    key_prefix: Arc<str>,
    defaults: LockDefaults,
    owned: Arc<Mutex<HashMap<String, OwnershipEntry>>>,
}

impl<S: LockStore> LockEngine<S> {
    pub fn new(store: S, key_prefix: impl Into<String>, defaults: LockDefaults) -> Self {
        Self {
            store,
            key_prefix: Arc::from(key_prefix.into()),
            defaults,
            owned: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The map holds plain data, so a panic elsewhere cannot leave it torn.
    fn owned(&self) -> MutexGuard<'_, HashMap<String, OwnershipEntry>> {
        self.owned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn defaults(&self) -> LockDefaults {
        self.defaults
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Store key for a lock name: `{prefix}{name}`.
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    /// Single attempt with the configured default TTL.
    pub async fn acquire_default(&self, name: &str) -> Option<LockToken> {
        self.acquire(name, self.defaults.ttl).await
    }

    /// One conditional set with a fresh token. `None` means the key is held,
    /// the input was invalid, or the store failed; none of these raise.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Option<LockToken> {
        if name.is_empty() {
            warn!("Refusing to acquire a lock with an empty name");
            return None;
        }
        if ttl.is_zero() {
            warn!(lock = %name, "Refusing to acquire a lock with a zero TTL");
            return None;
        }

        let key = self.key(name);
        let token = LockToken::generate();

        match self.store.set_if_absent(&key, token.as_str(), ttl).await {
            Ok(true) => {
                self.owned().insert(
                    key.clone(),
                    OwnershipEntry {
                        token: token.clone(),
                        ttl,
                        acquired_at: Instant::now(),
                    },
                );
                debug!(lock = %name, key = %key, ttl_ms = ttl.as_millis(), "Lock acquired");
                Some(token)
            }
            Ok(false) => {
                debug!(lock = %name, key = %key, "Lock held elsewhere");
                None
            }
            Err(e) => {
                warn!(lock = %name, key = %key, error = %e, "Lock acquire failed");
                None
            }
        }
    }

    /// Poll [`acquire`](Self::acquire) at a fixed interval until it succeeds or
    /// `max_wait` has elapsed since the call started.
    pub async fn wait_acquire(&self, name: &str, options: WaitOptions) -> bool {
        self.wait_acquire_token(name, options).await.is_some()
    }

    /// [`wait_acquire`](Self::wait_acquire), keeping the token so the caller
    /// can later release with [`release_token`](Self::release_token).
    pub async fn wait_acquire_token(&self, name: &str, options: WaitOptions) -> Option<LockToken> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(token) = self.acquire(name, options.ttl).await {
                if attempts > 1 {
                    debug!(
                        lock = %name,
                        attempts,
                        waited_ms = started.elapsed().as_millis(),
                        "Lock acquired after waiting"
                    );
                }
                return Some(token);
            }
            if started.elapsed() > options.max_wait {
                warn!(
                    lock = %name,
                    attempts,
                    max_wait_ms = options.max_wait.as_millis(),
                    "Timed out waiting for lock"
                );
                return None;
            }
            tokio::time::sleep(options.poll_interval).await;
        }
    }

    /// Compare-and-delete with the token recorded at acquisition.
    ///
    /// The local entry is dropped before the store call, so it is gone whatever
    /// the outcome.
    pub async fn release(&self, name: &str) -> ReleaseStatus {
        let key = self.key(name);
        let entry = self.owned().remove(&key);
        let Some(entry) = entry else {
            debug!(lock = %name, key = %key, "Release skipped, lock not held by this process");
            return ReleaseStatus::NotTrackedLocally;
        };
        self.delete_remote(name, &key, entry).await
    }

    /// Release only if the local entry still carries `token`.
    ///
    /// Once `token` has expired, another caller in this process may have
    /// re-acquired the same name and replaced the entry. That entry and its
    /// store record are left alone and `NotTrackedLocally` is returned.
    pub async fn release_token(&self, name: &str, token: &LockToken) -> ReleaseStatus {
        let key = self.key(name);
        let entry = {
            let mut owned = self.owned();
            match owned.get(&key) {
                Some(entry) if entry.token == *token => owned.remove(&key),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            debug!(lock = %name, key = %key, "Release skipped, token no longer tracked by this process");
            return ReleaseStatus::NotTrackedLocally;
        };
        self.delete_remote(name, &key, entry).await
    }

    async fn delete_remote(&self, name: &str, key: &str, entry: OwnershipEntry) -> ReleaseStatus {
        let status = match self.store.compare_and_delete(key, entry.token.as_str()).await {
            Ok(DeleteOutcome::Deleted) => ReleaseStatus::Released,
            Ok(DeleteOutcome::Absent) => ReleaseStatus::AbsentRemote,
            Ok(DeleteOutcome::Mismatch) => ReleaseStatus::TokenMismatch,
            Err(e) => {
                warn!(lock = %name, key = %key, error = %e, "Lock release failed");
                return ReleaseStatus::StoreError;
            }
        };

        let held_ms = entry.acquired_at.elapsed().as_millis();
        match status {
            ReleaseStatus::Released => {
                debug!(lock = %name, key = %key, held_ms, "Lock released");
            }
            _ => {
                warn!(
                    lock = %name,
                    key = %key,
                    status = %status,
                    held_ms,
                    ttl_ms = entry.ttl.as_millis(),
                    "Lock expired before release"
                );
            }
        }
        status
    }

    /// Whether this process believes it holds `name`. The remote record may
    /// already have expired.
    pub fn is_held_locally(&self, name: &str) -> bool {
        self.owned().contains_key(&self.key(name))
    }

    /// Store keys of every lock this process believes it holds.
    pub fn held_keys(&self) -> Vec<String> {
        self.owned().keys().cloned().collect()
    }

    /// Release everything still tracked. Used on shutdown so peers do not have
    /// to wait out the TTLs.
    pub async fn release_all(&self) -> Vec<(String, ReleaseStatus)> {
        let prefix_len = self.key_prefix.len();
        let names: Vec<String> = self
            .held_keys()
            .into_iter()
            .map(|key| key[prefix_len..].to_string())
            .collect();

        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let status = self.release(&name).await;
            results.push((name, status));
        }
        if !results.is_empty() {
            info!(count = results.len(), "Released locks held at shutdown");
        }
        results
    }
}
