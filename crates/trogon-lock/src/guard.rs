//! Run an operation only while holding its lock.
//!
//! [`GuardedExecutor::run_guarded`] acquires, runs the operation once, and
//! releases on every exit path, including a panic inside the operation. A
//! failed acquisition is a skip, not an error: on any given tick most
//! replicas are expected to skip.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::engine::{LockEngine, ReleaseStatus, WaitOptions};
use crate::token::LockToken;
use crate::traits::LockStore;

/// Per-call lock timings. Unset fields fall back to the engine defaults.
///
/// Setting `poll_interval` or `max_wait` switches acquisition from a single
/// attempt to deadline-bounded polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardOptions {
    pub ttl: Option<Duration>,
    pub poll_interval: Option<Duration>,
    pub max_wait: Option<Duration>,
}

impl GuardOptions {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    pub fn waits(&self) -> bool {
        self.poll_interval.is_some() || self.max_wait.is_some()
    }
}

/// What happened to a guarded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    Ran(T),
    /// The lock was held elsewhere (or could not be taken); the operation was
    /// not invoked.
    Skipped,
}

impl<T> Guarded<T> {
    pub fn ran(&self) -> bool {
        matches!(self, Self::Ran(_))
    }
}

/// Lock name for a task: the explicit name if given, otherwise
/// `{identifier}_{method}`.
///
/// Synthesized names are only unique if identifiers are; two components with
/// the same identifier and method share one lock.
pub fn lock_name(explicit: Option<&str>, identifier: &str, method: &str) -> String {
    match explicit {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("{identifier}_{method}"),
    }
}

#[derive(Clone)]
pub struct GuardedExecutor<S: LockStore> {
    engine: LockEngine<S>,
}

impl<S: LockStore> GuardedExecutor<S> {
    pub fn new(engine: LockEngine<S>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &LockEngine<S> {
        &self.engine
    }

    async fn lock(&self, name: &str, options: GuardOptions) -> Option<LockToken> {
        let defaults = self.engine.defaults();
        let ttl = options.ttl.unwrap_or(defaults.ttl);

        if options.waits() {
            let wait = WaitOptions {
                ttl,
                poll_interval: options.poll_interval.unwrap_or(defaults.poll_interval),
                max_wait: options.max_wait.unwrap_or(defaults.max_wait),
            };
            self.engine.wait_acquire_token(name, wait).await
        } else {
            self.engine.acquire(name, ttl).await
        }
    }

    /// Acquire `name`, run `operation` once, release.
    ///
    /// - Not acquired: logs a warning, returns `Ok(Guarded::Skipped)`.
    /// - `operation` returns `Err(e)`: the lock is released, then `Err(e)` is
    ///   returned unchanged.
    /// - `operation` panics: the lock is released, then the panic resumes.
    ///
    /// Release problems are logged by the engine and never replace the
    /// operation's own result.
    pub async fn run_guarded<F, Fut, T, E>(
        &self,
        name: &str,
        options: GuardOptions,
        operation: F,
    ) -> Result<Guarded<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(token) = self.lock(name, options).await else {
            warn!(lock = %name, key = %self.engine.key(name), "Lock not acquired, skipping guarded operation");
            return Ok(Guarded::Skipped);
        };

        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        let status = self.engine.release_token(name, &token).await;
        debug!(lock = %name, status = %status, "Guarded operation finished");

        match outcome {
            Ok(Ok(value)) => Ok(Guarded::Ran(value)),
            Ok(Err(e)) => Err(e),
            Err(panic) => {
                if status != ReleaseStatus::Released {
                    warn!(lock = %name, status = %status, "Guarded operation panicked");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Bind `operation` to a lock once, at registration time, and get back a
    /// callable that runs it guarded on every call.
    pub fn guard<F>(
        &self,
        name: impl Into<String>,
        options: GuardOptions,
        operation: F,
    ) -> GuardedOperation<S, F> {
        GuardedOperation {
            executor: self.clone(),
            name: name.into(),
            options,
            operation,
        }
    }
}

/// An operation wrapped by [`GuardedExecutor::guard`].
pub struct GuardedOperation<S: LockStore, F> {
    executor: GuardedExecutor<S>,
    name: String,
    options: GuardOptions,
    operation: F,
}

impl<S: LockStore, F> GuardedOperation<S, F> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call<Fut, T, E>(&self) -> Result<Guarded<T>, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.executor
            .run_guarded(&self.name, self.options, || (self.operation)())
            .await
    }
}
