//! # trogon-lock
//!
//! Run recurring work on exactly one replica per tick, using an expiring lock
//! in a shared Redis.
//!
//! ## Features
//!
//! - `SET key token NX PX ttl` to acquire; a Lua compare-and-delete to release,
//!   so a holder whose lock expired can never delete its successor's.
//! - Single-attempt or deadline-bounded polling acquisition.
//! - A guarded executor that releases on every exit path, panics included, and
//!   skips the work when the lock is held elsewhere.
//! - Interval and six-field cron schedules (month `0-11`, weekday `0-6` with
//!   `0` = Sunday), one tokio task per schedule.
//! - Graceful shutdown: in-flight ticks finish and held locks are released on
//!   Ctrl-C / SIGTERM.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trogon_lock::{
//!     JobSpec, LockConfig, LockEngine, RedisConnection, Schedule, ScheduledTask, Scheduler,
//!     SystemEnv,
//! };
//!
//! struct Reports;
//!
//! impl ScheduledTask for Reports {
//!     type Error = String;
//!
//!     fn identifier(&self) -> &str {
//!         "reports"
//!     }
//!
//!     async fn run(&self) -> Result<(), String> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), trogon_lock::LockError> {
//!     let config = LockConfig::from_env(&SystemEnv)?;
//!     let redis = RedisConnection::connect(&config.store).await?;
//!     let engine = LockEngine::new(redis, config.store.key_prefix.clone(), config.defaults);
//!
//!     let mut scheduler = Scheduler::new(engine);
//!     scheduler.register(JobSpec::new(Schedule::cron("0 0 2 * * *")), Arc::new(Reports))?;
//!     scheduler.run().await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod engine;
pub mod env;
pub mod error;
pub mod guard;
pub mod jobs;
pub mod schedule;
pub mod scheduler;
pub mod token;
pub mod traits;
pub mod trigger;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use config::{LockConfig, LockDefaults, StoreConfig};
pub use connection::RedisConnection;
pub use engine::{LockEngine, ReleaseStatus, WaitOptions};
pub use env::{ReadEnv, SystemEnv};
pub use error::LockError;
pub use guard::{GuardOptions, Guarded, GuardedExecutor, GuardedOperation, lock_name};
pub use jobs::{CommandTask, JobConfig};
pub use schedule::Schedule;
pub use scheduler::{JobSpec, ScheduledTask, Scheduler};
pub use token::LockToken;
pub use traits::{DeleteOutcome, LockStore};
