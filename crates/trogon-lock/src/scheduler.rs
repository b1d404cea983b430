use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::{LockEngine, ReleaseStatus};
use crate::error::LockError;
use crate::guard::{GuardOptions, GuardedExecutor, lock_name};
use crate::schedule::Schedule;
use crate::traits::LockStore;
use crate::trigger::spawn_trigger;

/// A unit of recurring work that must run on at most one replica per tick.
pub trait ScheduledTask: Send + Sync + 'static {
    type Error: Display + Send + 'static;

    /// Stable name of the component. Together with
    /// [`method_name`](Self::method_name) it forms the lock name when none is
    /// given.
    fn identifier(&self) -> &str;

    fn method_name(&self) -> &str {
        "run"
    }

    fn run(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// How a task is scheduled and locked.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub schedule: Schedule,
    pub lock_name: Option<String>,
    pub options: GuardOptions,
}

impl JobSpec {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            lock_name: None,
            options: GuardOptions::default(),
        }
    }

    pub fn lock_name(mut self, name: impl Into<String>) -> Self {
        self.lock_name = Some(name.into());
        self
    }

    pub fn options(mut self, options: GuardOptions) -> Self {
        self.options = options;
        self
    }
}

/// Owns the triggers of every registered task.
///
/// Build the store connection and engine first, register tasks, then call
/// [`run`](Self::run). Registration spawns tasks, so it must happen inside a
/// tokio runtime.
pub struct Scheduler<S: LockStore> {
    executor: GuardedExecutor<S>,
    shutdown: watch::Sender<bool>,
    triggers: Vec<(String, JoinHandle<()>)>,
    names: HashSet<String>,
}

impl<S: LockStore> Scheduler<S> {
    pub fn new(engine: LockEngine<S>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            executor: GuardedExecutor::new(engine),
            shutdown,
            triggers: Vec::new(),
            names: HashSet::new(),
        }
    }

    pub fn engine(&self) -> &LockEngine<S> {
        self.executor.engine()
    }

    pub fn task_count(&self) -> usize {
        self.triggers.len()
    }

    /// Validate the schedule, wrap `task` in its lock and start its trigger.
    /// Returns the lock name in use.
    pub fn register<T: ScheduledTask>(
        &mut self,
        spec: JobSpec,
        task: Arc<T>,
    ) -> Result<String, LockError> {
        let compiled = spec.schedule.compile()?;
        let name = lock_name(
            spec.lock_name.as_deref(),
            task.identifier(),
            task.method_name(),
        );

        if spec.lock_name.is_none() {
            info!(lock = %name, "No lock name given, using identifier and method");
        }
        if !self.names.insert(name.clone()) {
            warn!(lock = %name, "Lock name already registered, tasks will exclude each other");
        }

        let guarded = Arc::new(self.executor.guard(name.clone(), spec.options, move || {
            let task = Arc::clone(&task);
            async move { task.run().await }
        }));
        let callback = move || {
            let guarded = Arc::clone(&guarded);
            async move { guarded.call().await.map(|_| ()) }
        };

        let handle = spawn_trigger(
            name.clone(),
            compiled,
            callback,
            self.shutdown.subscribe(),
        );
        info!(lock = %name, schedule = %spec.schedule, "Task registered");
        self.triggers.push((name.clone(), handle));
        Ok(name)
    }

    /// Run until SIGINT or SIGTERM, then shut down.
    pub async fn run(self) -> Result<(), LockError> {
        let mut signal_result = Ok(());
        let signal = async {
            signal_result = shutdown_signal().await;
        };
        self.run_until(signal).await;
        signal_result.map_err(LockError::from)
    }

    /// Run until `signal` resolves. Stops every trigger, waits for in-flight
    /// ticks, then releases whatever this process still holds.
    pub async fn run_until<F>(self, signal: F) -> Vec<(String, ReleaseStatus)>
    where
        F: Future<Output = ()>,
    {
        info!(tasks = self.triggers.len(), "Scheduler running");
        signal.await;

        info!("Shutdown requested, stopping triggers");
        self.shutdown.send_replace(true);
        for (name, handle) in self.triggers {
            if let Err(e) = handle.await {
                error!(trigger = %name, error = %e, "Trigger task ended abnormally");
            }
        }

        let released = self.executor.engine().release_all().await;
        info!("Scheduler stopped");
        released
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
///
/// On Unix both signals are handled so `docker stop` and Kubernetes pod
/// termination release locks right away. On non-Unix only Ctrl-C is available.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = sigterm.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        res = tokio::signal::ctrl_c() => res,
        _ = terminate => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockDefaults;
    use crate::mocks::MemoryLockStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter {
        id: &'static str,
        runs: AtomicUsize,
        work: Duration,
        fail: bool,
    }

    impl Counter {
        fn new(id: &'static str) -> Self {
            Self {
                id,
                runs: AtomicUsize::new(0),
                work: Duration::ZERO,
                fail: false,
            }
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl ScheduledTask for Counter {
        type Error = String;

        fn identifier(&self) -> &str {
            self.id
        }

        async fn run(&self) -> Result<(), String> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            if self.fail {
                Err(format!("{} failed", self.id))
            } else {
                Ok(())
            }
        }
    }

    fn scheduler(store: &MemoryLockStore) -> Scheduler<MemoryLockStore> {
        Scheduler::new(LockEngine::new(
            store.clone(),
            "lock:",
            LockDefaults::default(),
        ))
    }

    #[tokio::test]
    async fn synthesized_and_explicit_lock_names() {
        let store = MemoryLockStore::new();
        let mut s = scheduler(&store);

        let synthesized = s
            .register(JobSpec::new(Schedule::every(60)), Arc::new(Counter::new("reports")))
            .unwrap();
        let explicit = s
            .register(
                JobSpec::new(Schedule::every(60)).lock_name("nightly-billing"),
                Arc::new(Counter::new("billing")),
            )
            .unwrap();

        assert_eq!(synthesized, "reports_run");
        assert_eq!(explicit, "nightly-billing");
        assert_eq!(s.task_count(), 2);
        s.run_until(async {}).await;
    }

    #[tokio::test]
    async fn invalid_schedule_is_rejected_at_registration() {
        let store = MemoryLockStore::new();
        let mut s = scheduler(&store);

        let err = s
            .register(
                JobSpec::new(Schedule::cron("0 0 0 1 12 *")),
                Arc::new(Counter::new("bad")),
            )
            .unwrap_err();

        assert!(matches!(err, LockError::InvalidSchedule { .. }));
        assert_eq!(s.task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn two_replicas_run_each_tick_once() {
        let store = MemoryLockStore::new();
        let mut replica_a = scheduler(&store);
        let mut replica_b = scheduler(&store);
        let task = Arc::new(Counter {
            work: Duration::from_millis(100),
            ..Counter::new("sync")
        });

        replica_a
            .register(JobSpec::new(Schedule::every(1)), Arc::clone(&task))
            .unwrap();
        replica_b
            .register(JobSpec::new(Schedule::every(1)), Arc::clone(&task))
            .unwrap();

        tokio::join!(
            replica_a.run_until(tokio::time::sleep(Duration::from_millis(2500))),
            replica_b.run_until(tokio::time::sleep(Duration::from_millis(2500))),
        );

        // t = 0, 1s, 2s; the other replica skipped each tick.
        assert_eq!(task.runs(), 3);
        assert!(store.value("lock:sync_run").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_keeps_its_schedule_and_releases() {
        let store = MemoryLockStore::new();
        let mut s = scheduler(&store);
        let task = Arc::new(Counter {
            fail: true,
            ..Counter::new("flaky")
        });

        s.register(JobSpec::new(Schedule::every(1)), Arc::clone(&task))
            .unwrap();
        s.run_until(tokio::time::sleep(Duration::from_millis(2500)))
            .await;

        assert_eq!(task.runs(), 3);
        assert_eq!(store.delete_calls(), 3);
    }

    #[tokio::test]
    async fn shutdown_releases_locks_still_held() {
        let store = MemoryLockStore::new();
        let s = scheduler(&store);
        s.engine()
            .acquire("manual", Duration::from_secs(60))
            .await
            .unwrap();

        let released = s.run_until(async {}).await;

        assert_eq!(
            released,
            vec![("manual".to_string(), ReleaseStatus::Released)]
        );
        assert!(store.value("lock:manual").is_none());
    }
}
