//! Job definitions for the `trogon-lock` binary: run a command under a lock on
//! a schedule.
//!
//! ```json
//! [
//!   {
//!     "id": "nightly-report",
//!     "schedule": { "type": "cron", "expr": "0 0 2 * * *" },
//!     "lock": "reports",
//!     "ttl_ms": 600000,
//!     "command": { "bin": "/usr/local/bin/report", "args": ["--pdf"], "timeout_sec": 300 }
//!   },
//!   {
//!     "id": "cache-warmup",
//!     "schedule": { "type": "interval", "interval_sec": 60 },
//!     "max_wait_ms": 2000,
//!     "command": { "bin": "/usr/local/bin/warm" }
//!   }
//! ]
//! ```

use std::path::Path;
use std::process::ExitStatus;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::LockError;
use crate::guard::GuardOptions;
use crate::schedule::Schedule;
use crate::scheduler::{JobSpec, ScheduledTask};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the process after this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    pub schedule: Schedule,
    /// Lock name. Defaults to `{id}_run`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
    pub command: CommandSpec,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl JobConfig {
    /// Check everything that can be checked before the first tick.
    pub fn validate(&self) -> Result<(), LockError> {
        if self.id.trim().is_empty() {
            return Err(LockError::InvalidJob {
                reason: "id must not be empty".into(),
            });
        }
        for (field, value) in [
            ("ttl_ms", self.ttl_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("max_wait_ms", self.max_wait_ms),
        ] {
            if value == Some(0) {
                return Err(LockError::InvalidJob {
                    reason: format!("{field} must be >= 1 when set (job '{}')", self.id),
                });
            }
        }
        self.command
            .check()
            .map_err(|reason| LockError::InvalidJob {
                reason: format!("{reason} (job '{}')", self.id),
            })?;
        self.schedule.compile()?;
        Ok(())
    }

    pub fn guard_options(&self) -> GuardOptions {
        GuardOptions {
            ttl: self.ttl_ms.map(Duration::from_millis),
            poll_interval: self.poll_interval_ms.map(Duration::from_millis),
            max_wait: self.max_wait_ms.map(Duration::from_millis),
        }
    }

    pub fn job_spec(&self) -> JobSpec {
        let spec = JobSpec::new(self.schedule.clone()).options(self.guard_options());
        match &self.lock {
            Some(name) => spec.lock_name(name.clone()),
            None => spec,
        }
    }
}

impl CommandSpec {
    /// Reject commands that could never start: a relative or missing `bin`,
    /// a `bin` without any execute bit, NUL bytes in arguments, a zero timeout.
    fn check(&self) -> Result<(), String> {
        if self.timeout_sec == Some(0) {
            return Err("timeout_sec must be >= 1 when set".into());
        }
        if let Some(arg) = self.args.iter().find(|a| a.contains('\0')) {
            return Err(format!("argument contains null byte: {arg:?}"));
        }
        let bin = Path::new(&self.bin);
        if !bin.is_absolute() {
            return Err(format!("bin must be an absolute path, got: {}", self.bin));
        }
        executable(bin).map_err(|e| format!("bin '{}' {e}", self.bin))
    }
}

#[cfg(unix)]
fn executable(bin: &Path) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(bin)
        .map_err(|e| format!("cannot be accessed: {e}"))?
        .permissions()
        .mode();
    match mode & 0o111 {
        0 => Err("is not executable".into()),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn executable(_bin: &Path) -> Result<(), String> {
    Ok(())
}

/// Read a JSON array of jobs. Disabled jobs are dropped; any invalid job
/// fails the whole load.
pub fn load_jobs(path: impl AsRef<Path>) -> Result<Vec<JobConfig>, LockError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    parse_jobs(&raw)
}

pub fn parse_jobs(raw: &str) -> Result<Vec<JobConfig>, LockError> {
    let jobs: Vec<JobConfig> = serde_json::from_str(raw)?;

    let mut seen = std::collections::HashSet::new();
    let mut enabled = Vec::with_capacity(jobs.len());
    for job in jobs {
        if !seen.insert(job.id.clone()) {
            return Err(LockError::InvalidJob {
                reason: format!("duplicate job id '{}'", job.id),
            });
        }
        if !job.enabled {
            debug!(job_id = %job.id, "Skipping disabled job");
            continue;
        }
        job.validate()?;
        enabled.push(job);
    }
    Ok(enabled)
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn '{bin}': {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed waiting for '{bin}': {source}")]
    Wait {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{bin}' exited with {status}")]
    Exit { bin: String, status: ExitStatus },
    #[error("'{bin}' timed out after {secs}s")]
    Timeout { bin: String, secs: u64 },
}

/// Runs a [`JobConfig`]'s command as a [`ScheduledTask`].
///
/// The child sees `LOCK_JOB_ID`, `LOCK_FIRED_AT` and `LOCK_EXECUTION_ID` in its
/// environment and is killed if this process drops it.
pub struct CommandTask {
    id: String,
    command: CommandSpec,
}

impl CommandTask {
    pub fn new(config: &JobConfig) -> Self {
        Self {
            id: config.id.clone(),
            command: config.command.clone(),
        }
    }
}

impl ScheduledTask for CommandTask {
    type Error = CommandError;

    fn identifier(&self) -> &str {
        &self.id
    }

    async fn run(&self) -> Result<(), CommandError> {
        let bin = &self.command.bin;
        let execution_id = Uuid::new_v4().to_string();
        debug!(job_id = %self.id, bin = %bin, %execution_id, "Spawning process");

        let mut child = tokio::process::Command::new(bin)
            .args(&self.command.args)
            .env("LOCK_JOB_ID", &self.id)
            .env("LOCK_FIRED_AT", Utc::now().to_rfc3339())
            .env("LOCK_EXECUTION_ID", &execution_id)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                bin: bin.clone(),
                source,
            })?;

        let status = match self.command.timeout_sec {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), child.wait()).await
            {
                Ok(waited) => waited,
                Err(_) => {
                    let stopped = stop_child(&mut child).await;
                    warn!(job_id = %self.id, bin = %bin, secs, stopped = ?stopped, "Process timed out");
                    return Err(CommandError::Timeout {
                        bin: bin.clone(),
                        secs,
                    });
                }
            },
            None => child.wait().await,
        }
        .map_err(|source| CommandError::Wait {
            bin: bin.clone(),
            source,
        })?;

        if status.success() {
            debug!(job_id = %self.id, bin = %bin, %status, "Process completed");
            Ok(())
        } else {
            Err(CommandError::Exit {
                bin: bin.clone(),
                status,
            })
        }
    }
}

/// How long a timed-out child gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// How a timed-out child was brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stopped {
    Terminated,
    Killed,
    /// SIGKILL was sent but the child could not be reaped.
    Lingering,
}

/// SIGTERM first (Unix only), SIGKILL once [`TERM_GRACE`] has passed.
async fn stop_child(child: &mut tokio::process::Child) -> Stopped {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let signalled = kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok();
        if signalled && tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return Stopped::Terminated;
        }
    }

    match tokio::time::timeout(TERM_GRACE, child.kill()).await {
        Ok(Ok(())) => Stopped::Killed,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to kill timed-out process");
            Stopped::Lingering
        }
        Err(_) => Stopped::Lingering,
    }
}
