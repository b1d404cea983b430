//! One tokio task per schedule, invoking a callback at every tick.
//!
//! A callback that fails or panics is logged and the trigger carries on with
//! the next tick. Triggers are independent: a callback blocked in a lock wait
//! only delays its own schedule.

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::schedule::CompiledSchedule;

/// Spawn a trigger that runs until `shutdown` flips to `true` (or its sender
/// is dropped) or the schedule runs out of ticks.
///
/// Shutdown is only observed between ticks; a callback already running is
/// allowed to finish, so awaiting the handle waits for in-flight work.
pub fn spawn_trigger<F, Fut, E>(
    name: impl Into<String>,
    schedule: CompiledSchedule,
    callback: F,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let name = name.into();
    tokio::spawn(async move {
        let mut ticker = schedule.ticker();
        debug!(trigger = %name, "Trigger started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                more = ticker.tick() => {
                    if !more {
                        info!(trigger = %name, "Schedule has no further ticks");
                        break;
                    }
                }
            }

            fire(&name, &callback).await;
        }

        debug!(trigger = %name, "Trigger stopped");
    })
}

async fn fire<F, Fut, E>(name: &str, callback: &F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    let execution_id = Uuid::new_v4();
    let started = Instant::now();

    match AssertUnwindSafe(async { callback().await })
        .catch_unwind()
        .await
    {
        Ok(Ok(())) => {
            debug!(
                trigger = %name,
                %execution_id,
                elapsed_ms = started.elapsed().as_millis(),
                "Tick completed"
            );
        }
        Ok(Err(e)) => {
            error!(trigger = %name, %execution_id, error = %e, "Tick failed");
        }
        Err(panic) => {
            error!(
                trigger = %name,
                %execution_id,
                panic = panic_message(panic.as_ref()),
                "Tick panicked"
            );
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
