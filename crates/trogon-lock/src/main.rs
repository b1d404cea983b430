use std::sync::Arc;

use trogon_lock::jobs::load_jobs;
use trogon_lock::{
    CommandTask, LockConfig, LockEngine, LockError, ReadEnv, RedisConnection, Scheduler,
    SystemEnv,
};

const ENV_JOBS_FILE: &str = "CRON_JOBS_FILE";
const DEFAULT_JOBS_FILE: &str = "jobs.json";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(&SystemEnv).await {
        tracing::error!(error = %e, "trogon-lock exited with error");
        std::process::exit(1);
    }
}

async fn run<E: ReadEnv>(env: &E) -> Result<(), LockError> {
    let config = LockConfig::from_env(env)?;
    let jobs_file = env
        .var(ENV_JOBS_FILE)
        .unwrap_or_else(|_| DEFAULT_JOBS_FILE.to_string());

    let jobs = load_jobs(&jobs_file)?;
    tracing::info!(jobs_file = %jobs_file, job_count = jobs.len(), "Loaded job definitions");

    let redis = RedisConnection::connect(&config.store).await?;
    let engine = LockEngine::new(redis, config.store.key_prefix.clone(), config.defaults);

    let mut scheduler = Scheduler::new(engine);
    for job in &jobs {
        scheduler.register(job.job_spec(), Arc::new(CommandTask::new(job)))?;
    }

    tracing::info!("Starting lock-guarded scheduler");
    scheduler.run().await
}
