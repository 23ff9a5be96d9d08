//! Periodic task driver. Every task runs on a fixed cadence, guarded by a
//! postgres advisory lock so only one instance across the fleet works at a
//! time; a held lock drops the tick instead of queueing behind it.

use {
    database::advisory_lock::AdvisoryLock,
    sqlx::PgPool,
    std::{future::Future, sync::Arc, time::Duration},
    tokio::task::JoinHandle,
};

#[derive(Clone, Debug)]
pub struct TaskConfig {
    pub name: &'static str,
    pub period: Duration,
    /// Past this runtime the task logs that it is overdue but keeps going.
    pub soft_timeout: Duration,
    /// Past this runtime the tick is aborted. The advisory lock is released
    /// with the scope; a crashed holder loses it with its session.
    pub hard_timeout: Duration,
}

/// Spawns a periodic task. `work` is invoked per tick while the lock is
/// held; errors are logged and the cadence continues.
pub fn spawn_periodic<W, Fut>(pool: PgPool, config: TaskConfig, work: W) -> JoinHandle<()>
where
    W: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let work = Arc::new(work);
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(config.period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_tick(&pool, &config, work.as_ref()).await;
        }
    })
}

async fn run_tick<W, Fut>(pool: &PgPool, config: &TaskConfig, work: &W)
where
    W: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let lock_key = format!("task-{}", config.name);
    let lock = match AdvisoryLock::try_acquire(pool, &lock_key).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            tracing::debug!(task = config.name, "tick dropped, lock held elsewhere");
            return;
        }
        Err(err) => {
            tracing::warn!(task = config.name, error = %err, "could not acquire task lock");
            return;
        }
    };

    let started = tokio::time::Instant::now();
    let outcome = tokio::time::timeout(config.hard_timeout, work()).await;
    let elapsed = started.elapsed();
    if elapsed > config.soft_timeout {
        tracing::warn!(task = config.name, ?elapsed, "task exceeded its soft timeout");
    }
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::error!(task = config.name, error = ?err, "task failed");
        }
        Err(_elapsed) => {
            tracing::error!(task = config.name, "task hit its hard timeout, aborted");
        }
    }
    lock.release().await;
}
