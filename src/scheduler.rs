//! Leader-elected periodic scheduling.
//!
//! Every replica runs a [`Scheduler`] holding the same set of named
//! [`ScheduledTask`] registrations, but each task fires on only one replica
//! at a time. Leadership is per task, via a [Postgres advisory
//! lock][advisory-lock] keyed on the task name: the holder runs the task on
//! its interval, and every other replica stands by, re-trying the lock so a
//! crashed leader is replaced within one retry period rather than requiring
//! a restart.
//!
//! The locks are session-scoped, so a leader that loses its database
//! connection loses leadership with it. The leader pings its lock connection
//! before every run and abdicates back to standby when the ping fails, so a
//! deposed replica stops firing within one period. Tasks must still tolerate
//! one overlapping run during such a handoff; every task registered here is
//! an idempotent scan.
//!
//! [advisory-lock]: https://www.postgresql.org/docs/current/explicit-locking.html#ADVISORY-LOCKS

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{
    postgres::{PgAdvisoryLock, PgAdvisoryLockGuard},
    PgConnection, PgPool,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

type Result<T = ()> = std::result::Result<T, Error>;

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Default delay between standby lock attempts.
pub const DEFAULT_STANDBY_RETRY: std::time::Duration = std::time::Duration::from_secs(5);

/// A unit of recurring work, run cluster-wide on one replica at a time.
#[async_trait]
pub trait ScheduledTask: Send + Sync {
    /// Stable name; keys the advisory lock and appears in logs.
    fn name(&self) -> &'static str;

    /// Runs one iteration.
    ///
    /// Errors are logged by the scheduler and do not stop the schedule.
    async fn run_once(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

struct Registration {
    period: std::time::Duration,
    task: Arc<dyn ScheduledTask>,
}

/// Runs registered tasks periodically, one leader per task cluster-wide.
pub struct Scheduler {
    pool: PgPool,
    registrations: Vec<Registration>,
    standby_retry: std::time::Duration,
    shutdown_token: CancellationToken,
}

impl Scheduler {
    /// Creates an empty scheduler.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            registrations: Vec::new(),
            standby_retry: DEFAULT_STANDBY_RETRY,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Registers a task to run at the given period.
    pub fn register(mut self, period: std::time::Duration, task: Arc<dyn ScheduledTask>) -> Self {
        self.registrations.push(Registration { period, task });
        self
    }

    /// A token that stops the run loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs all registered tasks until cancelled.
    #[instrument(skip(self), err)]
    pub async fn run(&self) -> Result {
        let mut task_loops = JoinSet::new();
        for registration in &self.registrations {
            let pool = self.pool.clone();
            let period = registration.period;
            let task = registration.task.clone();
            let standby_retry = self.standby_retry;
            let shutdown_token = self.shutdown_token.clone();
            task_loops.spawn(run_task(pool, period, task, standby_retry, shutdown_token));
        }

        while let Some(joined) = task_loops.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(%err, "Scheduled task loop failed"),
                Err(err) => tracing::error!(%err, "Scheduled task loop panicked"),
            }
        }

        Ok(())
    }
}

async fn run_task(
    pool: PgPool,
    period: std::time::Duration,
    task: Arc<dyn ScheduledTask>,
    standby_retry: std::time::Duration,
    shutdown_token: CancellationToken,
) -> Result {
    let lock = PgAdvisoryLock::new(format!("courseloom-scheduler-{}", task.name()));

    loop {
        if shutdown_token.is_cancelled() {
            return Ok(());
        }

        let conn = pool.acquire().await?;
        match try_acquire_advisory_lock(conn, &lock).await? {
            Some(mut guard) => {
                tracing::info!(task = task.name(), "Scheduler lock acquired, leading");
                lead(&*task, period, &mut guard, &shutdown_token).await;
                if let Err(err) = guard.release_now().await {
                    tracing::debug!(%err, task = task.name(), "Failed to release scheduler lock");
                }
                if shutdown_token.is_cancelled() {
                    return Ok(());
                }
            }
            None => {
                tokio::select! {
                    _ = shutdown_token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(standby_retry) => {}
                }
            }
        }
    }
}

async fn lead<C>(
    task: &dyn ScheduledTask,
    period: std::time::Duration,
    guard: &mut PgAdvisoryLockGuard<'_, C>,
    shutdown_token: &CancellationToken,
) where
    C: AsMut<PgConnection> + Send,
{
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => return,
            _ = interval.tick() => {
                // The lock is session-scoped: if the lock connection died,
                // leadership went with it and another replica may already
                // hold the lock. Verify before every run.
                if let Err(err) = sqlx::query("select 1").execute(guard.as_mut()).await {
                    tracing::warn!(
                        %err,
                        task = task.name(),
                        "Scheduler lock connection lost, abdicating"
                    );
                    return;
                }
                if let Err(err) = task.run_once().await {
                    tracing::error!(%err, task = task.name(), "Scheduled task failed");
                }
            }
        }
    }
}

#[instrument(skip(conn, lock), err)]
pub(crate) async fn try_acquire_advisory_lock<'lock, C>(
    conn: C,
    lock: &'lock PgAdvisoryLock,
) -> sqlx::Result<Option<PgAdvisoryLockGuard<'lock, C>>>
where
    C: AsMut<PgConnection>,
{
    let guard = match lock.try_acquire(conn).await? {
        sqlx::Either::Left(guard) => Some(guard),
        sqlx::Either::Right(_) => None,
    };

    Ok(guard)
}
