//! The durable job store.
//!
//! [`JobStore`] is the single source of truth for every unit of background
//! work. All cross-replica coordination happens through the rows it manages:
//! claiming uses `FOR UPDATE SKIP LOCKED` so two replicas can never run the
//! same job, and parent finalization takes a row-level lock on the parent so
//! concurrent sibling completions collapse into exactly one finalization.
//!
//! The queue wake channel in [`queue`](crate::queue) is an optimization for
//! latency layered on top of this store; losing a wake message only delays a
//! job until the next poll, it never loses the job.

use chrono::{Duration, Utc};
use sqlx::{PgExecutor, PgPool};
use tracing::instrument;

use crate::job::{Job, JobId, JobStatus, NewJob};

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Job store errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when serializing or
    /// deserializing job payloads.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Indicates that the job couldn't be found.
    #[error("Job with ID {0} not found.")]
    JobNotFound(JobId),

    /// Indicates that the job exists but is not in the `running` state, so a
    /// guarded terminal write was rejected.
    #[error("Job with ID {0} is not running.")]
    JobNotRunning(JobId),
}

const JOB_COLUMNS: &str = "id, tenant_id, kind, status, parent_id, payload, priority, \
     progress_percent, progress_message, result_path, error_message, tokens_used, \
     retry_count, max_retries, available_at, created_at, started_at, completed_at";

/// The report returned by [`JobStore::try_finalize_parent`].
///
/// Exactly one of all concurrent finalization attempts for a given parent
/// observes `finalized == true`; racing callers that lose see
/// `all_complete == true` with consistent aggregate counts and must not
/// re-notify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalization {
    /// Whether this call transitioned the parent to its terminal state.
    pub finalized: bool,

    /// Whether every child has reached a terminal state.
    pub all_complete: bool,

    /// The parent's status after this call.
    pub parent_status: JobStatus,

    /// Number of children that completed successfully.
    pub completed_children: i64,

    /// Number of children that terminally failed.
    pub failed_children: i64,

    /// Number of children still in flight.
    pub pending_children: i64,

    /// Sum of the children's token usage.
    pub total_tokens: i64,
}

/// Per-status job counts, for operational visibility.
#[derive(Debug, Clone, Copy, Default, sqlx::FromRow)]
pub struct StatusCounts {
    /// Jobs waiting to be claimed.
    pub queued: i64,

    /// Jobs currently being processed.
    pub running: i64,

    /// Jobs that finished successfully.
    pub completed: i64,

    /// Jobs that failed terminally.
    pub failed: i64,
}

/// Durable, relational record of every unit of background work.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: PgPool,
}

impl JobStore {
    /// Creates a new store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Inserts a new job row in the `queued` state, returning its ID.
    ///
    /// Accepts any executor so callers can enqueue within their own
    /// transactions and only make the job visible on commit.
    #[instrument(
        name = "job.create",
        skip(self, executor, new_job),
        fields(job.id = tracing::field::Empty, job.kind = ?new_job.kind),
        err
    )]
    pub async fn create<'a, E>(&self, executor: E, new_job: &NewJob) -> Result<JobId>
    where
        E: PgExecutor<'a>,
    {
        let id = JobId::new();
        tracing::Span::current().record("job.id", id.to_string());

        sqlx::query(
            "insert into courseloom.job
                 (id, tenant_id, kind, parent_id, payload, priority, max_retries)
             values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(id)
        .bind(new_job.tenant_id)
        .bind(new_job.kind)
        .bind(new_job.parent_id)
        .bind(&new_job.payload)
        .bind(new_job.lane.priority())
        .bind(new_job.max_retries)
        .execute(executor)
        .await?;

        Ok(id)
    }

    /// Fetches a job by ID.
    pub async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "select {JOB_COLUMNS} from courseloom.job where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Fetches a job by ID, scoped to a tenant.
    ///
    /// This is the read used by request-facing callers; jobs belonging to
    /// other tenants are indistinguishable from absent ones.
    pub async fn get_for_tenant(&self, tenant_id: uuid::Uuid, id: JobId) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "select {JOB_COLUMNS} from courseloom.job where id = $1 and tenant_id = $2"
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    /// Lists the children of a parent job, in creation order.
    pub async fn list_by_parent(&self, parent_id: JobId) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            "select {JOB_COLUMNS} from courseloom.job
             where parent_id = $1
             order by created_at, id"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Claims the next available queued job and marks it `running`.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent replicas never claim the
    /// same row. Jobs become claimable once their `available_at` has passed,
    /// which is how retry backoff delays re-delivery.
    #[instrument(name = "job.claim", skip(self), fields(job.id = tracing::field::Empty), err)]
    pub async fn next_queued(&self) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "update courseloom.job j
             set status = 'running'::courseloom.job_status,
                 started_at = coalesce(j.started_at, now())
             from (
                 select id as available_id
                 from courseloom.job
                 where status = 'queued'::courseloom.job_status
                   and available_at <= now()
                 order by priority desc, created_at, id
                 limit 1
                 for update skip locked
             ) as available_job
             where j.id = available_job.available_id
             returning {JOB_COLUMNS}"
        ))
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job) = &job {
            tracing::Span::current().record("job.id", job.id.to_string());
        }

        Ok(job)
    }

    /// Persists handler-reported progress.
    pub async fn update_progress(
        &self,
        id: JobId,
        percent: i32,
        message: Option<&str>,
    ) -> Result {
        sqlx::query(
            "update courseloom.job
             set progress_percent = $2, progress_message = $3
             where id = $1",
        )
        .bind(id)
        .bind(percent.clamp(0, 100))
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Records the result artifact path without terminating the job.
    ///
    /// Used by fan-out parents, which stay `running` after producing their
    /// own artifact.
    pub async fn set_result_path(&self, id: JobId, result_path: &str) -> Result {
        sqlx::query(
            "update courseloom.job
             set result_path = $2
             where id = $1",
        )
        .bind(id)
        .bind(result_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Accumulates provider token usage onto the job row.
    pub async fn add_tokens(&self, id: JobId, tokens: i64) -> Result {
        sqlx::query(
            "update courseloom.job
             set tokens_used = tokens_used + $2
             where id = $1",
        )
        .bind(id)
        .bind(tokens)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Marks a running job completed.
    ///
    /// Guarded on the current status, so a terminal job is never
    /// un-terminated by a late or duplicate write.
    #[instrument(name = "job.complete", skip(self, result_path), err)]
    pub async fn mark_completed(&self, id: JobId, result_path: Option<&str>) -> Result {
        let result = sqlx::query(
            "update courseloom.job
             set status = 'completed'::courseloom.job_status,
                 result_path = coalesce($2, result_path),
                 progress_percent = 100,
                 completed_at = now()
             where id = $1
               and status = 'running'::courseloom.job_status",
        )
        .bind(id)
        .bind(result_path)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_rejection(id).await);
        }

        Ok(())
    }

    /// Marks a running job terminally failed with the given error message.
    #[instrument(name = "job.fail", skip(self, error), err)]
    pub async fn mark_failed(&self, id: JobId, error: &str) -> Result {
        let result = sqlx::query(
            "update courseloom.job
             set status = 'failed'::courseloom.job_status,
                 error_message = $2,
                 completed_at = now()
             where id = $1
               and status = 'running'::courseloom.job_status",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_rejection(id).await);
        }

        Ok(())
    }

    /// Returns a failed job to the queue for a delayed retry.
    ///
    /// Increments `retry_count` and pushes `available_at` forward by the
    /// backoff delay; the job is picked up again by the poll path once the
    /// delay has elapsed.
    #[instrument(name = "job.retry", skip(self, error, delay), err)]
    pub async fn reschedule_for_retry(
        &self,
        id: JobId,
        error: &str,
        delay: std::time::Duration,
    ) -> Result {
        let available_at =
            Utc::now() + Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);

        let result = sqlx::query(
            "update courseloom.job
             set status = 'queued'::courseloom.job_status,
                 retry_count = retry_count + 1,
                 error_message = $2,
                 available_at = $3
             where id = $1
               and status = 'running'::courseloom.job_status",
        )
        .bind(id)
        .bind(error)
        .bind(available_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.guard_rejection(id).await);
        }

        Ok(())
    }

    /// Distinguishes a missing row from a rejected guarded write.
    async fn guard_rejection(&self, id: JobId) -> Error {
        match self.get(id).await {
            Ok(Some(_)) => Error::JobNotRunning(id),
            Ok(None) => Error::JobNotFound(id),
            Err(err) => err,
        }
    }

    /// Operator-driven re-enqueue of a terminally failed job.
    ///
    /// Resets the retry bookkeeping and returns the job to `queued`. This is
    /// the only path out of a terminal state; automatic retries never touch
    /// terminal jobs. Returns `false` when the job isn't failed.
    #[instrument(name = "job.requeue", skip(self), err)]
    pub async fn requeue(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query(
            "update courseloom.job
             set status = 'queued'::courseloom.job_status,
                 retry_count = 0,
                 error_message = null,
                 progress_percent = 0,
                 progress_message = null,
                 available_at = now(),
                 started_at = null,
                 completed_at = null
             where id = $1
               and status = 'failed'::courseloom.job_status",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Attempts to finalize a parent job from its children's terminal states.
    ///
    /// Under a single row-level lock on the parent this:
    ///
    /// 1. counts children by terminal status;
    /// 2. returns "not ready" while any child is non-terminal;
    /// 3. if all children are terminal and the parent is still non-terminal,
    ///    atomically sets the parent to `failed` when any child failed, else
    ///    `completed`, folds the children's token usage into the parent, and
    ///    reports `finalized == true`;
    /// 4. if the parent was already terminal, reports `finalized == false,
    ///    all_complete == true` so a second racing caller does not re-notify.
    ///
    /// The lock serializes concurrent finalizers for the *same* parent only;
    /// unrelated parents proceed independently.
    #[instrument(name = "job.finalize_parent", skip(self), err)]
    pub async fn try_finalize_parent(&self, parent_id: JobId) -> Result<Finalization> {
        let mut tx = self.pool.begin().await?;

        let parent_status = sqlx::query_scalar::<_, JobStatus>(
            "select status from courseloom.job where id = $1 for update",
        )
        .bind(parent_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(Error::JobNotFound(parent_id))?;

        let (completed, failed, pending, tokens) = sqlx::query_as::<_, (i64, i64, i64, i64)>(
            "select
                 count(*) filter (where status = 'completed'::courseloom.job_status),
                 count(*) filter (where status = 'failed'::courseloom.job_status),
                 count(*) filter (where status not in
                     ('completed'::courseloom.job_status, 'failed'::courseloom.job_status)),
                 coalesce(sum(tokens_used), 0)::bigint
             from courseloom.job
             where parent_id = $1",
        )
        .bind(parent_id)
        .fetch_one(&mut *tx)
        .await?;

        if parent_status.is_terminal() {
            tx.commit().await?;
            return Ok(Finalization {
                finalized: false,
                all_complete: true,
                parent_status,
                completed_children: completed,
                failed_children: failed,
                pending_children: pending,
                total_tokens: tokens,
            });
        }

        if pending > 0 {
            tx.commit().await?;
            return Ok(Finalization {
                finalized: false,
                all_complete: false,
                parent_status,
                completed_children: completed,
                failed_children: failed,
                pending_children: pending,
                total_tokens: tokens,
            });
        }

        // The parent fails if any child failed, else completes.
        let final_status = if failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };

        sqlx::query(
            "update courseloom.job
             set status = $2,
                 tokens_used = tokens_used + $3,
                 progress_percent = 100,
                 error_message = case when $4::bigint > 0
                     then format('%s of %s child jobs failed', $4::bigint, $5::bigint)
                     else error_message end,
                 completed_at = now()
             where id = $1",
        )
        .bind(parent_id)
        .bind(final_status)
        .bind(tokens)
        .bind(failed)
        .bind(completed + failed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Finalization {
            finalized: true,
            all_complete: true,
            parent_status: final_status,
            completed_children: completed,
            failed_children: failed,
            pending_children: 0,
            total_tokens: tokens,
        })
    }

    /// Lists jobs that have been `running` longer than the given age.
    ///
    /// Used by the reconciler; parents legitimately stay `running` while
    /// their children execute, so rows with children are excluded.
    pub async fn list_stuck_running(&self, older_than: std::time::Duration) -> Result<Vec<Job>> {
        let cutoff =
            Utc::now() - Duration::milliseconds(older_than.as_millis().min(i64::MAX as u128) as i64);

        let jobs = sqlx::query_as::<_, Job>(&format!(
            "select {JOB_COLUMNS} from courseloom.job j
             where status = 'running'::courseloom.job_status
               and started_at < $1
               and not exists (select 1 from courseloom.job c where c.parent_id = j.id)
             order by started_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Per-status counts across the whole table.
    pub async fn counts(&self) -> Result<StatusCounts> {
        let counts = sqlx::query_as::<_, StatusCounts>(
            "select
                 count(*) filter (where status = 'queued'::courseloom.job_status) as queued,
                 count(*) filter (where status = 'running'::courseloom.job_status) as running,
                 count(*) filter (where status = 'completed'::courseloom.job_status) as completed,
                 count(*) filter (where status = 'failed'::courseloom.job_status) as failed
             from courseloom.job",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::PgPool;
    use uuid::Uuid;

    use super::*;
    use crate::job::{JobKind, Lane};

    fn new_job(tenant: Uuid) -> NewJob {
        NewJob::new(tenant, JobKind::LessonGeneration, json!({"lesson_id": 1}))
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn create_and_get(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let tenant = Uuid::new_v4();

        let id = store.create(&pool, &new_job(tenant)).await?;
        let job = store.get(id).await?.expect("job should exist");

        assert_eq!(job.id, id);
        assert_eq!(job.tenant_id, tenant);
        assert_eq!(job.kind, JobKind::LessonGeneration);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert!(job.started_at.is_none());

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn tenant_scoping(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let tenant = Uuid::new_v4();
        let other_tenant = Uuid::new_v4();

        let id = store.create(&pool, &new_job(tenant)).await?;

        assert!(store.get_for_tenant(tenant, id).await?.is_some());
        assert!(store.get_for_tenant(other_tenant, id).await?.is_none());

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn claim_marks_running(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let id = store.create(&pool, &new_job(Uuid::new_v4())).await?;

        let claimed = store.next_queued().await?.expect("job should be claimable");
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());

        // Nothing left to claim.
        assert!(store.next_queued().await?.is_none());

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn claim_respects_priority(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let tenant = Uuid::new_v4();

        store
            .create(&pool, &new_job(tenant).lane(Lane::Low))
            .await?;
        let critical = store
            .create(&pool, &new_job(tenant).lane(Lane::Critical))
            .await?;

        let first = store.next_queued().await?.expect("job should be claimable");
        assert_eq!(first.id, critical);

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn concurrent_claims_are_exclusive(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let tenant = Uuid::new_v4();

        let mut ids = std::collections::HashSet::new();
        for _ in 0..5 {
            ids.insert(store.create(&pool, &new_job(tenant)).await?);
        }

        // Claim all five from concurrent callers; every claim must be
        // distinct and each job claimed exactly once.
        let claims = futures::future::try_join_all((0..5).map(|_| {
            let store = store.clone();
            async move { store.next_queued().await }
        }))
        .await?;

        let claimed: std::collections::HashSet<_> = claims
            .into_iter()
            .map(|job| job.expect("five claims for five jobs").id)
            .collect();
        assert_eq!(claimed, ids);

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn retry_backoff_delays_availability(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let id = store.create(&pool, &new_job(Uuid::new_v4())).await?;

        store.next_queued().await?.expect("job should be claimable");
        store
            .reschedule_for_retry(id, "transient outage", std::time::Duration::from_secs(60))
            .await?;

        let job = store.get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.error_message.as_deref(), Some("transient outage"));

        // Not claimable until the backoff elapses.
        assert!(store.next_queued().await?.is_none());

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn terminal_states_are_sticky(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let id = store.create(&pool, &new_job(Uuid::new_v4())).await?;

        store.next_queued().await?.expect("job should be claimable");
        store.mark_completed(id, Some("results/lesson.json")).await?;

        // A duplicate terminal write is rejected, and distinguishable from a
        // missing row.
        assert!(matches!(
            store.mark_failed(id, "late failure").await,
            Err(Error::JobNotRunning(_))
        ));
        assert!(matches!(
            store.mark_failed(JobId::new(), "no such job").await,
            Err(Error::JobNotFound(_))
        ));

        let job = store.get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_path.as_deref(), Some("results/lesson.json"));

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn requeue_resets_failed_job(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let id = store.create(&pool, &new_job(Uuid::new_v4())).await?;

        store.next_queued().await?.expect("job should be claimable");
        store.mark_failed(id, "unrecoverable").await?;

        assert!(store.requeue(id).await?);

        let job = store.get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert!(job.error_message.is_none());
        assert!(job.completed_at.is_none());

        // A second requeue is a no-op because the job is queued again.
        assert!(!store.requeue(id).await?);

        Ok(())
    }

    async fn set_up_parent_with_children(
        store: &JobStore,
        pool: &PgPool,
        children: usize,
    ) -> Result<(JobId, Vec<JobId>)> {
        let tenant = Uuid::new_v4();
        let parent = store
            .create(pool, &NewJob::new(tenant, JobKind::OutlineGeneration, json!({})))
            .await?;
        // Parent is claimed by the fan-out handler and stays running.
        store.next_queued().await?.expect("parent should be claimable");

        let mut child_ids = Vec::new();
        for _ in 0..children {
            let id = store
                .create(pool, &new_job(tenant).child_of(parent))
                .await?;
            child_ids.push(id);
        }

        Ok((parent, child_ids))
    }

    async fn run_child(store: &JobStore, id: JobId, fail: bool, tokens: i64) -> Result {
        // Claim-and-terminate in row order; claims pick the oldest first so
        // tests drive children to terminal states one at a time.
        store.next_queued().await?.expect("child should be claimable");
        store.add_tokens(id, tokens).await?;
        if fail {
            store.mark_failed(id, "child failed").await?;
        } else {
            store.mark_completed(id, None).await?;
        }
        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn finalize_not_ready_until_all_terminal(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let (parent, children) = set_up_parent_with_children(&store, &pool, 2).await?;

        run_child(&store, children[0], false, 10).await?;

        let report = store.try_finalize_parent(parent).await?;
        assert!(!report.finalized);
        assert!(!report.all_complete);
        assert_eq!(report.pending_children, 1);

        run_child(&store, children[1], false, 5).await?;

        let report = store.try_finalize_parent(parent).await?;
        assert!(report.finalized);
        assert!(report.all_complete);
        assert_eq!(report.parent_status, JobStatus::Completed);
        assert_eq!(report.completed_children, 2);
        assert_eq!(report.total_tokens, 15);

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn finalize_fails_parent_when_any_child_fails(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let (parent, children) = set_up_parent_with_children(&store, &pool, 3).await?;

        run_child(&store, children[0], false, 7).await?;
        run_child(&store, children[1], true, 3).await?;
        run_child(&store, children[2], false, 2).await?;

        let report = store.try_finalize_parent(parent).await?;
        assert!(report.finalized);
        assert_eq!(report.parent_status, JobStatus::Failed);
        assert_eq!(report.completed_children, 2);
        assert_eq!(report.failed_children, 1);
        assert_eq!(report.total_tokens, 12);

        let parent_job = store.get(parent).await?.expect("parent should exist");
        assert_eq!(parent_job.status, JobStatus::Failed);
        assert_eq!(parent_job.tokens_used, 12);

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn finalize_happens_at_most_once(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let (parent, children) = set_up_parent_with_children(&store, &pool, 2).await?;

        run_child(&store, children[0], false, 1).await?;
        run_child(&store, children[1], false, 1).await?;

        // Race several finalizers for the same parent; exactly one must win.
        let reports = futures::future::try_join_all((0..4).map(|_| {
            let store = store.clone();
            async move { store.try_finalize_parent(parent).await }
        }))
        .await?;

        let winners = reports.iter().filter(|report| report.finalized).count();
        assert_eq!(winners, 1);

        for report in &reports {
            assert!(report.all_complete);
            assert_eq!(report.parent_status, JobStatus::Completed);
            assert_eq!(report.completed_children, 2);
            assert_eq!(report.total_tokens, 2);
        }

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn stuck_scan_skips_parents_and_fresh_jobs(pool: PgPool) -> Result {
        let store = JobStore::new(pool.clone());
        let (parent, _children) = set_up_parent_with_children(&store, &pool, 1).await?;

        // Backdate the parent's claim; it still must not be reported because
        // it has children in flight.
        sqlx::query(
            "update courseloom.job set started_at = now() - interval '1 hour' where id = $1",
        )
        .bind(parent)
        .execute(&pool)
        .await?;

        let stuck = store
            .list_stuck_running(std::time::Duration::from_secs(15 * 60))
            .await?;
        assert!(stuck.iter().all(|job| job.id != parent));

        Ok(())
    }
}
