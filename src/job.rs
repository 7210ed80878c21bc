//! Core job types.
//!
//! A [`Job`] is one unit of trackable asynchronous work: AI content
//! generation, SME-document ingestion, paid-account provisioning. Jobs are
//! durable rows in Postgres and every other part of this crate reads and
//! writes them through the [store](crate::store).
//!
//! Jobs may be linked into a parent/children group: a compound request (such
//! as "generate a full course") is recorded as one parent job which fans out
//! into independently executed child jobs. A parent's terminal status is
//! derived from its children by the [coordinator](crate::coordinator), never
//! set by a handler.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;
use uuid::Uuid;

/// Unique job identifier.
///
/// Internally a [ULID] converted to `UUID`, so identifiers sort by creation
/// time.
///
/// [ULID]: https://github.com/ulid/spec?tab=readme-ov-file#specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a new job identifier.
    pub fn new() -> Self {
        Self(Ulid::new().into())
    }

    /// Returns the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.as_hyphenated().fmt(f)
    }
}

/// The kind of work a job performs.
///
/// Dispatch is keyed on this closed enum: the worker's
/// [registry](crate::handler::Registry) must provide a handler for every
/// variant and is validated exhaustively at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "courseloom.job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Generates a course outline and fans out per-lesson child jobs.
    OutlineGeneration,

    /// Generates the content of a single lesson.
    LessonGeneration,

    /// Ingests an SME document into summary and chunks.
    DocumentIngestion,

    /// Provisions a paid account after a successful checkout.
    AccountProvisioning,
}

impl JobKind {
    /// All kinds, in dispatch-registry order.
    pub const ALL: [JobKind; 4] = [
        JobKind::OutlineGeneration,
        JobKind::LessonGeneration,
        JobKind::DocumentIngestion,
        JobKind::AccountProvisioning,
    ];
}

/// Lifecycle states of a job.
///
/// Status is monotonic: `queued -> running -> {completed, failed}`. A
/// terminal job never transitions again, except through the explicit
/// operator-driven [`requeue`](crate::store::JobStore::requeue) reset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "courseloom.job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a worker.
    Queued,

    /// Claimed and currently being processed.
    Running,

    /// Finished successfully.
    Completed,

    /// Finished unsuccessfully and will not be retried further.
    Failed,
}

impl JobStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Priority lanes for the queue wake channel.
///
/// Higher lanes are dequeued before lower ones; within a lane jobs are
/// processed in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lane {
    /// Batchable, latency-insensitive work.
    Low,

    /// The default lane.
    Default,

    /// Time-sensitive work, e.g. paid-account provisioning.
    Critical,
}

impl Lane {
    /// All lanes, in ascending priority order.
    pub const ALL: [Lane; 3] = [Lane::Low, Lane::Default, Lane::Critical];

    /// The priority value stored on the job row.
    pub fn priority(&self) -> i32 {
        match self {
            Lane::Low => 0,
            Lane::Default => 1,
            Lane::Critical => 2,
        }
    }

    /// The NOTIFY channel for this lane.
    pub fn channel(&self) -> &'static str {
        match self {
            Lane::Low => "courseloom_jobs_low",
            Lane::Default => "courseloom_jobs_default",
            Lane::Critical => "courseloom_jobs_critical",
        }
    }

    /// The default lane for a job kind.
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::AccountProvisioning => Lane::Critical,
            JobKind::OutlineGeneration | JobKind::LessonGeneration => Lane::Default,
            JobKind::DocumentIngestion => Lane::Low,
        }
    }
}

/// A durable job row.
///
/// The payload carries identifiers only, never denormalized snapshots:
/// handlers re-fetch the entities they operate on so re-execution after a
/// crash always sees fresh state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    /// Unique identifier.
    pub id: JobId,

    /// Owning tenant.
    pub tenant_id: Uuid,

    /// What this job does.
    pub kind: JobKind,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// The parent job, when this job is one leaf of a fan-out.
    pub parent_id: Option<JobId>,

    /// Handler input, identifiers only.
    pub payload: serde_json::Value,

    /// Dequeue priority, derived from [`Lane`].
    pub priority: i32,

    /// Progress percent, 0..=100.
    pub progress_percent: i32,

    /// Optional human-readable progress message.
    pub progress_message: Option<String>,

    /// Object-storage path of the stored result, once produced.
    pub result_path: Option<String>,

    /// Error message of the last failure, if any.
    pub error_message: Option<String>,

    /// Provider token usage accumulated for billing.
    pub tokens_used: i64,

    /// Number of failed attempts so far. Only increases.
    pub retry_count: i32,

    /// Attempt ceiling; at exhaustion the job is terminally failed.
    pub max_retries: i32,

    /// Earliest time the job may be claimed; pushed forward by retry backoff.
    pub available_at: DateTime<Utc>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// First claim time.
    pub started_at: Option<DateTime<Utc>>,

    /// Terminal transition time.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this job has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Input for creating a new job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Owning tenant.
    pub tenant_id: Uuid,

    /// What the job does.
    pub kind: JobKind,

    /// The parent job, when created as part of a fan-out.
    pub parent_id: Option<JobId>,

    /// Handler input, identifiers only.
    pub payload: serde_json::Value,

    /// Priority lane; defaults per kind.
    pub lane: Lane,

    /// Attempt ceiling.
    pub max_retries: i32,
}

impl NewJob {
    /// Creates a new job description with the kind's default lane and retry
    /// ceiling.
    pub fn new(tenant_id: Uuid, kind: JobKind, payload: serde_json::Value) -> Self {
        Self {
            tenant_id,
            kind,
            parent_id: None,
            payload,
            lane: Lane::for_kind(kind),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Links the job to a parent.
    pub fn child_of(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Overrides the lane.
    pub fn lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    /// Overrides the retry ceiling.
    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Default attempt ceiling for new jobs.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// Configuration of the exponential backoff applied between retries.
///
/// The interval grows by `backoff_coefficient` per attempt, starting at
/// `initial_interval_ms` and capped at `max_interval_ms`. The attempt ceiling
/// itself lives on the job row (`max_retries`), not here.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub(crate) initial_interval_ms: i32,
    pub(crate) max_interval_ms: i32,
    pub(crate) backoff_coefficient: f32,
}

impl RetryPolicy {
    /// Creates a builder for a custom policy.
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// The delay to apply before the given retry, 1-based.
    pub fn calculate_delay(&self, retry_count: i32) -> StdDuration {
        let base_delay = self.initial_interval_ms as f32;
        let backoff_delay = base_delay * self.backoff_coefficient.powi(retry_count - 1);
        let delay = backoff_delay.min(self.max_interval_ms as f32);
        StdDuration::from_millis(delay as u64)
    }
}

const DEFAULT_RETRY_POLICY: RetryPolicy = RetryPolicy {
    initial_interval_ms: 1_000,
    max_interval_ms: 60_000,
    backoff_coefficient: 2.0,
};

impl Default for RetryPolicy {
    fn default() -> Self {
        DEFAULT_RETRY_POLICY
    }
}

/// A builder for constructing custom [`RetryPolicy`] values.
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    inner: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Creates a new builder with the default settings.
    pub const fn new() -> Self {
        Self {
            inner: DEFAULT_RETRY_POLICY,
        }
    }

    /// Sets the interval before the first retry (in milliseconds).
    pub const fn initial_interval_ms(mut self, initial_interval_ms: i32) -> Self {
        self.inner.initial_interval_ms = initial_interval_ms;
        self
    }

    /// Sets the maximum interval between retries (in milliseconds).
    pub const fn max_interval_ms(mut self, max_interval_ms: i32) -> Self {
        self.inner.max_interval_ms = max_interval_ms;
        self
    }

    /// Sets the backoff coefficient applied after each retry.
    pub const fn backoff_coefficient(mut self, backoff_coefficient: f32) -> Self {
        self.inner.backoff_coefficient = backoff_coefficient;
        self
    }

    /// Builds the policy.
    pub const fn build(self) -> RetryPolicy {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn status_terminality() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn lane_priorities_are_ordered() {
        assert!(Lane::Critical.priority() > Lane::Default.priority());
        assert!(Lane::Default.priority() > Lane::Low.priority());
    }

    #[test]
    fn default_lane_per_kind() {
        assert_eq!(Lane::for_kind(JobKind::AccountProvisioning), Lane::Critical);
        assert_eq!(Lane::for_kind(JobKind::OutlineGeneration), Lane::Default);
        assert_eq!(Lane::for_kind(JobKind::LessonGeneration), Lane::Default);
        assert_eq!(Lane::for_kind(JobKind::DocumentIngestion), Lane::Low);
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval_ms, 1_000);
        assert_eq!(policy.max_interval_ms, 60_000);
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn retry_policy_backoff_grows_and_caps() {
        let policy = RetryPolicy::builder()
            .initial_interval_ms(500)
            .max_interval_ms(5_000)
            .backoff_coefficient(2.0)
            .build();

        assert_eq!(policy.calculate_delay(1), StdDuration::from_millis(500));
        assert_eq!(policy.calculate_delay(2), StdDuration::from_millis(1_000));
        assert_eq!(policy.calculate_delay(3), StdDuration::from_millis(2_000));
        // Capped at the maximum interval.
        assert_eq!(policy.calculate_delay(10), StdDuration::from_millis(5_000));
    }

    #[test]
    fn kind_serialization_is_snake_case() {
        let json = serde_json::to_string(&JobKind::OutlineGeneration).unwrap();
        assert_eq!(json, r#""outline_generation""#);
    }
}
