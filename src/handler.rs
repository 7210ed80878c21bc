//! Handler dispatch.
//!
//! Each [`JobKind`](crate::job::JobKind) has exactly one [`JobHandler`]
//! implementation, registered in a [`Registry`] the worker dispatches
//! through. The registry is validated exhaustively at startup so a missing
//! handler is a boot failure, not a runtime dead letter.
//!
//! Handlers must be idempotent: a crash after side effects but before the
//! terminal status write means the job is re-delivered, so handlers re-fetch
//! their entities by the identifiers in the payload and overwrite stale
//! partial results rather than appending to them.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use crate::{
    events::{Event, EventPublisher},
    job::{Job, JobId, JobKind},
    store::{self, JobStore},
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Indicates that no handler was registered for a job kind.
    #[error("No handler registered for job kind '{0:?}'.")]
    MissingHandler(JobKind),

    /// Indicates that two handlers were registered for the same job kind.
    #[error("A handler is already registered for job kind '{0:?}'.")]
    DuplicateHandler(JobKind),
}

/// An error produced by a handler, classified for the retry loop.
///
/// Retryable errors re-enqueue the job with backoff until its `max_retries`
/// ceiling; fatal errors fail the job immediately regardless of remaining
/// attempts.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// A transient failure, e.g. a provider timeout or rate limit.
    #[error("{0}")]
    Retryable(String),

    /// A permanent failure, e.g. a malformed payload or a missing entity.
    #[error("{0}")]
    Fatal(String),
}

impl HandlerError {
    /// Wraps an error as retryable.
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        Self::Retryable(err.to_string())
    }

    /// Wraps an error as fatal.
    pub fn fatal(err: impl std::fmt::Display) -> Self {
        Self::Fatal(err.to_string())
    }

    /// Whether the worker should re-enqueue the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}

/// What a successful handler run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job finished; the worker writes the terminal `completed` status.
    Completed {
        /// Object-storage path of the stored result, if one was produced.
        result_path: Option<String>,
    },

    /// The job fanned out into child jobs and stays `running` until the
    /// coordinator finalizes it from its children's terminal states.
    AwaitChildren,
}

impl Outcome {
    /// A completion without a result artifact.
    pub fn done() -> Self {
        Self::Completed { result_path: None }
    }

    /// A completion with a stored result artifact.
    pub fn done_with_result(result_path: impl Into<String>) -> Self {
        Self::Completed {
            result_path: Some(result_path.into()),
        }
    }
}

/// Job-scoped facilities passed to a handler run.
///
/// Progress and token writes are best-effort bookkeeping: failures are
/// logged and swallowed so they never fail the job itself.
#[derive(Debug, Clone)]
pub struct Context {
    job_id: JobId,
    tenant_id: uuid::Uuid,
    store: JobStore,
    events: EventPublisher,
}

impl Context {
    pub(crate) fn new(
        job_id: JobId,
        tenant_id: uuid::Uuid,
        store: JobStore,
        events: EventPublisher,
    ) -> Self {
        Self {
            job_id,
            tenant_id,
            store,
            events,
        }
    }

    /// The job this context is scoped to.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Lists the children created under this job so far.
    ///
    /// Fan-out handlers consult this on entry: existing children mean a
    /// prior delivery already fanned out before it was interrupted, and the
    /// handler must not fan out again.
    pub async fn children(&self) -> std::result::Result<Vec<Job>, store::Error> {
        self.store.list_by_parent(self.job_id).await
    }

    /// Reports handler progress, 0 to 100 percent.
    ///
    /// Persisted on the job row and announced to the tenant's event channel.
    pub async fn progress(&self, percent: i32, message: &str) {
        if let Err(err) = self
            .store
            .update_progress(self.job_id, percent, Some(message))
            .await
        {
            tracing::warn!(%err, job.id = %self.job_id, "Failed to record job progress");
        }

        self.events
            .publish(&Event::JobProgress {
                tenant_id: self.tenant_id,
                job_id: self.job_id,
                percent,
                message: Some(message.to_string()),
            })
            .await;
    }

    /// Records the job's result artifact path without completing it.
    ///
    /// Completion normally carries the path via [`Outcome::Completed`]; this
    /// is for fan-out parents that produce an artifact but stay running.
    pub async fn record_result(&self, result_path: &str) {
        if let Err(err) = self.store.set_result_path(self.job_id, result_path).await {
            tracing::warn!(%err, job.id = %self.job_id, "Failed to record result path");
        }
    }

    /// Accumulates provider token usage onto the job for billing.
    pub async fn record_tokens(&self, tokens: i64) {
        if let Err(err) = self.store.add_tokens(self.job_id, tokens).await {
            tracing::warn!(%err, job.id = %self.job_id, "Failed to record token usage");
        }
    }
}

/// A unit of executable business logic, keyed by job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// The kind this handler executes.
    fn kind(&self) -> JobKind;

    /// Executes the job.
    async fn run(&self, job: &Job, ctx: &Context) -> std::result::Result<Outcome, HandlerError>;
}

/// Maps each job kind to its handler.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its own kind.
    pub fn register(mut self, handler: Arc<dyn JobHandler>) -> Result<Self> {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            return Err(Error::DuplicateHandler(kind));
        }
        Ok(self)
    }

    /// Looks up the handler for a kind.
    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }

    /// Ensures every job kind has a handler.
    ///
    /// Called once at worker startup.
    pub fn validate(&self) -> Result {
        for kind in JobKind::ALL {
            if !self.handlers.contains_key(&kind) {
                return Err(Error::MissingHandler(kind));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler(JobKind);

    #[async_trait]
    impl JobHandler for NoopHandler {
        fn kind(&self) -> JobKind {
            self.0
        }

        async fn run(
            &self,
            _job: &Job,
            _ctx: &Context,
        ) -> std::result::Result<Outcome, HandlerError> {
            Ok(Outcome::done())
        }
    }

    fn full_registry() -> Registry {
        JobKind::ALL
            .into_iter()
            .try_fold(Registry::new(), |registry, kind| {
                registry.register(Arc::new(NoopHandler(kind)))
            })
            .expect("registration should succeed")
    }

    #[test]
    fn validate_requires_every_kind() {
        let registry = Registry::new()
            .register(Arc::new(NoopHandler(JobKind::LessonGeneration)))
            .unwrap();

        assert!(matches!(
            registry.validate(),
            Err(Error::MissingHandler(_))
        ));

        assert!(full_registry().validate().is_ok());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let result = Registry::new()
            .register(Arc::new(NoopHandler(JobKind::LessonGeneration)))
            .unwrap()
            .register(Arc::new(NoopHandler(JobKind::LessonGeneration)));

        assert!(matches!(
            result,
            Err(Error::DuplicateHandler(JobKind::LessonGeneration))
        ));
    }

    #[test]
    fn error_classification() {
        assert!(HandlerError::retryable("timeout").is_retryable());
        assert!(!HandlerError::fatal("bad payload").is_retryable());
    }
}
