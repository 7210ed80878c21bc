//! The job worker.
//!
//! Each replica runs one [`Worker`]: a loop that wakes on lane
//! notifications, falls back to a poll interval for anything a lost
//! notification missed, and drains the store through a bounded set of
//! concurrent handler executions.
//!
//! The claim in [`JobStore::next_queued`] is what makes multi-replica
//! processing safe; the worker adds retry classification, per-handler
//! timeouts, fan-in callbacks, and graceful shutdown on top.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    coordinator::{self, Coordinator},
    events::{Event, EventPublisher},
    handler::{self, Context, HandlerError, Outcome, Registry},
    job::{Job, RetryPolicy},
    queue::{self, QueueClient, Wake},
    store::{self, JobStore},
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Worker errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from the job store.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned from the queue client.
    #[error(transparent)]
    Queue(#[from] queue::Error),

    /// Error returned from the handler registry.
    #[error(transparent)]
    Registry(#[from] handler::Error),

    /// Error returned from the coordinator.
    #[error(transparent)]
    Coordinator(#[from] coordinator::Error),
}

/// Worker tuning, read from the environment with sensible defaults.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum handler executions in flight at once.
    pub concurrency: usize,

    /// How often to poll the store when no notifications arrive.
    pub poll_interval: std::time::Duration,

    /// Ceiling on a single handler execution. Generation jobs are long, but
    /// nothing legitimate runs for an hour.
    pub handler_timeout: std::time::Duration,

    /// How long to wait for in-flight jobs on shutdown.
    pub shutdown_grace: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: std::time::Duration::from_secs(5),
            handler_timeout: std::time::Duration::from_secs(15 * 60),
            shutdown_grace: std::time::Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Reads configuration from `COURSELOOM_WORKER_*` environment variables,
    /// falling back to defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: env_parse("COURSELOOM_WORKER_CONCURRENCY", defaults.concurrency),
            poll_interval: std::time::Duration::from_secs(env_parse(
                "COURSELOOM_WORKER_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )),
            handler_timeout: std::time::Duration::from_secs(env_parse(
                "COURSELOOM_WORKER_HANDLER_TIMEOUT_SECS",
                defaults.handler_timeout.as_secs(),
            )),
            shutdown_grace: std::time::Duration::from_secs(env_parse(
                "COURSELOOM_WORKER_SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )),
        }
    }

    /// Overrides the concurrency bound.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Overrides the poll interval.
    pub fn with_poll_interval(mut self, poll_interval: std::time::Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Overrides the per-handler timeout.
    pub fn with_handler_timeout(mut self, handler_timeout: std::time::Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Claims and executes jobs until shut down.
#[derive(Clone)]
pub struct Worker {
    store: JobStore,
    queue: QueueClient,
    coordinator: Coordinator,
    registry: Arc<Registry>,
    events: EventPublisher,
    retry_policy: RetryPolicy,
    config: WorkerConfig,
    shutdown_token: CancellationToken,
}

impl Worker {
    /// Creates a new worker.
    ///
    /// Fails when the registry is missing a handler for any job kind.
    pub fn new(
        store: JobStore,
        queue: QueueClient,
        coordinator: Coordinator,
        registry: Registry,
        events: EventPublisher,
        config: WorkerConfig,
    ) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            store,
            queue,
            coordinator,
            registry: Arc::new(registry),
            events,
            retry_policy: RetryPolicy::default(),
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// Overrides the retry backoff policy.
    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// A token that stops the run loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Runs the worker until cancelled or a shutdown notification arrives.
    ///
    /// Wakes on lane notifications and polls on an interval as the fallback
    /// for dropped notifications; a lost listener connection triggers a
    /// reconnect followed by an immediate drain to cover the gap.
    #[instrument(skip(self), err)]
    pub async fn run(&self) -> Result {
        let mut polling_interval = tokio::time::interval(self.config.poll_interval);
        let mut in_flight = JoinSet::new();

        'reconnect: loop {
            let mut listener = self.queue.listen().await?;

            tracing::info!("Queue listener connected successfully");

            // Drain immediately after (re)connect in case notifications were
            // missed while disconnected.
            self.drain(&mut in_flight).await?;

            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => {
                        self.wait_for_in_flight(&mut in_flight).await;
                        return Ok(());
                    }

                    wake = listener.recv() => {
                        match wake {
                            Ok(Wake::NewWork) => {
                                self.drain(&mut in_flight).await?;
                            }
                            Ok(Wake::Shutdown) => {
                                tracing::info!("Shutdown notification received");
                                self.wait_for_in_flight(&mut in_flight).await;
                                return Ok(());
                            }
                            Err(err) => {
                                tracing::warn!(%err, "Queue listener connection lost, reconnecting");
                                continue 'reconnect;
                            }
                        }
                    }

                    _ = polling_interval.tick() => {
                        self.drain(&mut in_flight).await?;
                    }
                }
            }
        }
    }

    /// Claims available jobs until the store is empty, keeping at most
    /// `concurrency` handler executions in flight.
    async fn drain(&self, in_flight: &mut JoinSet<()>) -> Result {
        loop {
            while in_flight.len() >= self.config.concurrency {
                if let Some(Err(err)) = in_flight.join_next().await {
                    tracing::error!(%err, "Job task panicked");
                }
            }

            let Some(job) = self.store.next_queued().await? else {
                return Ok(());
            };

            let worker = self.clone();
            in_flight.spawn(async move { worker.process(job).await });
        }
    }

    async fn wait_for_in_flight(&self, in_flight: &mut JoinSet<()>) {
        let drain = async {
            while let Some(joined) = in_flight.join_next().await {
                if let Err(err) = joined {
                    tracing::error!(%err, "Job task panicked");
                }
            }
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Shutdown grace elapsed with jobs still in flight"
            );
        }
    }

    /// Executes one claimed job through its handler and settles the outcome.
    ///
    /// Every path out of here is logged rather than propagated; a job's
    /// failure must never take down the worker loop.
    #[instrument(
        name = "worker.process",
        skip(self, job),
        fields(job.id = %job.id, job.kind = ?job.kind, job.retry_count = job.retry_count)
    )]
    async fn process(&self, job: Job) {
        let Some(job_handler) = self.registry.get(job.kind) else {
            // Unreachable after registry validation, but a poisoned row must
            // not wedge the queue.
            self.settle_failure(
                &job,
                HandlerError::fatal(handler::Error::MissingHandler(job.kind)),
            )
            .await;
            return;
        };

        let ctx = Context::new(job.id, job.tenant_id, self.store.clone(), self.events.clone());
        let result = match tokio::time::timeout(
            self.config.handler_timeout,
            job_handler.run(&job, &ctx),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::retryable(format!(
                "handler timed out after {}s",
                self.config.handler_timeout.as_secs()
            ))),
        };

        match result {
            Ok(Outcome::Completed { result_path }) => {
                if let Err(err) = self.store.mark_completed(job.id, result_path.as_deref()).await {
                    tracing::error!(%err, "Failed to record job completion");
                    return;
                }

                tracing::info!("Job completed");
                self.events
                    .publish(&Event::JobCompleted {
                        tenant_id: job.tenant_id,
                        job_id: job.id,
                        kind: job.kind,
                        result_path,
                    })
                    .await;
                self.fan_in(&job).await;
            }

            Ok(Outcome::AwaitChildren) => {
                // The parent stays running; the coordinator finalizes it
                // from its children's terminal transitions.
                tracing::info!("Job fanned out, awaiting children");
            }

            Err(err) => self.settle_failure(&job, err).await,
        }
    }

    async fn settle_failure(&self, job: &Job, err: HandlerError) {
        let retries_remaining = job.retry_count < job.max_retries;
        let will_retry = err.is_retryable() && retries_remaining;

        if will_retry {
            let delay = self.retry_policy.calculate_delay(job.retry_count + 1);
            tracing::warn!(%err, delay_ms = delay.as_millis() as u64, "Job failed, will retry");

            if let Err(store_err) = self
                .store
                .reschedule_for_retry(job.id, &err.to_string(), delay)
                .await
            {
                tracing::error!(%store_err, "Failed to reschedule job for retry");
                return;
            }
        } else {
            if err.is_retryable() {
                tracing::error!(%err, "Job failed with retries exhausted");
            } else {
                tracing::error!(%err, "Job failed fatally");
            }

            if let Err(store_err) = self.store.mark_failed(job.id, &err.to_string()).await {
                tracing::error!(%store_err, "Failed to record job failure");
                return;
            }
        }

        self.events
            .publish(&Event::JobFailed {
                tenant_id: job.tenant_id,
                job_id: job.id,
                kind: job.kind,
                error: err.to_string(),
                will_retry,
            })
            .await;

        if !will_retry {
            self.fan_in(job).await;
        }
    }

    async fn fan_in(&self, job: &Job) {
        if let Err(err) = self.coordinator.on_child_terminal(job).await {
            // The reconciler's stuck-parent alert is the backstop here.
            tracing::error!(%err, "Fan-in callback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use async_trait::async_trait;
    use serde_json::json;
    use sqlx::PgPool;
    use uuid::Uuid;

    use super::*;
    use crate::{
        events::EventSubscriber,
        handler::JobHandler,
        job::{JobKind, JobStatus, NewJob},
        providers::NoopMailer,
    };

    enum Behavior {
        Succeed,
        FailRetryable,
        FailFatal,
        Hang,
        Panic,
    }

    struct ScriptedHandler {
        kind: JobKind,
        behavior: Behavior,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(
            &self,
            _job: &Job,
            _ctx: &Context,
        ) -> std::result::Result<Outcome, HandlerError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(Outcome::done_with_result("results/out.json")),
                Behavior::FailRetryable => Err(HandlerError::retryable("provider timeout")),
                Behavior::FailFatal => Err(HandlerError::fatal("malformed payload")),
                Behavior::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                    Ok(Outcome::done())
                }
                Behavior::Panic => panic!("handler blew up"),
            }
        }
    }

    fn registry_with(behavior_for_lessons: Behavior, runs: Arc<AtomicUsize>) -> Registry {
        let mut registry = Registry::new();
        for kind in JobKind::ALL {
            let behavior = if kind == JobKind::LessonGeneration {
                match behavior_for_lessons {
                    Behavior::Succeed => Behavior::Succeed,
                    Behavior::FailRetryable => Behavior::FailRetryable,
                    Behavior::FailFatal => Behavior::FailFatal,
                    Behavior::Hang => Behavior::Hang,
                    Behavior::Panic => Behavior::Panic,
                }
            } else {
                Behavior::Succeed
            };
            registry = registry
                .register(Arc::new(ScriptedHandler {
                    kind,
                    behavior,
                    runs: runs.clone(),
                }))
                .unwrap();
        }
        registry
    }

    fn worker(pool: &PgPool, registry: Registry) -> Worker {
        let store = JobStore::new(pool.clone());
        let queue = QueueClient::new(pool.clone());
        let events = EventPublisher::new(pool.clone());
        let coordinator = Coordinator::new(
            pool.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(NoopMailer),
        );
        Worker::new(
            store,
            queue,
            coordinator,
            registry,
            events,
            WorkerConfig::default().with_concurrency(2),
        )
        .unwrap()
    }

    async fn enqueue_lesson(
        pool: &PgPool,
        tenant: Uuid,
        max_retries: i32,
    ) -> store::Result<crate::job::JobId> {
        JobStore::new(pool.clone())
            .create(
                pool,
                &NewJob::new(tenant, JobKind::LessonGeneration, json!({}))
                    .max_retries(max_retries),
            )
            .await
    }

    async fn drain_and_join(worker: &Worker) -> Result {
        let mut in_flight = JoinSet::new();
        worker.drain(&mut in_flight).await?;
        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    async fn recv_soon(subscriber: &mut EventSubscriber) -> Event {
        tokio::time::timeout(std::time::Duration::from_secs(5), subscriber.recv())
            .await
            .expect("event should arrive")
            .expect("event should decode")
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn success_completes_and_publishes(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = worker(&pool, registry_with(Behavior::Succeed, runs.clone()));
        let tenant = Uuid::new_v4();
        let mut subscriber = EventSubscriber::connect(&pool, tenant)
            .await
            .expect("subscriber should connect");
        let id = enqueue_lesson(&pool, tenant, 5).await?;

        drain_and_join(&worker).await?;

        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let job = JobStore::new(pool).get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_path.as_deref(), Some("results/out.json"));

        assert!(matches!(
            recv_soon(&mut subscriber).await,
            Event::JobCompleted { job_id, .. } if job_id == id
        ));

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn retryable_failure_requeues_with_backoff(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = worker(&pool, registry_with(Behavior::FailRetryable, runs));
        let tenant = Uuid::new_v4();
        let mut subscriber = EventSubscriber::connect(&pool, tenant)
            .await
            .expect("subscriber should connect");
        let id = enqueue_lesson(&pool, tenant, 5).await?;

        drain_and_join(&worker).await?;

        let job = JobStore::new(pool).get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job.available_at > job.created_at);

        assert!(matches!(
            recv_soon(&mut subscriber).await,
            Event::JobFailed { will_retry: true, .. }
        ));

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn fatal_failure_skips_retries(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = worker(&pool, registry_with(Behavior::FailFatal, runs.clone()));
        let tenant = Uuid::new_v4();
        let mut subscriber = EventSubscriber::connect(&pool, tenant)
            .await
            .expect("subscriber should connect");
        let id = enqueue_lesson(&pool, tenant, 5).await?;

        drain_and_join(&worker).await?;

        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let job = JobStore::new(pool).get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);

        assert!(matches!(
            recv_soon(&mut subscriber).await,
            Event::JobFailed { will_retry: false, .. }
        ));

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn exhausted_retries_fail_terminally(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = worker(&pool, registry_with(Behavior::FailRetryable, runs)).retry_policy(
            RetryPolicy::builder()
                .initial_interval_ms(0)
                .max_interval_ms(0)
                .build(),
        );
        let id = enqueue_lesson(&pool, Uuid::new_v4(), 1).await?;

        // First attempt requeues, second exhausts the ceiling.
        drain_and_join(&worker).await?;
        drain_and_join(&worker).await?;

        let job = JobStore::new(pool).get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn hung_handlers_are_timed_out(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let store = JobStore::new(pool.clone());
        let queue = QueueClient::new(pool.clone());
        let events = EventPublisher::new(pool.clone());
        let coordinator = Coordinator::new(
            pool.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(NoopMailer),
        );
        let worker = Worker::new(
            store.clone(),
            queue,
            coordinator,
            registry_with(Behavior::Hang, runs),
            events,
            WorkerConfig::default()
                .with_concurrency(2)
                .with_handler_timeout(std::time::Duration::from_millis(50)),
        )
        .unwrap();

        let id = enqueue_lesson(&pool, Uuid::new_v4(), 5).await?;

        drain_and_join(&worker).await?;

        let job = store.get(id).await?.expect("job should exist");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 1);
        assert!(job
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("timed out")));

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn worker_survives_panicking_handler(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let store = JobStore::new(pool.clone());
        let queue = QueueClient::new(pool.clone());
        let events = EventPublisher::new(pool.clone());
        let coordinator = Coordinator::new(
            pool.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            Arc::new(NoopMailer),
        );
        // Concurrency of one forces the drain to join the panicked task
        // before it can claim the second job.
        let worker = Worker::new(
            store.clone(),
            queue,
            coordinator,
            registry_with(Behavior::Panic, runs.clone()),
            events,
            WorkerConfig::default().with_concurrency(1),
        )
        .unwrap();

        let tenant = Uuid::new_v4();
        let first = enqueue_lesson(&pool, tenant, 5).await?;
        let second = enqueue_lesson(&pool, tenant, 5).await?;

        drain_and_join(&worker).await?;

        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // A panic skips settlement entirely, so both jobs stay running for
        // the reconciler to pick up.
        for id in [first, second] {
            let job = store.get(id).await?.expect("job should exist");
            assert_eq!(job.status, JobStatus::Running);
        }

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn child_terminal_triggers_fan_in(pool: PgPool) -> Result {
        let runs = Arc::new(AtomicUsize::new(0));
        let worker = worker(&pool, registry_with(Behavior::Succeed, runs));
        let store = JobStore::new(pool.clone());

        let tenant = Uuid::new_v4();
        store
            .create(&pool, &NewJob::new(tenant, JobKind::OutlineGeneration, json!({})))
            .await?;
        let parent = store.next_queued().await?.expect("parent should be claimable");
        store
            .create(
                &pool,
                &NewJob::new(tenant, JobKind::LessonGeneration, json!({})).child_of(parent.id),
            )
            .await?;

        drain_and_join(&worker).await?;

        let parent = store.get(parent.id).await?.expect("parent should exist");
        assert_eq!(parent.status, JobStatus::Completed);

        Ok(())
    }
}
