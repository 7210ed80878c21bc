//! # Courseloom Jobs
//!
//! Durable background job orchestration for the Courseloom platform, backed
//! by Postgres.
//!
//! Every piece of deferred work (AI course generation, document ingestion,
//! paid-account provisioning) runs as a [`Job`]: a durable row that is
//! claimed with `FOR UPDATE SKIP LOCKED`, executed by a registered handler,
//! retried with exponential backoff on transient failure, and observable by
//! the tenant that enqueued it. `LISTEN`/`NOTIFY` lanes wake workers with
//! low latency, while an interval poll of the store guarantees nothing is
//! lost when a notification is dropped.
//!
//! The moving parts:
//!
//! - [`JobClient`]: what the web tier calls to enqueue work, record checkout
//!   transitions, and answer status queries.
//! - [`Worker`]: claims and executes jobs through a [`Registry`] of
//!   [`JobHandler`]s, bounded to a fixed concurrency per replica.
//! - [`Coordinator`]: links fan-out parents to their children and finalizes
//!   a parent exactly once when the last child finishes.
//! - [`Scheduler`]: runs named periodic tasks, each led by one replica at a
//!   time via a Postgres advisory lock; the [`Reconciler`] (re-enqueues
//!   stranded work, raises graduated alerts) and the expired-signup sweep
//!   run this way.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::env;
//!
//! use courseloom_jobs::{EventPublisher, JobClient, JobStore, ProvisioningStore, QueueClient};
//! use sqlx::PgPool;
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let database_url = &env::var("DATABASE_URL").expect("DATABASE_URL should be set");
//! let pool = PgPool::connect(database_url).await?;
//!
//! // Run migrations.
//! courseloom_jobs::MIGRATOR.run(&pool).await?;
//!
//! let client = JobClient::new(
//!     JobStore::new(pool.clone()),
//!     QueueClient::new(pool.clone()),
//!     ProvisioningStore::new(pool.clone()),
//!     EventPublisher::new(pool.clone()),
//! );
//!
//! // Kick off full course generation for a tenant.
//! let tenant_id = Uuid::new_v4();
//! let course_id = Uuid::new_v4();
//! let job_id = client.enqueue_course_generation(tenant_id, course_id).await?;
//!
//! // Later: poll status from a request handler.
//! let job = client.job_status(tenant_id, job_id).await?;
//! println!("{:?} {}%", job.status, job.progress_percent);
//! # Ok(())
//! # }
//! ```
//!
//! Workers, the scheduler, and handler wiring live in the binary that embeds
//! this crate; see [`worker`] and [`scheduler`] for details.

#![warn(clippy::all, nonstandard_style, future_incompatible, missing_docs)]

use sqlx::migrate::Migrator;

pub use crate::{
    client::JobClient,
    coordinator::Coordinator,
    events::{Event, EventPublisher, EventSubscriber},
    handler::{Context, HandlerError, JobHandler, Outcome, Registry},
    job::{Job, JobId, JobKind, JobStatus, Lane, NewJob, RetryPolicy},
    provisioning::{PendingProvisioning, ProvisioningStatus, ProvisioningStore},
    queue::{graceful_shutdown, QueueClient},
    reconciler::Reconciler,
    scheduler::{ScheduledTask, Scheduler},
    store::JobStore,
    worker::{Worker, WorkerConfig},
};

pub mod client;
pub mod coordinator;
pub mod events;
pub mod handler;
pub mod handlers;
pub mod job;
pub mod providers;
pub mod provisioning;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod store;
pub mod worker;

/// A SQLx [`Migrator`] which provides this crate's schema migrations.
///
/// These migrations must be applied before any store, worker, or scheduler
/// can be used.
///
/// **Note**: Changes are managed within a dedicated schema, called
/// "courseloom".
pub static MIGRATOR: Migrator = sqlx::migrate!();
