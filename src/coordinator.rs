//! Fan-out/fan-in coordination.
//!
//! A compound request runs as one parent job whose handler fans out into
//! independent child jobs. The parent stays `running` while its children
//! execute; after every child terminal transition the worker calls back into
//! the coordinator, which asks the store to finalize the parent. The store's
//! row lock guarantees exactly one of those calls wins, so the finished
//! notification and email fire at most once no matter how many children
//! complete simultaneously on different replicas.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::instrument;

use crate::{
    events::{Event, EventPublisher},
    job::{Job, JobId, JobStatus, NewJob},
    providers::Mailer,
    queue::QueueClient,
    store::{self, JobStore},
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Coordinator errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from the job store.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Links parent and child jobs and finalizes parents from child outcomes.
#[derive(Clone)]
pub struct Coordinator {
    pool: PgPool,
    store: JobStore,
    queue: QueueClient,
    events: EventPublisher,
    mailer: Arc<dyn Mailer>,
}

impl Coordinator {
    /// Creates a new coordinator.
    pub fn new(
        pool: PgPool,
        store: JobStore,
        queue: QueueClient,
        events: EventPublisher,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            pool,
            store,
            queue,
            events,
            mailer,
        }
    }

    /// Creates child jobs under a running parent and wakes workers.
    ///
    /// All children are inserted in one transaction, so a crash mid-fan-out
    /// leaves either no children or all of them. An empty fan-out finalizes
    /// the parent immediately; there are no children to ever trigger fan-in.
    #[instrument(
        name = "coordinator.fan_out",
        skip(self, children),
        fields(job.id = %parent.id, children = children.len()),
        err
    )]
    pub async fn fan_out(&self, parent: &Job, children: Vec<NewJob>) -> Result<Vec<JobId>> {
        if children.is_empty() {
            self.finalize(parent.id).await?;
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(children.len());
        let mut lanes = Vec::new();
        for child in &children {
            let child = child.clone().child_of(parent.id);
            ids.push(self.store.create(&mut *tx, &child).await?);
            if !lanes.contains(&child.lane) {
                lanes.push(child.lane);
            }
        }
        tx.commit().await?;

        for lane in lanes {
            self.queue.wake(lane).await;
        }

        Ok(ids)
    }

    /// Reacts to a child reaching a terminal state.
    ///
    /// No-op for jobs without a parent.
    #[instrument(name = "coordinator.fan_in", skip(self, child), fields(job.id = %child.id), err)]
    pub async fn on_child_terminal(&self, child: &Job) -> Result {
        let Some(parent_id) = child.parent_id else {
            return Ok(());
        };

        self.finalize(parent_id).await
    }

    async fn finalize(&self, parent_id: JobId) -> Result {
        let report = self.store.try_finalize_parent(parent_id).await?;

        if !report.finalized {
            return Ok(());
        }

        // Only the winning finalizer reaches this point, so the finished
        // notifications fire at most once per parent.
        let Some(parent) = self.store.get(parent_id).await? else {
            return Ok(());
        };

        tracing::info!(
            job.id = %parent_id,
            status = ?report.parent_status,
            completed = report.completed_children,
            failed = report.failed_children,
            tokens = report.total_tokens,
            "Parent job finalized"
        );

        let succeeded = report.parent_status == JobStatus::Completed;
        self.events
            .publish(&Event::CourseGenerationFinished {
                tenant_id: parent.tenant_id,
                parent_id,
                succeeded,
                completed_lessons: report.completed_children,
                failed_lessons: report.failed_children,
                tokens_used: report.total_tokens,
            })
            .await;

        // Completion email is best-effort.
        if let Err(err) = self.mailer.send_course_ready(parent.tenant_id, succeeded).await {
            tracing::warn!(%err, job.id = %parent_id, "Failed to send course-ready email");
        }

        Ok(())
    }
}
