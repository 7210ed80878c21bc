//! The request-facing API.
//!
//! [`JobClient`] is what the web tier calls: it enqueues jobs, records
//! checkout lifecycle transitions, and answers status queries. Enqueueing is
//! a durable insert followed by a best-effort wake; the insert alone is
//! enough for the job to run, the wake only shortens the wait.
//!
//! All reads are tenant-scoped. A caller can never observe another tenant's
//! jobs, not even by ID.

use serde_json::json;
use tracing::instrument;
use uuid::Uuid;

use crate::{
    events::{self, Event, EventPublisher, EventSubscriber},
    job::{Job, JobId, JobKind, Lane, NewJob},
    provisioning::{
        self, NewPendingProvisioning, PaymentConfirmation, PendingProvisioning, ProvisioningStore,
    },
    queue::QueueClient,
    store::{self, JobStore, StatusCounts},
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from the job store.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned from the provisioning store.
    #[error(transparent)]
    Provisioning(#[from] provisioning::Error),

    /// Error returned from the event layer.
    #[error(transparent)]
    Events(#[from] events::Error),

    /// Indicates that the job couldn't be found for this tenant.
    #[error("Job with ID {0} not found.")]
    JobNotFound(JobId),
}

/// Enqueues work and answers status queries for the web tier.
#[derive(Debug, Clone)]
pub struct JobClient {
    store: JobStore,
    queue: QueueClient,
    provisioning: ProvisioningStore,
    events: EventPublisher,
}

impl JobClient {
    /// Creates a new client.
    pub fn new(
        store: JobStore,
        queue: QueueClient,
        provisioning: ProvisioningStore,
        events: EventPublisher,
    ) -> Self {
        Self {
            store,
            queue,
            provisioning,
            events,
        }
    }

    /// Enqueues full course generation: one outline job which fans out into
    /// per-lesson jobs once the outline exists.
    #[instrument(skip(self), err)]
    pub async fn enqueue_course_generation(
        &self,
        tenant_id: Uuid,
        course_id: Uuid,
    ) -> Result<JobId> {
        self.enqueue(NewJob::new(
            tenant_id,
            JobKind::OutlineGeneration,
            json!({ "course_id": course_id }),
        ))
        .await
    }

    /// Enqueues regeneration of a single lesson.
    #[instrument(skip(self), err)]
    pub async fn enqueue_lesson_generation(
        &self,
        tenant_id: Uuid,
        lesson_id: Uuid,
    ) -> Result<JobId> {
        self.enqueue(NewJob::new(
            tenant_id,
            JobKind::LessonGeneration,
            json!({ "lesson_id": lesson_id }),
        ))
        .await
    }

    /// Enqueues ingestion of an uploaded subject-matter document.
    #[instrument(skip(self), err)]
    pub async fn enqueue_document_ingestion(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<JobId> {
        self.enqueue(NewJob::new(
            tenant_id,
            JobKind::DocumentIngestion,
            json!({ "document_id": document_id }),
        ))
        .await
    }

    /// Enqueues an arbitrary job.
    ///
    /// The typed `enqueue_*` methods cover the common cases; this is the
    /// escape hatch for callers that build their own [`NewJob`].
    pub async fn enqueue(&self, new_job: NewJob) -> Result<JobId> {
        let lane = new_job.lane;
        let kind = new_job.kind;
        let tenant_id = new_job.tenant_id;
        let id = self.store.create(self.store.pool(), &new_job).await?;
        self.queue.wake(lane).await;
        self.events
            .publish(&Event::JobCreated {
                tenant_id,
                job_id: id,
                kind,
            })
            .await;
        Ok(id)
    }

    /// Subscribes to a tenant's event stream.
    ///
    /// Checkout flows pass the pending provisioning ID instead; that row's
    /// ID is the tenant scope until the tenant exists.
    pub async fn subscribe(&self, scope: Uuid) -> Result<EventSubscriber> {
        Ok(EventSubscriber::connect(self.store.pool(), scope).await?)
    }

    /// Records a started checkout.
    pub async fn start_checkout(&self, new: &NewPendingProvisioning) -> Result<Uuid> {
        Ok(self.provisioning.create(new).await?)
    }

    /// Records a payment confirmation webhook and, the first time the
    /// session is confirmed, enqueues the provisioning job.
    ///
    /// Returns `None` for an unknown session. Replayed webhooks change
    /// nothing and enqueue nothing; the reconciler re-enqueues if the first
    /// job is ever lost.
    #[instrument(skip(self, customer_id, subscription_id), err)]
    pub async fn confirm_payment(
        &self,
        session_id: &str,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<PaymentConfirmation>> {
        let Some(confirmation) = self
            .provisioning
            .mark_paid(session_id, customer_id, subscription_id)
            .await?
        else {
            return Ok(None);
        };

        if confirmation.newly_paid {
            // Provisioning jobs pre-date the tenant they create; the row ID
            // stands in as the tenant scope.
            self.enqueue(NewJob::new(
                confirmation.pending.id,
                JobKind::AccountProvisioning,
                json!({ "pending_provisioning_id": confirmation.pending.id }),
            ))
            .await?;
        }

        Ok(Some(confirmation))
    }

    /// Fetches a tenant's job.
    pub async fn job_status(&self, tenant_id: Uuid, id: JobId) -> Result<Job> {
        self.store
            .get_for_tenant(tenant_id, id)
            .await?
            .ok_or(Error::JobNotFound(id))
    }

    /// Lists the children of a tenant's fan-out job.
    pub async fn child_jobs(&self, tenant_id: Uuid, parent_id: JobId) -> Result<Vec<Job>> {
        // Scope check on the parent first.
        self.job_status(tenant_id, parent_id).await?;
        Ok(self.store.list_by_parent(parent_id).await?)
    }

    /// Fetches a pending provisioning by checkout session.
    pub async fn checkout_status(&self, session_id: &str) -> Result<Option<PendingProvisioning>> {
        Ok(self.provisioning.get_by_session(session_id).await?)
    }

    /// Operator-driven re-enqueue of a terminally failed job.
    ///
    /// Returns `false` when the job isn't in a failed state.
    #[instrument(skip(self), err)]
    pub async fn requeue(&self, id: JobId) -> Result<bool> {
        let requeued = self.store.requeue(id).await?;
        if requeued {
            if let Some(job) = self.store.get(id).await? {
                self.queue.wake(Lane::for_kind(job.kind)).await;
            }
        }
        Ok(requeued)
    }

    /// Per-status job counts, for dashboards.
    pub async fn counts(&self) -> Result<StatusCounts> {
        Ok(self.store.counts().await?)
    }
}
