//! Cross-replica domain events.
//!
//! The orchestration layer announces notable transitions over `pg_notify` on
//! per-tenant channels, so any web replica can stream updates to its
//! connected clients regardless of which worker replica did the work.
//!
//! Publication is fire-and-forget: a failed or dropped notification is
//! logged and swallowed, never affecting job processing. The job row remains
//! the record of truth a client can always re-query, so a missed event costs
//! staleness, not correctness.

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgListener, PgPool};
use uuid::Uuid;

use crate::job::{JobId, JobKind};

type Result<T = ()> = std::result::Result<T, Error>;

/// Event subscription errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Error returned by the `serde_json` crate when deserializing an event
    /// payload.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A domain event emitted by the orchestration layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job was enqueued.
    JobCreated {
        tenant_id: Uuid,
        job_id: JobId,
        kind: JobKind,
    },

    /// A handler reported progress.
    JobProgress {
        tenant_id: Uuid,
        job_id: JobId,
        percent: i32,
        message: Option<String>,
    },

    /// A job reached `completed`.
    JobCompleted {
        tenant_id: Uuid,
        job_id: JobId,
        kind: JobKind,
        result_path: Option<String>,
    },

    /// A job attempt failed.
    JobFailed {
        tenant_id: Uuid,
        job_id: JobId,
        kind: JobKind,
        error: String,
        /// Whether the job was re-enqueued for another attempt.
        will_retry: bool,
    },

    /// A fan-out parent was finalized from its children.
    CourseGenerationFinished {
        tenant_id: Uuid,
        parent_id: JobId,
        succeeded: bool,
        completed_lessons: i64,
        failed_lessons: i64,
        tokens_used: i64,
    },

    /// A paid signup finished provisioning.
    AccountProvisioned {
        provisioning_id: Uuid,
        tenant_id: Uuid,
        identity_id: String,
    },
}

impl Event {
    /// The scope whose channel carries this event.
    ///
    /// Usually the owning tenant. Provisioning events scope to the pending
    /// row instead: the checkout flow subscribes before the tenant exists,
    /// and the row ID is also the tenant scope of the provisioning job.
    pub fn scope(&self) -> Uuid {
        match self {
            Event::JobCreated { tenant_id, .. }
            | Event::JobProgress { tenant_id, .. }
            | Event::JobCompleted { tenant_id, .. }
            | Event::JobFailed { tenant_id, .. }
            | Event::CourseGenerationFinished { tenant_id, .. } => *tenant_id,
            Event::AccountProvisioned {
                provisioning_id, ..
            } => *provisioning_id,
        }
    }
}

fn scope_channel(scope: Uuid) -> String {
    format!("courseloom_events_{}", scope.simple())
}

/// Publishes [`Event`]s over per-scope `pg_notify` channels.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    pool: PgPool,
}

impl EventPublisher {
    /// Creates a publisher over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Publishes an event to its scope's channel.
    ///
    /// Never fails; errors are logged and swallowed.
    pub async fn publish(&self, event: &Event) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "Failed to serialize event");
                return;
            }
        };

        if let Err(err) = sqlx::query("select pg_notify($1, $2)")
            .bind(scope_channel(event.scope()))
            .bind(payload)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(%err, "Failed to publish event");
        }
    }
}

/// A subscription to one scope's events.
pub struct EventSubscriber {
    listener: PgListener,
}

impl EventSubscriber {
    /// Connects a subscription for the given scope.
    pub async fn connect(pool: &PgPool, scope: Uuid) -> Result<Self> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(&scope_channel(scope)).await?;
        Ok(Self { listener })
    }

    /// Waits for the next event.
    ///
    /// Errors indicate a lost connection; reconnect and re-query the store
    /// for anything missed in between.
    pub async fn recv(&mut self) -> Result<Event> {
        let notification = self.listener.recv().await?;
        Ok(serde_json::from_str(notification.payload())?)
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;

    use super::*;

    async fn recv_soon(subscriber: &mut EventSubscriber) -> Event {
        tokio::time::timeout(std::time::Duration::from_secs(5), subscriber.recv())
            .await
            .expect("event should arrive")
            .expect("event should decode")
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn events_reach_their_scope(pool: PgPool) -> Result {
        let publisher = EventPublisher::new(pool.clone());
        let tenant = Uuid::new_v4();
        let mut subscriber = EventSubscriber::connect(&pool, tenant).await?;

        let job_id = JobId::new();
        publisher
            .publish(&Event::JobCompleted {
                tenant_id: tenant,
                job_id,
                kind: JobKind::LessonGeneration,
                result_path: Some("results/out.json".into()),
            })
            .await;

        let event = recv_soon(&mut subscriber).await;
        assert!(matches!(
            event,
            Event::JobCompleted { job_id: id, .. } if id == job_id
        ));

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn other_scopes_hear_nothing(pool: PgPool) -> Result {
        let publisher = EventPublisher::new(pool.clone());
        let mut other = EventSubscriber::connect(&pool, Uuid::new_v4()).await?;

        publisher
            .publish(&Event::JobCreated {
                tenant_id: Uuid::new_v4(),
                job_id: JobId::new(),
                kind: JobKind::DocumentIngestion,
            })
            .await;

        let silence =
            tokio::time::timeout(std::time::Duration::from_millis(250), other.recv()).await;
        assert!(silence.is_err());

        Ok(())
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn provisioning_events_scope_to_the_pending_row(pool: PgPool) -> Result {
        let publisher = EventPublisher::new(pool.clone());
        let provisioning_id = Uuid::new_v4();
        let mut subscriber = EventSubscriber::connect(&pool, provisioning_id).await?;

        publisher
            .publish(&Event::AccountProvisioned {
                provisioning_id,
                tenant_id: Uuid::new_v4(),
                identity_id: "idn_1".into(),
            })
            .await;

        let event = recv_soon(&mut subscriber).await;
        assert!(matches!(event, Event::AccountProvisioned { .. }));

        Ok(())
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let event = Event::JobFailed {
            tenant_id: Uuid::new_v4(),
            job_id: JobId::new(),
            kind: JobKind::DocumentIngestion,
            error: "provider timeout".into(),
            will_retry: true,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job_failed");
        assert_eq!(json["kind"], "document_ingestion");
        assert_eq!(json["will_retry"], true);
    }
}
