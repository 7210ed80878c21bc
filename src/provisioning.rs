//! Paid-signup provisioning state.
//!
//! A signup that has paid but has no account yet is tracked as a
//! [`PendingProvisioning`] row, separate from the job that will provision it.
//! The row is the durable record of where the signup is in its lifecycle:
//!
//! ```text
//! awaiting_payment -> paid -> provisioning -> {provisioned, failed}
//! ```
//!
//! Payment webhooks address rows by checkout session and are idempotent:
//! replaying a `mark_paid` for an already-paid session changes nothing.
//! Claiming (`paid -> provisioning`) is an atomic guarded update so two
//! provisioning attempts can never both proceed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

pub(crate) type Result<T = ()> = std::result::Result<T, Error>;

/// Provisioning store errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned by the `sqlx` crate during database operations.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Indicates that the pending provisioning couldn't be found.
    #[error("Pending provisioning with ID {0} not found.")]
    NotFound(Uuid),
}

/// Lifecycle states of a pending provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "courseloom.provisioning_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    /// Checkout started; no payment confirmation yet.
    AwaitingPayment,

    /// Payment confirmed; a provisioning job should pick this up.
    Paid,

    /// A provisioning job has claimed this row.
    Provisioning,

    /// The account exists; terminal.
    Provisioned,

    /// Provisioning failed terminally; needs operator attention.
    Failed,
}

/// A signup between checkout and account creation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingProvisioning {
    /// Unique identifier; also scopes the eventual provisioning job.
    pub id: Uuid,

    /// Signup email.
    pub email: String,

    /// Pre-hashed password, ready to hand to the identity provider.
    pub password_hash: String,

    /// Purchased plan.
    pub plan: String,

    /// Current lifecycle state.
    pub status: ProvisioningStatus,

    /// External checkout session, unique per row.
    pub payment_session_id: String,

    /// Payment vendor's customer, recorded from the webhook.
    pub customer_id: Option<String>,

    /// Payment vendor's subscription, recorded from the webhook.
    pub subscription_id: Option<String>,

    /// Identity vendor's account, recorded once provisioned.
    pub identity_id: Option<String>,

    /// Error message of a terminal failure, if any.
    pub error_message: Option<String>,

    /// When an unpaid row becomes eligible for the TTL sweep.
    pub expires_at: DateTime<Utc>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last transition time; staleness is measured from here.
    pub updated_at: DateTime<Utc>,
}

/// Result of recording a payment webhook.
#[derive(Debug, Clone)]
pub struct PaymentConfirmation {
    /// The row in its state after the call.
    pub pending: PendingProvisioning,

    /// Whether this call performed the `awaiting_payment -> paid`
    /// transition. `false` means the webhook was a replay.
    pub newly_paid: bool,
}

/// Input for starting a checkout.
#[derive(Debug, Clone)]
pub struct NewPendingProvisioning {
    /// Signup email.
    pub email: String,

    /// Pre-hashed password; plaintext never reaches this layer.
    pub password_hash: String,

    /// Purchased plan.
    pub plan: String,

    /// External checkout session.
    pub payment_session_id: String,
}

/// How long an unpaid signup is kept before the TTL sweep removes it.
pub const UNPAID_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

const COLUMNS: &str = "id, email, password_hash, plan, status, payment_session_id, \
     customer_id, subscription_id, identity_id, error_message, \
     expires_at, created_at, updated_at";

/// Durable record of signups between checkout and account creation.
#[derive(Debug, Clone)]
pub struct ProvisioningStore {
    pool: PgPool,
}

impl ProvisioningStore {
    /// Creates a new store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Records a started checkout in the `awaiting_payment` state.
    #[instrument(name = "provisioning.create", skip_all, fields(provisioning.id = tracing::field::Empty), err)]
    pub async fn create(&self, new: &NewPendingProvisioning) -> Result<Uuid> {
        let id = Uuid::new_v4();
        tracing::Span::current().record("provisioning.id", id.to_string());

        let expires_at = Utc::now() + Duration::milliseconds(UNPAID_TTL.as_millis() as i64);

        sqlx::query(
            "insert into courseloom.pending_provisioning
                 (id, email, password_hash, plan, payment_session_id, expires_at)
             values ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(&new.plan)
        .bind(&new.payment_session_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    /// Fetches a pending provisioning by ID.
    pub async fn get(&self, id: Uuid) -> Result<Option<PendingProvisioning>> {
        let row = sqlx::query_as::<_, PendingProvisioning>(&format!(
            "select {COLUMNS} from courseloom.pending_provisioning where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Fetches a pending provisioning by its checkout session.
    pub async fn get_by_session(&self, session_id: &str) -> Result<Option<PendingProvisioning>> {
        let row = sqlx::query_as::<_, PendingProvisioning>(&format!(
            "select {COLUMNS} from courseloom.pending_provisioning
             where payment_session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Records a payment confirmation from the checkout webhook.
    ///
    /// Idempotent: only an `awaiting_payment` row transitions to `paid`;
    /// replayed webhooks for any later state change nothing. Returns the row
    /// in its state after the call, or `None` when the session is unknown.
    #[instrument(name = "provisioning.mark_paid", skip(self, customer_id, subscription_id), err)]
    pub async fn mark_paid(
        &self,
        session_id: &str,
        customer_id: &str,
        subscription_id: &str,
    ) -> Result<Option<PaymentConfirmation>> {
        let updated = sqlx::query_as::<_, PendingProvisioning>(&format!(
            "update courseloom.pending_provisioning
             set status = 'paid'::courseloom.provisioning_status,
                 customer_id = $2,
                 subscription_id = $3,
                 updated_at = now()
             where payment_session_id = $1
               and status = 'awaiting_payment'::courseloom.provisioning_status
             returning {COLUMNS}"
        ))
        .bind(session_id)
        .bind(customer_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(pending) => Ok(Some(PaymentConfirmation {
                pending,
                newly_paid: true,
            })),
            // Replayed webhook or unknown session; report current state.
            None => Ok(self
                .get_by_session(session_id)
                .await?
                .map(|pending| PaymentConfirmation {
                    pending,
                    newly_paid: false,
                })),
        }
    }

    /// Atomically claims a `paid` row for provisioning.
    ///
    /// Returns `None` when the row isn't in `paid`, which is how a
    /// re-delivered provisioning job detects that another attempt already
    /// claimed (or finished) the work.
    #[instrument(name = "provisioning.claim", skip(self), err)]
    pub async fn claim_paid(&self, id: Uuid) -> Result<Option<PendingProvisioning>> {
        let row = sqlx::query_as::<_, PendingProvisioning>(&format!(
            "update courseloom.pending_provisioning
             set status = 'provisioning'::courseloom.provisioning_status,
                 updated_at = now()
             where id = $1
               and status = 'paid'::courseloom.provisioning_status
             returning {COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Returns a `provisioning` row to `paid`.
    ///
    /// Used when a provisioning attempt fails transiently, so a retry can
    /// claim the row again.
    pub async fn release_claim(&self, id: Uuid) -> Result {
        sqlx::query(
            "update courseloom.pending_provisioning
             set status = 'paid'::courseloom.provisioning_status,
                 updated_at = now()
             where id = $1
               and status = 'provisioning'::courseloom.provisioning_status",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Marks a claimed row terminally provisioned.
    #[instrument(name = "provisioning.provisioned", skip(self, identity_id), err)]
    pub async fn mark_provisioned(&self, id: Uuid, identity_id: &str) -> Result {
        let result = sqlx::query(
            "update courseloom.pending_provisioning
             set status = 'provisioned'::courseloom.provisioning_status,
                 identity_id = $2,
                 updated_at = now()
             where id = $1
               and status = 'provisioning'::courseloom.provisioning_status",
        )
        .bind(id)
        .bind(identity_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id));
        }

        Ok(())
    }

    /// Marks a claimed row terminally failed.
    #[instrument(name = "provisioning.failed", skip(self, error), err)]
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result {
        let result = sqlx::query(
            "update courseloom.pending_provisioning
             set status = 'failed'::courseloom.provisioning_status,
                 error_message = $2,
                 updated_at = now()
             where id = $1
               and status = 'provisioning'::courseloom.provisioning_status",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(id));
        }

        Ok(())
    }

    /// Lists rows stuck in `paid` longer than the given age.
    ///
    /// These are signups whose provisioning job was lost; the reconciler
    /// re-enqueues them.
    pub async fn list_stuck_paid(
        &self,
        older_than: std::time::Duration,
    ) -> Result<Vec<PendingProvisioning>> {
        let cutoff = Utc::now()
            - Duration::milliseconds(older_than.as_millis().min(i64::MAX as u128) as i64);

        let rows = sqlx::query_as::<_, PendingProvisioning>(&format!(
            "select {COLUMNS} from courseloom.pending_provisioning
             where status = 'paid'::courseloom.provisioning_status
               and updated_at < $1
             order by updated_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Lists rows stuck in `provisioning` longer than the given age.
    ///
    /// These are claims whose worker died between claiming and the terminal
    /// write; the reconciler releases them so a fresh job can take the claim.
    pub async fn list_stuck_provisioning(
        &self,
        older_than: std::time::Duration,
    ) -> Result<Vec<PendingProvisioning>> {
        let cutoff = Utc::now()
            - Duration::milliseconds(older_than.as_millis().min(i64::MAX as u128) as i64);

        let rows = sqlx::query_as::<_, PendingProvisioning>(&format!(
            "select {COLUMNS} from courseloom.pending_provisioning
             where status = 'provisioning'::courseloom.provisioning_status
               and updated_at < $1
             order by updated_at"
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Deletes unpaid signups past their TTL, returning the count removed.
    ///
    /// Never touches rows that have paid; those hold money and must be
    /// resolved, not expired.
    #[instrument(name = "provisioning.sweep", skip(self), err)]
    pub async fn sweep_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "delete from courseloom.pending_provisioning
             where status = 'awaiting_payment'::courseloom.provisioning_status
               and expires_at < now()",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

/// Scheduled task that runs the unpaid-signup TTL sweep.
#[derive(Clone)]
pub struct ExpiredSignupSweep {
    store: ProvisioningStore,
}

impl ExpiredSignupSweep {
    /// Creates the sweep task over the given store.
    pub fn new(store: ProvisioningStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl crate::scheduler::ScheduledTask for ExpiredSignupSweep {
    fn name(&self) -> &'static str {
        "sweep-expired-signups"
    }

    async fn run_once(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let swept = self.store.sweep_expired().await?;
        if swept > 0 {
            tracing::info!(swept, "Removed expired unpaid signups");
        }
        Ok(())
    }
}
