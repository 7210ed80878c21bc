//! Reconciliation of stuck work.
//!
//! Workers can crash between claiming a job and settling it, and payment
//! webhooks can land while no worker is listening. The reconciler is the
//! periodic backstop: it scans for rows that have sat in an in-between state
//! too long, re-enqueues the ones that are safe to re-drive, and raises
//! graduated alerts for the ones that need a human.
//!
//! Alerting is graduated by age: past [`WARNING_AFTER`] a row gets a warning,
//! past [`CRITICAL_AFTER`] a critical instead. Each pass reports a row at one
//! severity, never both.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::instrument;

use crate::{
    job::{JobKind, Lane, NewJob},
    provisioning::{self, PendingProvisioning, ProvisioningStore},
    queue::QueueClient,
    store::{self, JobStore},
};

type Result<T = ()> = std::result::Result<T, Error>;

/// Reconciler errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned from the job store.
    #[error(transparent)]
    Store(#[from] store::Error),

    /// Error returned from the provisioning store.
    #[error(transparent)]
    Provisioning(#[from] provisioning::Error),
}

/// Age after which a stuck row raises a warning.
pub const WARNING_AFTER: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Age after which a stuck row raises a critical alert instead.
pub const CRITICAL_AFTER: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Alert severity, graduated by how long a row has been stuck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Worth a look during working hours.
    Warning,

    /// Needs attention now.
    Critical,
}

/// Destination for operational alerts.
///
/// Delivery is best-effort: failures are logged and never fail the
/// reconciliation pass.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, severity: Severity, message: &str) -> std::result::Result<(), String>;
}

/// Default sink that writes alerts to the log.
#[derive(Debug, Default, Clone)]
pub struct LogAlerts;

#[async_trait]
impl AlertSink for LogAlerts {
    async fn alert(&self, severity: Severity, message: &str) -> std::result::Result<(), String> {
        match severity {
            Severity::Warning => tracing::warn!(alert = true, "{message}"),
            Severity::Critical => tracing::error!(alert = true, "{message}"),
        }
        Ok(())
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stuck running jobs that raised a warning.
    pub job_warnings: usize,

    /// Stuck running jobs that raised a critical alert.
    pub job_criticals: usize,

    /// Paid signups re-enqueued for provisioning.
    pub reenqueued_provisionings: usize,

    /// Orphaned provisioning claims released back to `paid`.
    pub released_claims: usize,
}

/// Periodic scan for stuck jobs and stranded signups.
#[derive(Clone)]
pub struct Reconciler {
    store: JobStore,
    provisioning: ProvisioningStore,
    queue: QueueClient,
    alerts: Arc<dyn AlertSink>,
}

impl Reconciler {
    /// Creates a new reconciler.
    pub fn new(
        store: JobStore,
        provisioning: ProvisioningStore,
        queue: QueueClient,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            provisioning,
            queue,
            alerts,
        }
    }

    /// Runs one full reconciliation pass.
    #[instrument(name = "reconciler.run", skip(self), err)]
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        self.alert_stuck_jobs(&mut report).await?;
        self.recover_stuck_provisionings(&mut report).await?;
        self.recover_orphaned_claims(&mut report).await?;

        if report != ReconcileReport::default() {
            tracing::info!(?report, "Reconciliation pass found work");
        }

        Ok(report)
    }

    /// Alerts on jobs stuck in `running` past the thresholds.
    ///
    /// Running jobs are never force-failed here: the worker may still be
    /// executing, and a duplicate terminal write would race it. Operators
    /// decide via [`JobStore::requeue`] once they've confirmed the worker is
    /// gone.
    async fn alert_stuck_jobs(&self, report: &mut ReconcileReport) -> Result {
        let now = Utc::now();
        for job in self.store.list_stuck_running(WARNING_AFTER).await? {
            let age = age_since(now, job.started_at.unwrap_or(job.created_at));

            let severity = grade(age);
            match severity {
                Severity::Warning => report.job_warnings += 1,
                Severity::Critical => report.job_criticals += 1,
            }

            self.send_alert(
                severity,
                &format!(
                    "Job {} ({:?}) has been running for {} minutes without completing",
                    job.id,
                    job.kind,
                    age.as_secs() / 60
                ),
            )
            .await;
        }

        Ok(())
    }

    /// Re-enqueues provisioning jobs for signups stuck in `paid`.
    ///
    /// Safe to over-deliver: the provisioning handler's atomic claim means a
    /// duplicate job finds the row already claimed and no-ops.
    async fn recover_stuck_provisionings(&self, report: &mut ReconcileReport) -> Result {
        let now = Utc::now();
        for pending in self.provisioning.list_stuck_paid(WARNING_AFTER).await? {
            self.reenqueue_provisioning(&pending).await?;
            report.reenqueued_provisionings += 1;

            self.send_alert(
                grade(age_since(now, pending.updated_at)),
                &format!(
                    "Paid signup {} was never provisioned; re-enqueued",
                    pending.id
                ),
            )
            .await;
        }

        Ok(())
    }

    /// Releases provisioning claims whose worker died mid-provisioning.
    ///
    /// A claim is only meaningful while its worker lives; a crash between
    /// `claim_paid` and the terminal write strands the row in `provisioning`
    /// with no owner, and a re-delivered job sees what looks like an active
    /// claim. Releasing the claim and re-enqueueing lets the next attempt
    /// take it. A worker that is merely slow loses its claim here, but its
    /// late terminal write is guarded on the claimed status and fails into a
    /// retry, which re-claims; money has changed hands, so these rows are
    /// alerted at the same graduated thresholds as stuck jobs.
    async fn recover_orphaned_claims(&self, report: &mut ReconcileReport) -> Result {
        let now = Utc::now();
        for pending in self
            .provisioning
            .list_stuck_provisioning(WARNING_AFTER)
            .await?
        {
            self.provisioning.release_claim(pending.id).await?;
            self.reenqueue_provisioning(&pending).await?;
            report.released_claims += 1;

            self.send_alert(
                grade(age_since(now, pending.updated_at)),
                &format!(
                    "Provisioning of paid signup {} stalled mid-claim; claim released and re-enqueued",
                    pending.id
                ),
            )
            .await;
        }

        Ok(())
    }

    async fn reenqueue_provisioning(&self, pending: &PendingProvisioning) -> Result {
        // Provisioning jobs pre-date the tenant they create; the row ID
        // stands in as the tenant scope.
        let new_job = NewJob::new(
            pending.id,
            JobKind::AccountProvisioning,
            json!({ "pending_provisioning_id": pending.id }),
        );
        self.store.create(self.store.pool(), &new_job).await?;
        self.queue.wake(Lane::Critical).await;

        Ok(())
    }

    async fn send_alert(&self, severity: Severity, message: &str) {
        if let Err(err) = self.alerts.alert(severity, message).await {
            tracing::warn!(%err, "Failed to deliver alert");
        }
    }
}

/// Grades a stuck row's age into exactly one severity bucket.
fn grade(age: std::time::Duration) -> Severity {
    if age >= CRITICAL_AFTER {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

fn age_since(now: DateTime<Utc>, then: DateTime<Utc>) -> std::time::Duration {
    (now - then).to_std().unwrap_or(std::time::Duration::ZERO)
}

#[async_trait]
impl crate::scheduler::ScheduledTask for Reconciler {
    fn name(&self) -> &'static str {
        "reconcile-stuck-work"
    }

    async fn run_once(&self) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Reconciler::run_once(self).await?;
        Ok(())
    }
}
