//! Paid-account provisioning.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    events::{Event, EventPublisher},
    handler::{Context, HandlerError, JobHandler, Outcome},
    job::{Job, JobKind},
    providers::{IdentityProvider, Mailer},
    provisioning::{ProvisioningStatus, ProvisioningStore},
};

#[derive(Debug, Deserialize)]
struct ProvisionPayload {
    pending_provisioning_id: Uuid,
}

/// Creates the account for a paid signup.
///
/// Exactly-once behavior rests on the store's atomic `paid -> provisioning`
/// claim: a re-delivered or duplicate job finds the row already claimed (or
/// terminal) and no-ops. A transient identity failure releases the claim so
/// the retry can take it again; money has changed hands, so nothing on this
/// path is allowed to silently drop the signup.
pub struct ProvisionAccountHandler {
    provisioning: ProvisioningStore,
    identity: Arc<dyn IdentityProvider>,
    mailer: Arc<dyn Mailer>,
    events: EventPublisher,
}

impl ProvisionAccountHandler {
    pub fn new(
        provisioning: ProvisioningStore,
        identity: Arc<dyn IdentityProvider>,
        mailer: Arc<dyn Mailer>,
        events: EventPublisher,
    ) -> Self {
        Self {
            provisioning,
            identity,
            mailer,
            events,
        }
    }
}

#[async_trait]
impl JobHandler for ProvisionAccountHandler {
    fn kind(&self) -> JobKind {
        JobKind::AccountProvisioning
    }

    async fn run(&self, job: &Job, ctx: &Context) -> Result<Outcome, HandlerError> {
        let payload: ProvisionPayload =
            serde_json::from_value(job.payload.clone()).map_err(HandlerError::fatal)?;
        let id = payload.pending_provisioning_id;

        let pending = self
            .provisioning
            .get(id)
            .await
            .map_err(HandlerError::retryable)?
            .ok_or_else(|| HandlerError::fatal(format!("unknown pending provisioning {id}")))?;

        let Some(claimed) = self
            .provisioning
            .claim_paid(id)
            .await
            .map_err(HandlerError::retryable)?
        else {
            return match pending.status {
                // Another delivery already claimed or finished the work.
                ProvisioningStatus::Provisioning | ProvisioningStatus::Provisioned => {
                    tracing::info!(provisioning.id = %id, "Signup already claimed, nothing to do");
                    Ok(Outcome::done())
                }
                ProvisioningStatus::Failed => Err(HandlerError::fatal(
                    "signup already failed terminally; needs operator review",
                )),
                ProvisioningStatus::AwaitingPayment => Err(HandlerError::fatal(
                    "signup has not paid; refusing to provision",
                )),
                // Claim raced between our read and update; retry re-reads.
                ProvisioningStatus::Paid => {
                    Err(HandlerError::retryable("claim raced, retrying"))
                }
            };
        };

        ctx.progress(25, "Creating account").await;

        let identity = match self
            .identity
            .create_account(&claimed.email, &claimed.password_hash, &claimed.plan)
            .await
        {
            Ok(identity) => identity,
            Err(err) => {
                let handler_err = HandlerError::from(err);
                if handler_err.is_retryable() {
                    // Give the retry a claimable row again.
                    self.provisioning
                        .release_claim(id)
                        .await
                        .map_err(HandlerError::retryable)?;
                } else {
                    self.provisioning
                        .mark_failed(id, &handler_err.to_string())
                        .await
                        .map_err(HandlerError::retryable)?;
                }
                return Err(handler_err);
            }
        };

        self.provisioning
            .mark_provisioned(id, &identity.identity_id)
            .await
            .map_err(HandlerError::retryable)?;

        ctx.progress(90, "Account created").await;

        self.events
            .publish(&Event::AccountProvisioned {
                provisioning_id: id,
                tenant_id: identity.tenant_id,
                identity_id: identity.identity_id.clone(),
            })
            .await;

        // Welcome email is best-effort; the account exists either way.
        if let Err(err) = self.mailer.send_welcome(&claimed.email).await {
            tracing::warn!(%err, provisioning.id = %id, "Failed to send welcome email");
        }

        Ok(Outcome::done())
    }
}
