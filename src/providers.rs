//! External service seams.
//!
//! Handlers never talk to AI, identity, or email vendors directly; they go
//! through these traits so the worker loop stays testable and vendor swaps
//! don't touch orchestration code. Implementations live in the host
//! application.

use async_trait::async_trait;
use uuid::Uuid;

use crate::handler::HandlerError;

/// A type alias for provider results.
pub type Result<T = ()> = std::result::Result<T, Error>;

/// Provider errors, classified for the retry loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transient vendor failure: timeout, rate limit, 5xx.
    #[error("{0}")]
    Transient(String),

    /// A permanent failure: invalid input, missing entity, rejected request.
    #[error("{0}")]
    Permanent(String),
}

impl Error {
    /// Wraps an error as transient.
    pub fn transient(err: impl std::fmt::Display) -> Self {
        Self::Transient(err.to_string())
    }

    /// Wraps an error as permanent.
    pub fn permanent(err: impl std::fmt::Display) -> Self {
        Self::Permanent(err.to_string())
    }
}

impl From<Error> for HandlerError {
    fn from(err: Error) -> Self {
        match err {
            Error::Transient(msg) => HandlerError::Retryable(msg),
            Error::Permanent(msg) => HandlerError::Fatal(msg),
        }
    }
}

/// A generated course outline.
#[derive(Debug, Clone)]
pub struct GeneratedOutline {
    /// Identifiers of the lessons the outline created, in course order.
    /// Fan-out creates one child job per entry.
    pub lesson_ids: Vec<Uuid>,

    /// Object-storage path of the stored outline.
    pub result_path: String,

    /// Provider tokens consumed.
    pub tokens: i64,
}

/// A generated lesson body.
#[derive(Debug, Clone)]
pub struct GeneratedLesson {
    /// Object-storage path of the stored lesson content.
    pub result_path: String,

    /// Provider tokens consumed.
    pub tokens: i64,
}

/// The result of ingesting an uploaded subject-matter document.
#[derive(Debug, Clone)]
pub struct IngestedDocument {
    /// Object-storage path of the stored summary and chunk index.
    pub result_path: String,

    /// Number of retrieval chunks produced.
    pub chunk_count: i64,

    /// Provider tokens consumed.
    pub tokens: i64,
}

/// AI content generation.
///
/// Calls are addressed by entity identifiers; the provider fetches current
/// entity state itself, which keeps re-execution after a crash idempotent.
/// Implementations must overwrite any partial prior output for the same
/// entity rather than appending.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Generates and stores a course outline, creating its lesson stubs.
    async fn generate_outline(&self, tenant_id: Uuid, course_id: Uuid)
        -> Result<GeneratedOutline>;

    /// Generates and stores the content of one lesson.
    async fn generate_lesson(&self, tenant_id: Uuid, lesson_id: Uuid) -> Result<GeneratedLesson>;

    /// Summarizes and chunks one uploaded document.
    async fn ingest_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<IngestedDocument>;
}

/// A provisioned login identity.
#[derive(Debug, Clone)]
pub struct ProvisionedIdentity {
    /// Vendor-assigned identity ID.
    pub identity_id: String,

    /// The tenant created for the new account.
    pub tenant_id: Uuid,
}

/// Account identity management.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Creates a login identity and tenant for a paid signup.
    ///
    /// Must be idempotent on `email`: re-provisioning an email that already
    /// has an identity returns the existing identity instead of failing.
    async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        plan: &str,
    ) -> Result<ProvisionedIdentity>;
}

/// Transactional email.
///
/// All sends are best-effort; callers log failures and move on.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Sends the post-provisioning welcome email.
    async fn send_welcome(&self, email: &str) -> Result;

    /// Notifies a tenant's owner that course generation finished.
    ///
    /// The implementation resolves the tenant to its notification address.
    async fn send_course_ready(&self, tenant_id: Uuid, succeeded: bool) -> Result;
}

/// A [`Mailer`] that sends nothing.
///
/// For deployments without email configured, and for tests.
#[derive(Debug, Default, Clone)]
pub struct NoopMailer;

#[async_trait]
impl Mailer for NoopMailer {
    async fn send_welcome(&self, _email: &str) -> Result {
        Ok(())
    }

    async fn send_course_ready(&self, _tenant_id: Uuid, _succeeded: bool) -> Result {
        Ok(())
    }
}
