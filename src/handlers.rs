//! Business handlers, one per job kind.
//!
//! Handlers hold their external dependencies behind the seams in
//! [`providers`](crate::providers) and parse their payloads as
//! identifier-only structs. Payload parse failures are fatal: a malformed
//! payload will never become well-formed by retrying.

pub mod ingest;
pub mod lesson;
pub mod outline;
pub mod provision;

pub use ingest::IngestDocumentHandler;
pub use lesson::GenerateLessonHandler;
pub use outline::GenerateOutlineHandler;
pub use provision::ProvisionAccountHandler;
