//! Subject-matter document ingestion.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    handler::{Context, HandlerError, JobHandler, Outcome},
    job::{Job, JobKind},
    providers::ContentProvider,
};

#[derive(Debug, Deserialize)]
struct IngestPayload {
    document_id: Uuid,
}

/// Summarizes and chunks an uploaded document for retrieval.
///
/// Runs on the low-priority lane; ingestion is batchable and must never
/// starve interactive generation work. The provider replaces any prior
/// summary and chunks for the document, so re-delivery is safe.
pub struct IngestDocumentHandler {
    content: Arc<dyn ContentProvider>,
}

impl IngestDocumentHandler {
    pub fn new(content: Arc<dyn ContentProvider>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl JobHandler for IngestDocumentHandler {
    fn kind(&self) -> JobKind {
        JobKind::DocumentIngestion
    }

    async fn run(&self, job: &Job, ctx: &Context) -> Result<Outcome, HandlerError> {
        let payload: IngestPayload =
            serde_json::from_value(job.payload.clone()).map_err(HandlerError::fatal)?;

        ctx.progress(10, "Summarizing document").await;

        let ingested = self
            .content
            .ingest_document(job.tenant_id, payload.document_id)
            .await?;

        ctx.record_tokens(ingested.tokens).await;
        ctx.progress(90, &format!("Indexed {} chunks", ingested.chunk_count))
            .await;

        Ok(Outcome::done_with_result(ingested.result_path))
    }
}
