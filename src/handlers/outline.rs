//! Course outline generation and per-lesson fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    coordinator::Coordinator,
    handler::{Context, HandlerError, JobHandler, Outcome},
    job::{Job, JobKind, NewJob},
    providers::ContentProvider,
};

#[derive(Debug, Deserialize)]
struct OutlinePayload {
    course_id: Uuid,
}

/// Generates a course outline, then fans out one lesson job per outline
/// entry.
///
/// The parent job stays running after this handler returns; the coordinator
/// finalizes it once every lesson child reaches a terminal state. Idempotent
/// on re-delivery because the provider overwrites any prior outline for the
/// course and fan-out only happens after a successful generation.
pub struct GenerateOutlineHandler {
    content: Arc<dyn ContentProvider>,
    coordinator: Coordinator,
}

impl GenerateOutlineHandler {
    pub fn new(content: Arc<dyn ContentProvider>, coordinator: Coordinator) -> Self {
        Self {
            content,
            coordinator,
        }
    }
}

#[async_trait]
impl JobHandler for GenerateOutlineHandler {
    fn kind(&self) -> JobKind {
        JobKind::OutlineGeneration
    }

    async fn run(&self, job: &Job, ctx: &Context) -> Result<Outcome, HandlerError> {
        let payload: OutlinePayload =
            serde_json::from_value(job.payload.clone()).map_err(HandlerError::fatal)?;

        // A re-delivered parent may already have fanned out; the first
        // attempt can be interrupted between the fan-out commit and its
        // return. The children are the durable record of that.
        let existing = ctx.children().await.map_err(HandlerError::retryable)?;
        if !existing.is_empty() {
            tracing::info!(
                children = existing.len(),
                "Fan-out already happened, awaiting children"
            );
            return Ok(Outcome::AwaitChildren);
        }

        ctx.progress(5, "Generating course outline").await;

        let outline = self
            .content
            .generate_outline(job.tenant_id, payload.course_id)
            .await?;

        ctx.record_tokens(outline.tokens).await;
        ctx.record_result(&outline.result_path).await;
        ctx.progress(
            30,
            &format!("Outline ready, generating {} lessons", outline.lesson_ids.len()),
        )
        .await;

        let children = outline
            .lesson_ids
            .iter()
            .map(|lesson_id| {
                NewJob::new(
                    job.tenant_id,
                    JobKind::LessonGeneration,
                    json!({ "lesson_id": lesson_id }),
                )
            })
            .collect();

        self.coordinator
            .fan_out(job, children)
            .await
            .map_err(HandlerError::retryable)?;

        Ok(Outcome::AwaitChildren)
    }
}
