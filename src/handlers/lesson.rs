//! Single-lesson content generation.

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
struct LessonPayload {
    lesson_id: Uuid,
}

/// Generates the content of one lesson.
///
/// Usually a fan-out child of an outline job, but also enqueued standalone
/// when a user regenerates a single lesson. The provider overwrites any
/// prior content for the lesson, so re-delivery is safe.
pub struct GenerateLessonHandler {
    content: Arc<dyn ContentProvider>,
}

impl GenerateLessonHandler {
    pub fn new(content: Arc<dyn ContentProvider>) -> Self {
        Self { content }
    }
}

#[async_trait]
impl JobHandler for GenerateLessonHandler {
    fn kind(&self) -> JobKind {
        JobKind::LessonGeneration
    }

    async fn run(&self, job: &Job, ctx: &Context) -> Result<Outcome, HandlerError> {
        let payload: LessonPayload =
            serde_json::from_value(job.payload.clone()).map_err(HandlerError::fatal)?;

        ctx.progress(10, "Generating lesson content").await;

        let lesson = self
            .content
            .generate_lesson(job.tenant_id, payload.lesson_id)
            .await?;

        ctx.record_tokens(lesson.tokens).await;

        Ok(Outcome::done_with_result(lesson.result_path))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use sqlx::PgPool;

    use super::*;
    use crate::{
        events::EventPublisher,
        job::NewJob,
        providers::{self, Error, GeneratedLesson, GeneratedOutline, IngestedDocument},
        store::JobStore,
    };

    struct FakeContent {
        fail_transiently: bool,
    }

    #[async_trait]
    impl ContentProvider for FakeContent {
        async fn generate_outline(
            &self,
            _tenant_id: Uuid,
            _course_id: Uuid,
        ) -> providers::Result<GeneratedOutline> {
            unimplemented!()
        }

        async fn generate_lesson(
            &self,
            _tenant_id: Uuid,
            lesson_id: Uuid,
        ) -> providers::Result<GeneratedLesson> {
            if self.fail_transiently {
                return Err(Error::transient("model overloaded"));
            }
            Ok(GeneratedLesson {
                result_path: format!("lessons/{lesson_id}.json"),
                tokens: 64,
            })
        }

        async fn ingest_document(
            &self,
            _tenant_id: Uuid,
            _document_id: Uuid,
        ) -> providers::Result<IngestedDocument> {
            unimplemented!()
        }
    }

    async fn claimed_lesson_job(pool: &PgPool, lesson_id: Uuid) -> (JobStore, Job) {
        let store = JobStore::new(pool.clone());
        store
            .create(
                pool,
                &NewJob::new(
                    Uuid::new_v4(),
                    JobKind::LessonGeneration,
                    json!({ "lesson_id": lesson_id }),
                ),
            )
            .await
            .unwrap();
        let job = store.next_queued().await.unwrap().expect("claimable");
        (store, job)
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn produces_result_path_and_tokens(pool: PgPool) {
        let lesson_id = Uuid::new_v4();
        let (store, job) = claimed_lesson_job(&pool, lesson_id).await;
        let handler = GenerateLessonHandler::new(Arc::new(FakeContent {
            fail_transiently: false,
        }));
        let ctx = Context::new(
            job.id,
            job.tenant_id,
            store.clone(),
            EventPublisher::new(pool.clone()),
        );

        let outcome = handler.run(&job, &ctx).await.unwrap();
        assert_eq!(
            outcome,
            Outcome::done_with_result(format!("lessons/{lesson_id}.json"))
        );

        let job = store.get(job.id).await.unwrap().expect("job exists");
        assert_eq!(job.tokens_used, 64);
    }

    #[sqlx::test(migrator = "crate::MIGRATOR")]
    async fn provider_outage_is_retryable(pool: PgPool) {
        let (store, job) = claimed_lesson_job(&pool, Uuid::new_v4()).await;
        let handler = GenerateLessonHandler::new(Arc::new(FakeContent {
            fail_transiently: true,
        }));
        let ctx = Context::new(
            job.id,
            job.tenant_id,
            store,
            EventPublisher::new(pool.clone()),
        );

        let err = handler.run(&job, &ctx).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
