use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use docwriter_broker::{BrokerError, QueueBroker, StatusTopic};
use docwriter_store::{get_json, paths, ObjectStore, StatusStore, StoreError};
use docwriter_types::{
    DocumentIndexRow, JobRecord, JobStage, StageMessage, StagePhase, TimelineEvent,
};

use crate::config::KernelConfig;
use crate::context::{enqueue_stage, StageContext};
use crate::error::StageError;

/// Structured errors surfaced to the HTTP layer. Owner mismatches are
/// reported without revealing whether the job exists for someone else.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not authorized")]
    NotAuthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotAuthorized { .. } => ApiError::NotAuthorized,
            StoreError::NotFound(what) => ApiError::NotFound(what),
            StoreError::InvalidKey(key) => ApiError::Invalid(format!("invalid path '{}'", key)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<StageError> for ApiError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::NotAuthorized(_) => ApiError::NotAuthorized,
            StageError::Validation(detail) => ApiError::Invalid(detail),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub stage: JobStage,
    pub cycle: Option<u32>,
    pub message: String,
    pub artifact: Option<String>,
    pub cycles_requested: u32,
    pub cycles_completed: u32,
    pub has_error: bool,
    pub last_error: Option<String>,
}

impl From<JobRecord> for JobStatus {
    fn from(record: JobRecord) -> Self {
        Self {
            stage: record.stage,
            cycle: record.cycle,
            message: record.message,
            artifact: record.artifact,
            cycles_requested: record.cycles_requested,
            cycles_completed: record.cycles_completed,
            has_error: record.has_error,
            last_error: record.last_error,
        }
    }
}

/// The operations the HTTP front-end calls. Every operation enforces the
/// owner before touching any blob or row.
#[derive(Clone)]
pub struct Kernel {
    broker: Arc<dyn QueueBroker>,
    objects: Arc<dyn ObjectStore>,
    status: Arc<StatusStore>,
    topic: StatusTopic,
    config: Arc<KernelConfig>,
}

impl Kernel {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        objects: Arc<dyn ObjectStore>,
        status: Arc<StatusStore>,
        topic: StatusTopic,
        config: Arc<KernelConfig>,
    ) -> Self {
        Self {
            broker,
            objects,
            status,
            topic,
            config,
        }
    }

    pub fn from_context(ctx: &StageContext) -> Self {
        Self::new(
            ctx.broker.clone(),
            ctx.objects.clone(),
            ctx.status.clone(),
            ctx.topic.clone(),
            ctx.config.clone(),
        )
    }

    /// Admit a new job: write its index row, then queue plan-intake. Every
    /// call creates a fresh job id.
    pub async fn admit_job(
        &self,
        owner_id: &str,
        title: &str,
        audience: &str,
        cycles: u32,
    ) -> Result<String, ApiError> {
        if owner_id.trim().is_empty() {
            return Err(ApiError::Invalid("owner_id must not be empty".to_string()));
        }
        if title.trim().is_empty() {
            return Err(ApiError::Invalid("title must not be empty".to_string()));
        }
        if !(1..=5).contains(&cycles) {
            return Err(ApiError::Invalid(
                "cycles must be between 1 and 5".to_string(),
            ));
        }

        let job_id = Uuid::new_v4().to_string();
        self.status
            .admit(JobRecord::admitted(
                owner_id,
                job_id.as_str(),
                title,
                audience,
                cycles,
            ))
            .await?;

        let mut msg = StageMessage::new(JobStage::PlanIntake, owner_id, job_id.as_str());
        msg.title = Some(title.to_string());
        msg.audience = Some(audience.to_string());
        msg.cycles = Some(cycles);
        enqueue_stage(self.broker.as_ref(), &self.topic, &self.config, &msg, None).await?;
        Ok(job_id)
    }

    /// Submit intake answers. Retrying with an identical payload is a
    /// no-op once the context has been built.
    pub async fn submit_answers(
        &self,
        owner_id: &str,
        job_id: &str,
        answers: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        self.status.get_job(owner_id, job_id).await?;

        let context_key = paths::intake_context(owner_id, job_id);
        if self.objects.exists(&context_key).await? {
            let answers_key = paths::intake_answers(owner_id, job_id);
            if let Ok(existing) =
                get_json::<BTreeMap<String, String>>(self.objects.as_ref(), &answers_key).await
            {
                if existing == answers {
                    return Ok(());
                }
            }
        }

        let mut msg = StageMessage::new(JobStage::IntakeResume, owner_id, job_id);
        msg.answers = Some(answers);
        enqueue_stage(self.broker.as_ref(), &self.topic, &self.config, &msg, None).await?;
        Ok(())
    }

    pub async fn get_status(&self, owner_id: &str, job_id: &str) -> Result<JobStatus, ApiError> {
        Ok(self.status.get_job(owner_id, job_id).await?.into())
    }

    pub async fn get_timeline(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> Result<Vec<TimelineEvent>, ApiError> {
        Ok(self.status.timeline(owner_id, job_id).await?)
    }

    pub async fn list_documents(&self, owner_id: &str) -> Vec<DocumentIndexRow> {
        self.status.list_documents(owner_id).await
    }

    /// Fetch one artifact blob. The owner check runs before any blob read.
    pub async fn fetch_artifact(
        &self,
        owner_id: &str,
        job_id: &str,
        relative_path: &str,
    ) -> Result<(Vec<u8>, &'static str), ApiError> {
        self.status.get_job(owner_id, job_id).await?;
        let relative = sanitize_relative(relative_path)?;
        let key = format!("{}/{}", paths::job_root(owner_id, job_id), relative);
        let bytes = self.objects.get(&key).await?;
        Ok((bytes, content_type_for(relative)))
    }

    pub async fn fetch_diagram_archive(
        &self,
        owner_id: &str,
        job_id: &str,
    ) -> Result<(Vec<u8>, &'static str), ApiError> {
        self.fetch_artifact(owner_id, job_id, "diagrams.zip").await
    }

    /// Replay the most recent FAILED stage from the message captured on its
    /// timeline event; idempotent stage outputs make the re-run safe.
    pub async fn resume_failed(&self, owner_id: &str, job_id: &str) -> Result<(), ApiError> {
        let record = self.status.get_job(owner_id, job_id).await?;
        if !record.has_error {
            return Err(ApiError::Invalid(
                "job has no failed stage to resume".to_string(),
            ));
        }
        let timeline = self.status.timeline(owner_id, job_id).await?;
        let failed = timeline
            .iter()
            .rev()
            .find(|event| event.phase == StagePhase::Failed)
            .ok_or_else(|| {
                ApiError::Invalid("no failed event recorded for this job".to_string())
            })?;
        let value = failed.details.parsed_message.clone().ok_or_else(|| {
            ApiError::Invalid("failed event does not carry a replayable message".to_string())
        })?;
        let msg: StageMessage = serde_json::from_value(value)
            .map_err(|err| ApiError::Internal(format!("stored message unparseable: {}", err)))?;
        if msg.owner_id != owner_id {
            return Err(ApiError::NotAuthorized);
        }
        self.status.clear_error(owner_id, job_id).await?;
        enqueue_stage(self.broker.as_ref(), &self.topic, &self.config, &msg, None).await?;
        Ok(())
    }

    /// Best-effort cancellation: workers check the flag on entry and
    /// dead-letter the delivery; in-flight external calls finish on their
    /// own.
    pub async fn cancel_job(&self, owner_id: &str, job_id: &str) -> Result<(), ApiError> {
        Ok(self.status.set_cancelled(owner_id, job_id).await?)
    }
}

fn sanitize_relative(path: &str) -> Result<&str, ApiError> {
    let trimmed = path.trim_matches('/');
    let valid = !trimmed.is_empty()
        && !trimmed.contains('\\')
        && trimmed
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(trimmed)
    } else {
        Err(ApiError::Invalid(format!("invalid artifact path '{}'", path)))
    }
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().unwrap_or_default() {
        "md" => "text/markdown; charset=utf-8",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        "zip" => "application/zip",
        "puml" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_sanitized() {
        assert_eq!(sanitize_relative("final.md").expect("ok"), "final.md");
        assert_eq!(
            sanitize_relative("/drafts/s1.md").expect("ok"),
            "drafts/s1.md"
        );
        assert!(sanitize_relative("../other/final.md").is_err());
        assert!(sanitize_relative("").is_err());
    }

    #[test]
    fn content_types_cover_the_artifact_set() {
        assert_eq!(content_type_for("final.pdf"), "application/pdf");
        assert_eq!(content_type_for("diagrams.zip"), "application/zip");
        assert_eq!(content_type_for("flow.png"), "image/png");
        assert_eq!(content_type_for("unknown.bin"), "application/octet-stream");
    }
}
