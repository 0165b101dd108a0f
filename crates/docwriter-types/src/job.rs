use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// Pipeline stage; one durable queue per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStage {
    PlanIntake,
    IntakeResume,
    Plan,
    Write,
    Review,
    Verify,
    Rewrite,
    DiagramPrep,
    DiagramRender,
    Finalize,
}

impl JobStage {
    pub const ALL: [JobStage; 10] = [
        JobStage::PlanIntake,
        JobStage::IntakeResume,
        JobStage::Plan,
        JobStage::Write,
        JobStage::Review,
        JobStage::Verify,
        JobStage::Rewrite,
        JobStage::DiagramPrep,
        JobStage::DiagramRender,
        JobStage::Finalize,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStage::PlanIntake => "plan-intake",
            JobStage::IntakeResume => "intake-resume",
            JobStage::Plan => "plan",
            JobStage::Write => "write",
            JobStage::Review => "review",
            JobStage::Verify => "verify",
            JobStage::Rewrite => "rewrite",
            JobStage::DiagramPrep => "diagram-prep",
            JobStage::DiagramRender => "diagram-render",
            JobStage::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagePhase {
    Queued,
    Start,
    Done,
    Failed,
}

impl StagePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            StagePhase::Queued => "QUEUED",
            StagePhase::Start => "START",
            StagePhase::Done => "DONE",
            StagePhase::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for StagePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EventDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Original stage message, recorded on FAILED events so a failed stage
    /// can be replayed verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_message: Option<Value>,
}

/// One stage transition, published on the status topic and appended to the
/// per-job timeline by the status recorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: String,
    pub owner_id: String,
    pub stage: JobStage,
    pub phase: StagePhase,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: EventDetails,
    /// Set when a review cycle concludes; the recorder folds it into the
    /// job row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles_completed: Option<u32>,
}

impl StatusEvent {
    pub fn new(
        owner_id: impl Into<String>,
        job_id: impl Into<String>,
        stage: JobStage,
        phase: StagePhase,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            stage,
            phase,
            ts: Utc::now(),
            cycle: None,
            artifact: None,
            message: None,
            details: EventDetails::default(),
            cycles_completed: None,
        }
    }

    /// Replay identity: the same logical transition observed twice must not
    /// produce two timeline entries.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.job_id,
            self.stage,
            self.phase,
            self.ts.timestamp_micros()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub job_id: String,
    pub stage: JobStage,
    pub phase: StagePhase,
    pub ts: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub details: EventDetails,
}

impl TimelineEvent {
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.job_id,
            self.stage,
            self.phase,
            self.ts.timestamp_micros()
        )
    }
}

impl From<StatusEvent> for TimelineEvent {
    fn from(event: StatusEvent) -> Self {
        Self {
            job_id: event.job_id,
            stage: event.stage,
            phase: event.phase,
            ts: event.ts,
            cycle: event.cycle,
            artifact: event.artifact,
            message: event.message,
            details: event.details,
        }
    }
}

/// Authoritative per-job status row. Created at admission, mutated by the
/// status recorder on every event, never deleted by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub owner_id: String,
    pub job_id: String,
    pub title: String,
    pub audience: String,
    pub stage: JobStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub cycles_requested: u32,
    #[serde(default)]
    pub cycles_completed: u32,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl JobRecord {
    pub fn admitted(
        owner_id: impl Into<String>,
        job_id: impl Into<String>,
        title: impl Into<String>,
        audience: impl Into<String>,
        cycles_requested: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            owner_id: owner_id.into(),
            job_id: job_id.into(),
            title: title.into(),
            audience: audience.into(),
            stage: JobStage::PlanIntake,
            cycle: None,
            message: "queued".to_string(),
            artifact: None,
            cycles_requested,
            cycles_completed: 0,
            has_error: false,
            last_error: None,
            cancelled: false,
            created_at: now,
            updated_at: now,
            schema_version: SCHEMA_VERSION,
        }
    }
}

/// Listing row surfaced to the document index, keyed by (owner_id, job_id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndexRow {
    pub owner_id: String,
    pub job_id: String,
    pub title: String,
    pub audience: String,
    pub stage: JobStage,
    #[serde(default)]
    pub message: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub cycles_requested: u32,
    #[serde(default)]
    pub cycles_completed: u32,
    #[serde(default)]
    pub has_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl From<&JobRecord> for DocumentIndexRow {
    fn from(record: &JobRecord) -> Self {
        Self {
            owner_id: record.owner_id.clone(),
            job_id: record.job_id.clone(),
            title: record.title.clone(),
            audience: record.audience.clone(),
            stage: record.stage,
            message: record.message.clone(),
            updated_at: record.updated_at,
            artifact: record.artifact.clone(),
            cycles_requested: record.cycles_requested,
            cycles_completed: record.cycles_completed,
            has_error: record.has_error,
            last_error: record.last_error.clone(),
            schema_version: record.schema_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_round_trips_kebab_case() {
        for stage in JobStage::ALL {
            let json = serde_json::to_string(&stage).expect("serialize");
            assert_eq!(json, format!("\"{}\"", stage.as_str()));
            let back: JobStage = serde_json::from_str(&json).expect("deserialize");
            assert_eq!(back, stage);
        }
    }

    #[test]
    fn phase_uses_upper_snake_wire_form() {
        let json = serde_json::to_string(&StagePhase::Failed).expect("serialize");
        assert_eq!(json, "\"FAILED\"");
    }

    #[test]
    fn identity_is_stable_for_same_transition() {
        let event = StatusEvent::new("u1", "j1", JobStage::Write, StagePhase::Done);
        let timeline: TimelineEvent = event.clone().into();
        assert_eq!(event.identity(), timeline.identity());
    }
}
