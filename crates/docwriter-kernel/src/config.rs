use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use docwriter_gateway::{AgentRole, GatewayConfig};
use docwriter_types::{JobStage, Severity};

/// One durable queue per stage. Review flavors fan out inside the review
/// handler, so they carry no queue of their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueNames {
    pub plan_intake: String,
    pub intake_resume: String,
    pub plan: String,
    pub write: String,
    pub review: String,
    pub verify: String,
    pub rewrite: String,
    pub diagram_prep: String,
    pub diagram_render: String,
    pub finalize: String,
    pub status_topic: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            plan_intake: "docwriter-plan-intake".to_string(),
            intake_resume: "docwriter-intake-resume".to_string(),
            plan: "docwriter-plan".to_string(),
            write: "docwriter-write".to_string(),
            review: "docwriter-review".to_string(),
            verify: "docwriter-verify".to_string(),
            rewrite: "docwriter-rewrite".to_string(),
            diagram_prep: "docwriter-diagram-prep".to_string(),
            diagram_render: "docwriter-diagram-render".to_string(),
            finalize: "docwriter-finalize-ready".to_string(),
            status_topic: "docwriter-status".to_string(),
        }
    }
}

impl QueueNames {
    pub fn for_stage(&self, stage: JobStage) -> &str {
        match stage {
            JobStage::PlanIntake => &self.plan_intake,
            JobStage::IntakeResume => &self.intake_resume,
            JobStage::Plan => &self.plan,
            JobStage::Write => &self.write,
            JobStage::Review => &self.review,
            JobStage::Verify => &self.verify,
            JobStage::Rewrite => &self.rewrite,
            JobStage::DiagramPrep => &self.diagram_prep,
            JobStage::DiagramRender => &self.diagram_render,
            JobStage::Finalize => &self.finalize,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewFlags {
    pub style: bool,
    pub cohesion: bool,
    pub summary: bool,
}

#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub queues: QueueNames,
    pub gateway: GatewayConfig,
    pub renderer_url: String,
    pub review_flags: ReviewFlags,
    /// Sections written per `write` message (`DOCWRITER_WRITE_BATCH_SIZE`).
    pub write_batch_size: usize,
    /// Target document length (`DOCWRITER_DEFAULT_LENGTH_PAGES`).
    pub default_length_pages: u32,
    /// Any review issue at or above this severity forces a rewrite.
    pub rewrite_severity: Severity,
    pub max_transient_retries: u32,
    pub lock_duration: Duration,
    /// Visibility delay when a write message arrives before its
    /// dependencies are drafted.
    pub dependency_retry_delay: Duration,
    pub render_svg: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            queues: QueueNames::default(),
            gateway: GatewayConfig {
                endpoint: "https://api.openai.com/v1".to_string(),
                api_key: None,
                default_model: "gpt-4o-mini".to_string(),
                models: HashMap::new(),
                max_transient_retries: 3,
                max_completion_tokens: None,
            },
            renderer_url: "http://127.0.0.1:8792".to_string(),
            review_flags: ReviewFlags::default(),
            write_batch_size: 1,
            default_length_pages: 60,
            rewrite_severity: Severity::High,
            max_transient_retries: 3,
            lock_duration: docwriter_broker::DEFAULT_LOCK_DURATION,
            dependency_retry_delay: Duration::from_secs(5),
            render_svg: false,
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_string("DOCWRITER_QUEUE_PLAN_INTAKE", &mut config.queues.plan_intake);
        env_string(
            "DOCWRITER_QUEUE_INTAKE_RESUME",
            &mut config.queues.intake_resume,
        );
        env_string("DOCWRITER_QUEUE_PLAN", &mut config.queues.plan);
        env_string("DOCWRITER_QUEUE_WRITE", &mut config.queues.write);
        env_string("DOCWRITER_QUEUE_REVIEW", &mut config.queues.review);
        env_string("DOCWRITER_QUEUE_VERIFY", &mut config.queues.verify);
        env_string("DOCWRITER_QUEUE_REWRITE", &mut config.queues.rewrite);
        env_string(
            "DOCWRITER_QUEUE_DIAGRAM_PREP",
            &mut config.queues.diagram_prep,
        );
        env_string(
            "DOCWRITER_QUEUE_DIAGRAM_RENDER",
            &mut config.queues.diagram_render,
        );
        env_string("DOCWRITER_QUEUE_FINALIZE", &mut config.queues.finalize);
        env_string("DOCWRITER_STATUS_TOPIC", &mut config.queues.status_topic);

        env_string("DOCWRITER_LLM_ENDPOINT", &mut config.gateway.endpoint);
        if let Some(key) = env_opt("DOCWRITER_LLM_API_KEY") {
            config.gateway.api_key = Some(key);
        }
        env_string("DOCWRITER_MODEL_DEFAULT", &mut config.gateway.default_model);
        if let Some(model) = env_opt("DOCWRITER_MODEL_PLANNER") {
            config.gateway.models.insert(AgentRole::Planner, model.clone());
            config.gateway.models.insert(AgentRole::Interviewer, model);
        }
        if let Some(model) = env_opt("DOCWRITER_MODEL_WRITER") {
            config.gateway.models.insert(AgentRole::Writer, model.clone());
            config.gateway.models.insert(AgentRole::Rewriter, model);
        }
        if let Some(model) = env_opt("DOCWRITER_MODEL_REVIEWER") {
            config.gateway.models.insert(AgentRole::Reviewer, model.clone());
            config.gateway.models.insert(AgentRole::Verifier, model);
        }

        env_string("DOCWRITER_RENDERER_URL", &mut config.renderer_url);

        config.review_flags.style = env_flag("DOCWRITER_REVIEW_STYLE");
        config.review_flags.cohesion = env_flag("DOCWRITER_REVIEW_COHESION");
        config.review_flags.summary = env_flag("DOCWRITER_REVIEW_SUMMARY");

        if let Some(size) = env_opt("DOCWRITER_WRITE_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            config.write_batch_size = size;
        }
        if let Some(pages) =
            env_opt("DOCWRITER_DEFAULT_LENGTH_PAGES").and_then(|v| v.parse().ok())
        {
            config.default_length_pages = pages;
        }
        if let Some(secs) =
            env_opt("DOCWRITER_DEPENDENCY_RETRY_SECS").and_then(|v| v.parse().ok())
        {
            config.dependency_retry_delay = Duration::from_secs(secs);
        }
        config.render_svg = env_flag("DOCWRITER_RENDER_SVG");

        config
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_string(name: &str, slot: &mut String) {
    if let Some(value) = env_opt(name) {
        *slot = value;
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
