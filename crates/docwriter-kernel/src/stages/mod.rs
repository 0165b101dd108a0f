use std::time::Duration;

use docwriter_types::{JobStage, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;

mod diagram_prep;
mod diagram_render;
mod finalize;
mod intake_resume;
mod plan;
mod plan_intake;
mod review;
mod rewrite;
mod verify;
mod write;

/// What a completed handler reports back for the DONE event.
#[derive(Debug, Clone, Default)]
pub struct StageOutcome {
    pub message: String,
    pub artifact: Option<String>,
    pub tokens: u64,
    pub model: Option<String>,
    pub cycle: Option<u32>,
    pub cycles_completed: Option<u32>,
    pub notes: Option<String>,
}

impl StageOutcome {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// A handler either finishes, or asks for redelivery after a delay without
/// marking the stage failed (used by the dependency-ready check).
#[derive(Debug)]
pub enum StageDisposition {
    Done(StageOutcome),
    Retry { reason: String, delay: Duration },
}

pub(crate) fn done(outcome: StageOutcome) -> Result<StageDisposition, StageError> {
    Ok(StageDisposition::Done(outcome))
}

pub async fn run_stage(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    match msg.stage {
        JobStage::PlanIntake => plan_intake::run(ctx, msg).await,
        JobStage::IntakeResume => intake_resume::run(ctx, msg).await,
        JobStage::Plan => plan::run(ctx, msg).await,
        JobStage::Write => write::run(ctx, msg).await,
        JobStage::Review => review::run(ctx, msg).await,
        JobStage::Verify => verify::run(ctx, msg).await,
        JobStage::Rewrite => rewrite::run(ctx, msg).await,
        JobStage::DiagramPrep => diagram_prep::run(ctx, msg).await,
        JobStage::DiagramRender => diagram_render::run(ctx, msg).await,
        JobStage::Finalize => finalize::run(ctx, msg).await,
    }
}
