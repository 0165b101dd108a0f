use docwriter_gateway::AgentRole;
use docwriter_store::{paths, put_json};
use docwriter_types::{IntakeQuestion, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;
use crate::prompts;
use crate::stages::{done, StageDisposition, StageOutcome};

/// Produce the intake questionnaire and suspend: the pipeline does not
/// advance until the user submits answers.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let title = msg
        .title
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| StageError::Validation("plan-intake message missing title".to_string()))?;
    let audience = msg
        .audience
        .as_deref()
        .filter(|a| !a.trim().is_empty())
        .ok_or_else(|| {
            StageError::Validation("plan-intake message missing audience".to_string())
        })?;

    let completion = ctx
        .gateway
        .complete(
            AgentRole::Interviewer,
            &prompts::interviewer_system(),
            &prompts::interviewer_prompt(title, audience, ctx.config.default_length_pages),
        )
        .await?;
    let questions: Vec<IntakeQuestion> =
        prompts::parse_model_json(&completion.text).map_err(|err| {
            StageError::Durable(format!(
                "interviewer returned an unparseable questionnaire: {}",
                err
            ))
        })?;

    let key = paths::intake_questions(&msg.owner_id, &msg.job_id);
    put_json(ctx.objects.as_ref(), &key, &questions).await?;

    let mut outcome = StageOutcome::new(format!(
        "intake questionnaire ready ({} questions); awaiting answers",
        questions.len()
    ));
    outcome.artifact = Some(key);
    outcome.tokens = completion.usage.total_tokens;
    outcome.model = Some(completion.model);
    done(outcome)
}
