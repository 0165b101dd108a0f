use std::collections::HashSet;

use tracing::{debug, warn};

use docwriter_observability::redact_text;
use docwriter_store::{get_json, paths, put_json, StoreError};
use docwriter_types::{IntakeContext, IntakeQuestion, JobStage, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;
use crate::stages::{done, StageDisposition, StageOutcome};

/// Persist the user's answers, merge the authoritative planner context, and
/// wake the pipeline back up.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let answers = msg.answers.clone().unwrap_or_default();
    let record = ctx.status.get_job(&msg.owner_id, &msg.job_id).await?;

    let questions: Vec<IntakeQuestion> = match get_json(
        ctx.objects.as_ref(),
        &paths::intake_questions(&msg.owner_id, &msg.job_id),
    )
    .await
    {
        Ok(questions) => questions,
        Err(StoreError::NotFound(_)) => {
            return Err(StageError::Validation(
                "cannot resume intake before the questionnaire exists".to_string(),
            ))
        }
        Err(err) => return Err(err.into()),
    };

    let known: HashSet<&str> = questions.iter().map(|q| q.id.as_str()).collect();
    let unknown: Vec<&str> = answers
        .keys()
        .map(String::as_str)
        .filter(|id| !known.contains(id))
        .collect();
    let notes = if unknown.is_empty() {
        None
    } else {
        warn!(
            job_id = %msg.job_id,
            keys = %unknown.join(","),
            "answers contain keys the questionnaire never asked; preserving"
        );
        Some(format!("unknown answer keys preserved: {}", unknown.join(",")))
    };

    put_json(
        ctx.objects.as_ref(),
        &paths::intake_answers(&msg.owner_id, &msg.job_id),
        &answers,
    )
    .await?;
    debug!(
        job_id = %msg.job_id,
        payload = %redact_text(&serde_json::to_string(&answers).unwrap_or_default()),
        "intake answers persisted"
    );

    let context = IntakeContext {
        title: record.title,
        audience: record.audience,
        cycles: record.cycles_requested,
        answers,
    };
    let context_key = paths::intake_context(&msg.owner_id, &msg.job_id);
    put_json(ctx.objects.as_ref(), &context_key, &context).await?;

    let mut next = msg.forward(JobStage::Plan);
    next.inputs
        .insert("context".to_string(), context_key.clone());
    ctx.enqueue_stage(&next, None).await?;

    let mut outcome = StageOutcome::new("intake resumed; planning queued");
    outcome.artifact = Some(context_key);
    outcome.notes = notes;
    done(outcome)
}
