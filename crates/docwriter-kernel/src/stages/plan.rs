use docwriter_gateway::AgentRole;
use docwriter_store::{get_json, paths, put_json};
use docwriter_types::{validate_plan, IntakeContext, JobStage, Plan, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;
use crate::prompts;
use crate::stages::{done, StageDisposition, StageOutcome};

fn parse_and_validate(raw: &str) -> Result<Plan, String> {
    let plan: Plan = prompts::parse_model_json(raw).map_err(|err| err.to_string())?;
    validate_plan(&plan).map_err(|err| err.to_string())?;
    Ok(plan)
}

/// Turn the intake context into a validated section DAG and fan the write
/// stage out over it. One repair attempt on invalid planner output; a second
/// failure dead-letters the job.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let context: IntakeContext = get_json(
        ctx.objects.as_ref(),
        &paths::intake_context(&msg.owner_id, &msg.job_id),
    )
    .await?;

    let system = prompts::planner_system();
    let completion = ctx
        .gateway
        .complete(
            AgentRole::Planner,
            &system,
            &prompts::planner_prompt(&context, ctx.config.default_length_pages),
        )
        .await?;
    let mut tokens = completion.usage.total_tokens;
    let mut model = completion.model.clone();

    let plan = match parse_and_validate(&completion.text) {
        Ok(plan) => plan,
        Err(first_error) => {
            let repair = ctx
                .gateway
                .complete(
                    AgentRole::Planner,
                    &system,
                    &prompts::planner_repair_prompt(&completion.text, &first_error),
                )
                .await?;
            tokens += repair.usage.total_tokens;
            model = repair.model.clone();
            parse_and_validate(&repair.text).map_err(|second_error| {
                StageError::Validation(format!(
                    "planner output failed validation twice: {}; then {}",
                    first_error, second_error
                ))
            })?
        }
    };

    let plan_key = paths::plan(&msg.owner_id, &msg.job_id);
    put_json(ctx.objects.as_ref(), &plan_key, &plan).await?;

    // Sections are already in topological order; batching preserves it.
    let batch = ctx.config.write_batch_size.max(1);
    for chunk in plan.sections.chunks(batch) {
        let mut next = msg.forward(JobStage::Write);
        next.sections = chunk.iter().map(|s| s.id.clone()).collect();
        next.inputs.insert("plan".to_string(), plan_key.clone());
        ctx.enqueue_stage(&next, None).await?;
    }

    let mut outcome = StageOutcome::new(format!(
        "plan ready with {} sections; writing queued",
        plan.sections.len()
    ));
    outcome.artifact = Some(plan_key);
    outcome.tokens = tokens;
    outcome.model = Some(model);
    done(outcome)
}
