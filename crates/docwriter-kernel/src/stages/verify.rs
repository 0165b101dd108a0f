use std::collections::HashSet;

use docwriter_gateway::AgentRole;
use docwriter_store::{get_json, paths, put_json};
use docwriter_types::{
    JobStage, Plan, ReviewFlavor, ReviewIssue, ReviewNote, StageMessage, VerifyReport,
};

use crate::context::StageContext;
use crate::error::StageError;
use crate::prompts;
use crate::stages::review::{load_drafts, note_forces_rewrite};
use crate::stages::write::load_memory;
use crate::stages::{done, StageDisposition, StageOutcome};

/// Second-pass contradiction check and the cycle decision: loop back into
/// rewrite while the budget allows, otherwise advance to diagrams. The
/// budget bound is the pipeline's termination guarantee.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let cycle = msg
        .cycle
        .ok_or_else(|| StageError::Validation("verify message missing cycle".to_string()))?;
    let record = ctx.status.get_job(&msg.owner_id, &msg.job_id).await?;
    let plan: Plan = get_json(
        ctx.objects.as_ref(),
        &paths::plan(&msg.owner_id, &msg.job_id),
    )
    .await?;
    let drafts = load_drafts(ctx, &msg.owner_id, &msg.job_id, &plan).await?;

    let mut review_wants_rewrite = false;
    let mut issues: Vec<ReviewIssue> = Vec::new();
    for flavor in ReviewFlavor::ALL {
        let key = paths::review(&msg.owner_id, &msg.job_id, cycle, flavor.as_str());
        if ctx.objects.exists(&key).await? {
            let note: ReviewNote = get_json(ctx.objects.as_ref(), &key).await?;
            review_wants_rewrite |= note_forces_rewrite(&note, ctx.config.rewrite_severity);
            issues.extend(note.issues);
        }
    }

    let memory = load_memory(ctx, &msg.owner_id, &msg.job_id).await?;
    let declared_facts: Vec<(String, Vec<String>)> = plan
        .sections
        .iter()
        .filter_map(|section| {
            memory
                .sections
                .get(&section.id)
                .map(|m| (section.id.clone(), m.facts.clone()))
        })
        .collect();

    let completion = ctx
        .gateway
        .complete(
            AgentRole::Verifier,
            &prompts::verifier_system(),
            &prompts::verifier_prompt(cycle, &drafts, &declared_facts, &issues),
        )
        .await?;
    let report: VerifyReport = prompts::parse_model_json(&completion.text).map_err(|err| {
        StageError::Durable(format!("verifier returned an unparseable report: {}", err))
    })?;
    let verify_key = paths::verify(&msg.owner_id, &msg.job_id, cycle);
    put_json(ctx.objects.as_ref(), &verify_key, &report).await?;

    let wants_rewrite = report.needs_rewrite || review_wants_rewrite;
    let budget_left = cycle < record.cycles_requested;

    let message;
    if wants_rewrite && budget_left {
        // Sections named by findings go back to the writer; when nothing is
        // named but a rewrite is demanded, everything does.
        let mut seen = HashSet::new();
        let mut flagged: Vec<String> = plan
            .sections
            .iter()
            .filter(|section| {
                issues.iter().any(|i| i.section_id == section.id)
                    || report
                        .contradictions
                        .iter()
                        .any(|c| c.section_id == section.id)
            })
            .filter(|section| seen.insert(section.id.clone()))
            .map(|section| section.id.clone())
            .collect();
        if flagged.is_empty() {
            flagged = plan.sections.iter().map(|s| s.id.clone()).collect();
        }

        let mut next = msg.forward(JobStage::Rewrite);
        next.cycle = Some(cycle);
        next.sections = flagged;
        ctx.enqueue_stage(&next, None).await?;
        message = format!("verify cycle {}: rewrite required", cycle);
    } else {
        let next = msg.forward(JobStage::DiagramPrep);
        ctx.enqueue_stage(&next, None).await?;
        message = if wants_rewrite {
            format!(
                "verify cycle {}: cycle budget exhausted; advancing to diagrams",
                cycle
            )
        } else {
            format!("verify cycle {}: no rewrite required", cycle)
        };
    }

    let mut outcome = StageOutcome::new(message);
    outcome.artifact = Some(verify_key);
    outcome.cycle = Some(cycle);
    outcome.cycles_completed = Some(cycle.min(record.cycles_requested));
    outcome.tokens = completion.usage.total_tokens;
    outcome.model = Some(completion.model);
    done(outcome)
}
