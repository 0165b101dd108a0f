use docwriter_gateway::AgentRole;
use docwriter_store::{get_json, get_string, paths, StoreError};
use docwriter_types::{
    JobStage, Plan, ReviewFlavor, ReviewIssue, ReviewNote, Severity, StageMessage, VerifyReport,
};

use crate::context::StageContext;
use crate::error::StageError;
use crate::prompts;
use crate::stages::write::{merge_memory, parse_writer_output};
use crate::stages::{done, StageDisposition, StageOutcome};

/// Rewrite every flagged section against the cycle's findings: the rewrite
/// blob is kept for the audit trail and the canonical draft is replaced for
/// the next cycle.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let cycle = msg
        .cycle
        .ok_or_else(|| StageError::Validation("rewrite message missing cycle".to_string()))?;
    if msg.sections.is_empty() {
        return Err(StageError::Validation(
            "rewrite message carries no sections".to_string(),
        ));
    }
    let plan: Plan = get_json(
        ctx.objects.as_ref(),
        &paths::plan(&msg.owner_id, &msg.job_id),
    )
    .await?;

    let mut issues: Vec<ReviewIssue> = Vec::new();
    for flavor in ReviewFlavor::ALL {
        let key = paths::review(&msg.owner_id, &msg.job_id, cycle, flavor.as_str());
        if ctx.objects.exists(&key).await? {
            let note: ReviewNote = get_json(ctx.objects.as_ref(), &key).await?;
            issues.extend(note.issues);
        }
    }
    match get_json::<VerifyReport>(
        ctx.objects.as_ref(),
        &paths::verify(&msg.owner_id, &msg.job_id, cycle),
    )
    .await
    {
        Ok(report) => {
            for contradiction in report.contradictions {
                let against = contradiction
                    .against_section_id
                    .map(|id| format!(" (against {})", id))
                    .unwrap_or_default();
                issues.push(ReviewIssue {
                    section_id: contradiction.section_id,
                    severity: Severity::High,
                    description: format!("contradiction{}: {}", against, contradiction.description),
                    suggested_patch: None,
                });
            }
        }
        Err(StoreError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }

    let mut tokens = 0u64;
    let mut model = None;
    let mut last_artifact = None;

    for section_id in &msg.sections {
        let section = plan
            .section(section_id)
            .ok_or_else(|| {
                StageError::Validation(format!(
                    "rewrite message names unknown section '{}'",
                    section_id
                ))
            })?
            .clone();
        let draft_key = paths::draft(&msg.owner_id, &msg.job_id, section_id);
        let current = get_string(ctx.objects.as_ref(), &draft_key).await?;
        let section_issues: Vec<ReviewIssue> = issues
            .iter()
            .filter(|issue| issue.section_id == *section_id)
            .cloned()
            .collect();

        let completion = ctx
            .gateway
            .complete(
                AgentRole::Rewriter,
                &prompts::rewriter_system(),
                &prompts::rewriter_prompt(&section, &current, &section_issues),
            )
            .await?;
        tokens += completion.usage.total_tokens;
        model = Some(completion.model.clone());

        let output = parse_writer_output(&completion.text);
        let rewrite_key = paths::rewrite(&msg.owner_id, &msg.job_id, cycle, section_id);
        ctx.objects
            .put(&rewrite_key, output.markdown.clone().into_bytes())
            .await?;
        ctx.objects
            .put(&draft_key, output.markdown.into_bytes())
            .await?;
        merge_memory(ctx, &msg.owner_id, &msg.job_id, section_id, output.memory).await?;
        last_artifact = Some(rewrite_key);
    }

    // CAS gate so a redelivered rewrite cannot queue the same review twice.
    let next_cycle = cycle + 1;
    let gate = format!("review-queued:{}:{}", msg.job_id, next_cycle);
    match ctx.status.compare_and_swap(&gate, 0, 1).await {
        Ok(()) => {
            let mut next = msg.forward(JobStage::Review);
            next.cycle = Some(next_cycle);
            ctx.enqueue_stage(&next, None).await?;
        }
        Err(StoreError::VersionConflict { .. }) => {}
        Err(err) => return Err(err.into()),
    }

    let mut outcome = StageOutcome::new(format!(
        "rewrote {} section(s); review cycle {} queued",
        msg.sections.len(),
        next_cycle
    ));
    outcome.artifact = last_artifact;
    outcome.cycle = Some(cycle);
    outcome.tokens = tokens;
    outcome.model = model;
    done(outcome)
}
