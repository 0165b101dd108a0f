use docwriter_store::{get_json, get_string, paths, put_json};
use docwriter_types::{JobStage, Plan, ReviewNote, Severity, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;
use crate::reviewers::reviewer_registry;
use crate::stages::{done, StageDisposition, StageOutcome};

pub(crate) async fn load_drafts(
    ctx: &StageContext,
    owner_id: &str,
    job_id: &str,
    plan: &Plan,
) -> Result<Vec<(String, String)>, StageError> {
    let mut drafts = Vec::with_capacity(plan.sections.len());
    for section in &plan.sections {
        let body = get_string(
            ctx.objects.as_ref(),
            &paths::draft(owner_id, job_id, &section.id),
        )
        .await?;
        drafts.push((section.id.clone(), body));
    }
    Ok(drafts)
}

/// Rewrite policy: a flavor forces a rewrite when it says so outright or
/// when any finding reaches the configured severity threshold.
pub(crate) fn note_forces_rewrite(note: &ReviewNote, threshold: Severity) -> bool {
    note.needs_rewrite || note.issues.iter().any(|issue| issue.severity >= threshold)
}

/// Fan out to the enabled review flavors concurrently, persist each note,
/// and hand the consolidated cycle to verify.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let cycle = msg
        .cycle
        .ok_or_else(|| StageError::Validation("review message missing cycle".to_string()))?;
    let plan: Plan = get_json(
        ctx.objects.as_ref(),
        &paths::plan(&msg.owner_id, &msg.job_id),
    )
    .await?;
    let drafts = load_drafts(ctx, &msg.owner_id, &msg.job_id, &plan).await?;

    let reviewers = reviewer_registry(&ctx.gateway, &ctx.config.review_flags);
    let futures = reviewers.iter().map(|reviewer| {
        let reviewer = reviewer.clone();
        let plan = &plan;
        let drafts = &drafts;
        async move {
            let note = reviewer.produce_findings(cycle, plan, drafts).await?;
            Ok::<_, StageError>((reviewer.flavor(), note))
        }
    });
    let findings = futures::future::try_join_all(futures).await?;

    let mut tokens = 0u64;
    for (flavor, note) in &findings {
        put_json(
            ctx.objects.as_ref(),
            &paths::review(&msg.owner_id, &msg.job_id, cycle, flavor.as_str()),
            note,
        )
        .await?;
        tokens += note.tokens_used;
    }

    let mut next = msg.forward(JobStage::Verify);
    next.cycle = Some(cycle);
    ctx.enqueue_stage(&next, None).await?;

    let mut outcome = StageOutcome::new(format!(
        "review cycle {} complete ({} flavor(s)); verify queued",
        cycle,
        findings.len()
    ));
    outcome.artifact = Some(paths::review(&msg.owner_id, &msg.job_id, cycle, "general"));
    outcome.cycle = Some(cycle);
    outcome.tokens = tokens;
    done(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwriter_types::ReviewIssue;

    fn note(needs_rewrite: bool, severity: Option<Severity>) -> ReviewNote {
        ReviewNote {
            issues: severity
                .map(|severity| {
                    vec![ReviewIssue {
                        section_id: "s1".to_string(),
                        severity,
                        description: "issue".to_string(),
                        suggested_patch: None,
                    }]
                })
                .unwrap_or_default(),
            needs_rewrite,
            tokens_used: 0,
        }
    }

    #[test]
    fn severity_threshold_forces_rewrite() {
        assert!(note_forces_rewrite(&note(false, Some(Severity::High)), Severity::High));
        assert!(note_forces_rewrite(
            &note(false, Some(Severity::Critical)),
            Severity::High
        ));
        assert!(!note_forces_rewrite(
            &note(false, Some(Severity::Medium)),
            Severity::High
        ));
    }

    #[test]
    fn explicit_flag_forces_rewrite_without_issues() {
        assert!(note_forces_rewrite(&note(true, None), Severity::High));
        assert!(!note_forces_rewrite(&note(false, None), Severity::High));
    }
}
