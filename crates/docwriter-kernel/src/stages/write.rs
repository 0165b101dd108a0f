use std::collections::HashSet;

use serde::Deserialize;

use docwriter_gateway::AgentRole;
use docwriter_store::{get_json, paths, put_json, StoreError};
use docwriter_types::{JobMemory, JobStage, Plan, SectionMemory, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;
use crate::prompts;
use crate::stages::{done, StageDisposition, StageOutcome};

#[derive(Debug, Deserialize)]
pub(crate) struct WriterOutput {
    pub markdown: String,
    #[serde(default)]
    pub memory: SectionMemory,
}

/// Writers are asked for the JSON contract; prose replies fall back to
/// markdown-as-is with a summary derived from the first line.
pub(crate) fn parse_writer_output(raw: &str) -> WriterOutput {
    match prompts::parse_model_json::<WriterOutput>(raw) {
        Ok(output) if !output.markdown.trim().is_empty() => output,
        _ => {
            let summary: String = raw
                .lines()
                .find(|line| !line.trim().is_empty())
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            WriterOutput {
                markdown: raw.to_string(),
                memory: SectionMemory {
                    summary,
                    ..Default::default()
                },
            }
        }
    }
}

pub(crate) async fn load_memory(
    ctx: &StageContext,
    owner_id: &str,
    job_id: &str,
) -> Result<JobMemory, StageError> {
    match get_json(ctx.objects.as_ref(), &paths::memory(owner_id, job_id)).await {
        Ok(memory) => Ok(memory),
        Err(StoreError::NotFound(_)) => Ok(JobMemory::default()),
        Err(err) => Err(err.into()),
    }
}

/// Serialize concurrent memory merges with a compare-and-swap on the job's
/// memory version; losers re-read and retry the merge.
pub(crate) async fn merge_memory(
    ctx: &StageContext,
    owner_id: &str,
    job_id: &str,
    section_id: &str,
    increment: SectionMemory,
) -> Result<(), StageError> {
    let version_key = format!("memory:{}", job_id);
    for _ in 0..5 {
        let version = ctx.status.get_counter(&version_key).await;
        let mut memory = load_memory(ctx, owner_id, job_id).await?;
        memory.merge_section(section_id, increment.clone());
        match ctx
            .status
            .compare_and_swap(&version_key, version, version + 1)
            .await
        {
            Ok(()) => {
                put_json(
                    ctx.objects.as_ref(),
                    &paths::memory(owner_id, job_id),
                    &memory,
                )
                .await?;
                return Ok(());
            }
            Err(StoreError::VersionConflict { .. }) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(StageError::Transient(
        "memory merge contention; retry delivery".to_string(),
    ))
}

/// Write the message's sections in order. A section whose predecessors are
/// not yet drafted abandons the delivery with a visibility delay; the first
/// worker to observe the full draft set queues review cycle 1.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    if msg.sections.is_empty() {
        return Err(StageError::Validation(
            "write message carries no sections".to_string(),
        ));
    }
    let plan: Plan = get_json(
        ctx.objects.as_ref(),
        &paths::plan(&msg.owner_id, &msg.job_id),
    )
    .await?;

    let drafts_prefix = format!("{}/drafts", paths::job_root(&msg.owner_id, &msg.job_id));
    let mut drafted: HashSet<String> = ctx
        .objects
        .list(&drafts_prefix)
        .await?
        .iter()
        .filter_map(|key| paths::section_of_draft(key))
        .map(str::to_string)
        .collect();

    let mut tokens = 0u64;
    let mut model = None;
    let mut newly_written: Vec<String> = Vec::new();

    for section_id in &msg.sections {
        let section = plan
            .section(section_id)
            .ok_or_else(|| {
                StageError::Validation(format!(
                    "write message names unknown section '{}'",
                    section_id
                ))
            })?
            .clone();
        if drafted.contains(section_id) {
            continue;
        }
        if !plan.dependencies_met(section_id, &drafted) {
            return Ok(StageDisposition::Retry {
                reason: format!("section '{}' waiting on predecessors", section_id),
                delay: ctx.config.dependency_retry_delay,
            });
        }

        let memory = load_memory(ctx, &msg.owner_id, &msg.job_id).await?;
        let predecessor_summaries: Vec<(String, String)> = section
            .depends_on
            .iter()
            .filter_map(|dep| {
                memory
                    .sections
                    .get(dep)
                    .map(|m| (dep.clone(), m.summary.clone()))
            })
            .collect();
        let inherited_facts = memory.facts_for(&section.depends_on);

        let completion = ctx
            .gateway
            .complete(
                AgentRole::Writer,
                &prompts::writer_system(),
                &prompts::writer_prompt(&section, &plan, &predecessor_summaries, &inherited_facts),
            )
            .await?;
        tokens += completion.usage.total_tokens;
        model = Some(completion.model.clone());

        let output = parse_writer_output(&completion.text);
        ctx.objects
            .put(
                &paths::draft(&msg.owner_id, &msg.job_id, section_id),
                output.markdown.into_bytes(),
            )
            .await?;
        merge_memory(ctx, &msg.owner_id, &msg.job_id, section_id, output.memory).await?;
        drafted.insert(section_id.clone());
        newly_written.push(section_id.clone());
    }

    // Fan-in: a CAS gate makes exactly one worker queue the first review,
    // even across redeliveries.
    let all_present = plan.sections.iter().all(|s| drafted.contains(&s.id));
    let mut queued_review = false;
    if all_present {
        let gate = format!("review-queued:{}:1", msg.job_id);
        match ctx.status.compare_and_swap(&gate, 0, 1).await {
            Ok(()) => {
                let mut next = msg.forward(JobStage::Review);
                next.cycle = Some(1);
                ctx.enqueue_stage(&next, None).await?;
                queued_review = true;
            }
            Err(StoreError::VersionConflict { .. }) => {}
            Err(err) => return Err(err.into()),
        }
    }

    let mut outcome = StageOutcome::new(if queued_review {
        "all sections drafted; review cycle 1 queued".to_string()
    } else {
        format!("drafted {} section(s)", newly_written.len())
    });
    if let Some(last) = newly_written.last() {
        outcome.artifact = Some(paths::draft(&msg.owner_id, &msg.job_id, last));
    }
    outcome.tokens = tokens;
    outcome.model = model;
    done(outcome)
}
