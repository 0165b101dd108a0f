use std::collections::BTreeMap;

use serde::Serialize;

use docwriter_render::{bundle_archive, OutputFormat};
use docwriter_store::{get_json, get_string, paths, put_json, StoreError};
use docwriter_types::{DiagramManifest, Plan, StageMessage, StagePhase};

use crate::context::StageContext;
use crate::error::StageError;
use crate::stages::diagram_prep::PLANTUML_FENCE;
use crate::stages::{done, StageDisposition, StageOutcome};

#[derive(Debug, Default, Clone, Serialize)]
struct StageUsage {
    tokens: u64,
    duration_s: f64,
    events: u32,
}

/// Replace fenced diagram sources with references to their rendered assets;
/// blocks without a manifest entry are left as-is.
fn embed_diagrams(section_id: &str, markdown: &str, manifest: &DiagramManifest) -> String {
    let mut index = 0;
    PLANTUML_FENCE
        .replace_all(markdown, |captures: &regex::Captures<'_>| {
            index += 1;
            let name = format!("{}-diagram-{}", section_id, index);
            if manifest.entry(&name).is_some() {
                format!("![{}](diagrams/{}.png)", name, name)
            } else {
                captures[0].to_string()
            }
        })
        .into_owned()
}

/// Assemble the terminal artifact set: `final.md` from the plan order with
/// diagrams embedded, the converted `final.pdf`/`final.docx`, the diagram
/// bundle, and the usage metrics blob. No further stage is enqueued.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let record = ctx.status.get_job(&msg.owner_id, &msg.job_id).await?;
    let plan: Plan = get_json(
        ctx.objects.as_ref(),
        &paths::plan(&msg.owner_id, &msg.job_id),
    )
    .await?;
    let manifest: DiagramManifest = match get_json(
        ctx.objects.as_ref(),
        &paths::diagram_index(&msg.owner_id, &msg.job_id),
    )
    .await
    {
        Ok(manifest) => manifest,
        Err(StoreError::NotFound(_)) => DiagramManifest::default(),
        Err(err) => return Err(err.into()),
    };

    let mut doc = format!("# {}\n\n_Prepared for {}_\n\n", record.title, record.audience);
    if let Some(summary) = plan
        .executive_summary
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        doc.push_str(&format!("## Executive Summary\n\n{}\n\n", summary.trim()));
    }
    for section in &plan.sections {
        let draft = get_string(
            ctx.objects.as_ref(),
            &paths::draft(&msg.owner_id, &msg.job_id, &section.id),
        )
        .await?;
        let body = embed_diagrams(&section.id, &draft, &manifest);
        doc.push_str(&format!("## {}\n\n{}\n\n", section.title, body.trim_end()));
        for spec in &section.diagram_specs {
            if manifest.entry(&spec.name).is_some() {
                doc.push_str(&format!("![{}](diagrams/{}.png)\n\n", spec.name, spec.name));
            }
        }
    }

    let markdown_key = paths::final_markdown(&msg.owner_id, &msg.job_id);
    ctx.objects
        .put(&markdown_key, doc.clone().into_bytes())
        .await?;

    let pdf = ctx.converter.convert(&doc, OutputFormat::Pdf).await?;
    ctx.objects
        .put(&paths::final_pdf(&msg.owner_id, &msg.job_id), pdf)
        .await?;
    let docx = ctx.converter.convert(&doc, OutputFormat::Docx).await?;
    ctx.objects
        .put(&paths::final_docx(&msg.owner_id, &msg.job_id), docx)
        .await?;

    let diagrams_prefix = format!("{}/diagrams", paths::job_root(&msg.owner_id, &msg.job_id));
    let mut archive_entries = Vec::new();
    for key in ctx.objects.list(&diagrams_prefix).await? {
        let name = key
            .rsplit('/')
            .next()
            .unwrap_or(key.as_str())
            .to_string();
        let bytes = ctx.objects.get(&key).await?;
        archive_entries.push((name, bytes));
    }
    let archive = bundle_archive(&archive_entries)?;
    ctx.objects
        .put(&paths::diagram_archive(&msg.owner_id, &msg.job_id), archive)
        .await?;

    let timeline = ctx.status.timeline(&msg.owner_id, &msg.job_id).await?;
    let mut usage: BTreeMap<String, StageUsage> = BTreeMap::new();
    for event in timeline
        .iter()
        .filter(|event| event.phase == StagePhase::Done)
    {
        let slot = usage.entry(event.stage.as_str().to_string()).or_default();
        slot.tokens += event.details.tokens.unwrap_or(0);
        slot.duration_s += event.details.duration_s.unwrap_or(0.0);
        slot.events += 1;
    }
    put_json(
        ctx.objects.as_ref(),
        &paths::metrics(&msg.owner_id, &msg.job_id, "usage"),
        &usage,
    )
    .await?;

    let mut outcome = StageOutcome::new("document finalized");
    outcome.artifact = Some(markdown_key);
    done(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwriter_types::DiagramManifestEntry;

    fn manifest_with(name: &str) -> DiagramManifest {
        DiagramManifest {
            entries: vec![DiagramManifestEntry {
                name: name.to_string(),
                language: "plantuml".to_string(),
                source_path: format!("jobs/u/j/diagrams/{}.puml", name),
                asset_path: format!("jobs/u/j/diagrams/{}.png", name),
                section_id: Some("s1".to_string()),
            }],
        }
    }

    #[test]
    fn fenced_sources_become_image_references() {
        let markdown = "Before.\n\n```plantuml\n@startuml\nA -> B\n@enduml\n```\n\nAfter.";
        let embedded = embed_diagrams("s1", markdown, &manifest_with("s1-diagram-1"));
        assert!(embedded.contains("![s1-diagram-1](diagrams/s1-diagram-1.png)"));
        assert!(!embedded.contains("@startuml"));
    }

    #[test]
    fn unknown_blocks_are_left_alone() {
        let markdown = "```plantuml\n@startuml\nA -> B\n@enduml\n```";
        let embedded = embed_diagrams("s1", markdown, &DiagramManifest::default());
        assert!(embedded.contains("@startuml"));
    }
}
