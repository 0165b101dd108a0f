use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;

use docwriter_store::{get_json, get_string, paths, put_json};
use docwriter_types::{
    DiagramManifest, DiagramManifestEntry, DiagramSource, JobStage, Plan, StageMessage,
};

use crate::context::StageContext;
use crate::error::StageError;
use crate::stages::{done, StageDisposition, StageOutcome};

pub(crate) static PLANTUML_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?ms)^```plantuml[ \t]*\r?\n(.*?)^```[ \t]*$")
        .expect("plantuml fence pattern compiles")
});

/// Fenced diagram sources in a draft, named `{section}-diagram-{n}` in
/// order of appearance.
pub(crate) fn embedded_diagrams(section_id: &str, markdown: &str) -> Vec<(String, String)> {
    PLANTUML_FENCE
        .captures_iter(markdown)
        .enumerate()
        .map(|(index, captures)| {
            (
                format!("{}-diagram-{}", section_id, index + 1),
                captures[1].trim_end().to_string(),
            )
        })
        .collect()
}

/// Collect diagram sources from the plan and the drafts, persist them with
/// the manifest, and fan out one render message per diagram. Zero diagrams
/// short-circuits straight to finalize.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let plan: Plan = get_json(
        ctx.objects.as_ref(),
        &paths::plan(&msg.owner_id, &msg.job_id),
    )
    .await?;

    let mut seen: HashSet<String> = HashSet::new();
    let mut sources: Vec<(String, String, String, Option<String>)> = Vec::new();
    for section in &plan.sections {
        for spec in &section.diagram_specs {
            if seen.insert(spec.name.clone()) {
                sources.push((
                    spec.name.clone(),
                    spec.language.clone(),
                    spec.source.clone(),
                    Some(section.id.clone()),
                ));
            }
        }
    }
    for section in &plan.sections {
        let draft = get_string(
            ctx.objects.as_ref(),
            &paths::draft(&msg.owner_id, &msg.job_id, &section.id),
        )
        .await?;
        for (name, source) in embedded_diagrams(&section.id, &draft) {
            if seen.insert(name.clone()) {
                sources.push((name, "plantuml".to_string(), source, Some(section.id.clone())));
            }
        }
    }

    let mut manifest = DiagramManifest::default();
    for (name, language, source, section_id) in &sources {
        let source_path = paths::diagram_source(&msg.owner_id, &msg.job_id, name);
        ctx.objects
            .put(&source_path, source.clone().into_bytes())
            .await?;
        manifest.entries.push(DiagramManifestEntry {
            name: name.clone(),
            language: language.clone(),
            source_path,
            asset_path: paths::diagram_asset(&msg.owner_id, &msg.job_id, name, "png"),
            section_id: section_id.clone(),
        });
    }
    let index_key = paths::diagram_index(&msg.owner_id, &msg.job_id);
    put_json(ctx.objects.as_ref(), &index_key, &manifest).await?;

    let message = if manifest.entries.is_empty() {
        let next = msg.forward(JobStage::Finalize);
        ctx.enqueue_stage(&next, None).await?;
        "no diagrams to render; finalize queued".to_string()
    } else {
        for (name, language, source, _) in &sources {
            let mut next = msg.forward(JobStage::DiagramRender);
            next.diagram = Some(DiagramSource {
                name: name.clone(),
                source_language: language.clone(),
                source_text: source.clone(),
            });
            ctx.enqueue_stage(&next, None).await?;
        }
        format!("prepared {} diagram(s); rendering queued", sources.len())
    };

    let mut outcome = StageOutcome::new(message);
    outcome.artifact = Some(index_key);
    done(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_plantuml_blocks_in_order() {
        let markdown = "Intro.\n\n```plantuml\n@startuml\nA -> B\n@enduml\n```\n\nText.\n\n```plantuml\n@startuml\nB -> C\n@enduml\n```\n";
        let diagrams = embedded_diagrams("s1", markdown);
        assert_eq!(diagrams.len(), 2);
        assert_eq!(diagrams[0].0, "s1-diagram-1");
        assert!(diagrams[0].1.contains("A -> B"));
        assert_eq!(diagrams[1].0, "s1-diagram-2");
    }

    #[test]
    fn ignores_other_fences() {
        let markdown = "```rust\nfn main() {}\n```\n";
        assert!(embedded_diagrams("s1", markdown).is_empty());
    }
}
