use docwriter_render::DiagramFormat;
use docwriter_store::{get_json, paths, StoreError};
use docwriter_types::{DiagramManifest, JobStage, StageMessage};

use crate::context::StageContext;
use crate::error::StageError;
use crate::stages::{done, StageDisposition, StageOutcome};

/// Render one diagram through the external renderer. The "last diagram"
/// decision races across parallel render workers, so it rides an atomic
/// counter: only the worker whose increment reaches the manifest total
/// queues finalize.
pub async fn run(
    ctx: &StageContext,
    msg: &StageMessage,
) -> Result<StageDisposition, StageError> {
    let diagram = msg.diagram.as_ref().ok_or_else(|| {
        StageError::Validation("diagram-render message missing diagram source".to_string())
    })?;
    let manifest: DiagramManifest = get_json(
        ctx.objects.as_ref(),
        &paths::diagram_index(&msg.owner_id, &msg.job_id),
    )
    .await?;
    if manifest.entry(&diagram.name).is_none() {
        return Err(StageError::Validation(format!(
            "diagram '{}' is not in the manifest",
            diagram.name
        )));
    }

    let asset_key = paths::diagram_asset(&msg.owner_id, &msg.job_id, &diagram.name, "png");
    if !ctx.objects.exists(&asset_key).await? {
        let bytes = ctx
            .renderer
            .render(&diagram.source_text, DiagramFormat::Png)
            .await?;
        ctx.objects.put(&asset_key, bytes).await?;
        if ctx.config.render_svg {
            let svg = ctx
                .renderer
                .render(&diagram.source_text, DiagramFormat::Svg)
                .await?;
            ctx.objects
                .put(
                    &paths::diagram_asset(&msg.owner_id, &msg.job_id, &diagram.name, "svg"),
                    svg,
                )
                .await?;
        }
    }

    // Count each diagram exactly once via a per-diagram CAS gate: a
    // redelivery after a crash between put and count still advances the
    // counter, so the rendered == total decision cannot undercount.
    let total = manifest.entries.len() as u64;
    let gate = format!("diagram-counted:{}:{}", msg.job_id, diagram.name);
    let message = match ctx.status.compare_and_swap(&gate, 0, 1).await {
        Ok(()) => {
            let rendered = ctx
                .status
                .increment_counter(&format!("diagrams-rendered:{}", msg.job_id), 1)
                .await?;
            if rendered == total {
                let next = msg.forward(JobStage::Finalize);
                ctx.enqueue_stage(&next, None).await?;
                format!("all {} diagram(s) rendered; finalize queued", total)
            } else {
                format!("rendered diagram {}/{}", rendered, total)
            }
        }
        Err(StoreError::VersionConflict { .. }) => {
            format!("diagram '{}' already rendered", diagram.name)
        }
        Err(err) => return Err(err.into()),
    };

    let mut outcome = StageOutcome::new(message);
    outcome.artifact = Some(asset_key);
    done(outcome)
}
