use std::sync::Arc;

use async_trait::async_trait;

use docwriter_gateway::{AgentRole, LlmGateway};
use docwriter_types::{Plan, ReviewFlavor, ReviewNote};

use crate::config::ReviewFlags;
use crate::error::StageError;
use crate::prompts;

/// A reviewer produces structured findings for one flavor. Concrete variants
/// are selected by feature flags; only `general` is always on.
#[async_trait]
pub trait Reviewer: Send + Sync {
    fn flavor(&self) -> ReviewFlavor;
    async fn produce_findings(
        &self,
        cycle: u32,
        plan: &Plan,
        drafts: &[(String, String)],
    ) -> Result<ReviewNote, StageError>;
}

pub struct LlmReviewer {
    flavor: ReviewFlavor,
    gateway: Arc<dyn LlmGateway>,
}

impl LlmReviewer {
    pub fn new(flavor: ReviewFlavor, gateway: Arc<dyn LlmGateway>) -> Self {
        Self { flavor, gateway }
    }
}

#[async_trait]
impl Reviewer for LlmReviewer {
    fn flavor(&self) -> ReviewFlavor {
        self.flavor
    }

    async fn produce_findings(
        &self,
        cycle: u32,
        plan: &Plan,
        drafts: &[(String, String)],
    ) -> Result<ReviewNote, StageError> {
        let completion = self
            .gateway
            .complete(
                AgentRole::Reviewer,
                &prompts::reviewer_system(self.flavor),
                &prompts::reviewer_prompt(cycle, plan, drafts),
            )
            .await?;
        let mut note: ReviewNote = prompts::parse_model_json(&completion.text).map_err(|err| {
            StageError::Durable(format!(
                "{} reviewer returned unparseable findings: {}",
                self.flavor, err
            ))
        })?;
        note.tokens_used = completion.usage.total_tokens;
        Ok(note)
    }
}

/// Build the active reviewer set: `general` always, the rest by flag.
pub fn reviewer_registry(
    gateway: &Arc<dyn LlmGateway>,
    flags: &ReviewFlags,
) -> Vec<Arc<dyn Reviewer>> {
    let mut reviewers: Vec<Arc<dyn Reviewer>> = vec![Arc::new(LlmReviewer::new(
        ReviewFlavor::General,
        gateway.clone(),
    ))];
    if flags.style {
        reviewers.push(Arc::new(LlmReviewer::new(
            ReviewFlavor::Style,
            gateway.clone(),
        )));
    }
    if flags.cohesion {
        reviewers.push(Arc::new(LlmReviewer::new(
            ReviewFlavor::Cohesion,
            gateway.clone(),
        )));
    }
    if flags.summary {
        reviewers.push(Arc::new(LlmReviewer::new(
            ReviewFlavor::Summary,
            gateway.clone(),
        )));
    }
    reviewers
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwriter_gateway::ScriptedGateway;

    #[tokio::test]
    async fn registry_respects_flags() {
        let gateway: Arc<dyn LlmGateway> = Arc::new(ScriptedGateway::new());
        let base = reviewer_registry(&gateway, &ReviewFlags::default());
        assert_eq!(base.len(), 1);
        assert_eq!(base[0].flavor(), ReviewFlavor::General);

        let all = reviewer_registry(
            &gateway,
            &ReviewFlags {
                style: true,
                cohesion: true,
                summary: true,
            },
        );
        let flavors: Vec<ReviewFlavor> = all.iter().map(|r| r.flavor()).collect();
        assert_eq!(
            flavors,
            vec![
                ReviewFlavor::General,
                ReviewFlavor::Style,
                ReviewFlavor::Cohesion,
                ReviewFlavor::Summary
            ]
        );
    }
}
