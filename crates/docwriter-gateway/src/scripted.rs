use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{AgentRole, Completion, GatewayError, LlmGateway, TokenUsage};

enum ScriptedReply {
    Text(String),
    TransientFailure(String),
}

/// Deterministic gateway for tests: replies are scripted per role and
/// consumed in order, and every prompt is recorded for assertions.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<HashMap<AgentRole, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<(AgentRole, String)>>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn push_text(&self, role: AgentRole, text: impl Into<String>) {
        self.scripts
            .lock()
            .await
            .entry(role)
            .or_default()
            .push_back(ScriptedReply::Text(text.into()));
    }

    pub async fn push_transient_failure(&self, role: AgentRole, message: impl Into<String>) {
        self.scripts
            .lock()
            .await
            .entry(role)
            .or_default()
            .push_back(ScriptedReply::TransientFailure(message.into()));
    }

    pub async fn calls(&self) -> Vec<(AgentRole, String)> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn complete(
        &self,
        role: AgentRole,
        _system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError> {
        self.calls
            .lock()
            .await
            .push((role, user_prompt.to_string()));
        let reply = self
            .scripts
            .lock()
            .await
            .get_mut(&role)
            .and_then(|queue| queue.pop_front());
        match reply {
            Some(ScriptedReply::Text(text)) => {
                let usage = TokenUsage {
                    prompt_tokens: (user_prompt.len() / 4) as u64,
                    completion_tokens: (text.len() / 4) as u64,
                    total_tokens: ((user_prompt.len() + text.len()) / 4) as u64,
                };
                Ok(Completion {
                    text,
                    usage,
                    model: format!("scripted-{}", role),
                })
            }
            Some(ScriptedReply::TransientFailure(message)) => {
                Err(GatewayError::Transient(message))
            }
            None => Err(GatewayError::Fatal(format!(
                "no scripted reply left for role `{}`",
                role
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_are_consumed_in_order_per_role() {
        let gateway = ScriptedGateway::new();
        gateway.push_text(AgentRole::Writer, "first").await;
        gateway
            .push_transient_failure(AgentRole::Writer, "blip")
            .await;
        gateway.push_text(AgentRole::Writer, "second").await;

        let one = gateway
            .complete(AgentRole::Writer, "sys", "p1")
            .await
            .expect("first");
        assert_eq!(one.text, "first");
        assert!(matches!(
            gateway.complete(AgentRole::Writer, "sys", "p2").await,
            Err(GatewayError::Transient(_))
        ));
        let three = gateway
            .complete(AgentRole::Writer, "sys", "p3")
            .await
            .expect("second");
        assert_eq!(three.text, "second");

        assert!(matches!(
            gateway.complete(AgentRole::Writer, "sys", "p4").await,
            Err(GatewayError::Fatal(_))
        ));
        assert_eq!(gateway.calls().await.len(), 4);
    }
}
