use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

mod scripted;

pub use scripted::ScriptedGateway;

/// Agent roles the pipeline calls models under; each can be pinned to its
/// own model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Interviewer,
    Planner,
    Writer,
    Reviewer,
    Verifier,
    Rewriter,
}

impl AgentRole {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Interviewer => "interviewer",
            AgentRole::Planner => "planner",
            AgentRole::Writer => "writer",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Verifier => "verifier",
            AgentRole::Rewriter => "rewriter",
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient provider failure: {0}")]
    Transient(String),
    #[error("provider rejected the request: {0}")]
    Fatal(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited { .. } | GatewayError::Transient(_)
        )
    }
}

fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// OpenAI-compatible base URL, e.g. `https://api.openai.com/v1`.
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub default_model: String,
    #[serde(default)]
    pub models: HashMap<AgentRole, String>,
    #[serde(default = "default_max_retries")]
    pub max_transient_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
}

impl GatewayConfig {
    pub fn model_for(&self, role: AgentRole) -> &str {
        self.models
            .get(&role)
            .map(String::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(self.default_model.as_str())
    }
}

/// Thin abstraction over model calls: per-role model selection, token
/// accounting, retry on transient failures. Stage workers depend only on
/// this trait, which is also the deterministic test seam.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError>;
}

pub struct HttpGateway {
    client: Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn call_once(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError> {
        let url = format!(
            "{}/chat/completions",
            self.config.endpoint.trim_end_matches('/')
        );
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "stream": false,
        });
        if let Some(max_tokens) = self.config.max_completion_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.config.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req
            .send()
            .await
            .map_err(|err| GatewayError::Transient(err.to_string()))?;
        let status = response.status();
        let retry_after = parse_retry_after(&response);
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| GatewayError::Transient(err.to_string()))?;

        if let Some(err) = classify_status(status, &value, retry_after) {
            return Err(err);
        }
        if let Some(detail) = extract_error(&value) {
            return Err(GatewayError::Fatal(detail));
        }

        let text = extract_text(&value).ok_or_else(|| {
            GatewayError::Fatal(format!(
                "provider returned no completion content for model `{}`",
                model
            ))
        })?;
        let usage = extract_usage(&value).unwrap_or_default();
        let model = value
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(model)
            .to_string();
        Ok(Completion { text, usage, model })
    }
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn complete(
        &self,
        role: AgentRole,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, GatewayError> {
        let model = self.config.model_for(role).to_string();
        let mut attempt = 0;
        loop {
            match self.call_once(&model, system_prompt, user_prompt).await {
                Ok(completion) => return Ok(completion),
                Err(err) if err.is_transient() && attempt < self.config.max_transient_retries => {
                    let delay = match &err {
                        GatewayError::RateLimited {
                            retry_after: Some(after),
                        } => *after,
                        _ => backoff_delay(attempt),
                    };
                    warn!(
                        role = role.as_str(),
                        model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient gateway failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn classify_status(
    status: StatusCode,
    body: &serde_json::Value,
    retry_after: Option<Duration>,
) -> Option<GatewayError> {
    if status.is_success() {
        return None;
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(GatewayError::RateLimited { retry_after });
    }
    let detail = extract_error(body)
        .unwrap_or_else(|| format!("provider request failed with status {}", status));
    if status.is_server_error() {
        Some(GatewayError::Transient(detail))
    } else {
        Some(GatewayError::Fatal(detail))
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Exponential backoff with a small hash-derived jitter so concurrent
/// workers do not retry in lockstep.
fn backoff_delay(attempt: u32) -> Duration {
    let base = 500u64.saturating_mul(1 << attempt.min(6));
    let mut hasher = DefaultHasher::new();
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        .hash(&mut hasher);
    Duration::from_millis(base + hasher.finish() % 250)
}

fn collect_text_fragments(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => out.push_str(s),
        serde_json::Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
            if let Some(message) = map.get("message") {
                collect_text_fragments(message, out);
            }
        }
        _ => {}
    }
}

fn extract_text(value: &serde_json::Value) -> Option<String> {
    let mut out = String::new();
    if let Some(choice) = value.get("choices").and_then(|v| v.get(0)) {
        collect_text_fragments(choice, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }
    if let Some(content) = value.get("content") {
        collect_text_fragments(content, &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }
    None
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage
        .get("prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let completion_tokens = usage
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GatewayConfig {
        GatewayConfig {
            endpoint: "https://llm.example.com/v1".to_string(),
            api_key: None,
            default_model: "base-model".to_string(),
            models: HashMap::from([(AgentRole::Planner, "planner-model".to_string())]),
            max_transient_retries: 3,
            max_completion_tokens: None,
        }
    }

    #[test]
    fn model_selection_falls_back_to_default() {
        let config = config();
        assert_eq!(config.model_for(AgentRole::Planner), "planner-model");
        assert_eq!(config.model_for(AgentRole::Writer), "base-model");
    }

    #[test]
    fn status_classification_matches_taxonomy() {
        let body = serde_json::json!({"error": {"message": "boom"}});
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &body, Some(Duration::from_secs(2))),
            Some(GatewayError::RateLimited {
                retry_after: Some(d)
            }) if d == Duration::from_secs(2)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &body, None),
            Some(GatewayError::Transient(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, &body, None),
            Some(GatewayError::Fatal(_))
        ));
        assert!(classify_status(StatusCode::OK, &body, None).is_none());
    }

    #[test]
    fn text_and_usage_extraction() {
        let body = serde_json::json!({
            "model": "base-model-0125",
            "choices": [{"message": {"content": "hello"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5}
        });
        assert_eq!(extract_text(&body).as_deref(), Some("hello"));
        let usage = extract_usage(&body).expect("usage");
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        assert!(backoff_delay(0) < Duration::from_millis(800));
        assert!(backoff_delay(3) >= Duration::from_millis(4000));
    }
}
