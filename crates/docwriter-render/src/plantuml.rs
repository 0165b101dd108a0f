use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;

use crate::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramFormat {
    Png,
    Svg,
}

impl DiagramFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiagramFormat::Png => "png",
            DiagramFormat::Svg => "svg",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            DiagramFormat::Png => "image/png",
            DiagramFormat::Svg => "image/svg+xml",
        }
    }
}

/// External diagram renderer. The pipeline depends only on this trait; the
/// HTTP client below talks to a PlantUML server.
#[async_trait]
pub trait DiagramRenderer: Send + Sync {
    async fn render(&self, source: &str, format: DiagramFormat) -> Result<Vec<u8>, RenderError>;
}

pub struct PlantUmlClient {
    base_url: String,
    client: Client,
    max_transient_retries: u32,
}

impl PlantUmlClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: Client::new(),
            max_transient_retries: 3,
        }
    }

    pub fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    fn render_url(&self, format: DiagramFormat) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), format.as_str())
    }

    async fn render_once(
        &self,
        source: &str,
        format: DiagramFormat,
    ) -> Result<Vec<u8>, RenderError> {
        let response = self
            .client
            .post(self.render_url(format))
            .header("content-type", "text/plain; charset=utf-8")
            .body(source.to_string())
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|err| RenderError::Transient(err.to_string()))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(RenderError::Transient(format!(
                "renderer returned status {}",
                status
            )));
        }
        if !status.is_success() {
            return Err(RenderError::Fatal(format!(
                "renderer returned status {}",
                status
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| RenderError::Transient(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl DiagramRenderer for PlantUmlClient {
    async fn render(&self, source: &str, format: DiagramFormat) -> Result<Vec<u8>, RenderError> {
        let mut attempt = 0;
        loop {
            match self.render_once(source, format).await {
                Ok(bytes) => return Ok(bytes),
                Err(err) if err.is_transient() && attempt < self.max_transient_retries => {
                    let delay = Duration::from_millis(250 * (1 << attempt.min(5)));
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient renderer failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Deterministic renderer for tests: stamps the format and source into the
/// returned bytes and counts invocations.
#[derive(Default)]
pub struct ScriptedRenderer {
    renders: AtomicU32,
}

impl ScriptedRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn render_count(&self) -> u32 {
        self.renders.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiagramRenderer for ScriptedRenderer {
    async fn render(&self, source: &str, format: DiagramFormat) -> Result<Vec<u8>, RenderError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}:{}", format.as_str(), source.len()).into_bytes())
    }
}
