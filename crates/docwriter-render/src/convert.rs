use async_trait::async_trait;

use crate::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Pdf,
    Docx,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Docx => "docx",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "application/pdf",
            OutputFormat::Docx => {
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            }
        }
    }
}

/// Interface to the external PDF/DOCX conversion service. The finalize stage
/// calls it once per output format.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, markdown: &str, format: OutputFormat) -> Result<Vec<u8>, RenderError>;
}

/// In-tree default that hands the markdown bytes through unchanged. Wiring a
/// real converter replaces this at engine construction.
#[derive(Default)]
pub struct PassthroughConverter;

#[async_trait]
impl DocumentConverter for PassthroughConverter {
    async fn convert(&self, markdown: &str, _format: OutputFormat) -> Result<Vec<u8>, RenderError> {
        Ok(markdown.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passthrough_preserves_markdown_for_every_format() {
        let converter = PassthroughConverter;
        for format in [OutputFormat::Pdf, OutputFormat::Docx] {
            let bytes = converter.convert("# Title", format).await.expect("convert");
            assert_eq!(bytes, b"# Title");
        }
    }
}
