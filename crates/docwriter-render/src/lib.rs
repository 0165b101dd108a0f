use thiserror::Error;

mod archive;
mod convert;
mod plantuml;

pub use archive::bundle_archive;
pub use convert::{DocumentConverter, OutputFormat, PassthroughConverter};
pub use plantuml::{DiagramFormat, DiagramRenderer, PlantUmlClient, ScriptedRenderer};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("transient renderer failure: {0}")]
    Transient(String),
    #[error("renderer rejected the request: {0}")]
    Fatal(String),
    #[error("archive failed: {0}")]
    Archive(String),
}

impl RenderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RenderError::Transient(_))
    }
}
