use serde::{Deserialize, Serialize};

/// One renderable diagram discovered by diagram-prep: either declared in the
/// plan or embedded in a draft as a fenced source block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramManifestEntry {
    pub name: String,
    pub language: String,
    /// Blob key of the persisted source (`diagrams/{name}.puml`).
    pub source_path: String,
    /// Blob key the rendered asset will land at (`diagrams/{name}.png`).
    pub asset_path: String,
    /// Section the diagram is embedded in, when it came from a draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_id: Option<String>,
}

/// `diagrams/index.json`: maps logical references inside the Markdown to
/// asset paths and fixes the render fan-in total.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiagramManifest {
    #[serde(default)]
    pub entries: Vec<DiagramManifestEntry>,
}

impl DiagramManifest {
    pub fn entry(&self, name: &str) -> Option<&DiagramManifestEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}
