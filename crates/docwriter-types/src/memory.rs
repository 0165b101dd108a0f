use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Memory carried forward from an already-written section: what later
/// sections must know about it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SectionMemory {
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub style_notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub glossary: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobMemory {
    #[serde(default)]
    pub sections: BTreeMap<String, SectionMemory>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub glossary: BTreeMap<String, String>,
}

impl JobMemory {
    /// Fold one section's increment in. Section entries overwrite (a rewrite
    /// replaces the old summary); glossary terms accumulate.
    pub fn merge_section(&mut self, section_id: &str, memory: SectionMemory) {
        for (term, definition) in &memory.glossary {
            self.glossary
                .entry(term.clone())
                .or_insert_with(|| definition.clone());
        }
        self.sections.insert(section_id.to_string(), memory);
    }

    /// Facts declared by the given sections, in section order.
    pub fn facts_for(&self, section_ids: &[String]) -> Vec<String> {
        section_ids
            .iter()
            .filter_map(|id| self.sections.get(id))
            .flat_map(|m| m.facts.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overwrites_section_but_accumulates_glossary() {
        let mut memory = JobMemory::default();
        memory.merge_section(
            "s1",
            SectionMemory {
                summary: "v1".to_string(),
                glossary: BTreeMap::from([("TERM".to_string(), "first".to_string())]),
                ..Default::default()
            },
        );
        memory.merge_section(
            "s1",
            SectionMemory {
                summary: "v2".to_string(),
                glossary: BTreeMap::from([("TERM".to_string(), "second".to_string())]),
                ..Default::default()
            },
        );
        assert_eq!(memory.sections["s1"].summary, "v2");
        assert_eq!(memory.glossary["TERM"], "first");
    }

    #[test]
    fn facts_surface_in_dependency_order() {
        let mut memory = JobMemory::default();
        memory.merge_section(
            "s1",
            SectionMemory {
                facts: vec!["f1".to_string()],
                ..Default::default()
            },
        );
        memory.merge_section(
            "s2",
            SectionMemory {
                facts: vec!["f2".to_string()],
                ..Default::default()
            },
        );
        let facts = memory.facts_for(&["s2".to_string(), "s1".to_string()]);
        assert_eq!(facts, vec!["f2".to_string(), "f1".to_string()]);
    }
}
