use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

fn default_spec_language() -> String {
    "plantuml".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramSpec {
    pub name: String,
    #[serde(default = "default_spec_language")]
    pub language: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagram_specs: Vec<DiagramSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_words: Option<u32>,
}

/// Document plan. Section order is authoritative: dependencies may only
/// point at sections that appear earlier in the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub sections: Vec<SectionSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub glossary: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub style_guide: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<String>,
}

impl Plan {
    pub fn section(&self, id: &str) -> Option<&SectionSpec> {
        self.sections.iter().find(|s| s.id == id)
    }

    /// True when every dependency of `section` has a member in `drafted`.
    pub fn dependencies_met(&self, section_id: &str, drafted: &HashSet<String>) -> bool {
        self.section(section_id)
            .map(|s| s.depends_on.iter().all(|dep| drafted.contains(dep)))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    EmptySectionList,
    DuplicateSectionId { section_id: String },
    UnknownDependency { section_id: String, dependency_id: String },
    ForwardDependency { section_id: String, dependency_id: String },
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySectionList => write!(f, "plan has no sections"),
            Self::DuplicateSectionId { section_id } => {
                write!(f, "duplicate section id '{}'", section_id)
            }
            Self::UnknownDependency {
                section_id,
                dependency_id,
            } => write!(
                f,
                "section '{}' depends on unknown section '{}'",
                section_id, dependency_id
            ),
            Self::ForwardDependency {
                section_id,
                dependency_id,
            } => write!(
                f,
                "section '{}' depends on '{}' which appears later in the plan",
                section_id, dependency_id
            ),
        }
    }
}

impl std::error::Error for PlanError {}

/// Validate the plan invariants: at least one section, unique ids, and every
/// dependency resolving to an earlier section. The earlier-only rule makes
/// cycles structurally impossible, so an accepted plan is always a DAG in
/// topological order.
pub fn validate_plan(plan: &Plan) -> Result<(), PlanError> {
    if plan.sections.is_empty() {
        return Err(PlanError::EmptySectionList);
    }

    let all_ids: HashSet<&str> = plan.sections.iter().map(|s| s.id.as_str()).collect();
    if all_ids.len() != plan.sections.len() {
        let mut seen = HashSet::new();
        for section in &plan.sections {
            if !seen.insert(section.id.as_str()) {
                return Err(PlanError::DuplicateSectionId {
                    section_id: section.id.clone(),
                });
            }
        }
    }

    let mut earlier: HashSet<&str> = HashSet::new();
    for section in &plan.sections {
        for dep in &section.depends_on {
            if !all_ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    section_id: section.id.clone(),
                    dependency_id: dep.clone(),
                });
            }
            if !earlier.contains(dep.as_str()) {
                return Err(PlanError::ForwardDependency {
                    section_id: section.id.clone(),
                    dependency_id: dep.clone(),
                });
            }
        }
        earlier.insert(section.id.as_str());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(id: &str, deps: Vec<&str>) -> SectionSpec {
        SectionSpec {
            id: id.to_string(),
            title: format!("Section {}", id),
            depends_on: deps.into_iter().map(String::from).collect(),
            diagram_specs: Vec::new(),
            target_words: None,
        }
    }

    fn plan_of(sections: Vec<SectionSpec>) -> Plan {
        Plan {
            sections,
            glossary: BTreeMap::new(),
            style_guide: Vec::new(),
            constraints: Vec::new(),
            executive_summary: None,
        }
    }

    #[test]
    fn accepts_a_topologically_ordered_plan() {
        let plan = plan_of(vec![
            section("s1", vec![]),
            section("s2", vec!["s1"]),
            section("s3", vec!["s1", "s2"]),
        ]);
        assert!(validate_plan(&plan).is_ok());
    }

    #[test]
    fn rejects_empty_plans() {
        assert_eq!(
            validate_plan(&plan_of(vec![])),
            Err(PlanError::EmptySectionList)
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let plan = plan_of(vec![section("s1", vec![]), section("s1", vec![])]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanError::DuplicateSectionId { .. })
        ));
    }

    #[test]
    fn rejects_unknown_dependencies() {
        let plan = plan_of(vec![section("s1", vec!["ghost"])]);
        assert!(matches!(
            validate_plan(&plan),
            Err(PlanError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn rejects_forward_and_cyclic_dependencies() {
        let forward = plan_of(vec![section("s1", vec!["s2"]), section("s2", vec![])]);
        assert!(matches!(
            validate_plan(&forward),
            Err(PlanError::ForwardDependency { .. })
        ));

        let cyclic = plan_of(vec![
            section("s1", vec!["s2"]),
            section("s2", vec!["s1"]),
        ]);
        assert!(validate_plan(&cyclic).is_err());
    }

    #[test]
    fn dependency_readiness_tracks_drafted_set() {
        let plan = plan_of(vec![section("s1", vec![]), section("s2", vec!["s1"])]);
        let mut drafted = HashSet::new();
        assert!(!plan.dependencies_met("s2", &drafted));
        drafted.insert("s1".to_string());
        assert!(plan.dependencies_met("s2", &drafted));
    }
}
