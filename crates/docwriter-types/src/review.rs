use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlavor {
    General,
    Style,
    Cohesion,
    Summary,
}

impl ReviewFlavor {
    pub const ALL: [ReviewFlavor; 4] = [
        ReviewFlavor::General,
        ReviewFlavor::Style,
        ReviewFlavor::Cohesion,
        ReviewFlavor::Summary,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ReviewFlavor::General => "general",
            ReviewFlavor::Style => "style",
            ReviewFlavor::Cohesion => "cohesion",
            ReviewFlavor::Summary => "summary",
        }
    }
}

impl std::fmt::Display for ReviewFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIssue {
    pub section_id: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_patch: Option<String>,
}

/// Structured findings from one review flavor in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewNote {
    #[serde(default)]
    pub issues: Vec<ReviewIssue>,
    #[serde(default)]
    pub needs_rewrite: bool,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub section_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub against_section_id: Option<String>,
    pub description: String,
}

/// Consolidated second-pass decision for a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VerifyReport {
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    #[serde(default)]
    pub needs_rewrite: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_low_to_critical() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn review_note_defaults_are_empty() {
        let note: ReviewNote = serde_json::from_str("{}").expect("parse");
        assert!(note.issues.is_empty());
        assert!(!note.needs_rewrite);
    }
}
