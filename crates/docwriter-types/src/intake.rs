use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeQuestion {
    pub id: String,
    pub q: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
}

/// Authoritative planner input. Deliberately timestamp-free so that replaying
/// intake-resume with identical answers yields byte-identical context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeContext {
    pub title: String,
    pub audience: String,
    pub cycles: u32,
    #[serde(default)]
    pub answers: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_serialization_is_deterministic() {
        let mut answers = BTreeMap::new();
        answers.insert("a2".to_string(), "later".to_string());
        answers.insert("a1".to_string(), "first".to_string());
        let ctx = IntakeContext {
            title: "T".to_string(),
            audience: "A".to_string(),
            cycles: 2,
            answers,
        };
        let one = serde_json::to_string(&ctx).expect("serialize");
        let two = serde_json::to_string(&ctx).expect("serialize");
        assert_eq!(one, two);
        assert!(one.find("a1").expect("a1") < one.find("a2").expect("a2"));
    }
}
