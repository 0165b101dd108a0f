use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::JobStage;

fn default_diagram_language() -> String {
    "plantuml".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramSource {
    pub name: String,
    #[serde(default = "default_diagram_language")]
    pub source_language: String,
    pub source_text: String,
}

/// Wire contract for every stage queue. Stage-specific fields are optional
/// and stay off the wire when unused; unknown fields land in `extra` and are
/// preserved when the message is forwarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMessage {
    pub job_id: String,
    #[serde(default)]
    pub owner_id: String,
    pub stage: JobStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    /// Blob pointers by role, e.g. `context` -> `jobs/u/j/intake/context.json`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycles: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answers: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sections: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagram: Option<DiagramSource>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StageMessage {
    pub fn new(stage: JobStage, owner_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            owner_id: owner_id.into(),
            stage,
            cycle: None,
            inputs: BTreeMap::new(),
            attempt: 0,
            trace_id: Uuid::new_v4().to_string(),
            title: None,
            audience: None,
            cycles: None,
            answers: None,
            sections: Vec::new(),
            diagram: None,
            extra: Map::new(),
        }
    }

    /// Next-stage message carrying over identity, trace, and unknown fields.
    pub fn forward(&self, stage: JobStage) -> Self {
        Self {
            job_id: self.job_id.clone(),
            owner_id: self.owner_id.clone(),
            stage,
            cycle: None,
            inputs: BTreeMap::new(),
            attempt: 0,
            trace_id: self.trace_id.clone(),
            title: None,
            audience: None,
            cycles: None,
            answers: None,
            sections: Vec::new(),
            diagram: None,
            extra: self.extra.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_survive_a_round_trip() {
        let raw = r#"{
            "job_id": "j1",
            "owner_id": "u1",
            "stage": "write",
            "sections": ["s1"],
            "x_future_field": {"nested": true}
        }"#;
        let msg: StageMessage = serde_json::from_str(raw).expect("parse");
        assert_eq!(msg.sections, vec!["s1".to_string()]);
        assert!(msg.extra.contains_key("x_future_field"));

        let forwarded = msg.forward(JobStage::Review);
        let json = serde_json::to_value(&forwarded).expect("serialize");
        assert_eq!(json["x_future_field"]["nested"], serde_json::json!(true));
        assert_eq!(json["stage"], serde_json::json!("review"));
    }

    #[test]
    fn missing_owner_deserializes_to_empty_string() {
        let raw = r#"{"job_id": "j1", "stage": "plan"}"#;
        let msg: StageMessage = serde_json::from_str(raw).expect("parse");
        assert!(msg.owner_id.is_empty());
    }
}
