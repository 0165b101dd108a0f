//! Prompt assembly for every agent role, plus tolerant extraction of JSON
//! payloads from model output.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;

use docwriter_types::{IntakeContext, Plan, ReviewFlavor, ReviewIssue, SectionSpec};

static JSON_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.*?)```").expect("json fence pattern compiles")
});

/// Models often wrap JSON in a markdown fence; strip it when present.
pub fn extract_json_block(raw: &str) -> &str {
    if let Some(captures) = JSON_FENCE.captures(raw) {
        if let Some(inner) = captures.get(1) {
            return inner.as_str().trim();
        }
    }
    raw.trim()
}

pub fn parse_model_json<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(extract_json_block(raw))
}

pub fn interviewer_system() -> String {
    "You prepare intake questionnaires for long-form technical documents. \
     Reply with a JSON array of objects {\"id\", \"q\", \"sample\"}. \
     Ask only questions whose answers change the document's structure or emphasis."
        .to_string()
}

pub fn interviewer_prompt(title: &str, audience: &str, target_pages: u32) -> String {
    format!(
        "A document titled \"{}\" is being written for the audience \"{}\", \
         targeting roughly {} pages. Produce 5-10 intake questions with short \
         sample answers.",
        title, audience, target_pages
    )
}

pub fn planner_system() -> String {
    "You plan long-form technical documents. Reply with a single JSON object: \
     {\"sections\": [{\"id\", \"title\", \"depends_on\", \"diagram_specs\", \"target_words\"}], \
     \"glossary\": {}, \"style_guide\": [], \"constraints\": [], \"executive_summary\": null}. \
     Section ids must be unique and every depends_on entry must reference a \
     section that appears earlier in the list."
        .to_string()
}

pub fn planner_prompt(context: &IntakeContext, target_pages: u32) -> String {
    let answers = context
        .answers
        .iter()
        .map(|(id, answer)| format!("- {}: {}", id, answer))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Title: {}\nAudience: {}\nReview cycles: {}\nTarget length: ~{} pages\n\
         Intake answers:\n{}\n\nProduce the section plan.",
        context.title,
        context.audience,
        context.cycles,
        target_pages,
        if answers.is_empty() {
            "(none provided)".to_string()
        } else {
            answers
        }
    )
}

pub fn planner_repair_prompt(previous_output: &str, validation_error: &str) -> String {
    format!(
        "Your previous plan was rejected: {}.\n\nPrevious output:\n{}\n\n\
         Return a corrected JSON plan that satisfies the constraints.",
        validation_error, previous_output
    )
}

pub fn writer_system() -> String {
    "You write one section of a long-form technical document. Reply with a \
     JSON object {\"markdown\", \"memory\": {\"summary\", \"facts\", \
     \"style_notes\", \"glossary\"}}. The markdown is the full section body \
     without the section heading. Never contradict facts established by \
     earlier sections."
        .to_string()
}

pub fn writer_prompt(
    section: &SectionSpec,
    plan: &Plan,
    predecessor_summaries: &[(String, String)],
    inherited_facts: &[String],
) -> String {
    let mut prompt = format!(
        "Write section \"{}\" (id: {}).\n",
        section.title, section.id
    );
    if let Some(words) = section.target_words {
        prompt.push_str(&format!("Target length: ~{} words.\n", words));
    }
    if !plan.style_guide.is_empty() {
        prompt.push_str(&format!("Style guide:\n- {}\n", plan.style_guide.join("\n- ")));
    }
    if !plan.constraints.is_empty() {
        prompt.push_str(&format!("Constraints:\n- {}\n", plan.constraints.join("\n- ")));
    }
    if !predecessor_summaries.is_empty() {
        prompt.push_str("Earlier sections this one builds on:\n");
        for (id, summary) in predecessor_summaries {
            prompt.push_str(&format!("- {}: {}\n", id, summary));
        }
    }
    if !inherited_facts.is_empty() {
        prompt.push_str(&format!(
            "Facts already established:\n- {}\n",
            inherited_facts.join("\n- ")
        ));
    }
    prompt
}

pub fn reviewer_system(flavor: ReviewFlavor) -> String {
    let focus = match flavor {
        ReviewFlavor::General => {
            "technical accuracy, completeness, and argument structure"
        }
        ReviewFlavor::Style => "tone, register, and consistency with the style guide",
        ReviewFlavor::Cohesion => "cross-section flow, terminology drift, and transitions",
        ReviewFlavor::Summary => "whether the executive summary matches the body",
    };
    format!(
        "You review a document draft for {}. Reply with a JSON object \
         {{\"issues\": [{{\"section_id\", \"severity\", \"description\", \
         \"suggested_patch\"}}], \"needs_rewrite\": bool}}. Severity is one of \
         \"low\", \"medium\", \"high\", \"critical\".",
        focus
    )
}

pub fn reviewer_prompt(cycle: u32, plan: &Plan, drafts: &[(String, String)]) -> String {
    let mut prompt = format!("Review cycle {}.\nSections in order:\n", cycle);
    for section in &plan.sections {
        prompt.push_str(&format!("- {} ({})\n", section.title, section.id));
    }
    prompt.push_str("\nDrafts:\n");
    for (id, body) in drafts {
        prompt.push_str(&format!("### {}\n{}\n\n", id, body));
    }
    prompt
}

pub fn verifier_system() -> String {
    "You check a document draft for internal contradictions against the facts \
     each section declares. Reply with a JSON object {\"contradictions\": \
     [{\"section_id\", \"against_section_id\", \"description\"}], \
     \"needs_rewrite\": bool}."
        .to_string()
}

pub fn verifier_prompt(
    cycle: u32,
    drafts: &[(String, String)],
    declared_facts: &[(String, Vec<String>)],
    open_issues: &[ReviewIssue],
) -> String {
    let mut prompt = format!("Verification pass for cycle {}.\nDeclared facts:\n", cycle);
    for (section_id, facts) in declared_facts {
        for fact in facts {
            prompt.push_str(&format!("- [{}] {}\n", section_id, fact));
        }
    }
    if !open_issues.is_empty() {
        prompt.push_str("\nReviewer findings this cycle:\n");
        for issue in open_issues {
            prompt.push_str(&format!(
                "- [{}] {:?}: {}\n",
                issue.section_id, issue.severity, issue.description
            ));
        }
    }
    prompt.push_str("\nDrafts:\n");
    for (id, body) in drafts {
        prompt.push_str(&format!("### {}\n{}\n\n", id, body));
    }
    prompt
}

pub fn rewriter_system() -> String {
    "You rewrite one section of a technical document to resolve reviewer \
     findings while preserving everything that was not flagged. Reply with a \
     JSON object {\"markdown\", \"memory\": {\"summary\", \"facts\", \
     \"style_notes\", \"glossary\"}}."
        .to_string()
}

pub fn rewriter_prompt(
    section: &SectionSpec,
    current_draft: &str,
    issues: &[ReviewIssue],
) -> String {
    let mut prompt = format!(
        "Rewrite section \"{}\" (id: {}).\n\nFindings to resolve:\n",
        section.title, section.id
    );
    for issue in issues {
        prompt.push_str(&format!("- {:?}: {}\n", issue.severity, issue.description));
        if let Some(patch) = &issue.suggested_patch {
            prompt.push_str(&format!("  suggested patch: {}\n", patch));
        }
    }
    prompt.push_str(&format!("\nCurrent draft:\n{}\n", current_draft));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_from_fenced_output() {
        let raw = "Here is the plan:\n```json\n{\"sections\": []}\n```\nDone.";
        assert_eq!(extract_json_block(raw), "{\"sections\": []}");
        assert_eq!(extract_json_block("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn parse_model_json_handles_bare_and_fenced() {
        #[derive(serde::Deserialize)]
        struct Probe {
            a: u32,
        }
        let fenced: Probe = parse_model_json("```\n{\"a\": 2}\n```").expect("fenced");
        assert_eq!(fenced.a, 2);
        let bare: Probe = parse_model_json("{\"a\": 3}").expect("bare");
        assert_eq!(bare.a, 3);
    }
}
