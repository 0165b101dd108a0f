//! Canonical blob keys. Every artifact a job produces lives under
//! `jobs/{owner_id}/{job_id}/`; workers derive keys only through these
//! helpers so retried messages overwrite the same paths.

pub fn job_root(owner_id: &str, job_id: &str) -> String {
    format!("jobs/{}/{}", owner_id, job_id)
}

pub fn intake_questions(owner_id: &str, job_id: &str) -> String {
    format!("{}/intake/questions.json", job_root(owner_id, job_id))
}

pub fn intake_answers(owner_id: &str, job_id: &str) -> String {
    format!("{}/intake/answers.json", job_root(owner_id, job_id))
}

pub fn intake_context(owner_id: &str, job_id: &str) -> String {
    format!("{}/intake/context.json", job_root(owner_id, job_id))
}

pub fn plan(owner_id: &str, job_id: &str) -> String {
    format!("{}/plan.json", job_root(owner_id, job_id))
}

pub fn memory(owner_id: &str, job_id: &str) -> String {
    format!("{}/memory.json", job_root(owner_id, job_id))
}

pub fn draft(owner_id: &str, job_id: &str, section_id: &str) -> String {
    format!("{}/drafts/{}.md", job_root(owner_id, job_id), section_id)
}

pub fn review(owner_id: &str, job_id: &str, cycle: u32, flavor: &str) -> String {
    format!(
        "{}/reviews/cycle-{}/{}.json",
        job_root(owner_id, job_id),
        cycle,
        flavor
    )
}

pub fn verify(owner_id: &str, job_id: &str, cycle: u32) -> String {
    review(owner_id, job_id, cycle, "verify")
}

pub fn rewrite(owner_id: &str, job_id: &str, cycle: u32, section_id: &str) -> String {
    format!(
        "{}/rewrites/cycle-{}/{}.md",
        job_root(owner_id, job_id),
        cycle,
        section_id
    )
}

pub fn diagram_index(owner_id: &str, job_id: &str) -> String {
    format!("{}/diagrams/index.json", job_root(owner_id, job_id))
}

pub fn diagram_source(owner_id: &str, job_id: &str, name: &str) -> String {
    format!("{}/diagrams/{}.puml", job_root(owner_id, job_id), name)
}

pub fn diagram_asset(owner_id: &str, job_id: &str, name: &str, ext: &str) -> String {
    format!("{}/diagrams/{}.{}", job_root(owner_id, job_id), name, ext)
}

pub fn final_markdown(owner_id: &str, job_id: &str) -> String {
    format!("{}/final.md", job_root(owner_id, job_id))
}

pub fn final_pdf(owner_id: &str, job_id: &str) -> String {
    format!("{}/final.pdf", job_root(owner_id, job_id))
}

pub fn final_docx(owner_id: &str, job_id: &str) -> String {
    format!("{}/final.docx", job_root(owner_id, job_id))
}

pub fn diagram_archive(owner_id: &str, job_id: &str) -> String {
    format!("{}/diagrams.zip", job_root(owner_id, job_id))
}

pub fn metrics(owner_id: &str, job_id: &str, name: &str) -> String {
    format!("{}/metrics/{}.json", job_root(owner_id, job_id), name)
}

/// Section id extracted from a draft key, if the key is one.
pub fn section_of_draft(key: &str) -> Option<&str> {
    let (_, rest) = key.split_once("/drafts/")?;
    rest.strip_suffix(".md")
}
