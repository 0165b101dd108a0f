use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use docwriter_broker::{InMemoryBroker, StatusTopic};
use docwriter_gateway::{AgentRole, LlmGateway, ScriptedGateway};
use docwriter_kernel::{spawn_pipeline, ApiError, Kernel, KernelConfig, StageContext};
use docwriter_render::{PassthroughConverter, ScriptedRenderer};
use docwriter_store::{paths, put_json, FsObjectStore, StatusStore};
use docwriter_types::{JobRecord, JobStage, StageMessage, StagePhase};

struct Harness {
    _dir: tempfile::TempDir,
    ctx: StageContext,
    kernel: Kernel,
    gateway: Arc<ScriptedGateway>,
    renderer: Arc<ScriptedRenderer>,
    cancel: CancellationToken,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(customize: impl FnOnce(&mut KernelConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = KernelConfig::default();
        config.dependency_retry_delay = Duration::from_millis(50);
        customize(&mut config);
        let config = Arc::new(config);

        let gateway = Arc::new(ScriptedGateway::new());
        let renderer = Arc::new(ScriptedRenderer::new());
        let gateway_dyn: Arc<dyn LlmGateway> = gateway.clone();

        let ctx = StageContext {
            broker: Arc::new(InMemoryBroker::new()),
            objects: Arc::new(
                FsObjectStore::new(dir.path().join("objects"))
                    .await
                    .expect("object store"),
            ),
            status: Arc::new(
                StatusStore::new(dir.path().join("status"))
                    .await
                    .expect("status store"),
            ),
            topic: StatusTopic::new(),
            gateway: gateway_dyn,
            renderer: renderer.clone(),
            converter: Arc::new(PassthroughConverter),
            config,
        };
        let kernel = Kernel::from_context(&ctx);
        let cancel = CancellationToken::new();
        spawn_pipeline(ctx.clone(), cancel.clone());

        Self {
            _dir: dir,
            ctx,
            kernel,
            gateway,
            renderer,
            cancel,
        }
    }

    async fn wait_until(
        &self,
        owner: &str,
        job: &str,
        what: &str,
        predicate: impl Fn(&docwriter_kernel::JobStatus) -> bool,
    ) -> docwriter_kernel::JobStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        let mut last = None;
        while tokio::time::Instant::now() < deadline {
            if let Ok(status) = self.kernel.get_status(owner, job).await {
                if predicate(&status) {
                    return status;
                }
                last = Some(status);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("timed out waiting for {}; last status: {:?}", what, last);
    }

    async fn wait_finalized(&self, owner: &str, job: &str) -> docwriter_kernel::JobStatus {
        self.wait_until(owner, job, "finalize", |s| {
            s.stage == JobStage::Finalize && s.message == "document finalized"
        })
        .await
    }

    async fn artifact_string(&self, owner: &str, job: &str, rel: &str) -> String {
        let (bytes, _) = self
            .kernel
            .fetch_artifact(owner, job, rel)
            .await
            .unwrap_or_else(|err| panic!("fetch {}: {}", rel, err));
        String::from_utf8(bytes).expect("utf8 artifact")
    }

    async fn done_stages(&self, owner: &str, job: &str) -> Vec<(JobStage, Option<u32>)> {
        self.kernel
            .get_timeline(owner, job)
            .await
            .expect("timeline")
            .into_iter()
            .filter(|e| e.phase == StagePhase::Done)
            .map(|e| (e.stage, e.cycle))
            .collect()
    }
}

const QUESTIONS: &str = r#"[{"id": "a1", "q": "What scope matters most?", "sample": "Connection pooling"}]"#;

fn two_section_plan() -> String {
    r#"{
        "sections": [
            {"id": "s1", "title": "Foundations", "depends_on": [], "target_words": 1200},
            {"id": "s2", "title": "Advanced Patterns", "depends_on": ["s1"], "target_words": 1500}
        ],
        "glossary": {"backpressure": "flow control applied upstream"},
        "style_guide": ["active voice"],
        "constraints": [],
        "executive_summary": "A tour of async patterns."
    }"#
    .to_string()
}

fn one_section_plan() -> String {
    r#"{"sections": [{"id": "s1", "title": "Core", "depends_on": []}]}"#.to_string()
}

fn writer_json(markdown: &str, summary: &str, facts: &[&str]) -> String {
    serde_json::json!({
        "markdown": markdown,
        "memory": {"summary": summary, "facts": facts, "style_notes": [], "glossary": {}}
    })
    .to_string()
}

const CLEAN_REVIEW: &str = r#"{"issues": [], "needs_rewrite": false}"#;
const CLEAN_VERIFY: &str = r#"{"contradictions": [], "needs_rewrite": false}"#;

fn rewrite_review(section_id: &str) -> String {
    serde_json::json!({
        "issues": [{
            "section_id": section_id,
            "severity": "high",
            "description": "claims conflict with the pooling section",
            "suggested_patch": "align the retry budget numbers"
        }],
        "needs_rewrite": true
    })
    .to_string()
}

#[tokio::test]
async fn happy_path_two_cycles_no_rewrite() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, two_section_plan()).await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "foundations overview", &["retry budget is 3"]))
        .await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D2", "advanced patterns", &[]))
        .await;
    h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "Async Patterns", "Architects", 2)
        .await
        .expect("admit");

    h.wait_until("u1", &job, "intake questions", |s| {
        s.stage == JobStage::PlanIntake && s.message.contains("awaiting answers")
    })
    .await;
    let questions = h.artifact_string("u1", &job, "intake/questions.json").await;
    assert!(questions.contains("What scope matters most?"));

    h.kernel
        .submit_answers("u1", &job, BTreeMap::from([("a1".to_string(), "x".to_string())]))
        .await
        .expect("answers");

    let status = h.wait_finalized("u1", &job).await;
    assert_eq!(status.cycles_completed, 1, "one clean review/verify pass");
    assert!(!status.has_error);

    let stages: Vec<JobStage> = h
        .done_stages("u1", &job)
        .await
        .into_iter()
        .map(|(stage, _)| stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            JobStage::PlanIntake,
            JobStage::IntakeResume,
            JobStage::Plan,
            JobStage::Write,
            JobStage::Write,
            JobStage::Review,
            JobStage::Verify,
            JobStage::DiagramPrep,
            JobStage::Finalize,
        ]
    );

    let final_md = h.artifact_string("u1", &job, "final.md").await;
    assert!(final_md.contains("# Async Patterns"));
    let d1 = final_md.find("D1").expect("section one in final");
    let d2 = final_md.find("D2").expect("section two in final");
    assert!(d1 < d2, "sections concatenated in plan order");

    // Writer for s2 saw s1's declared facts.
    let writer_calls: Vec<String> = h
        .gateway
        .calls()
        .await
        .into_iter()
        .filter(|(role, _)| *role == AgentRole::Writer)
        .map(|(_, prompt)| prompt)
        .collect();
    assert!(writer_calls[1].contains("retry budget is 3"));
}

#[tokio::test]
async fn rewrite_once_then_advance() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, two_section_plan()).await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "s1", &[]))
        .await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D2", "s2", &[]))
        .await;
    h.gateway
        .push_text(AgentRole::Reviewer, rewrite_review("s2"))
        .await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;
    h.gateway
        .push_text(AgentRole::Rewriter, writer_json("D2-rewritten", "s2 v2", &[]))
        .await;
    h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "Async Patterns", "Architects", 2)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");

    let status = h.wait_finalized("u1", &job).await;
    assert_eq!(status.cycles_completed, 2);

    let cycles: Vec<(JobStage, Option<u32>)> = h
        .done_stages("u1", &job)
        .await
        .into_iter()
        .filter(|(stage, _)| {
            matches!(stage, JobStage::Review | JobStage::Verify | JobStage::Rewrite)
        })
        .collect();
    assert_eq!(
        cycles,
        vec![
            (JobStage::Review, Some(1)),
            (JobStage::Verify, Some(1)),
            (JobStage::Rewrite, Some(1)),
            (JobStage::Review, Some(2)),
            (JobStage::Verify, Some(2)),
        ]
    );

    assert_eq!(
        h.artifact_string("u1", &job, "drafts/s2.md").await,
        "D2-rewritten"
    );
    assert_eq!(
        h.artifact_string("u1", &job, "rewrites/cycle-1/s2.md").await,
        "D2-rewritten"
    );
    assert_eq!(h.artifact_string("u1", &job, "drafts/s1.md").await, "D1");
}

#[tokio::test]
async fn cycle_budget_exhaustion_still_terminates() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, one_section_plan()).await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "core", &[]))
        .await;
    // Both cycles demand a rewrite; the budget forces the advance anyway.
    h.gateway
        .push_text(AgentRole::Reviewer, rewrite_review("s1"))
        .await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;
    h.gateway
        .push_text(AgentRole::Rewriter, writer_json("D1v2", "core v2", &[]))
        .await;
    h.gateway
        .push_text(AgentRole::Reviewer, rewrite_review("s1"))
        .await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "Bounded Loops", "SREs", 2)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");

    let status = h.wait_finalized("u1", &job).await;
    assert_eq!(status.cycles_completed, 2);

    let rewrites = h
        .done_stages("u1", &job)
        .await
        .into_iter()
        .filter(|(stage, _)| *stage == JobStage::Rewrite)
        .count();
    assert_eq!(rewrites, 1, "no rewrite after the final verify");
}

#[tokio::test]
async fn write_dependency_ordering_abandons_until_ready() {
    let h = Harness::start().await;
    let job = "job-deps";
    h.ctx
        .status
        .admit(JobRecord::admitted("u1", job, "Deps", "Devs", 1))
        .await
        .expect("admit");
    let plan_raw = r#"{"sections": [
        {"id": "s1", "title": "One", "depends_on": []},
        {"id": "s2", "title": "Two", "depends_on": ["s1"]},
        {"id": "s3", "title": "Three", "depends_on": ["s2"]}
    ]}"#;
    let plan: docwriter_types::Plan = serde_json::from_str(plan_raw).expect("plan");
    put_json(h.ctx.objects.as_ref(), &paths::plan("u1", job), &plan)
        .await
        .expect("plan blob");
    h.ctx
        .objects
        .put(&paths::draft("u1", job, "s1"), b"D1".to_vec())
        .await
        .expect("draft s1");

    h.gateway
        .push_text(AgentRole::Writer, writer_json("D2", "two", &[]))
        .await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D3", "three", &[]))
        .await;

    // Deliver write(s3) before write(s2): it must abandon and succeed later.
    let queue = h.ctx.config.queues.for_stage(JobStage::Write).to_string();
    let mut s3 = StageMessage::new(JobStage::Write, "u1", job);
    s3.sections = vec!["s3".to_string()];
    let mut s2 = StageMessage::new(JobStage::Write, "u1", job);
    s2.sections = vec!["s2".to_string()];
    h.ctx
        .broker
        .enqueue(&queue, serde_json::to_string(&s3).expect("json"), None)
        .await
        .expect("enqueue s3");
    h.ctx
        .broker
        .enqueue(&queue, serde_json::to_string(&s2).expect("json"), None)
        .await
        .expect("enqueue s2");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if h.ctx
            .objects
            .exists(&paths::draft("u1", job, "s3"))
            .await
            .expect("exists")
        {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "s3 draft never appeared"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let writer_calls: Vec<String> = h
        .gateway
        .calls()
        .await
        .into_iter()
        .filter(|(role, _)| *role == AgentRole::Writer)
        .map(|(_, prompt)| prompt)
        .collect();
    assert_eq!(writer_calls.len(), 2, "no model call before readiness");
    assert!(writer_calls[0].contains("(id: s2)"));
    assert!(writer_calls[1].contains("(id: s3)"));
}

#[tokio::test]
async fn owner_isolation_on_every_operation() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;

    let job = h
        .kernel
        .admit_job("u1", "Private Doc", "Internal", 1)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;

    assert!(matches!(
        h.kernel.fetch_artifact("u2", &job, "intake/questions.json").await,
        Err(ApiError::NotAuthorized)
    ));
    assert!(matches!(
        h.kernel.get_status("u2", &job).await,
        Err(ApiError::NotAuthorized)
    ));
    assert!(matches!(
        h.kernel.get_timeline("u2", &job).await,
        Err(ApiError::NotAuthorized)
    ));
    assert!(matches!(
        h.kernel
            .submit_answers("u2", &job, BTreeMap::new())
            .await,
        Err(ApiError::NotAuthorized)
    ));
    assert!(h.kernel.list_documents("u2").await.is_empty());
}

#[tokio::test]
async fn transient_writer_failure_retries_to_one_draft() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, one_section_plan()).await;
    h.gateway
        .push_transient_failure(AgentRole::Writer, "model briefly unavailable")
        .await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "core", &[]))
        .await;
    h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "Retry Semantics", "Developers", 1)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");

    let status = h.wait_finalized("u1", &job).await;
    assert!(!status.has_error, "error cleared once the retry succeeds");
    assert_eq!(status.cycles_completed, 1);

    let timeline = h.kernel.get_timeline("u1", &job).await.expect("timeline");
    let write_phases: Vec<StagePhase> = timeline
        .iter()
        .filter(|e| e.stage == JobStage::Write && e.phase != StagePhase::Queued)
        .map(|e| e.phase)
        .collect();
    assert_eq!(
        write_phases,
        vec![
            StagePhase::Start,
            StagePhase::Failed,
            StagePhase::Start,
            StagePhase::Done
        ]
    );
    assert_eq!(h.artifact_string("u1", &job, "drafts/s1.md").await, "D1");
}

#[tokio::test]
async fn diagrams_render_and_bundle() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, one_section_plan()).await;
    let markdown = "Intro.\n\n```plantuml\n@startuml\nA -> B\n@enduml\n```\n\nOutro.";
    h.gateway
        .push_text(AgentRole::Writer, writer_json(markdown, "core", &[]))
        .await;
    h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "With Diagrams", "Architects", 1)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");
    h.wait_finalized("u1", &job).await;

    assert_eq!(h.renderer.render_count(), 1);
    let final_md = h.artifact_string("u1", &job, "final.md").await;
    assert!(final_md.contains("![s1-diagram-1](diagrams/s1-diagram-1.png)"));
    assert!(!final_md.contains("@startuml"));

    let (archive, content_type) = h
        .kernel
        .fetch_diagram_archive("u1", &job)
        .await
        .expect("archive");
    assert_eq!(content_type, "application/zip");
    let mut zip = zip::ZipArchive::new(std::io::Cursor::new(archive)).expect("open zip");
    let names: Vec<String> = (0..zip.len())
        .map(|i| zip.by_index(i).expect("entry").name().to_string())
        .collect();
    assert!(names.contains(&"index.json".to_string()));
    assert!(names.contains(&"s1-diagram-1.puml".to_string()));
    assert!(names.contains(&"s1-diagram-1.png".to_string()));
}

#[tokio::test]
async fn optional_review_flavors_fan_out_when_enabled() {
    let h = Harness::start_with(|config| {
        config.review_flags.style = true;
        config.review_flags.cohesion = true;
        config.review_flags.summary = true;
    })
    .await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, one_section_plan()).await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "core", &[]))
        .await;
    for _ in 0..4 {
        h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    }
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "Flavored", "Architects", 1)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");
    h.wait_finalized("u1", &job).await;

    for flavor in ["general", "style", "cohesion", "summary"] {
        let note = h
            .artifact_string("u1", &job, &format!("reviews/cycle-1/{}.json", flavor))
            .await;
        assert!(note.contains("needs_rewrite"), "{} note persisted", flavor);
    }
}

#[tokio::test]
async fn replaying_a_write_message_changes_nothing() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    h.gateway.push_text(AgentRole::Planner, one_section_plan()).await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "core", &[]))
        .await;
    h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;

    let job = h
        .kernel
        .admit_job("u1", "Replay", "Developers", 1)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");
    h.wait_finalized("u1", &job).await;

    let writer_calls_before = h.gateway.calls().await.len();
    let reviews_before = h
        .done_stages("u1", &job)
        .await
        .into_iter()
        .filter(|(stage, _)| *stage == JobStage::Review)
        .count();

    // Replay the write message against an already-complete job.
    let mut replay = StageMessage::new(JobStage::Write, "u1", job.as_str());
    replay.sections = vec!["s1".to_string()];
    let queue = h.ctx.config.queues.for_stage(JobStage::Write).to_string();
    h.ctx
        .broker
        .enqueue(&queue, serde_json::to_string(&replay).expect("json"), None)
        .await
        .expect("enqueue replay");
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(h.artifact_string("u1", &job, "drafts/s1.md").await, "D1");
    assert_eq!(
        h.gateway.calls().await.len(),
        writer_calls_before,
        "replay made no model call"
    );
    let reviews_after = h
        .done_stages("u1", &job)
        .await
        .into_iter()
        .filter(|(stage, _)| *stage == JobStage::Review)
        .count();
    assert_eq!(reviews_before, reviews_after, "no duplicate review cycle");
}

#[tokio::test]
async fn invalid_plan_dead_letters_and_resume_replays_it() {
    let h = Harness::start().await;
    h.gateway.push_text(AgentRole::Interviewer, QUESTIONS).await;
    // Both the initial attempt and the repair attempt are unusable.
    h.gateway.push_text(AgentRole::Planner, "not json at all").await;
    h.gateway.push_text(AgentRole::Planner, "still not json").await;

    let job = h
        .kernel
        .admit_job("u1", "Broken Planner", "Developers", 1)
        .await
        .expect("admit");
    h.wait_until("u1", &job, "intake", |s| s.message.contains("awaiting answers"))
        .await;
    h.kernel
        .submit_answers("u1", &job, BTreeMap::new())
        .await
        .expect("answers");

    let status = h
        .wait_until("u1", &job, "plan failure", |s| s.has_error)
        .await;
    assert!(status
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("validation"));
    let queue = h.ctx.config.queues.for_stage(JobStage::Plan).to_string();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let dead = loop {
        let dead = h.ctx.broker.dead_letters(&queue).await.expect("dead letters");
        if !dead.is_empty() || tokio::time::Instant::now() >= deadline {
            break dead;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(dead.len(), 1, "validation failure dead-letters immediately");

    // Operator fixes the model side and resumes the failed stage.
    h.gateway.push_text(AgentRole::Planner, one_section_plan()).await;
    h.gateway
        .push_text(AgentRole::Writer, writer_json("D1", "core", &[]))
        .await;
    h.gateway.push_text(AgentRole::Reviewer, CLEAN_REVIEW).await;
    h.gateway.push_text(AgentRole::Verifier, CLEAN_VERIFY).await;
    h.kernel.resume_failed("u1", &job).await.expect("resume");

    let status = h.wait_finalized("u1", &job).await;
    assert!(!status.has_error);
}
