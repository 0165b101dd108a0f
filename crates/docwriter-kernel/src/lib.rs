mod api;
pub mod config;
mod context;
mod error;
pub mod prompts;
mod recorder;
mod reviewers;
mod stages;
mod worker;

pub use api::{ApiError, JobStatus, Kernel};
pub use config::{KernelConfig, QueueNames, ReviewFlags};
pub use context::StageContext;
pub use error::{Disposition, StageError};
pub use recorder::StatusRecorder;
pub use reviewers::{reviewer_registry, LlmReviewer, Reviewer};
pub use stages::{StageDisposition, StageOutcome};
pub use worker::run_worker;

use docwriter_types::JobStage;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Spawn one worker per stage queue plus the status recorder. Tasks run
/// until the token is cancelled or the broker closes.
pub fn spawn_pipeline(ctx: StageContext, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for stage in JobStage::ALL {
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_worker(ctx, stage, cancel).await;
        }));
    }
    let recorder = StatusRecorder::new(ctx.status.clone(), ctx.topic.clone());
    handles.push(tokio::spawn(recorder.run(cancel)));
    handles
}
