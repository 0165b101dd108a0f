use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Level};

use docwriter_broker::{BrokerError, Lease, QueueBroker};
use docwriter_observability::{emit_event, KernelEvent, ProcessKind};
use docwriter_store::StoreError;
use docwriter_types::{JobStage, StageMessage, StagePhase, StatusEvent};

use crate::context::StageContext;
use crate::error::{Disposition, StageError};
use crate::stages::{self, StageDisposition};

/// Consume one stage queue until cancelled. Every delivery runs the common
/// skeleton: parse, validate owner, check cancellation, publish START, run
/// the handler under lock renewal, publish DONE or FAILED, settle the lock.
pub async fn run_worker(ctx: StageContext, stage: JobStage, cancel: CancellationToken) {
    let queue = ctx.config.queues.for_stage(stage).to_string();
    loop {
        let lease = tokio::select! {
            _ = cancel.cancelled() => return,
            received = ctx.broker.receive(&queue, ctx.config.lock_duration) => match received {
                Ok(lease) => lease,
                Err(BrokerError::Closed) => return,
                Err(err) => {
                    warn!(queue, error = %err, "receive failed; backing off");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            },
        };
        process_delivery(&ctx, stage, &queue, lease).await;
    }
}

async fn process_delivery(ctx: &StageContext, stage: JobStage, queue: &str, lease: Lease) {
    let msg: StageMessage = match serde_json::from_str(&lease.body) {
        Ok(msg) => msg,
        Err(err) => {
            dead_letter(ctx, queue, &lease, &format!("validation: malformed message: {}", err))
                .await;
            return;
        }
    };

    if msg.owner_id.trim().is_empty() {
        dead_letter(ctx, queue, &lease, "validation: message has no owner_id").await;
        return;
    }
    if msg.stage != stage {
        dead_letter(
            ctx,
            queue,
            &lease,
            &format!("validation: stage '{}' delivered on queue '{}'", msg.stage, queue),
        )
        .await;
        return;
    }

    match ctx.status.get_job(&msg.owner_id, &msg.job_id).await {
        Ok(record) if record.cancelled => {
            dead_letter(ctx, queue, &lease, "cancelled").await;
            return;
        }
        Ok(_) | Err(StoreError::NotFound(_)) => {}
        Err(StoreError::NotAuthorized { .. }) => {
            dead_letter(
                ctx,
                queue,
                &lease,
                "validation: message owner does not match job owner",
            )
            .await;
            return;
        }
        Err(err) => {
            warn!(queue, error = %err, "status lookup failed; abandoning for retry");
            let _ = ctx
                .broker
                .abandon(&lease.lock_token, Some(redelivery_backoff(lease.delivery_count)))
                .await;
            return;
        }
    }

    let mut start = StatusEvent::new(
        msg.owner_id.clone(),
        msg.job_id.clone(),
        stage,
        StagePhase::Start,
    );
    start.cycle = msg.cycle;
    ctx.topic.publish(start);
    let started = Instant::now();

    let result = tokio::select! {
        result = stages::run_stage(ctx, &msg) => result,
        _ = renew_lock(ctx.broker.as_ref(), &lease.lock_token, ctx.config.lock_duration) => {
            Err(StageError::Transient("broker lock lost during handling".to_string()))
        }
    };
    let duration_s = started.elapsed().as_secs_f64();

    match result {
        Ok(StageDisposition::Done(outcome)) => {
            let mut event = StatusEvent::new(
                msg.owner_id.clone(),
                msg.job_id.clone(),
                stage,
                StagePhase::Done,
            );
            event.cycle = outcome.cycle.or(msg.cycle);
            event.artifact = outcome.artifact.clone();
            event.message = Some(outcome.message.clone());
            event.cycles_completed = outcome.cycles_completed;
            event.details.duration_s = Some(duration_s);
            event.details.tokens = Some(outcome.tokens);
            event.details.model = outcome.model.clone();
            event.details.notes = outcome.notes.clone();
            ctx.topic.publish(event);
            if let Err(err) = ctx.broker.complete(&lease.lock_token).await {
                // Redelivery is absorbed by idempotent outputs.
                warn!(queue, error = %err, "failed to complete lock; message will redeliver");
            }
        }
        Ok(StageDisposition::Retry { reason, delay }) => {
            debug!(queue, reason, "stage not ready; abandoning with delay");
            let _ = ctx.broker.abandon(&lease.lock_token, Some(delay)).await;
        }
        Err(err) => {
            let mut event = StatusEvent::new(
                msg.owner_id.clone(),
                msg.job_id.clone(),
                stage,
                StagePhase::Failed,
            );
            event.cycle = msg.cycle;
            event.message = Some(err.to_string());
            event.details.duration_s = Some(duration_s);
            event.details.notes = Some(format!("error_kind={}", err.kind()));
            event.details.parsed_message = serde_json::to_value(&msg).ok();
            ctx.topic.publish(event);
            emit_event(
                Level::WARN,
                ProcessKind::Worker,
                KernelEvent {
                    event: "stage.failed",
                    component: "kernel.worker",
                    trace_id: Some(&msg.trace_id),
                    job_id: Some(&msg.job_id),
                    stage: Some(stage.as_str()),
                    queue: Some(queue),
                    cycle: msg.cycle,
                    status: Some("failed"),
                    error_code: Some(err.kind()),
                    detail: Some(&err.to_string()),
                },
            );
            match err.disposition() {
                Disposition::DeadLetter => {
                    let _ = ctx
                        .broker
                        .dead_letter(&lease.lock_token, &err.to_string())
                        .await;
                }
                Disposition::Abandon => {
                    let _ = ctx
                        .broker
                        .abandon(
                            &lease.lock_token,
                            Some(redelivery_backoff(lease.delivery_count)),
                        )
                        .await;
                }
            }
        }
    }
}

async fn dead_letter(ctx: &StageContext, queue: &str, lease: &Lease, reason: &str) {
    emit_event(
        Level::WARN,
        ProcessKind::Worker,
        KernelEvent {
            event: "message.dead_letter",
            component: "kernel.worker",
            trace_id: None,
            job_id: None,
            stage: None,
            queue: Some(queue),
            cycle: None,
            status: Some("dead_letter"),
            error_code: None,
            detail: Some(reason),
        },
    );
    let _ = ctx.broker.dead_letter(&lease.lock_token, reason).await;
}

/// Exponential redelivery backoff derived from the delivery count, capped
/// so dead-letter progression stays responsive.
fn redelivery_backoff(delivery_count: u32) -> Duration {
    Duration::from_secs(1 << delivery_count.min(6))
}

/// Renew the lease at half the lock duration for as long as the handler
/// runs. Completes (forcing a transient failure) only when renewal fails.
async fn renew_lock(broker: &dyn QueueBroker, lock_token: &str, lock_duration: Duration) {
    loop {
        tokio::time::sleep(lock_duration / 2).await;
        if let Err(err) = broker.renew(lock_token, lock_duration).await {
            warn!(error = %err, "lock renewal failed");
            return;
        }
    }
}
