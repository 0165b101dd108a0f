use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use docwriter_broker::StatusTopic;
use docwriter_store::{StatusStore, StoreError};

/// Subscriber on the status topic that persists every transition: job row
/// upsert, timeline append, document index upsert. Replays are absorbed by
/// event identity inside the store.
pub struct StatusRecorder {
    status: Arc<StatusStore>,
    topic: StatusTopic,
}

impl StatusRecorder {
    pub fn new(status: Arc<StatusStore>, topic: StatusTopic) -> Self {
        Self { status, topic }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut rx = self.topic.subscribe();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status recorder lagged behind the topic");
                        continue;
                    }
                    Err(RecvError::Closed) => return,
                },
            };

            // A hosted subscription would abandon for redelivery; the
            // broadcast topic has no replay, so retry in place.
            let mut attempt = 0;
            loop {
                match self.status.apply_event(&event).await {
                    Ok(()) => break,
                    Err(StoreError::NotAuthorized { .. }) => {
                        warn!(
                            job_id = %event.job_id,
                            stage = %event.stage,
                            "dropping status event with mismatched owner"
                        );
                        break;
                    }
                    Err(err) if attempt < 3 => {
                        warn!(
                            job_id = %event.job_id,
                            attempt,
                            error = %err,
                            "status write failed; retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(Duration::from_millis(100 * (attempt as u64))).await;
                    }
                    Err(err) => {
                        warn!(
                            job_id = %event.job_id,
                            error = %err,
                            "status event dropped after repeated write failures"
                        );
                        break;
                    }
                }
            }
        }
    }
}
