use std::sync::Arc;
use std::time::Duration;

use docwriter_broker::{QueueBroker, StatusTopic};
use docwriter_gateway::LlmGateway;
use docwriter_render::{DiagramRenderer, DocumentConverter};
use docwriter_store::{ObjectStore, StatusStore};
use docwriter_types::{StageMessage, StagePhase, StatusEvent};

use crate::config::KernelConfig;
use crate::error::StageError;

/// Shared handles every stage worker runs against. Workers hold no other
/// cross-request state.
#[derive(Clone)]
pub struct StageContext {
    pub broker: Arc<dyn QueueBroker>,
    pub objects: Arc<dyn ObjectStore>,
    pub status: Arc<StatusStore>,
    pub topic: StatusTopic,
    pub gateway: Arc<dyn LlmGateway>,
    pub renderer: Arc<dyn DiagramRenderer>,
    pub converter: Arc<dyn DocumentConverter>,
    pub config: Arc<KernelConfig>,
}

impl StageContext {
    pub async fn enqueue_stage(
        &self,
        msg: &StageMessage,
        delay: Option<Duration>,
    ) -> Result<(), StageError> {
        enqueue_stage(
            self.broker.as_ref(),
            &self.topic,
            &self.config,
            msg,
            delay,
        )
        .await
    }
}

/// Serialize, enqueue on the stage's queue, and publish the QUEUED
/// transition. Admission and resume use this path too.
pub async fn enqueue_stage(
    broker: &dyn QueueBroker,
    topic: &StatusTopic,
    config: &KernelConfig,
    msg: &StageMessage,
    delay: Option<Duration>,
) -> Result<(), StageError> {
    let body = serde_json::to_string(msg)
        .map_err(|err| StageError::Logic(format!("stage message serialization: {}", err)))?;
    broker
        .enqueue(config.queues.for_stage(msg.stage), body, delay)
        .await?;
    let mut event = StatusEvent::new(
        msg.owner_id.clone(),
        msg.job_id.clone(),
        msg.stage,
        StagePhase::Queued,
    );
    event.cycle = msg.cycle;
    topic.publish(event);
    Ok(())
}
