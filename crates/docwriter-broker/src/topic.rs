use tokio::sync::broadcast;

use docwriter_types::StatusEvent;

/// Fan-out channel carrying every stage transition. Subscribers that fall
/// behind see `Lagged` and continue from the tail.
#[derive(Clone)]
pub struct StatusTopic {
    tx: broadcast::Sender<StatusEvent>,
}

impl StatusTopic {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: StatusEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for StatusTopic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwriter_types::{JobStage, StagePhase};

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let topic = StatusTopic::new();
        let mut rx = topic.subscribe();
        topic.publish(StatusEvent::new("u1", "j1", JobStage::Plan, StagePhase::Start));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.stage, JobStage::Plan);
        assert_eq!(event.phase, StagePhase::Start);
    }
}
