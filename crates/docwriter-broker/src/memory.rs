use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{BrokerError, DeadLetter, Lease, QueueBroker, DEFAULT_MAX_DELIVERY_COUNT};

struct Pending {
    body: String,
    delivery_count: u32,
}

struct Inflight {
    queue: String,
    body: String,
    delivery_count: u32,
    expires_at: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    delayed: Vec<(Instant, Pending)>,
    dead: Vec<DeadLetter>,
}

#[derive(Default)]
struct Shared {
    queues: HashMap<String, QueueState>,
    inflight: HashMap<String, Inflight>,
}

/// In-process broker with the same contract as a hosted queue service:
/// at-least-once delivery, per-message locks with expiry reclaim, delayed
/// visibility, and dead-lettering once the delivery count is exceeded.
pub struct InMemoryBroker {
    state: Mutex<Shared>,
    notify: Arc<Notify>,
    shutdown: CancellationToken,
    max_delivery_count: u32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Shared::default()),
            notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            max_delivery_count: DEFAULT_MAX_DELIVERY_COUNT,
        }
    }

    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    /// Unblocks every pending `receive` with `BrokerError::Closed`.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn promote_due(queue: &mut QueueState, now: Instant) {
    let mut index = 0;
    while index < queue.delayed.len() {
        if queue.delayed[index].0 <= now {
            let (_, pending) = queue.delayed.swap_remove(index);
            queue.ready.push_back(pending);
        } else {
            index += 1;
        }
    }
}

fn reclaim_expired(shared: &mut Shared, now: Instant) {
    let expired: Vec<String> = shared
        .inflight
        .iter()
        .filter(|(_, lease)| lease.expires_at <= now)
        .map(|(token, _)| token.clone())
        .collect();
    for token in expired {
        if let Some(lease) = shared.inflight.remove(&token) {
            debug!(queue = %lease.queue, "message lock expired; redelivering");
            shared
                .queues
                .entry(lease.queue)
                .or_default()
                .ready
                .push_back(Pending {
                    body: lease.body,
                    delivery_count: lease.delivery_count,
                });
        }
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue: &str,
        body: String,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError> {
        if self.shutdown.is_cancelled() {
            return Err(BrokerError::Unavailable("broker is shut down".to_string()));
        }
        let mut shared = self.state.lock().await;
        let state = shared.queues.entry(queue.to_string()).or_default();
        let pending = Pending {
            body,
            delivery_count: 0,
        };
        match delay {
            Some(delay) if !delay.is_zero() => {
                state.delayed.push((Instant::now() + delay, pending));
            }
            _ => state.ready.push_back(pending),
        }
        drop(shared);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, queue: &str, max_lock: Duration) -> Result<Lease, BrokerError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(BrokerError::Closed);
            }
            {
                let mut shared = self.state.lock().await;
                let now = Instant::now();
                reclaim_expired(&mut shared, now);
                let state = shared.queues.entry(queue.to_string()).or_default();
                promote_due(state, now);
                let mut leased = None;
                while let Some(mut pending) = state.ready.pop_front() {
                    pending.delivery_count += 1;
                    if pending.delivery_count > self.max_delivery_count {
                        warn!(
                            queue,
                            delivery_count = pending.delivery_count,
                            "max delivery count exceeded; dead-lettering"
                        );
                        state.dead.push(DeadLetter {
                            body: pending.body,
                            reason: "max delivery count exceeded".to_string(),
                            delivery_count: pending.delivery_count,
                        });
                        continue;
                    }
                    leased = Some(pending);
                    break;
                }
                if let Some(pending) = leased {
                    let lock_token = Uuid::new_v4().to_string();
                    let lease = Lease {
                        queue: queue.to_string(),
                        body: pending.body.clone(),
                        lock_token: lock_token.clone(),
                        delivery_count: pending.delivery_count,
                    };
                    shared.inflight.insert(
                        lock_token,
                        Inflight {
                            queue: queue.to_string(),
                            body: pending.body,
                            delivery_count: pending.delivery_count,
                            expires_at: now + max_lock,
                        },
                    );
                    return Ok(lease);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(25)) => {}
                _ = self.shutdown.cancelled() => return Err(BrokerError::Closed),
            }
        }
    }

    async fn renew(&self, lock_token: &str, extension: Duration) -> Result<(), BrokerError> {
        let mut shared = self.state.lock().await;
        let lease = shared
            .inflight
            .get_mut(lock_token)
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))?;
        lease.expires_at = Instant::now() + extension;
        Ok(())
    }

    async fn complete(&self, lock_token: &str) -> Result<(), BrokerError> {
        let mut shared = self.state.lock().await;
        shared
            .inflight
            .remove(lock_token)
            .map(|_| ())
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))
    }

    async fn abandon(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), BrokerError> {
        let mut shared = self.state.lock().await;
        let lease = shared
            .inflight
            .remove(lock_token)
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))?;
        let state = shared.queues.entry(lease.queue).or_default();
        let pending = Pending {
            body: lease.body,
            delivery_count: lease.delivery_count,
        };
        match delay {
            Some(delay) if !delay.is_zero() => {
                state.delayed.push((Instant::now() + delay, pending));
            }
            _ => state.ready.push_back(pending),
        }
        drop(shared);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, lock_token: &str, reason: &str) -> Result<(), BrokerError> {
        let mut shared = self.state.lock().await;
        let lease = shared
            .inflight
            .remove(lock_token)
            .ok_or_else(|| BrokerError::UnknownLock(lock_token.to_string()))?;
        warn!(queue = %lease.queue, reason, "message dead-lettered");
        shared
            .queues
            .entry(lease.queue)
            .or_default()
            .dead
            .push(DeadLetter {
                body: lease.body,
                reason: reason.to_string(),
                delivery_count: lease.delivery_count,
            });
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError> {
        let shared = self.state.lock().await;
        Ok(shared
            .queues
            .get(queue)
            .map(|state| state.dead.clone())
            .unwrap_or_default())
    }
}
