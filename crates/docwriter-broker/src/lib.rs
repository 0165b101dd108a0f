use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod topic;

pub use memory::InMemoryBroker;
pub use topic::StatusTopic;

pub const DEFAULT_MAX_DELIVERY_COUNT: u32 = 10;
pub const DEFAULT_LOCK_DURATION: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("unknown or expired lock token: {0}")]
    UnknownLock(String),
    #[error("broker is shut down")]
    Closed,
}

/// One delivery of a queued message. The lock token is valid until the lease
/// expires or the message is settled.
#[derive(Debug, Clone)]
pub struct Lease {
    pub queue: String,
    pub body: String,
    pub lock_token: String,
    pub delivery_count: u32,
}

/// Terminal, operator-inspectable message state.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub body: String,
    pub reason: String,
    pub delivery_count: u32,
}

/// At-least-once delivery over named queues with per-message locks.
/// Consumers must be idempotent: a message abandoned, expired, or in flight
/// during a crash is delivered again.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Durably accept a message; visible after `delay` when given.
    async fn enqueue(
        &self,
        queue: &str,
        body: String,
        delay: Option<Duration>,
    ) -> Result<(), BrokerError>;

    /// Wait for the next message on `queue` and lock it for `max_lock`.
    async fn receive(&self, queue: &str, max_lock: Duration) -> Result<Lease, BrokerError>;

    /// Extend a lease; handlers running past half their lock must renew.
    async fn renew(&self, lock_token: &str, extension: Duration) -> Result<(), BrokerError>;

    /// Settle the message as processed.
    async fn complete(&self, lock_token: &str) -> Result<(), BrokerError>;

    /// Release the message for redelivery, optionally after a delay.
    async fn abandon(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), BrokerError>;

    /// Move the message to the queue's dead-letter list.
    async fn dead_letter(&self, lock_token: &str, reason: &str) -> Result<(), BrokerError>;

    /// Inspect a queue's dead-letter list.
    async fn dead_letters(&self, queue: &str) -> Result<Vec<DeadLetter>, BrokerError>;
}
