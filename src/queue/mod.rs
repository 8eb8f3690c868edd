//! Job queue and consumers
//!
//! The queue only ever carries `{id}` references; the job store holds the
//! authoritative state, so a reference can be redelivered safely.
//!
//! - [`JobService`] - producer side: submit, cancel, status
//! - [`Worker`] - long-running consumer with a cancellation listener
//! - [`BatchConsumer`] / [`BatchPoller`] - stateless per-batch consumer and
//!   the local harness that drives it

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;

pub mod batch;
pub mod jobs;
pub mod memory;
pub mod poller;
pub mod processor;
pub mod redis_queue;
pub mod registry;
pub mod workers;

pub use batch::{BatchConsumer, BatchItemFailure, BatchResponse};
pub use jobs::JobService;
pub use memory::MemoryQueue;
pub use poller::{BatchPoller, PollSummary};
pub use processor::{Disposition, FailurePolicy, JobProcessor};
pub use redis_queue::RedisQueue;
pub use registry::{Registration, RunningJobRegistry};
pub use workers::{Worker, WorkerOptions};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown receipt handle")]
    UnknownReceipt,
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// The only payload the queue carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReference {
    pub id: String,
}

impl QueueReference {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn to_body(&self) -> QueueResult<String> {
        serde_json::to_string(self).map_err(|e| QueueError::Malformed(e.to_string()))
    }
}

/// A message handed out by `receive`, hidden from other receivers until it
/// is acknowledged or its visibility timeout lapses
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub receipt: String,
    pub body: String,
    /// 1 on first delivery
    pub receive_count: u32,
}

impl ReceivedMessage {
    pub fn reference(&self) -> QueueResult<QueueReference> {
        serde_json::from_str(&self.body).map_err(|e| QueueError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    pub visibility_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered
    pub max_receive_count: u32,
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout(),
            max_receive_count: config.max_receive_count.max(1),
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 5,
        }
    }
}

/// Durable, at-least-once point-to-point channel
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, reference: &QueueReference) -> QueueResult<()>;

    /// Long-poll for up to `max_items` messages, waiting at most `wait_time`
    async fn receive(&self, max_items: usize, wait_time: Duration)
        -> QueueResult<Vec<ReceivedMessage>>;

    /// Permanently remove a received message
    async fn acknowledge(&self, receipt: &str) -> QueueResult<()>;

    /// Push the message's visibility deadline `timeout` into the future
    async fn extend_visibility(&self, receipt: &str, timeout: Duration) -> QueueResult<()>;

    fn options(&self) -> QueueOptions;

    async fn ping(&self) -> QueueResult<()>;
}
