//! Local driver for the [`BatchConsumer`].
//!
//! Stands in for the managed event source: receives a batch, hands it to
//! the consumer, and acknowledges every item not named in the response.
//! Failed items stay in flight and come back after the visibility timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::batch::BatchConsumer;
use super::{JobQueue, QueueResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub received: usize,
    pub failed: usize,
}

pub struct BatchPoller {
    queue: Arc<dyn JobQueue>,
    consumer: BatchConsumer,
    batch_size: usize,
    wait_time: Duration,
}

impl BatchPoller {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        consumer: BatchConsumer,
        batch_size: usize,
        wait_time: Duration,
    ) -> Self {
        Self {
            queue,
            consumer,
            batch_size: batch_size.max(1),
            wait_time,
        }
    }

    pub async fn poll_once(&self) -> QueueResult<PollSummary> {
        let messages = self.queue.receive(self.batch_size, self.wait_time).await?;
        if messages.is_empty() {
            return Ok(PollSummary::default());
        }

        let response = self.consumer.process_batch(&messages).await;
        let failed: Vec<&str> = response.failed_receipts().collect();

        for message in messages.iter().filter(|m| !failed.contains(&m.receipt.as_str())) {
            if let Err(e) = self.queue.acknowledge(&message.receipt).await {
                error!(error = %e, "Failed to acknowledge batch item");
            }
        }

        Ok(PollSummary {
            received: messages.len(),
            failed: failed.len(),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        info!(batch_size = self.batch_size, "Batch poller started");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.poll_once() => polled,
            };

            if let Err(e) = polled {
                error!(error = %e, "Batch poll failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
        }

        info!("Batch poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedExecutor;
    use crate::db::{JobStore, MemoryJobStore};
    use crate::models::{JobKind, JobStatus};
    use crate::queue::{JobProcessor, JobService, MemoryQueue, QueueOptions};
    use serde_json::json;

    fn setup(
        visibility_timeout: Duration,
        max_receive_count: u32,
    ) -> (JobService, MemoryJobStore, MemoryQueue, BatchPoller) {
        let store = MemoryJobStore::new();
        let queue = MemoryQueue::new(QueueOptions {
            visibility_timeout,
            max_receive_count,
        });
        let processor = JobProcessor::new(
            Arc::new(store.clone()),
            Arc::new(ScriptedExecutor::immediate()),
        );
        let poller = BatchPoller::new(
            Arc::new(queue.clone()),
            BatchConsumer::new(processor, max_receive_count),
            10,
            Duration::from_millis(200),
        );
        let service = JobService::new(Arc::new(store.clone()), Arc::new(queue.clone()));
        (service, store, queue, poller)
    }

    #[tokio::test]
    async fn test_successful_items_are_acknowledged() {
        let (service, store, queue, poller) = setup(Duration::from_secs(60), 3);
        let a = service
            .submit_raw(JobKind::Message, json!({ "message": "a" }))
            .await
            .unwrap();
        let b = service
            .submit_raw(JobKind::Message, json!({ "message": "fail" }))
            .await
            .unwrap();

        let summary = poller.poll_once().await.unwrap();
        assert_eq!(summary, PollSummary { received: 2, failed: 1 });
        assert_eq!(queue.in_flight_len(), 1);
        assert_eq!(store.get(&a).await.unwrap().status, JobStatus::Completed);
        assert_eq!(store.get(&b).await.unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_failed_item_retried_until_recorded() {
        let (service, store, queue, poller) = setup(Duration::from_millis(30), 2);
        let id = service
            .submit_raw(JobKind::Message, json!({ "message": "fail" }))
            .await
            .unwrap();

        let first = poller.poll_once().await.unwrap();
        assert_eq!(first.failed, 1);

        let second = poller.poll_once().await.unwrap();
        assert_eq!(second, PollSummary { received: 1, failed: 0 });

        assert_eq!(queue.in_flight_len(), 0);
        assert!(queue.dead_letters().is_empty());
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_empty_poll() {
        let (_, _, _, poller) = setup(Duration::from_secs(60), 3);
        let summary = tokio::time::timeout(Duration::from_secs(2), poller.poll_once())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary, PollSummary::default());
    }
}
