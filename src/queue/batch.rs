//! Stateless per-batch consumer.
//!
//! Each invocation receives a batch of messages and returns the receipts of
//! the items that should be redelivered, in the partial batch response shape
//! used by SQS event source mappings:
//!
//! ```json
//! { "batchItemFailures": [ { "itemIdentifier": "<receipt>" } ] }
//! ```
//!
//! There is no cancellation listener here. A cancel that arrives while an
//! item is executing is only enforced by the store's guarded final write.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::processor::{Disposition, FailurePolicy, JobProcessor};
use super::ReceivedMessage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_item_failures: Vec<BatchItemFailure>,
}

impl BatchResponse {
    pub fn failed_receipts(&self) -> impl Iterator<Item = &str> {
        self.batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
    }
}

pub struct BatchConsumer {
    processor: JobProcessor,
    max_receive_count: u32,
}

impl BatchConsumer {
    /// `max_receive_count` is the delivery on which an executor failure is
    /// recorded instead of retried
    pub fn new(processor: JobProcessor, max_receive_count: u32) -> Self {
        Self {
            processor,
            max_receive_count: max_receive_count.max(1),
        }
    }

    pub async fn process_batch(&self, messages: &[ReceivedMessage]) -> BatchResponse {
        info!(size = messages.len(), "Processing batch");

        let results = join_all(messages.iter().map(|m| self.process_item(m))).await;

        let batch_item_failures: Vec<BatchItemFailure> = messages
            .iter()
            .zip(results)
            .filter(|(_, ok)| !ok)
            .map(|(m, _)| BatchItemFailure {
                item_identifier: m.receipt.clone(),
            })
            .collect();

        if !batch_item_failures.is_empty() {
            warn!(
                failed = batch_item_failures.len(),
                size = messages.len(),
                "Batch finished with failures"
            );
        }

        BatchResponse { batch_item_failures }
    }

    /// `true` when the item is done with and must not be redelivered
    async fn process_item(&self, message: &ReceivedMessage) -> bool {
        let reference = match message.reference() {
            Ok(reference) => reference,
            Err(e) => {
                warn!(error = %e, body = %message.body, "Dropping malformed queue reference");
                return true;
            }
        };

        let policy = if message.receive_count >= self.max_receive_count {
            FailurePolicy::Record
        } else {
            FailurePolicy::Defer
        };

        match self.processor.process(&reference.id, None, policy).await {
            Ok(Disposition::Deferred(reason)) => {
                debug!(
                    job_id = %reference.id,
                    receive_count = message.receive_count,
                    %reason,
                    "Item deferred for redelivery"
                );
                false
            }
            Ok(_) => true,
            Err(e) => {
                error!(job_id = %reference.id, error = %e, "Job store unavailable, item will be redelivered");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::ScriptedExecutor;
    use crate::db::{JobStore, MemoryJobStore};
    use crate::models::{JobKind, JobStatus, NewJob};
    use crate::queue::QueueReference;
    use serde_json::json;
    use std::sync::Arc;

    async fn insert(store: &MemoryJobStore, message: &str) -> String {
        store
            .insert(NewJob::new(JobKind::Message, json!({ "message": message })))
            .await
            .unwrap()
            .id
    }

    fn message(receipt: &str, id: &str, receive_count: u32) -> ReceivedMessage {
        ReceivedMessage {
            receipt: receipt.to_string(),
            body: QueueReference::new(id).to_body().unwrap(),
            receive_count,
        }
    }

    fn consumer(store: &MemoryJobStore, executor: &ScriptedExecutor) -> BatchConsumer {
        let processor = JobProcessor::new(Arc::new(store.clone()), Arc::new(executor.clone()));
        BatchConsumer::new(processor, 3)
    }

    #[tokio::test]
    async fn test_partial_failure_reports_only_failed_items() {
        let store = MemoryJobStore::new();
        let executor = ScriptedExecutor::immediate();
        let ok = insert(&store, "fine").await;
        let bad = insert(&store, "fail").await;

        let response = consumer(&store, &executor)
            .process_batch(&[message("r-ok", &ok, 1), message("r-bad", &bad, 1)])
            .await;

        assert_eq!(
            response.batch_item_failures,
            vec![BatchItemFailure {
                item_identifier: "r-bad".to_string()
            }]
        );
        assert_eq!(store.get(&ok).await.unwrap().status, JobStatus::Completed);
        assert_eq!(store.get(&bad).await.unwrap().status, JobStatus::Processing);
    }

    #[tokio::test]
    async fn test_final_attempt_records_failure() {
        let store = MemoryJobStore::new();
        let executor = ScriptedExecutor::immediate();
        let bad = insert(&store, "fail").await;

        let response = consumer(&store, &executor)
            .process_batch(&[message("r-bad", &bad, 3)])
            .await;

        assert!(response.batch_item_failures.is_empty());
        let row = store.get(&bad).await.unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.output.unwrap()["error"], "scripted failure");
    }

    #[tokio::test]
    async fn test_cancelled_missing_and_malformed_items_succeed() {
        let store = MemoryJobStore::new();
        let executor = ScriptedExecutor::immediate();
        let cancelled = insert(&store, "never").await;
        store.set_cancelled(&cancelled).await.unwrap();

        let malformed = ReceivedMessage {
            receipt: "r-junk".to_string(),
            body: "{\"nope\":1}".to_string(),
            receive_count: 1,
        };

        let response = consumer(&store, &executor)
            .process_batch(&[
                message("r-cancelled", &cancelled, 1),
                message("r-missing", "ghost", 1),
                malformed,
            ])
            .await;

        assert!(response.batch_item_failures.is_empty());
        assert_eq!(executor.calls(), 0);
        assert_eq!(store.get(&cancelled).await.unwrap().status, JobStatus::Cancelled);
    }

    #[test]
    fn test_response_wire_shape() {
        let response = BatchResponse {
            batch_item_failures: vec![BatchItemFailure {
                item_identifier: "abc".to_string(),
            }],
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "batchItemFailures": [ { "itemIdentifier": "abc" } ] })
        );
        assert_eq!(
            serde_json::to_value(BatchResponse::default()).unwrap(),
            json!({ "batchItemFailures": [] })
        );
    }
}
