//! Long-running queue consumer
//!
//! Two activities run per worker process:
//!
//! - the receive loop: one in-flight job at a time, scale out by running
//!   more worker processes
//! - the cancellation listener: a standing subscription that aborts the
//!   matching entry in this process's [`RunningJobRegistry`]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::processor::{Disposition, FailurePolicy, JobProcessor};
use super::registry::RunningJobRegistry;
use super::{JobQueue, ReceivedMessage};
use crate::db::{CancellationStream, CancellationSubscriber, StoreResult};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Long-poll duration per receive
    pub wait_time: Duration,
    /// Delay before retrying a failed receive or a dropped subscription
    pub retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(20),
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub struct Worker {
    queue: Arc<dyn JobQueue>,
    processor: JobProcessor,
    subscriber: Arc<dyn CancellationSubscriber>,
    registry: RunningJobRegistry,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        processor: JobProcessor,
        subscriber: Arc<dyn CancellationSubscriber>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            queue,
            processor,
            subscriber,
            registry: RunningJobRegistry::new(),
            options,
        }
    }

    pub fn registry(&self) -> &RunningJobRegistry {
        &self.registry
    }

    /// Run until `shutdown` fires. The job in flight at that moment is
    /// finished before returning.
    pub async fn run(&self, shutdown: CancellationToken) -> StoreResult<()> {
        // Subscribe before taking any work so no cancellation for a job we
        // start is missed
        let stream = self.subscriber.subscribe().await?;
        let listener_shutdown = shutdown.child_token();
        let listener = tokio::spawn(listen_for_cancellations(
            stream,
            self.subscriber.clone(),
            self.registry.clone(),
            listener_shutdown.clone(),
            self.options.retry_delay,
        ));

        info!("Worker started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.queue.receive(1, self.options.wait_time) => received,
            };

            match received {
                Ok(messages) => {
                    for message in messages {
                        self.handle_message(message).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to receive from queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.retry_delay) => {}
                    }
                }
            }
        }

        listener_shutdown.cancel();
        if let Err(e) = listener.await {
            warn!(error = %e, "Cancellation listener ended abnormally");
        }
        info!("Worker stopped");
        Ok(())
    }

    /// Process one message and acknowledge it unless a store failure
    /// means it should be redelivered.
    pub async fn handle_message(&self, message: ReceivedMessage) -> Option<Disposition> {
        let reference = match message.reference() {
            Ok(reference) => reference,
            Err(e) => {
                warn!(error = %e, body = %message.body, "Dropping malformed queue reference");
                self.acknowledge(&message).await;
                return None;
            }
        };

        debug!(job_id = %reference.id, receive_count = message.receive_count, "Received job reference");

        let processing =
            self.processor
                .process(&reference.id, Some(&self.registry), FailurePolicy::Record);
        tokio::pin!(processing);
        let heartbeat = self.keep_visible(&message);
        tokio::pin!(heartbeat);

        let result = tokio::select! {
            result = &mut processing => result,
            () = &mut heartbeat => processing.await,
        };

        match result {
            Ok(disposition) => {
                debug!(job_id = %reference.id, ?disposition, "Job reference handled");
                self.acknowledge(&message).await;
                Some(disposition)
            }
            Err(e) => {
                // Left unacknowledged; the queue redelivers after the
                // visibility timeout
                error!(job_id = %reference.id, error = %e, "Job store unavailable, leaving message for redelivery");
                None
            }
        }
    }

    async fn acknowledge(&self, message: &ReceivedMessage) {
        if let Err(e) = self.queue.acknowledge(&message.receipt).await {
            error!(error = %e, "Failed to acknowledge message");
        }
    }

    /// Keep the message hidden while a long execution is in flight
    async fn keep_visible(&self, message: &ReceivedMessage) {
        let timeout = self.queue.options().visibility_timeout;
        let period = (timeout / 2).max(Duration::from_millis(100));

        loop {
            tokio::time::sleep(period).await;
            if let Err(e) = self.queue.extend_visibility(&message.receipt, timeout).await {
                warn!(error = %e, "Failed to extend message visibility");
            }
        }
    }
}

/// Standing subscription loop: abort local executions named by
/// cancellation events, resubscribing if the channel drops.
async fn listen_for_cancellations(
    mut stream: CancellationStream,
    subscriber: Arc<dyn CancellationSubscriber>,
    registry: RunningJobRegistry,
    shutdown: CancellationToken,
    retry_delay: Duration,
) {
    loop {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if registry.abort(&event.id) {
                        info!(job_id = %event.id, "Aborted running job on cancellation");
                    } else {
                        debug!(job_id = %event.id, "Cancellation for job not running here");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Cancellation channel error"),
                None => {
                    warn!("Cancellation subscription closed");
                    break;
                }
            }
        }

        stream = loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(retry_delay) => {}
            }
            match subscriber.subscribe().await {
                Ok(stream) => {
                    info!("Cancellation subscription re-established");
                    break stream;
                }
                Err(e) => error!(error = %e, "Failed to resubscribe to cancellation channel"),
            }
        };
    }
}
