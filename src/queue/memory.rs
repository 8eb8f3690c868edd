use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueOptions, QueueReference, QueueResult, ReceivedMessage};

#[derive(Debug, Clone)]
struct Envelope {
    body: String,
    receive_count: u32,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Envelope>,
    in_flight: HashMap<String, (Envelope, Instant)>,
    dead: Vec<Envelope>,
}

impl State {
    /// Return expired in-flight messages to the queue, or dead-letter them
    fn reclaim(&mut self, now: Instant, max_receive_count: u32) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (_, visible_at))| *visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some((envelope, _)) = self.in_flight.remove(&receipt) {
                if envelope.receive_count >= max_receive_count {
                    warn!(receive_count = envelope.receive_count, "Dead-lettering message");
                    self.dead.push(envelope);
                } else {
                    self.pending.push_front(envelope);
                }
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|(_, at)| *at).min()
    }
}

/// In-process queue with visibility timeouts, for tests and the `dev` command
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    options: QueueOptions,
}

impl MemoryQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<String> {
        self.lock().dead.iter().map(|e| e.body.clone()).collect()
    }

    fn try_claim(&self, max_items: usize) -> (Vec<ReceivedMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut state = self.lock();
        state.reclaim(now, self.options.max_receive_count);

        let mut claimed = Vec::new();
        while claimed.len() < max_items {
            let Some(mut envelope) = state.pending.pop_front() else {
                break;
            };
            envelope.receive_count += 1;
            let receipt = Uuid::new_v4().to_string();
            claimed.push(ReceivedMessage {
                receipt: receipt.clone(),
                body: envelope.body.clone(),
                receive_count: envelope.receive_count,
            });
            state
                .in_flight
                .insert(receipt, (envelope, now + self.options.visibility_timeout));
        }

        (claimed, state.next_expiry())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, reference: &QueueReference) -> QueueResult<()> {
        let body = reference.to_body()?;
        self.lock().pending.push_back(Envelope {
            body,
            receive_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(
        &self,
        max_items: usize,
        wait_time: Duration,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait_time;

        loop {
            let (claimed, next_expiry) = self.try_claim(max_items.max(1));
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            // Wake for an enqueue, a visibility expiry, or the end of the poll
            let wake_at = next_expiry.map_or(deadline, |at| at.min(deadline));
            let _ = tokio::time::timeout_at(wake_at, self.notify.notified()).await;
        }
    }

    async fn acknowledge(&self, receipt: &str) -> QueueResult<()> {
        if self.lock().in_flight.remove(receipt).is_none() {
            debug!(receipt, "Acknowledged a message that was no longer in flight");
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, timeout: Duration) -> QueueResult<()> {
        let mut state = self.lock();
        let (_, visible_at) = state
            .in_flight
            .get_mut(receipt)
            .ok_or(QueueError::UnknownReceipt)?;
        *visible_at = Instant::now() + timeout;
        Ok(())
    }

    fn options(&self) -> QueueOptions {
        self.options
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
