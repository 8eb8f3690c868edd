//! Redis-backed job queue
//!
//! Layout for a queue named `q`:
//!
//! - `q:pending`  - list of envelopes waiting for a receiver
//! - `q:inflight` - sorted set of received envelopes scored by the unix-ms
//!   instant they become visible again; the member string is the receipt
//! - `q:dead`     - list of envelopes that exceeded the receive limit
//!
//! Claiming and reclaiming are Lua scripts so each move is atomic.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{JobQueue, QueueError, QueueOptions, QueueReference, QueueResult, ReceivedMessage};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

const CLAIM_SCRIPT: &str = r#"
local out = {}
for i = 1, tonumber(ARGV[1]) do
  local raw = redis.call('RPOP', KEYS[1])
  if not raw then break end
  local msg = cjson.decode(raw)
  msg.receive_count = (msg.receive_count or 0) + 1
  msg.receipt = ARGV[2 + i]
  local encoded = cjson.encode(msg)
  redis.call('ZADD', KEYS[2], ARGV[2], encoded)
  table.insert(out, encoded)
end
return out
"#;

const RECLAIM_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local dead = 0
for _, raw in ipairs(expired) do
  if redis.call('ZREM', KEYS[1], raw) == 1 then
    local msg = cjson.decode(raw)
    msg.receipt = nil
    if (msg.receive_count or 0) >= tonumber(ARGV[2]) then
      redis.call('LPUSH', KEYS[3], cjson.encode(msg))
      dead = dead + 1
    else
      redis.call('RPUSH', KEYS[2], cjson.encode(msg))
    end
  end
end
return dead
"#;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    body: String,
    #[serde(default)]
    receive_count: u32,
}

pub struct RedisQueue {
    conn: ConnectionManager,
    pending_key: String,
    inflight_key: String,
    dead_key: String,
    options: QueueOptions,
    claim: Script,
    reclaim: Script,
}

impl RedisQueue {
    pub async fn connect(url: &str, name: &str, options: QueueOptions) -> QueueResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(queue = name, "Connected to Redis queue");

        Ok(Self {
            conn,
            pending_key: format!("{}:pending", name),
            inflight_key: format!("{}:inflight", name),
            dead_key: format!("{}:dead", name),
            options,
            claim: Script::new(CLAIM_SCRIPT),
            reclaim: Script::new(RECLAIM_SCRIPT),
        })
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn deadline_ms(timeout: Duration) -> i64 {
        Self::now_ms() + timeout.as_millis() as i64
    }

    async fn reclaim_expired(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let dead: i64 = self
            .reclaim
            .key(&self.inflight_key)
            .key(&self.pending_key)
            .key(&self.dead_key)
            .arg(Self::now_ms())
            .arg(self.options.max_receive_count)
            .invoke_async(&mut conn)
            .await?;
        if dead > 0 {
            warn!(count = dead, queue = %self.dead_key, "Dead-lettered messages");
        }
        Ok(())
    }

    async fn try_claim(&self, max_items: usize) -> QueueResult<Vec<ReceivedMessage>> {
        let mut conn = self.conn.clone();
        let mut invocation = self.claim.key(&self.pending_key);
        invocation
            .key(&self.inflight_key)
            .arg(max_items)
            .arg(Self::deadline_ms(self.options.visibility_timeout));
        for _ in 0..max_items {
            invocation.arg(Uuid::new_v4().to_string());
        }

        let claimed: Vec<String> = invocation.invoke_async(&mut conn).await?;
        claimed
            .into_iter()
            .map(|raw| {
                let envelope: Envelope = serde_json::from_str(&raw)
                    .map_err(|e| QueueError::Malformed(e.to_string()))?;
                Ok(ReceivedMessage {
                    receipt: raw,
                    body: envelope.body,
                    receive_count: envelope.receive_count,
                })
            })
            .collect()
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, reference: &QueueReference) -> QueueResult<()> {
        let envelope = Envelope {
            body: reference.to_body()?,
            receive_count: 0,
        };
        let payload =
            serde_json::to_string(&envelope).map_err(|e| QueueError::Malformed(e.to_string()))?;

        let mut conn = self.conn.clone();
        let _: () = conn.lpush(&self.pending_key, payload).await?;
        debug!(job_id = %reference.id, "Enqueued job reference");
        Ok(())
    }

    async fn receive(
        &self,
        max_items: usize,
        wait_time: Duration,
    ) -> QueueResult<Vec<ReceivedMessage>> {
        let started = tokio::time::Instant::now();
        let max_items = max_items.max(1);

        loop {
            self.reclaim_expired().await?;
            let claimed = self.try_claim(max_items).await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }

            let elapsed = started.elapsed();
            if elapsed >= wait_time {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(wait_time - elapsed)).await;
        }
    }

    async fn acknowledge(&self, receipt: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(&self.inflight_key, receipt).await?;
        if removed == 0 {
            debug!("Acknowledged a message that was no longer in flight");
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, timeout: Duration) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.inflight_key)
            .arg("XX")
            .arg(Self::deadline_ms(timeout))
            .arg(receipt)
            .query_async(&mut conn)
            .await?;

        let score: Option<f64> = conn.zscore(&self.inflight_key, receipt).await?;
        match score {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownReceipt),
        }
    }

    fn options(&self) -> QueueOptions {
        self.options
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(QueueError::Unavailable(format!("unexpected PING reply: {}", pong)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_defaults_receive_count() {
        let envelope: Envelope = serde_json::from_str(r#"{"body":"{\"id\":\"x\"}"}"#).unwrap();
        assert_eq!(envelope.receive_count, 0);
        let reference: QueueReference = serde_json::from_str(&envelope.body).unwrap();
        assert_eq!(reference.id, "x");
    }

    #[test]
    fn test_claimed_envelope_keeps_body() {
        // Shape produced by CLAIM_SCRIPT via cjson
        let raw = r#"{"receipt":"r-1","receive_count":3,"body":"{\"id\":\"job\"}"}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.receive_count, 3);
        assert_eq!(envelope.body, r#"{"id":"job"}"#);
    }
}
