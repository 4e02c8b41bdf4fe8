//! Scheduler substrate: work queues, cancel sets, and progress pub/sub.
//!
//! `Substrate` is implemented twice, mirroring the teacher's store/engine
//! split in kind: `RedisSubstrate` for production and `InMemorySubstrate`
//! as a test double.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};

use crate::error::{EngineError, Result};

/// Which job family a substrate operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Scan,
    Firmware,
}

impl JobKind {
    fn queue_key(self) -> &'static str {
        match self {
            JobKind::Scan => "soc:scan_queue",
            JobKind::Firmware => "soc:firmware_queue",
        }
    }

    fn cancel_key(self) -> &'static str {
        match self {
            JobKind::Scan => "soc:scan_cancel",
            JobKind::Firmware => "soc:firmware_cancel",
        }
    }

    fn channel_prefix(self) -> &'static str {
        match self {
            JobKind::Scan => "soc:scan",
            JobKind::Firmware => "soc:firmware",
        }
    }

    pub fn channel(self, job_id: &str) -> String {
        format!("{}:{}", self.channel_prefix(), job_id)
    }
}

#[async_trait]
pub trait Substrate: Send + Sync {
    async fn enqueue(&self, kind: JobKind, job_id: &str) -> Result<()>;
    async fn dequeue(&self, kind: JobKind, block: Duration) -> Result<Option<String>>;
    async fn cancel(&self, kind: JobKind, job_id: &str) -> Result<()>;
    async fn is_cancelled(&self, kind: JobKind, job_id: &str) -> Result<bool>;
    async fn clear_cancel(&self, kind: JobKind, job_id: &str) -> Result<()>;
    /// JSON-encode `payload` and publish it on `kind`'s channel for `job_id`.
    async fn publish_raw(&self, kind: JobKind, job_id: &str, json: String) -> Result<()>;
}

/// Helper so callers can publish any `Serialize` value without hand-rolling
/// the `serde_json::to_string` call at every site.
pub async fn publish_json<T: Serialize>(
    substrate: &dyn Substrate,
    kind: JobKind,
    job_id: &str,
    payload: &T,
) -> Result<()> {
    let json = serde_json::to_string(payload)
        .map_err(|e| EngineError::ProgrammerError(format!("payload not serializable: {e}")))?;
    substrate.publish_raw(kind, job_id, json).await
}

// -- Redis-backed implementation -------------------------------------------

pub struct RedisSubstrate {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisSubstrate {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl Substrate for RedisSubstrate {
    async fn enqueue(&self, kind: JobKind, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("RPUSH")
            .arg(kind.queue_key())
            .arg(job_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))
    }

    async fn dequeue(&self, kind: JobKind, block: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let secs = block.as_secs_f64().max(0.0);
        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(kind.queue_key())
            .arg(secs)
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))?;
        Ok(result.map(|(_, id)| id))
    }

    async fn cancel(&self, kind: JobKind, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SADD")
            .arg(kind.cancel_key())
            .arg(job_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))
    }

    async fn is_cancelled(&self, kind: JobKind, job_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        redis::cmd("SISMEMBER")
            .arg(kind.cancel_key())
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))
    }

    async fn clear_cancel(&self, kind: JobKind, job_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SREM")
            .arg(kind.cancel_key())
            .arg(job_id)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))
    }

    async fn publish_raw(&self, kind: JobKind, job_id: &str, json: String) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(kind.channel(job_id))
            .arg(json)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| EngineError::DatastoreUnavailable(anyhow::anyhow!(e)))
    }
}

// -- In-memory test double --------------------------------------------------

#[derive(Default)]
struct MemState {
    scan_queue: VecDeque<String>,
    firmware_queue: VecDeque<String>,
    scan_cancel: HashSet<String>,
    firmware_cancel: HashSet<String>,
}

pub struct InMemorySubstrate {
    state: Mutex<MemState>,
    tx: broadcast::Sender<(String, String)>,
}

impl Default for InMemorySubstrate {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            state: Mutex::new(MemState::default()),
            tx,
        }
    }
}

impl InMemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every published `(channel, json)` pair, for tests and
    /// for the broadcast hub's consumer task when run against this double.
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Substrate for InMemorySubstrate {
    async fn enqueue(&self, kind: JobKind, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match kind {
            JobKind::Scan => state.scan_queue.push_back(job_id.to_string()),
            JobKind::Firmware => state.firmware_queue.push_back(job_id.to_string()),
        }
        Ok(())
    }

    async fn dequeue(&self, kind: JobKind, block: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            {
                let mut state = self.state.lock().await;
                let popped = match kind {
                    JobKind::Scan => state.scan_queue.pop_front(),
                    JobKind::Firmware => state.firmware_queue.pop_front(),
                };
                if popped.is_some() {
                    return Ok(popped);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn cancel(&self, kind: JobKind, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match kind {
            JobKind::Scan => state.scan_cancel.insert(job_id.to_string()),
            JobKind::Firmware => state.firmware_cancel.insert(job_id.to_string()),
        };
        Ok(())
    }

    async fn is_cancelled(&self, kind: JobKind, job_id: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(match kind {
            JobKind::Scan => state.scan_cancel.contains(job_id),
            JobKind::Firmware => state.firmware_cancel.contains(job_id),
        })
    }

    async fn clear_cancel(&self, kind: JobKind, job_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        match kind {
            JobKind::Scan => state.scan_cancel.remove(job_id),
            JobKind::Firmware => state.firmware_cancel.remove(job_id),
        };
        Ok(())
    }

    async fn publish_raw(&self, kind: JobKind, job_id: &str, json: String) -> Result<()> {
        let _ = self.tx.send((kind.channel(job_id), json));
        Ok(())
    }
}

pub type SharedSubstrate = Arc<dyn Substrate>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips() {
        let sub = InMemorySubstrate::new();
        sub.enqueue(JobKind::Scan, "abc").await.unwrap();
        let got = sub.dequeue(JobKind::Scan, Duration::from_millis(50)).await.unwrap();
        assert_eq!(got, Some("abc".to_string()));
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let sub = InMemorySubstrate::new();
        let got = sub.dequeue(JobKind::Scan, Duration::from_millis(20)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn cancel_set_membership_round_trips() {
        let sub = InMemorySubstrate::new();
        assert!(!sub.is_cancelled(JobKind::Scan, "j1").await.unwrap());
        sub.cancel(JobKind::Scan, "j1").await.unwrap();
        assert!(sub.is_cancelled(JobKind::Scan, "j1").await.unwrap());
        sub.clear_cancel(JobKind::Scan, "j1").await.unwrap();
        assert!(!sub.is_cancelled(JobKind::Scan, "j1").await.unwrap());
    }
}
