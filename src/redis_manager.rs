//! Redis Manager - key layout and the Redis-backed job queue
//!
//! This module handles:
//! - Key naming shared by the queue and the store
//! - Job publishing (RPUSH)
//! - Worker ID allocation and lease management
//! - Reliable job popping (BLMOVE into the worker's processing list, LREM on ack)
//! - Recovery of jobs left behind by workers whose lease expired

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Script};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::Submission;
use crate::queue::{Delivery, JobQueue};

/// Redis key constants
pub mod keys {
    use crate::ranking::{RankingKey, RankingScope};

    /// Judge job queue key
    pub const JUDGE_QUEUE: &str = "oj:judge:queue";

    /// Worker lease key prefix, the value is the owning instance's token
    pub const WORKER_LEASE_PREFIX: &str = "oj:judge:worker:lease:";

    pub fn worker_lease(worker_id: u32) -> String {
        format!("{}{}", WORKER_LEASE_PREFIX, worker_id)
    }

    /// Jobs popped by one worker but not yet acknowledged
    pub fn processing(worker_id: u32) -> String {
        format!("oj:judge:processing:{}", worker_id)
    }

    pub fn problem(problem_id: i64) -> String {
        format!("oj:problem:{}", problem_id)
    }

    pub fn submission(submission_id: &str) -> String {
        format!("oj:submission:{}", submission_id)
    }

    pub fn source(submission_id: &str) -> String {
        format!("oj:source:{}", submission_id)
    }

    /// Hash of historical best scores, field `user:problem`
    pub fn best(scope: &RankingScope) -> String {
        format!("oj:best:{}", scope)
    }

    pub fn user_problem(key: &RankingKey) -> String {
        format!("{}:{}", key.user_id, key.problem_id)
    }

    pub fn ranking_entry(key: &RankingKey) -> String {
        format!("oj:ranking:{}:{}:{}", key.scope, key.user_id, key.problem_id)
    }

    /// Sorted set of per-user totals
    pub fn ranking_board(scope: &RankingScope) -> String {
        format!("oj:ranking:{}", scope)
    }
}

/// Configuration constants
const MAX_WORKERS: u32 = 32;
const WORKER_LEASE_TTL_SECS: u64 = 120;

/// Extend our own lease, or take it back if it lapsed.
/// 1: renewed, 2: reclaimed, 0: held by another instance.
const RENEW_LEASE: &str = r#"
local owner = redis.call('GET', KEYS[1])
if owner == ARGV[1] then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
  return 1
end
if not owner then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
  return 2
end
return 0
"#;

const RELEASE_LEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Drain a processing list back onto the queue unless a live worker owns it.
/// Returns the number of moved jobs, or -1 when the list was left alone.
const REQUEUE_STALE: &str = r#"
local owner = redis.call('GET', KEYS[1])
if owner and owner ~= ARGV[1] then
  return -1
end
local moved = 0
while redis.call('RPOPLPUSH', KEYS[2], KEYS[3]) do
  moved = moved + 1
end
return moved
"#;

/// Redis list queue shared by intake and every worker slot
///
/// Each instance leases a worker id and keeps its in-flight jobs in that id's
/// processing list, so a starting instance never touches jobs a live one owns.
pub struct RedisQueue {
    client: redis::Client,
    conn: ConnectionManager,
    /// Idle connections for blocking pops; a blocking command would stall
    /// every other request sharing its connection
    blocking: Mutex<Vec<MultiplexedConnection>>,
    worker_id: u32,
    token: String,
    processing: String,
    requeue: Script,
    release: Script,
    lease_handle: JoinHandle<()>,
}

impl RedisQueue {
    /// Connect, lease a free worker id and keep the lease alive in the background.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;
        info!("Queue connected to Redis at {}", redis_url);

        let token = Uuid::new_v4().simple().to_string();
        let worker_id = allocate_worker_id(&mut conn.clone(), &token).await?;
        info!(
            "Allocated worker_id={} (lease {}s)",
            worker_id, WORKER_LEASE_TTL_SECS
        );
        let lease_handle = spawn_lease_heartbeat(conn.clone(), worker_id, token.clone());

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            worker_id,
            processing: keys::processing(worker_id),
            token,
            requeue: Script::new(REQUEUE_STALE),
            release: Script::new(RELEASE_LEASE),
            lease_handle,
        })
    }

    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    /// Move unacknowledged jobs back onto the queue.
    ///
    /// Drains this instance's own list and every list whose lease has
    /// expired. Lists of live workers are skipped. Call once at startup,
    /// before any slot pops.
    pub async fn requeue_stale(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut moved = 0;
        for worker_id in 0..MAX_WORKERS {
            let requeued: i64 = self
                .requeue
                .key(keys::worker_lease(worker_id))
                .key(keys::processing(worker_id))
                .key(keys::JUDGE_QUEUE)
                .arg(&self.token)
                .invoke_async(&mut conn)
                .await
                .with_context(|| format!("Failed to recover jobs of worker {}", worker_id))?;
            if requeued > 0 {
                warn!(
                    "Requeued {} unacknowledged job(s) of worker {}",
                    requeued, worker_id
                );
                moved += requeued as usize;
            }
        }
        Ok(moved)
    }

    /// Stop renewing and give the worker id back.
    ///
    /// Jobs still in this worker's list are recovered by the next instance
    /// that starts.
    pub async fn release(&self) -> Result<()> {
        self.lease_handle.abort();
        let mut conn = self.conn.clone();
        self.release
            .key(keys::worker_lease(self.worker_id))
            .arg(&self.token)
            .invoke_async::<i32>(&mut conn)
            .await
            .context("Failed to release worker lease")?;
        info!("Released worker_id={}", self.worker_id);
        Ok(())
    }

    async fn take_blocking(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        get_connection_with_retry(&self.client).await
    }

    async fn return_blocking(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push(conn);
    }
}

impl Drop for RedisQueue {
    fn drop(&mut self) {
        self.lease_handle.abort();
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn publish(&self, submission: &Submission) -> Result<()> {
        let payload = serde_json::to_string(submission)?;
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(keys::JUDGE_QUEUE, payload)
            .await
            .with_context(|| format!("Failed to publish submission {}", submission.id))
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let mut conn = self.take_blocking().await?;

        let result: redis::RedisResult<Option<String>> = redis::cmd("BLMOVE")
            .arg(keys::JUDGE_QUEUE)
            .arg(&self.processing)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await;

        let payload = match result {
            Ok(payload) => {
                self.return_blocking(conn).await;
                payload
            }
            Err(e) => {
                // Drop the broken connection; the next pop opens a fresh one
                warn!("Redis BLMOVE failed: {}", e);
                return Err(e.into());
            }
        };

        let Some(payload) = payload else {
            return Ok(None);
        };

        match serde_json::from_str::<Submission>(&payload) {
            Ok(submission) => Ok(Some(Delivery {
                submission,
                receipt: payload,
            })),
            Err(e) => {
                warn!("Failed to parse job data: {}. Data: {}", e, payload);
                let mut conn = self.conn.clone();
                conn.lrem::<_, _, ()>(&self.processing, 1, &payload)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lrem::<_, _, ()>(&self.processing, 1, &delivery.receipt)
            .await
            .with_context(|| format!("Failed to ack submission {}", delivery.submission.id))
    }
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    let mut attempts = 0;
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) if attempts < 5 => {
                attempts += 1;
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
            Err(e) => return Err(e).context("Redis unreachable"),
        }
    }
}

/// Allocate a unique worker ID using Redis SET NX with expiration
async fn allocate_worker_id(conn: &mut ConnectionManager, token: &str) -> Result<u32> {
    loop {
        for worker_id in 0..MAX_WORKERS {
            let claimed: Option<String> = redis::cmd("SET")
                .arg(keys::worker_lease(worker_id))
                .arg(token)
                .arg("NX")
                .arg("EX")
                .arg(WORKER_LEASE_TTL_SECS)
                .query_async(conn)
                .await
                .context("Failed to claim worker lease")?;

            if claimed.is_some() {
                return Ok(worker_id);
            }
        }

        warn!(
            "No free worker_id (0-{}). Retrying in 1 second...",
            MAX_WORKERS - 1
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Spawn a background task to keep the worker lease alive
fn spawn_lease_heartbeat(conn: ConnectionManager, worker_id: u32, token: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_secs(WORKER_LEASE_TTL_SECS / 2);
        let renew = Script::new(RENEW_LEASE);

        loop {
            tokio::time::sleep(interval).await;

            let mut conn = conn.clone();
            let renewed: redis::RedisResult<i32> = renew
                .key(keys::worker_lease(worker_id))
                .arg(&token)
                .arg(WORKER_LEASE_TTL_SECS)
                .invoke_async(&mut conn)
                .await;
            match renewed {
                Ok(1) => {}
                Ok(2) => warn!("Worker lease {} had lapsed and was reclaimed", worker_id),
                Ok(_) => error!("Worker lease {} is held by another instance", worker_id),
                Err(e) => warn!("Failed to refresh worker lease {}: {}", worker_id, e),
            }
        }
    })
}
