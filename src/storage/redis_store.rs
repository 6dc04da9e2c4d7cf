//! Redis-backed store
//!
//! Records are JSON strings. Ranking entries are hashes, and each scope keeps
//! a sorted set of per-user totals. Conditional writes run as Lua scripts so
//! they are atomic on the server.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::info;

use super::{scored, ProblemStore, RankingStore, SubmissionStore};
use crate::core::{Problem, Submission, SubmissionState};
use crate::ranking::{RankingEntry, RankingKey, RankingScope};
use crate::redis_manager::keys;

/// SET the record; raise the historical best if a score is given.
const UPDATE_WITH_RESULT: &str = r#"
redis.call('SET', KEYS[1], ARGV[1])
if ARGV[3] ~= '' then
  local current = redis.call('HGET', KEYS[2], ARGV[2])
  if (not current) or tonumber(ARGV[3]) > tonumber(current) then
    redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
  end
end
return 1
"#;

/// Count the attempt; replace best and move the user's total by the delta
/// only when the candidate wins.
const RECORD_BEST: &str = r#"
local score = tonumber(ARGV[1])
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'last_submit_at', ARGV[2])
local best_at = redis.call('HGET', KEYS[1], 'best_at')
local best = tonumber(redis.call('HGET', KEYS[1], 'best_score') or '0')
if (not best_at) or score > best then
  redis.call('HSET', KEYS[1], 'best_score', ARGV[1], 'best_at', ARGV[2])
  redis.call('ZINCRBY', KEYS[2], score - best, ARGV[3])
  return 1
end
return 0
"#;

const INCREMENT_ATTEMPTS: &str = r#"
redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'last_submit_at', ARGV[1])
redis.call('ZINCRBY', KEYS[2], 0, ARGV[2])
return 1
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    update_with_result: Script,
    record_best: Script,
    increment_attempts: Script,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        info!("Store connected to Redis at {}", redis_url);

        Ok(Self {
            conn,
            update_with_result: Script::new(UPDATE_WITH_RESULT),
            record_best: Script::new(RECORD_BEST),
            increment_attempts: Script::new(INCREMENT_ATTEMPTS),
        })
    }

    async fn load_submission(&self, submission_id: &str) -> Result<Option<Submission>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(keys::submission(submission_id)).await?;
        json.map(|data| {
            serde_json::from_str(&data)
                .with_context(|| format!("Corrupt submission record {}", submission_id))
        })
        .transpose()
    }
}

fn record_json(submission: &Submission) -> Result<String> {
    let mut record = submission.clone();
    record.source_code.clear();
    Ok(serde_json::to_string(&record)?)
}

#[async_trait]
impl ProblemStore for RedisStore {
    async fn get_problem(&self, problem_id: i64) -> Result<Option<Problem>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(keys::problem(problem_id)).await?;
        json.map(|data| {
            serde_json::from_str(&data)
                .with_context(|| format!("Corrupt problem record {}", problem_id))
        })
        .transpose()
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn insert_queued(&self, submission: &Submission) -> Result<()> {
        let mut conn = self.conn.clone();
        let record = record_json(submission)?;

        // No read happens here, so MULTI/EXEC is enough: both records land
        // together or not at all.
        redis::pipe()
            .atomic()
            .set(keys::submission(&submission.id), record)
            .ignore()
            .set(keys::source(&submission.id), &submission.source_code)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .with_context(|| format!("Failed to persist submission {}", submission.id))
    }

    async fn get_state(&self, submission_id: &str) -> Result<Option<SubmissionState>> {
        Ok(self.load_submission(submission_id).await?.map(|s| s.state))
    }

    async fn update_state(&self, submission_id: &str, state: SubmissionState) -> Result<()> {
        // One worker owns a submission, so read-modify-write is safe here.
        let mut record = self
            .load_submission(submission_id)
            .await?
            .with_context(|| format!("Submission {} not found", submission_id))?;
        record.advance(state);

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(keys::submission(submission_id), record_json(&record)?)
            .await?;
        Ok(())
    }

    async fn update_with_result(&self, submission: &Submission) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = submission.ranking_key();
        let score = scored(submission)
            .map(|s| s.to_string())
            .unwrap_or_default();

        self.update_with_result
            .key(keys::submission(&submission.id))
            .key(keys::best(&key.scope))
            .arg(record_json(submission)?)
            .arg(keys::user_problem(&key))
            .arg(score)
            .invoke_async::<i32>(&mut conn)
            .await
            .with_context(|| format!("Failed to persist result of {}", submission.id))?;
        Ok(())
    }

    async fn best_score(&self, key: &RankingKey) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let best: Option<f64> = conn
            .hget(keys::best(&key.scope), keys::user_problem(key))
            .await?;
        Ok(best)
    }
}

#[async_trait]
impl RankingStore for RedisStore {
    async fn record_best(&self, key: &RankingKey, score: f64, timestamp: i64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let improved: i32 = self
            .record_best
            .key(keys::ranking_entry(key))
            .key(keys::ranking_board(&key.scope))
            .arg(score)
            .arg(timestamp)
            .arg(key.user_id)
            .invoke_async(&mut conn)
            .await
            .context("Ranking best update failed")?;
        Ok(improved == 1)
    }

    async fn increment_attempts(&self, key: &RankingKey, timestamp: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        self.increment_attempts
            .key(keys::ranking_entry(key))
            .key(keys::ranking_board(&key.scope))
            .arg(timestamp)
            .arg(key.user_id)
            .invoke_async::<i32>(&mut conn)
            .await
            .context("Ranking attempt update failed")?;
        Ok(())
    }

    async fn entry(&self, key: &RankingKey) -> Result<Option<RankingEntry>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(keys::ranking_entry(key)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(entry_from_fields(&fields)?))
    }

    async fn total(&self, scope: RankingScope, user_id: i64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let total: Option<f64> = conn.zscore(keys::ranking_board(&scope), user_id).await?;
        Ok(total.unwrap_or(0.0))
    }
}

fn entry_from_fields(fields: &HashMap<String, String>) -> Result<RankingEntry> {
    fn field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<Option<T>> {
        fields
            .get(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|_| anyhow::anyhow!("Invalid ranking field {}: {}", name, raw))
            })
            .transpose()
    }

    Ok(RankingEntry {
        best_score: field(fields, "best_score")?.unwrap_or(0.0),
        attempts: field(fields, "attempts")?.unwrap_or(0),
        best_at: field(fields, "best_at")?,
        last_submit_at: field(fields, "last_submit_at")?,
    })
}
