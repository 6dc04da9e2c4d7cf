//! Persistence contracts consumed by the judge
//!
//! The judge never owns its storage engine. It reads and writes through these
//! narrow traits:
//! - `ProblemStore`: problem metadata, read-only
//! - `SubmissionStore`: submission records, state and historical best scores
//! - `RankingStore`: shared ranking entries with an atomic conditional write
//!
//! `MemoryStore` keeps everything in process; `RedisStore` is the deployed
//! backend.

pub mod memory;
pub mod redis_store;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{Problem, Submission, SubmissionState};
use crate::ranking::{RankingEntry, RankingKey, RankingScope};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

#[async_trait]
pub trait ProblemStore: Send + Sync {
    async fn get_problem(&self, problem_id: i64) -> Result<Option<Problem>>;
}

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Persist a queued submission and its paired source record in one write.
    async fn insert_queued(&self, submission: &Submission) -> Result<()>;

    async fn get_state(&self, submission_id: &str) -> Result<Option<SubmissionState>>;

    async fn update_state(&self, submission_id: &str, state: SubmissionState) -> Result<()>;

    /// Persist the terminal record. Scored results also feed the historical
    /// best for the submission's ranking key.
    async fn update_with_result(&self, submission: &Submission) -> Result<()>;

    /// Highest score among the user's judged submissions for this key
    async fn best_score(&self, key: &RankingKey) -> Result<Option<f64>>;
}

#[async_trait]
pub trait RankingStore: Send + Sync {
    /// Count an attempt and replace the best score only if `score` beats it,
    /// as one atomic write. Returns true if the best was replaced.
    async fn record_best(&self, key: &RankingKey, score: f64, timestamp: i64) -> Result<bool>;

    /// Count an attempt without touching the best score.
    async fn increment_attempts(&self, key: &RankingKey, timestamp: i64) -> Result<()>;

    async fn entry(&self, key: &RankingKey) -> Result<Option<RankingEntry>>;

    /// Sum of the user's best scores within a scope
    async fn total(&self, scope: RankingScope, user_id: i64) -> Result<f64>;
}

/// Score to feed into the historical best, if the record carries one
pub(crate) fn scored(submission: &Submission) -> Option<f64> {
    match submission.result {
        Some(kind) if submission.is_judged() && !kind.is_error() => Some(submission.score),
        _ => None,
    }
}
