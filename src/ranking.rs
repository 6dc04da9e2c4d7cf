//! Best-score bookkeeping per user and problem, globally and per contest
//!
//! Entries are shared across every worker slot. All writes go through
//! `RankingStore`, whose `record_best` is a single conditional write so two
//! judges finishing together for one key cannot lose an update.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::storage::RankingStore;

/// Grouping under which scores are ranked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RankingScope {
    Global,
    Contest(i64),
}

impl fmt::Display for RankingScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankingScope::Global => write!(f, "global"),
            RankingScope::Contest(id) => write!(f, "contest:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RankingKey {
    pub scope: RankingScope,
    pub user_id: i64,
    pub problem_id: i64,
}

/// Ranking state of one key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    /// Only ever increases
    pub best_score: f64,
    /// Judged submissions counted against this key
    pub attempts: u64,
    /// Submit time of the submission that set `best_score`
    pub best_at: Option<i64>,
    /// Submit time of the most recent counted submission
    pub last_submit_at: Option<i64>,
}

impl RankingEntry {
    /// Apply a candidate score in place. Returns true if the best improved.
    ///
    /// Store implementations run this under their own atomicity guarantee.
    pub fn record(&mut self, score: f64, timestamp: i64) -> bool {
        self.attempts += 1;
        self.last_submit_at = Some(timestamp);
        if self.best_at.is_none() || score > self.best_score {
            self.best_score = score;
            self.best_at = Some(timestamp);
            true
        } else {
            false
        }
    }

    pub fn count(&mut self, timestamp: i64) {
        self.attempts += 1;
        self.last_submit_at = Some(timestamp);
    }
}

/// What the aggregator did to the ranking for one submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingAction {
    /// CE/RE/IE: ranking untouched
    Skipped,
    /// Candidate offered as a new best
    RecordBest,
    /// Only the attempt counter moved
    CountAttempt,
}

/// Thin front over the ranking store used by the aggregator
#[derive(Clone)]
pub struct RankingUpdater {
    store: Arc<dyn RankingStore>,
}

impl RankingUpdater {
    pub fn new(store: Arc<dyn RankingStore>) -> Self {
        Self { store }
    }

    /// Offer `score` as the new best for `key`; counts an attempt either way.
    pub async fn record_best(&self, key: &RankingKey, score: f64, timestamp: i64) -> Result<bool> {
        let improved = self.store.record_best(key, score, timestamp).await?;
        debug!(
            scope = %key.scope,
            user_id = key.user_id,
            problem_id = key.problem_id,
            score,
            improved,
            "Ranking best offered"
        );
        Ok(improved)
    }

    pub async fn increment_attempts(&self, key: &RankingKey, timestamp: i64) -> Result<()> {
        self.store.increment_attempts(key, timestamp).await?;
        debug!(
            scope = %key.scope,
            user_id = key.user_id,
            problem_id = key.problem_id,
            "Ranking attempt counted"
        );
        Ok(())
    }
}
