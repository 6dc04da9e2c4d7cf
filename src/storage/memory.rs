//! In-process store
//!
//! Every operation takes one lock, so `record_best` is atomic with respect to
//! concurrent callers.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::{scored, ProblemStore, RankingStore, SubmissionStore};
use crate::core::{Problem, Submission, SubmissionState};
use crate::ranking::{RankingEntry, RankingKey, RankingScope};

#[derive(Default)]
struct Inner {
    problems: HashMap<i64, Problem>,
    submissions: HashMap<String, Submission>,
    sources: HashMap<String, String>,
    best: HashMap<RankingKey, f64>,
    ranking: HashMap<RankingKey, RankingEntry>,
    totals: HashMap<(RankingScope, i64), f64>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_problem(&self, problem: Problem) {
        self.lock().problems.insert(problem.id, problem);
    }

    /// Stored submission record (source code lives in `source`)
    pub fn submission(&self, submission_id: &str) -> Option<Submission> {
        self.lock().submissions.get(submission_id).cloned()
    }

    pub fn source(&self, submission_id: &str) -> Option<String> {
        self.lock().sources.get(submission_id).cloned()
    }
}

#[async_trait]
impl ProblemStore for MemoryStore {
    async fn get_problem(&self, problem_id: i64) -> Result<Option<Problem>> {
        Ok(self.lock().problems.get(&problem_id).cloned())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert_queued(&self, submission: &Submission) -> Result<()> {
        let mut inner = self.lock();
        if inner.submissions.contains_key(&submission.id) {
            bail!("Submission {} already exists", submission.id);
        }

        let mut record = submission.clone();
        let source = std::mem::take(&mut record.source_code);
        inner.sources.insert(submission.id.clone(), source);
        inner.submissions.insert(submission.id.clone(), record);
        Ok(())
    }

    async fn get_state(&self, submission_id: &str) -> Result<Option<SubmissionState>> {
        Ok(self.lock().submissions.get(submission_id).map(|s| s.state))
    }

    async fn update_state(&self, submission_id: &str, state: SubmissionState) -> Result<()> {
        match self.lock().submissions.get_mut(submission_id) {
            Some(record) => {
                record.advance(state);
                Ok(())
            }
            None => bail!("Submission {} not found", submission_id),
        }
    }

    async fn update_with_result(&self, submission: &Submission) -> Result<()> {
        let mut inner = self.lock();

        if let Some(score) = scored(submission) {
            let best = inner.best.entry(submission.ranking_key()).or_insert(score);
            if score > *best {
                *best = score;
            }
        }

        let mut record = submission.clone();
        record.source_code.clear();
        inner.submissions.insert(submission.id.clone(), record);
        Ok(())
    }

    async fn best_score(&self, key: &RankingKey) -> Result<Option<f64>> {
        Ok(self.lock().best.get(key).copied())
    }
}

#[async_trait]
impl RankingStore for MemoryStore {
    async fn record_best(&self, key: &RankingKey, score: f64, timestamp: i64) -> Result<bool> {
        let mut inner = self.lock();
        let entry = inner.ranking.entry(*key).or_default();
        let previous = entry.best_score;
        let improved = entry.record(score, timestamp);

        let total = inner.totals.entry((key.scope, key.user_id)).or_insert(0.0);
        if improved {
            *total += score - previous;
        }
        Ok(improved)
    }

    async fn increment_attempts(&self, key: &RankingKey, timestamp: i64) -> Result<()> {
        let mut inner = self.lock();
        inner.ranking.entry(*key).or_default().count(timestamp);
        inner.totals.entry((key.scope, key.user_id)).or_insert(0.0);
        Ok(())
    }

    async fn entry(&self, key: &RankingKey) -> Result<Option<RankingEntry>> {
        Ok(self.lock().ranking.get(key).cloned())
    }

    async fn total(&self, scope: RankingScope, user_id: i64) -> Result<f64> {
        Ok(self
            .lock()
            .totals
            .get(&(scope, user_id))
            .copied()
            .unwrap_or(0.0))
    }
}
