//! Submission and problem records as they travel through the pipeline

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::verdict::ResultKind;
use crate::ranking::{RankingKey, RankingScope};

/// Lifecycle state of a submission.
///
/// Ordering follows the pipeline so a transition can be checked with `<`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
    Queued,
    Compiling,
    Running,
    Judged,
}

/// One user's code entry for a problem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub user_id: i64,
    pub problem_id: i64,
    /// None means the submission was made outside any contest
    #[serde(default)]
    pub contest_id: Option<i64>,
    /// Raw language id; resolved with `Language::from_id`
    pub language: i32,
    pub source_code: String,
    /// Milliseconds since the Unix epoch
    pub submit_time: i64,
    pub state: SubmissionState,
    #[serde(default)]
    pub result: Option<ResultKind>,
    #[serde(default)]
    pub score: f64,
    #[serde(default)]
    pub pass_rate: f64,
    #[serde(default)]
    pub passed: u32,
    #[serde(default)]
    pub total: u32,
    /// Milliseconds
    #[serde(default)]
    pub time: u64,
    /// KB
    #[serde(default)]
    pub memory: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Submission {
    /// Build a freshly queued submission from an intake payload.
    pub fn queued(id: impl Into<String>, payload: &CommitPayload, submit_time: i64) -> Self {
        Self {
            id: id.into(),
            user_id: payload.user_id,
            problem_id: payload.problem_id,
            contest_id: payload.contest_id,
            language: payload.language,
            source_code: payload.source_code.clone(),
            submit_time,
            state: SubmissionState::Queued,
            result: None,
            score: 0.0,
            pass_rate: 0.0,
            passed: 0,
            total: 0,
            time: 0,
            memory: 0,
            error: None,
        }
    }

    /// Move to `next`. Backward moves and moves out of JUDGED are refused.
    pub fn advance(&mut self, next: SubmissionState) -> bool {
        if self.state == SubmissionState::Judged || next < self.state {
            warn!(
                submission_id = %self.id,
                from = ?self.state,
                to = ?next,
                "Refusing backward state transition"
            );
            return false;
        }
        self.state = next;
        true
    }

    /// Finish with CE/RE/IE and a diagnostic message.
    pub fn end_with_error(&mut self, kind: ResultKind, message: impl Into<String>) {
        self.result = Some(kind);
        self.error = Some(message.into());
        self.state = SubmissionState::Judged;
    }

    pub fn is_judged(&self) -> bool {
        self.state == SubmissionState::Judged
    }

    pub fn ranking_scope(&self) -> RankingScope {
        match self.contest_id {
            Some(contest_id) => RankingScope::Contest(contest_id),
            None => RankingScope::Global,
        }
    }

    pub fn ranking_key(&self) -> RankingKey {
        RankingKey {
            scope: self.ranking_scope(),
            user_id: self.user_id,
            problem_id: self.problem_id,
        }
    }
}

/// Problem metadata, read-only to the judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub id: i64,
    /// Milliseconds
    pub time_limit: u64,
    /// MB
    pub memory_limit: u64,
    /// MB
    pub output_limit: u64,
    /// Score awarded for a full pass
    pub score: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Payload handed to intake by the API layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPayload {
    pub user_id: i64,
    pub problem_id: i64,
    #[serde(default)]
    pub contest_id: Option<i64>,
    pub language: i32,
    pub source_code: String,
    /// Set by the API layer when it already stamped the request
    #[serde(default)]
    pub submit_time: Option<i64>,
}
