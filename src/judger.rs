//! Judger module - turning stage outcomes into persisted results
//!
//! `ResultAggregator` computes the score, persists the terminal record and
//! then updates the ranking. The ranking write is a follow-on: once the
//! record is stored, a ranking fault is logged and never undoes it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::core::{CompileOutcome, ExecutionOutcome, Problem, ResultKind, Submission, SubmissionState};
use crate::ranking::{RankingAction, RankingUpdater};
use crate::storage::SubmissionStore;

#[derive(Clone)]
pub struct ResultAggregator {
    submissions: Arc<dyn SubmissionStore>,
    ranking: RankingUpdater,
}

impl ResultAggregator {
    pub fn new(submissions: Arc<dyn SubmissionStore>, ranking: RankingUpdater) -> Self {
        Self {
            submissions,
            ranking,
        }
    }

    /// Persist an execution outcome and update the ranking.
    ///
    /// Errors only when the submission record itself could not be stored.
    /// Ranking faults, including the prior-best lookup, are logged instead.
    pub async fn apply(
        &self,
        submission: &mut Submission,
        outcome: &ExecutionOutcome,
        problem: &Problem,
    ) -> Result<RankingAction> {
        if outcome.is_error() {
            warn!(
                submission_id = %submission.id,
                result = %outcome.result,
                error = %outcome.message,
                "Runtime or internal error"
            );
            submission.end_with_error(outcome.result, outcome.message.clone());
            self.persist(submission).await?;
            return Ok(RankingAction::Skipped);
        }

        let pass_rate = if outcome.pass_rate.is_nan() {
            0.0
        } else {
            outcome.pass_rate
        };
        let key = submission.ranking_key();

        // Read before persisting: the stored best must not include this run.
        let previous_best = self.submissions.best_score(&key).await;

        submission.total = outcome.total;
        submission.passed = outcome.passed;
        submission.pass_rate = pass_rate;
        submission.score = pass_rate * problem.score;
        submission.time = outcome.time;
        submission.memory = outcome.memory;
        submission.result = Some(outcome.result);
        submission.advance(SubmissionState::Judged);

        self.persist(submission).await?;

        let action = match previous_best {
            Ok(best) if pass_rate > 0.0 && best.map_or(true, |best| best < submission.score) => {
                RankingAction::RecordBest
            }
            Ok(_) => RankingAction::CountAttempt,
            Err(e) => {
                warn!(
                    submission_id = %submission.id,
                    error = %format!("{:#}", e),
                    "Cannot read best score, ranking left unchanged"
                );
                RankingAction::Skipped
            }
        };

        let ranked = match action {
            RankingAction::RecordBest => self
                .ranking
                .record_best(&key, submission.score, submission.submit_time)
                .await
                .map(|_| ()),
            RankingAction::CountAttempt => {
                self.ranking
                    .increment_attempts(&key, submission.submit_time)
                    .await
            }
            RankingAction::Skipped => Ok(()),
        };
        if let Err(e) = ranked {
            warn!(
                submission_id = %submission.id,
                error = %format!("{:#}", e),
                "Ranking update failed, result is kept"
            );
        }

        info!(
            submission_id = %submission.id,
            result = %outcome.result,
            score = submission.score,
            passed = submission.passed,
            total = submission.total,
            "Submission judged"
        );
        Ok(action)
    }

    /// Persist a compile failure. The ranking is not touched.
    pub async fn apply_compile_error(
        &self,
        submission: &mut Submission,
        outcome: &CompileOutcome,
    ) -> Result<()> {
        info!(submission_id = %submission.id, "Compile error");
        submission.end_with_error(ResultKind::CompileError, outcome.message.clone());
        self.persist(submission).await
    }

    async fn persist(&self, submission: &Submission) -> Result<()> {
        self.submissions
            .update_with_result(submission)
            .await
            .with_context(|| format!("Failed to persist result of {}", submission.id))
    }
}
