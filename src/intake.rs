//! Submission intake
//!
//! Validates a payload, assigns an id and submit time, persists the queued
//! record and only then publishes the job.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;

use crate::core::{CommitPayload, Submission};
use crate::languages::LanguageTable;
use crate::queue::JobQueue;
use crate::storage::{ProblemStore, SubmissionStore};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Problem {0} does not exist")]
    ProblemNotFound(i64),

    #[error("Problem {0} is not open for submissions")]
    ProblemDisabled(i64),

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(i32),

    #[error("Failed to look up problem: {0:#}")]
    Lookup(#[source] anyhow::Error),

    #[error("Failed to persist submission: {0:#}")]
    Persist(#[source] anyhow::Error),

    /// The record is stored but no worker was told about it
    #[error("Submission {id} stored but not queued: {source:#}")]
    Publish {
        id: String,
        #[source]
        source: anyhow::Error,
    },
}

pub struct SubmissionIntake {
    problems: Arc<dyn ProblemStore>,
    submissions: Arc<dyn SubmissionStore>,
    queue: Arc<dyn JobQueue>,
    languages: Arc<LanguageTable>,
}

impl SubmissionIntake {
    pub fn new(
        problems: Arc<dyn ProblemStore>,
        submissions: Arc<dyn SubmissionStore>,
        queue: Arc<dyn JobQueue>,
        languages: Arc<LanguageTable>,
    ) -> Self {
        Self {
            problems,
            submissions,
            queue,
            languages,
        }
    }

    pub async fn submit(&self, payload: CommitPayload) -> Result<Submission, IntakeError> {
        if self.languages.get(payload.language).is_none() {
            return Err(IntakeError::UnsupportedLanguage(payload.language));
        }

        let problem = self
            .problems
            .get_problem(payload.problem_id)
            .await
            .map_err(IntakeError::Lookup)?
            .ok_or(IntakeError::ProblemNotFound(payload.problem_id))?;
        if !problem.enabled {
            return Err(IntakeError::ProblemDisabled(problem.id));
        }

        let id = Uuid::new_v4().simple().to_string();
        let submit_time = payload
            .submit_time
            .unwrap_or_else(|| Utc::now().timestamp_millis());
        let submission = Submission::queued(id, &payload, submit_time);

        self.submissions
            .insert_queued(&submission)
            .await
            .map_err(IntakeError::Persist)?;

        if let Err(source) = self.queue.publish(&submission).await {
            error!(submission_id = %submission.id, "Publish failed after persist: {:#}", source);
            return Err(IntakeError::Publish {
                id: submission.id,
                source,
            });
        }

        info!(
            submission_id = %submission.id,
            user_id = submission.user_id,
            problem_id = submission.problem_id,
            "Submission queued"
        );
        Ok(submission)
    }
}
