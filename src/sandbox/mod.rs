//! Sandbox module - client for the external sandbox daemon
//!
//! The daemon owns isolation and resource enforcement. This module only:
//! - Encodes one execution request per submission
//! - Performs a single write/read exchange over a Unix socket
//! - Decodes the reply into an `ExecutionOutcome`
//!
//! Faults never escape `SandboxClient::execute`; they come back as IE.

pub mod protocol;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, error};

use crate::config::JudgeConfig;
use crate::core::{ExecutionOutcome, Problem, Submission};
use crate::languages::LanguageTable;

pub use protocol::{decode_response, SandboxRequest};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(i32),

    #[error("Invalid request value for {key}: {value:?}")]
    InvalidRequest { key: &'static str, value: String },

    #[error("Cannot connect to sandbox at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send request: {0}")]
    Write(#[source] std::io::Error),

    #[error("Failed to read response: {0}")]
    Read(#[source] std::io::Error),

    #[error("Response filled the {0} byte buffer and was truncated")]
    Truncated(usize),

    #[error("Malformed sandbox response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unknown sandbox status code {0}")]
    UnknownCode(i32),

    #[error("Sandbox did not answer within {0:?}")]
    Timeout(Duration),
}

pub struct SandboxClient {
    socket: PathBuf,
    code_dir: PathBuf,
    buffer_size: usize,
    timeout: Option<Duration>,
    languages: Arc<LanguageTable>,
}

impl SandboxClient {
    pub fn new(config: &JudgeConfig, languages: Arc<LanguageTable>) -> Self {
        Self {
            socket: config.sandbox_socket.clone(),
            code_dir: config.code_dir.clone(),
            buffer_size: config.sandbox_buffer_size,
            timeout: config.sandbox_timeout,
            languages,
        }
    }

    /// Run a compiled submission against the problem's test data on `cpu`.
    pub async fn execute(
        &self,
        submission: &Submission,
        problem: &Problem,
        test_data: &Path,
        cpu: usize,
    ) -> ExecutionOutcome {
        match self.try_execute(submission, problem, test_data, cpu).await {
            Ok(outcome) => {
                debug!(
                    submission_id = %submission.id,
                    cpu,
                    result = %outcome.result,
                    passed = outcome.passed,
                    total = outcome.total,
                    "Sandbox run finished"
                );
                outcome
            }
            Err(e) => {
                error!(submission_id = %submission.id, cpu, error = %e, "Sandbox execution failed");
                ExecutionOutcome::internal_error(e.to_string())
            }
        }
    }

    async fn try_execute(
        &self,
        submission: &Submission,
        problem: &Problem,
        test_data: &Path,
        cpu: usize,
    ) -> Result<ExecutionOutcome, SandboxError> {
        let lang = self
            .languages
            .get(submission.language)
            .ok_or(SandboxError::UnsupportedLanguage(submission.language))?;

        let workdir = self.code_dir.join(&submission.id);
        let request = SandboxRequest {
            run_command: &lang.run_command,
            time_limit: problem.time_limit,
            memory_limit: problem.memory_limit,
            output_limit: problem.output_limit,
            workdir: &workdir,
            data_dir: test_data,
            language: lang.language.id(),
            cpu,
        }
        .encode()?;

        let raw = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(&request))
                .await
                .map_err(|_| SandboxError::Timeout(limit))??,
            None => self.exchange(&request).await?,
        };

        decode_response(&raw)
    }

    /// One request, one reply, one connection.
    async fn exchange(&self, request: &str) -> Result<Vec<u8>, SandboxError> {
        let mut stream =
            UnixStream::connect(&self.socket)
                .await
                .map_err(|source| SandboxError::Connect {
                    path: self.socket.clone(),
                    source,
                })?;

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(SandboxError::Write)?;

        let mut buf = vec![0u8; self.buffer_size];
        let n = stream.read(&mut buf).await.map_err(SandboxError::Read)?;
        if n == buf.len() {
            return Err(SandboxError::Truncated(n));
        }
        buf.truncate(n);
        Ok(buf)
    }
}
