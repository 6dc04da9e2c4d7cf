//! Compiler module - Source code compilation
//!
//! Writes the submission into its own workspace and, for compiled languages,
//! runs the language's build command in a disposable container with no
//! network access. An empty error stream means success.
//!
//! Every fault (unsupported language, workspace I/O, container launch) comes
//! back as a failed `CompileOutcome`; nothing is propagated to the caller.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::JudgeConfig;
use crate::core::{CompileOutcome, Submission};
use crate::languages::{LanguageConfig, LanguageTable};

/// Mount point of the workspace inside the build container
const CONTAINER_WORKDIR: &str = "/tmp/code";

pub struct CompilerOrchestrator {
    languages: Arc<LanguageTable>,
    code_dir: PathBuf,
    runner_image: String,
    docker_bin: String,
    timeout: Option<Duration>,
}

impl CompilerOrchestrator {
    pub fn new(config: &JudgeConfig, languages: Arc<LanguageTable>) -> Self {
        Self {
            languages,
            code_dir: config.code_dir.clone(),
            runner_image: config.runner_image.clone(),
            docker_bin: config.docker_bin.clone(),
            timeout: config.compile_timeout,
        }
    }

    /// Compile a submission. Never fails; faults become a failed outcome.
    pub async fn compile(&self, submission: &Submission) -> CompileOutcome {
        let id = submission.id.as_str();

        let Some(lang) = self.languages.get(submission.language) else {
            warn!(submission_id = %id, language = submission.language, "Unsupported language");
            return CompileOutcome::failure(
                id,
                format!("Unsupported language: {}", submission.language),
            );
        };

        let workspace = match self.write_source(submission, lang).await {
            Ok(dir) => dir,
            Err(e) => {
                error!(submission_id = %id, error = %format!("{:#}", e), "Cannot prepare workspace");
                return CompileOutcome::failure(id, format!("Cannot write source: {:#}", e));
            }
        };

        let Some(compile_cmd) = &lang.compile_command else {
            debug!(submission_id = %id, language = %lang.language, "Interpreted language, skipping build");
            return CompileOutcome::success(id);
        };

        match self.run_build(id, &workspace, lang, compile_cmd).await {
            Ok(outcome) => {
                if outcome.is_success() {
                    debug!(submission_id = %id, "Compilation succeeded");
                } else {
                    info!(submission_id = %id, "Compilation failed");
                }
                outcome
            }
            Err(e) => {
                error!(submission_id = %id, error = %format!("{:#}", e), "Build container fault");
                CompileOutcome::failure(id, format!("{:#}", e))
            }
        }
    }

    /// Write the source into `<code_dir>/<submission id>/<source file>`.
    async fn write_source(&self, submission: &Submission, lang: &LanguageConfig) -> Result<PathBuf> {
        let workspace = self.code_dir.join(&submission.id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("Failed to create directory {}", workspace.display()))?;

        let source_path = workspace.join(&lang.source_file);
        tokio::fs::write(&source_path, &submission.source_code)
            .await
            .with_context(|| format!("Failed to write {}", source_path.display()))?;

        Ok(workspace)
    }

    async fn run_build(
        &self,
        submission_id: &str,
        workspace: &Path,
        lang: &LanguageConfig,
        compile_cmd: &[String],
    ) -> Result<CompileOutcome> {
        let image = lang.image.as_deref().unwrap_or(&self.runner_image);
        let name = container_name(submission_id);
        let args = build_args(&name, workspace, image, compile_cmd);

        debug!(submission_id, "Running build container: {} {:?}", self.docker_bin, args);

        let child = Command::new(&self.docker_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch {}", self.docker_bin))?;

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(output) => output,
                Err(_) => {
                    warn!(submission_id, "Build container timed out, removing {}", name);
                    self.remove_container(name);
                    return Ok(CompileOutcome::failure(
                        submission_id,
                        format!("Compilation timed out after {}s", limit.as_secs_f64()),
                    ));
                }
            },
            None => child.wait_with_output().await,
        }
        .context("Failed to wait for build container")?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim_end();

        if !stderr.is_empty() {
            return Ok(CompileOutcome::failure(submission_id, stderr));
        }
        // A non-zero exit without diagnostics still counts as built.
        if !output.status.success() {
            warn!(submission_id, status = %output.status, "Build exited non-zero without diagnostics");
        }
        Ok(CompileOutcome::success(submission_id))
    }

    /// Force-remove a build container left behind by a timeout.
    fn remove_container(&self, name: String) {
        let docker_bin = self.docker_bin.clone();
        tokio::spawn(async move {
            let result = Command::new(&docker_bin)
                .args(["rm", "-f", &name])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = result {
                warn!("Failed to remove container {}: {}", name, e);
            }
        });
    }
}

fn container_name(submission_id: &str) -> String {
    format!("oj-build-{}", submission_id)
}

/// Arguments for a disposable, network-less build container bound to the workspace
fn build_args(name: &str, workspace: &Path, image: &str, compile_cmd: &[String]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--network".to_string(),
        "none".to_string(),
        "-v".to_string(),
        format!("{}:{}", workspace.display(), CONTAINER_WORKDIR),
        "-w".to_string(),
        CONTAINER_WORKDIR.to_string(),
        image.to_string(),
    ];
    args.extend(compile_cmd.iter().cloned());
    args
}
