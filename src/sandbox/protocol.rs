//! Sandbox daemon wire format
//!
//! Request: one line of space separated `--key=value` tokens, in this order:
//! `cmd`, `time`, `ram`, `output`, `workdir`, `data`, `lang`, `cpu`.
//! Response: one JSON object.

use std::path::Path;

use serde::Deserialize;

use super::SandboxError;
use crate::core::outcome::{EXEC_INTERNAL_FAILURE, EXEC_NORMAL, EXEC_RUNTIME_FAILURE};
use crate::core::{ExecutionOutcome, ResultKind};

/// One execution request
#[derive(Debug, Clone)]
pub struct SandboxRequest<'a> {
    /// Run token, `@` separating arguments
    pub run_command: &'a str,
    /// Milliseconds
    pub time_limit: u64,
    /// MB
    pub memory_limit: u64,
    /// MB
    pub output_limit: u64,
    pub workdir: &'a Path,
    pub data_dir: &'a Path,
    pub language: i32,
    pub cpu: usize,
}

impl SandboxRequest<'_> {
    /// Encode the request. Values must not contain whitespace, since the
    /// daemon splits tokens on spaces.
    pub fn encode(&self) -> Result<String, SandboxError> {
        let workdir = self.workdir.to_string_lossy();
        let data_dir = self.data_dir.to_string_lossy();

        for (key, value) in [
            ("cmd", self.run_command),
            ("workdir", workdir.as_ref()),
            ("data", data_dir.as_ref()),
        ] {
            if value.is_empty() || value.chars().any(char::is_whitespace) {
                return Err(SandboxError::InvalidRequest {
                    key,
                    value: value.to_string(),
                });
            }
        }

        Ok(format!(
            "--cmd={} --time={} --ram={} --output={} --workdir={} --data={} --lang={} --cpu={}",
            self.run_command,
            self.time_limit,
            self.memory_limit,
            self.output_limit,
            workdir,
            data_dir,
            self.language,
            self.cpu,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    code: i32,
    #[serde(default)]
    result: Option<ResultKind>,
    #[serde(default)]
    total: u32,
    #[serde(default)]
    passed: u32,
    #[serde(default)]
    pass_rate: Option<f64>,
    #[serde(default)]
    time: u64,
    #[serde(default)]
    memory: u64,
    #[serde(default)]
    error: Option<String>,
}

/// Decode a daemon response.
///
/// Code 1 becomes a runtime error and code 2 an internal error. Code 0 keeps
/// the reported result, or derives one from the pass rate when absent.
pub fn decode_response(raw: &[u8]) -> Result<ExecutionOutcome, SandboxError> {
    let wire: WireResponse = serde_json::from_slice(raw).map_err(SandboxError::Decode)?;

    let pass_rate = wire.pass_rate.unwrap_or_else(|| {
        if wire.total == 0 {
            f64::NAN
        } else {
            f64::from(wire.passed) / f64::from(wire.total)
        }
    });

    let result = match wire.code {
        EXEC_RUNTIME_FAILURE => ResultKind::RuntimeError,
        EXEC_INTERNAL_FAILURE => ResultKind::InternalError,
        EXEC_NORMAL => wire
            .result
            .unwrap_or_else(|| ResultKind::from_pass_rate(pass_rate)),
        other => return Err(SandboxError::UnknownCode(other)),
    };

    Ok(ExecutionOutcome {
        status: wire.code,
        result,
        total: wire.total,
        passed: wire.passed,
        pass_rate,
        time: wire.time,
        memory: wire.memory,
        message: wire.error.unwrap_or_default(),
    })
}
