//! Worker-local outcomes of the compile and execute stages

use super::verdict::ResultKind;

/// Status value of a successful compilation
pub const COMPILE_OK: i32 = 0;
/// Status value of any failed compilation, including unsupported languages
pub const COMPILE_FAILED: i32 = -1;

/// Result of the compile stage
#[derive(Debug, Clone, PartialEq)]
pub struct CompileOutcome {
    pub submission_id: String,
    /// 0 on success, nonzero on failure
    pub status: i32,
    /// Empty on success
    pub message: String,
}

impl CompileOutcome {
    pub fn success(submission_id: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.into(),
            status: COMPILE_OK,
            message: String::new(),
        }
    }

    pub fn failure(submission_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            submission_id: submission_id.into(),
            status: COMPILE_FAILED,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == COMPILE_OK
    }
}

/// Sandbox status code: run finished normally
pub const EXEC_NORMAL: i32 = 0;
/// Sandbox status code: the user program failed at runtime
pub const EXEC_RUNTIME_FAILURE: i32 = 1;
/// Sandbox status code: the sandbox itself failed
pub const EXEC_INTERNAL_FAILURE: i32 = 2;

/// Result of the execute stage
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: i32,
    pub result: ResultKind,
    pub total: u32,
    pub passed: u32,
    /// 0.0 to 1.0; may be NaN when the sandbox reported no tests
    pub pass_rate: f64,
    /// Milliseconds
    pub time: u64,
    /// KB
    pub memory: u64,
    pub message: String,
}

impl ExecutionOutcome {
    /// Outcome for an infrastructure fault on the way to or from the sandbox.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: EXEC_INTERNAL_FAILURE,
            result: ResultKind::InternalError,
            total: 0,
            passed: 0,
            pass_rate: 0.0,
            time: 0,
            memory: 0,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.result,
            ResultKind::RuntimeError | ResultKind::InternalError
        )
    }
}
