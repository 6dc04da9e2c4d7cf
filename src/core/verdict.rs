use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal result of judging a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "PA")]
    PartiallyAccepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "OLE")]
    OutputLimitExceeded,
    #[serde(rename = "CE")]
    CompileError,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "IE")]
    InternalError,
}

impl ResultKind {
    /// Result for a run that produced a pass rate but no explicit verdict.
    pub fn from_pass_rate(pass_rate: f64) -> Self {
        if pass_rate >= 1.0 {
            ResultKind::Accepted
        } else if pass_rate > 0.0 {
            ResultKind::PartiallyAccepted
        } else {
            ResultKind::WrongAnswer
        }
    }

    /// CE, RE and IE end a submission without a score.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            ResultKind::CompileError | ResultKind::RuntimeError | ResultKind::InternalError
        )
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResultKind::Accepted => "AC",
            ResultKind::PartiallyAccepted => "PA",
            ResultKind::WrongAnswer => "WA",
            ResultKind::TimeLimitExceeded => "TLE",
            ResultKind::MemoryLimitExceeded => "MLE",
            ResultKind::OutputLimitExceeded => "OLE",
            ResultKind::CompileError => "CE",
            ResultKind::RuntimeError => "RE",
            ResultKind::InternalError => "IE",
        };
        write!(f, "{}", s)
    }
}
