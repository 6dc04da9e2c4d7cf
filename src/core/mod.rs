pub mod outcome;
pub mod submission;
pub mod verdict;

pub use outcome::{CompileOutcome, ExecutionOutcome};
pub use submission::{CommitPayload, Problem, Submission, SubmissionState};
pub use verdict::ResultKind;
