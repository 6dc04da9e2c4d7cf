//! Cloud OJ judge worker
//!
//! Submissions enter through `intake::SubmissionIntake`, travel over a
//! `queue::JobQueue`, and are judged by `pool::JudgeWorkerPool`:
//! compile in a disposable container, run through the sandbox daemon,
//! then persist the result and update the ranking.

pub mod compiler;
pub mod config;
pub mod core;
pub mod intake;
pub mod judger;
pub mod languages;
pub mod pool;
pub mod queue;
pub mod ranking;
pub mod redis_manager;
pub mod sandbox;
pub mod storage;
