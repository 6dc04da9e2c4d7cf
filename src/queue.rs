//! Job queue contract
//!
//! Delivery is at-least-once: a popped job stays recoverable until `ack`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::core::Submission;

/// A job taken off the queue, with the raw payload needed to acknowledge it
#[derive(Debug, Clone)]
pub struct Delivery {
    pub submission: Submission,
    pub receipt: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, submission: &Submission) -> Result<()>;

    /// Wait up to `timeout` for the next job.
    async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>>;

    /// Forget a delivered job for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

/// In-process FIFO queue
#[derive(Default)]
pub struct MemoryQueue {
    pending: Mutex<VecDeque<String>>,
    in_flight: Mutex<Vec<String>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn in_flight(&self) -> MutexGuard<'_, Vec<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Popped but not yet acknowledged
    pub fn unacked(&self) -> usize {
        self.in_flight().len()
    }

    fn try_pop(&self) -> Option<String> {
        let payload = self.pending().pop_front()?;
        self.in_flight().push(payload.clone());
        Some(payload)
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn publish(&self, submission: &Submission) -> Result<()> {
        let payload = serde_json::to_string(submission)?;
        self.pending().push_back(payload);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(payload) = self.try_pop() {
                let submission = serde_json::from_str(&payload)?;
                return Ok(Some(Delivery {
                    submission,
                    receipt: payload,
                }));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut in_flight = self.in_flight();
        if let Some(pos) = in_flight.iter().position(|p| *p == delivery.receipt) {
            in_flight.remove(pos);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CommitPayload;

    fn submission(id: &str) -> Submission {
        let payload = CommitPayload {
            user_id: 1,
            problem_id: 1,
            contest_id: None,
            language: 3,
            source_code: String::new(),
            submit_time: None,
        };
        Submission::queued(id, &payload, 0)
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = MemoryQueue::new();
        queue.publish(&submission("a")).await.unwrap();
        queue.publish(&submission("b")).await.unwrap();

        let first = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.submission.id, "a");
        assert_eq!(queue.unacked(), 1);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.unacked(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_pop_times_out() {
        let queue = MemoryQueue::new();
        let popped = queue.pop(Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_publish() {
        let queue = std::sync::Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.publish(&submission("late")).await.unwrap();

        let delivery = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.submission.id, "late");
    }
}
