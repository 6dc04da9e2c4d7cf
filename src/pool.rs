//! Judge worker pool
//!
//! A fixed set of slots, each pinned to its own CPU core for the lifetime of
//! the pool. Every slot pulls one job at a time and drives it through
//! compile, execute and aggregate. Whatever happens inside a job, the
//! completion callback, workspace removal and queue ack still run.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::compiler::CompilerOrchestrator;
use crate::config::{ConfigError, JudgeConfig};
use crate::core::{ResultKind, Submission, SubmissionState};
use crate::judger::ResultAggregator;
use crate::languages::LanguageTable;
use crate::queue::{Delivery, JobQueue};
use crate::ranking::RankingUpdater;
use crate::sandbox::SandboxClient;
use crate::storage::{ProblemStore, RankingStore, SubmissionStore};

/// Called once per finished job, on every path
pub type CompletionCallback = Arc<dyn Fn(&Submission) + Send + Sync>;

/// Delay before a slot retries after a queue fault
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Storage and queue handles the pool works against
#[derive(Clone)]
pub struct Backends {
    pub problems: Arc<dyn ProblemStore>,
    pub submissions: Arc<dyn SubmissionStore>,
    pub ranking: Arc<dyn RankingStore>,
    pub queue: Arc<dyn JobQueue>,
}

pub struct JudgeWorkerPool {
    config: JudgeConfig,
    compiler: CompilerOrchestrator,
    sandbox: SandboxClient,
    aggregator: ResultAggregator,
    problems: Arc<dyn ProblemStore>,
    submissions: Arc<dyn SubmissionStore>,
    queue: Arc<dyn JobQueue>,
    /// Slot index to reserved core, fixed at construction
    cpus: Vec<usize>,
    on_complete: Option<CompletionCallback>,
}

impl JudgeWorkerPool {
    pub fn new(
        config: JudgeConfig,
        languages: Arc<LanguageTable>,
        backends: Backends,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cpus = config.cpus[..config.pool_size].to_vec();

        Ok(Self {
            compiler: CompilerOrchestrator::new(&config, languages.clone()),
            sandbox: SandboxClient::new(&config, languages),
            aggregator: ResultAggregator::new(
                backends.submissions.clone(),
                RankingUpdater::new(backends.ranking),
            ),
            problems: backends.problems,
            submissions: backends.submissions,
            queue: backends.queue,
            cpus,
            on_complete: None,
            config,
        })
    }

    pub fn with_completion_callback(mut self, callback: CompletionCallback) -> Self {
        self.on_complete = Some(callback);
        self
    }

    pub fn slots(&self) -> usize {
        self.cpus.len()
    }

    /// Core reserved for `slot`
    pub fn cpu_of(&self, slot: usize) -> Option<usize> {
        self.cpus.get(slot).copied()
    }

    /// Run every slot until `shutdown` turns true (or its sender is dropped).
    ///
    /// A slot only stops between pops. A pop in flight is allowed to finish,
    /// so a job already moved off the queue is judged and acked.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut slots = JoinSet::new();
        for slot in 0..self.slots() {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            slots.spawn(async move { pool.slot_loop(slot, shutdown).await });
        }
        info!("Judge pool started with {} slot(s), cpus {:?}", self.slots(), self.cpus);

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!("Judge slot terminated abnormally: {}", e);
            }
        }
        info!("Judge pool stopped");
    }

    async fn slot_loop(&self, slot: usize, shutdown: watch::Receiver<bool>) {
        debug!(slot, "Slot waiting for jobs");
        loop {
            // Pops are bounded by `queue_poll`, which bounds shutdown latency.
            let stopping = *shutdown.borrow();
            if stopping || shutdown.has_changed().is_err() {
                break;
            }

            match self.queue.pop(self.config.queue_poll).await {
                Ok(Some(delivery)) => self.process(slot, delivery).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(slot, "Queue pop failed: {:#}. Retrying...", e);
                    tokio::time::sleep(QUEUE_RETRY_DELAY).await;
                }
            }
        }
        debug!(slot, "Slot stopped");
    }

    /// Drive one delivered job to a terminal state on `slot`.
    pub async fn process(&self, slot: usize, delivery: Delivery) {
        let mut submission = delivery.submission.clone();

        // At-least-once delivery: a redelivered, already judged job is dropped.
        match self.submissions.get_state(&submission.id).await {
            Ok(Some(SubmissionState::Judged)) => {
                info!(submission_id = %submission.id, "Already judged, skipping redelivery");
                self.ack(&delivery).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(submission_id = %submission.id, "Cannot read stored state: {:#}", e);
            }
        }

        info!(
            submission_id = %submission.id,
            slot,
            language = submission.language,
            "Received judge job"
        );

        let judged = match self.cpu_of(slot) {
            Some(cpu) => AssertUnwindSafe(self.judge(&mut submission, cpu))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic.as_ref())))),
            None => Err(anyhow::anyhow!("No CPU reserved for slot {}", slot)),
        };

        if let Err(e) = judged {
            self.force_internal_error(&mut submission, format!("{:#}", e))
                .await;
        }

        if let Some(callback) = &self.on_complete {
            callback(&submission);
        }
        if self.config.auto_clean {
            self.remove_workspace(&submission.id).await;
        }
        self.ack(&delivery).await;
    }

    async fn judge(&self, submission: &mut Submission, cpu: usize) -> Result<()> {
        let compiled = self.compiler.compile(submission).await;
        if !compiled.is_success() {
            return self
                .aggregator
                .apply_compile_error(submission, &compiled)
                .await;
        }

        let problem = self
            .problems
            .get_problem(submission.problem_id)
            .await
            .context("Problem lookup failed")?
            .with_context(|| format!("Problem {} not found", submission.problem_id))?;

        submission.advance(SubmissionState::Running);
        self.submissions
            .update_state(&submission.id, SubmissionState::Running)
            .await
            .context("Failed to mark submission running")?;

        let test_data = self.config.test_data(problem.id);
        let outcome = self
            .sandbox
            .execute(submission, &problem, &test_data, cpu)
            .await;

        self.aggregator.apply(submission, &outcome, &problem).await?;
        Ok(())
    }

    /// Last resort: persist IE directly, bypassing aggregation.
    async fn force_internal_error(&self, submission: &mut Submission, message: String) {
        error!(submission_id = %submission.id, error = %message, "Judge job failed");
        submission.end_with_error(ResultKind::InternalError, message);
        if let Err(e) = self.submissions.update_with_result(submission).await {
            error!(
                submission_id = %submission.id,
                "Failed to persist internal error: {:#}", e
            );
        }
    }

    async fn remove_workspace(&self, submission_id: &str) {
        let workspace = self.config.workspace(submission_id);
        match tokio::fs::remove_dir_all(&workspace).await {
            Ok(()) => debug!(submission_id, "Workspace removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                submission_id,
                "Failed to remove workspace {}: {}",
                workspace.display(),
                e
            ),
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            warn!(submission_id = %delivery.submission.id, "Ack failed: {:#}", e);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("Judge panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("Judge panicked: {}", message)
    } else {
        "Judge panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CommitPayload, Problem};
    use crate::queue::MemoryQueue;
    use crate::storage::MemoryStore;
    use std::path::Path;
    use crate::ranking::RankingKey;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;
    use tokio::sync::{mpsc, Notify};

    struct Harness {
        _dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
        queue: Arc<MemoryQueue>,
        pool: Arc<JudgeWorkerPool>,
        completed: Arc<AtomicUsize>,
        config: JudgeConfig,
    }

    fn harness(pool_size: usize, cpus: Vec<usize>) -> Harness {
        harness_with(
            pool_size,
            cpus,
            |store| store as Arc<dyn SubmissionStore>,
            |queue| queue as Arc<dyn JobQueue>,
        )
    }

    /// Harness whose pool sees the submission store and queue through wrappers
    fn harness_with(
        pool_size: usize,
        cpus: Vec<usize>,
        wrap_store: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn SubmissionStore>,
        wrap_queue: impl FnOnce(Arc<MemoryQueue>) -> Arc<dyn JobQueue>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = JudgeConfig {
            code_dir: dir.path().join("code"),
            file_dir: dir.path().join("files"),
            sandbox_socket: dir.path().join("judge.sock"),
            docker_bin: "/nonexistent/docker".into(),
            pool_size,
            cpus,
            queue_poll: Duration::from_millis(50),
            ..JudgeConfig::default()
        };

        let store = Arc::new(MemoryStore::new());
        store.insert_problem(Problem {
            id: 10,
            time_limit: 1000,
            memory_limit: 64,
            output_limit: 16,
            score: 100.0,
            enabled: true,
        });
        let queue = Arc::new(MemoryQueue::new());
        let backends = Backends {
            problems: store.clone(),
            submissions: wrap_store(store.clone()),
            ranking: store.clone(),
            queue: wrap_queue(queue.clone()),
        };

        let completed = Arc::new(AtomicUsize::new(0));
        let counter = completed.clone();
        let pool = JudgeWorkerPool::new(
            config.clone(),
            Arc::new(LanguageTable::builtin().unwrap()),
            backends,
        )
        .unwrap()
        .with_completion_callback(Arc::new(move |_: &Submission| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        Harness {
            _dir: dir,
            store,
            queue,
            pool: Arc::new(pool),
            completed,
            config,
        }
    }

    /// Records every intermediate state write on top of a `MemoryStore`
    struct StateLog {
        inner: Arc<MemoryStore>,
        writes: Arc<Mutex<Vec<SubmissionState>>>,
    }

    #[async_trait]
    impl SubmissionStore for StateLog {
        async fn insert_queued(&self, submission: &Submission) -> Result<()> {
            self.inner.insert_queued(submission).await
        }
        async fn get_state(&self, id: &str) -> Result<Option<SubmissionState>> {
            self.inner.get_state(id).await
        }
        async fn update_state(&self, id: &str, state: SubmissionState) -> Result<()> {
            self.writes.lock().unwrap().push(state);
            self.inner.update_state(id, state).await
        }
        async fn update_with_result(&self, submission: &Submission) -> Result<()> {
            self.inner.update_with_result(submission).await
        }
        async fn best_score(&self, key: &RankingKey) -> Result<Option<f64>> {
            self.inner.best_score(key).await
        }
    }

    fn logged_harness() -> (Harness, Arc<Mutex<Vec<SubmissionState>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        let log = writes.clone();
        let h = harness_with(
            1,
            vec![0],
            move |inner| Arc::new(StateLog { inner, writes: log }) as Arc<dyn SubmissionStore>,
            |queue| queue as Arc<dyn JobQueue>,
        );
        (h, writes)
    }

    /// Fake daemon answering every connection with `reply`, forwarding requests.
    fn fake_daemon(socket: &Path, reply: &'static [u8]) -> mpsc::UnboundedReceiver<String> {
        let listener = UnixListener::bind(socket).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let n = stream.read(&mut buf).await.unwrap();
                let _ = tx.send(String::from_utf8_lossy(&buf[..n]).into_owned());
                stream.write_all(reply).await.unwrap();
            }
        });
        rx
    }

    /// Fake daemon reporting the stored state of `id` at the moment a request arrives
    fn state_daemon(
        socket: &Path,
        store: Arc<MemoryStore>,
        id: &'static str,
        reply: &'static [u8],
    ) -> mpsc::UnboundedReceiver<Option<SubmissionState>> {
        let listener = UnixListener::bind(socket).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                stream.read(&mut buf).await.unwrap();
                let _ = tx.send(store.get_state(id).await.unwrap());
                stream.write_all(reply).await.unwrap();
            }
        });
        rx
    }

    async fn enqueue(h: &Harness, id: &str, language: i32, problem_id: i64) -> Delivery {
        let payload = CommitPayload {
            user_id: 1,
            problem_id,
            contest_id: None,
            language,
            source_code: "print(input())".into(),
            submit_time: None,
        };
        let submission = Submission::queued(id, &payload, 1000);
        h.store.insert_queued(&submission).await.unwrap();
        h.queue.publish(&submission).await.unwrap();
        h.queue.pop(Duration::from_millis(10)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_process_accepted() {
        let h = harness(2, vec![4, 5]);
        let mut requests = fake_daemon(
            &h.config.sandbox_socket,
            br#"{"code":0,"passed":2,"total":2,"time":30,"memory":512}"#,
        );
        let delivery = enqueue(&h, "p1", 3, 10).await;

        h.pool.process(1, delivery).await;

        let stored = h.store.submission("p1").unwrap();
        assert_eq!(stored.state, SubmissionState::Judged);
        assert_eq!(stored.result, Some(ResultKind::Accepted));
        assert_eq!(stored.score, 100.0);
        assert!(requests.recv().await.unwrap().ends_with("--lang=3 --cpu=5"));

        assert_eq!(h.completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.unacked(), 0);
        assert!(!h.config.workspace("p1").exists());
    }

    #[tokio::test]
    async fn test_running_is_persisted_before_execution() {
        let (h, writes) = logged_harness();
        let mut seen = state_daemon(
            &h.config.sandbox_socket,
            h.store.clone(),
            "p6",
            br#"{"code":0,"passed":1,"total":1}"#,
        );
        let delivery = enqueue(&h, "p6", 3, 10).await;

        h.pool.process(0, delivery).await;

        assert_eq!(seen.recv().await.unwrap(), Some(SubmissionState::Running));
        assert_eq!(*writes.lock().unwrap(), vec![SubmissionState::Running]);
        let stored = h.store.submission("p6").unwrap();
        assert_eq!(stored.state, SubmissionState::Judged);
        assert_eq!(stored.result, Some(ResultKind::Accepted));
    }

    #[tokio::test]
    async fn test_compile_failure_skips_execution() {
        let (h, writes) = logged_harness();
        let delivery = enqueue(&h, "p2", 42, 10).await;

        h.pool.process(0, delivery).await;

        // Straight from QUEUED to JUDGED.
        assert!(writes.lock().unwrap().is_empty());
        let stored = h.store.submission("p2").unwrap();
        assert_eq!(stored.state, SubmissionState::Judged);
        assert_eq!(stored.result, Some(ResultKind::CompileError));
        assert!(stored.error.as_deref().unwrap().contains("Unsupported language"));
        assert!(h.store.entry(&stored.ranking_key()).await.unwrap().is_none());
        assert_eq!(h.completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.unacked(), 0);
    }

    #[tokio::test]
    async fn test_missing_problem_forces_internal_error() {
        let h = harness(1, vec![0]);
        let delivery = enqueue(&h, "p3", 3, 999).await;

        h.pool.process(0, delivery).await;

        let stored = h.store.submission("p3").unwrap();
        assert_eq!(stored.state, SubmissionState::Judged);
        assert_eq!(stored.result, Some(ResultKind::InternalError));
        assert!(stored.error.unwrap().contains("Problem 999 not found"));
        assert_eq!(h.completed.load(Ordering::SeqCst), 1);
        assert!(!h.config.workspace("p3").exists());
    }

    #[tokio::test]
    async fn test_sandbox_down_is_internal_error() {
        let h = harness(1, vec![0]);
        let delivery = enqueue(&h, "p4", 3, 10).await;

        h.pool.process(0, delivery).await;

        let stored = h.store.submission("p4").unwrap();
        assert_eq!(stored.result, Some(ResultKind::InternalError));
        assert!(stored.error.unwrap().contains("Cannot connect"));
    }

    #[tokio::test]
    async fn test_redelivery_of_judged_job_is_skipped() {
        let h = harness(1, vec![0]);
        let delivery = enqueue(&h, "p5", 3, 10).await;
        let mut judged = delivery.submission.clone();
        judged.end_with_error(ResultKind::CompileError, "first run");
        h.store.update_with_result(&judged).await.unwrap();

        h.pool.process(0, delivery).await;

        let stored = h.store.submission("p5").unwrap();
        assert_eq!(stored.error.as_deref(), Some("first run"));
        assert_eq!(h.completed.load(Ordering::SeqCst), 0);
        assert_eq!(h.queue.unacked(), 0);
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let h = harness(2, vec![0, 1]);
        let _requests = fake_daemon(
            &h.config.sandbox_socket,
            br#"{"code":0,"passed":1,"total":2}"#,
        );
        for id in ["r1", "r2", "r3"] {
            let payload = CommitPayload {
                user_id: 1,
                problem_id: 10,
                contest_id: None,
                language: 3,
                source_code: "print(1)".into(),
                submit_time: None,
            };
            let submission = Submission::queued(id, &payload, 1);
            h.store.insert_queued(&submission).await.unwrap();
            h.queue.publish(&submission).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(h.pool.clone().run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.completed.load(Ordering::SeqCst) < 3 {
            assert!(tokio::time::Instant::now() < deadline, "jobs did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();

        for id in ["r1", "r2", "r3"] {
            let stored = h.store.submission(id).unwrap();
            assert_eq!(stored.result, Some(ResultKind::PartiallyAccepted));
        }
        assert!(h.queue.is_empty());
        assert_eq!(h.queue.unacked(), 0);
    }

    /// Takes the job off the inner queue, then lingers before returning it
    struct SlowQueue {
        inner: Arc<MemoryQueue>,
        taken: Arc<Notify>,
    }

    #[async_trait]
    impl JobQueue for SlowQueue {
        async fn publish(&self, submission: &Submission) -> Result<()> {
            self.inner.publish(submission).await
        }
        async fn pop(&self, timeout: Duration) -> Result<Option<Delivery>> {
            let delivery = self.inner.pop(timeout).await?;
            if delivery.is_some() {
                self.taken.notify_one();
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(delivery)
        }
        async fn ack(&self, delivery: &Delivery) -> Result<()> {
            self.inner.ack(delivery).await
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_pop_keeps_job() {
        let taken = Arc::new(Notify::new());
        let notify = taken.clone();
        let h = harness_with(
            1,
            vec![0],
            |store| store as Arc<dyn SubmissionStore>,
            move |inner| Arc::new(SlowQueue { inner, taken: notify }) as Arc<dyn JobQueue>,
        );
        let _requests = fake_daemon(
            &h.config.sandbox_socket,
            br#"{"code":0,"passed":2,"total":2}"#,
        );
        let payload = CommitPayload {
            user_id: 1,
            problem_id: 10,
            contest_id: None,
            language: 3,
            source_code: "print(1)".into(),
            submit_time: None,
        };
        let submission = Submission::queued("s1", &payload, 1);
        h.store.insert_queued(&submission).await.unwrap();
        h.queue.publish(&submission).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(h.pool.clone().run(rx));
        taken.notified().await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(h.completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.unacked(), 0);
        let stored = h.store.submission("s1").unwrap();
        assert_eq!(stored.result, Some(ResultKind::Accepted));
    }

    #[test]
    fn test_new_rejects_shared_cores() {
        let config = JudgeConfig {
            pool_size: 2,
            cpus: vec![3, 3],
            ..JudgeConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let backends = Backends {
            problems: store.clone(),
            submissions: store.clone(),
            ranking: store,
            queue: Arc::new(MemoryQueue::new()),
        };

        let result = JudgeWorkerPool::new(
            config,
            Arc::new(LanguageTable::builtin().unwrap()),
            backends,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateCpu(3))));
    }

    #[test]
    fn test_slot_core_table() {
        let h = harness(2, vec![6, 2, 9]);
        assert_eq!(h.pool.slots(), 2);
        assert_eq!(h.pool.cpu_of(0), Some(6));
        assert_eq!(h.pool.cpu_of(1), Some(2));
        assert_eq!(h.pool.cpu_of(2), None);
    }
}
