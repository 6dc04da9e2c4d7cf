use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};

use cloud_judge::config::JudgeConfig;
use cloud_judge::core::Submission;
use cloud_judge::languages::LanguageTable;
use cloud_judge::pool::{Backends, JudgeWorkerPool};
use cloud_judge::redis_manager::RedisQueue;
use cloud_judge::storage::RedisStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cloud_judge=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = JudgeConfig::from_env().context("Invalid judge configuration")?;
    let languages = Arc::new(LanguageTable::builtin()?);
    info!("Loaded languages: {:?}", languages.supported());

    info!("Starting Judge Worker...");

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    let queue = Arc::new(RedisQueue::connect(&config.redis_url).await?);
    queue
        .requeue_stale()
        .await
        .context("Failed to recover unacknowledged jobs")?;

    info!(
        "Sandbox at {}, code dir {}, test data under {}",
        config.sandbox_socket.display(),
        config.code_dir.display(),
        config.file_dir.display()
    );

    let judged = Arc::new(AtomicU64::new(0));
    let counter = judged.clone();
    let backends = Backends {
        problems: store.clone(),
        submissions: store.clone(),
        ranking: store,
        queue: queue.clone(),
    };
    let pool = JudgeWorkerPool::new(config, languages, backends)?.with_completion_callback(
        Arc::new(move |submission: &Submission| {
            let total = counter.fetch_add(1, Ordering::Relaxed) + 1;
            info!(
                "Judge job completed: submission_id={}, result={:?}, judged so far={}",
                submission.id, submission.result, total
            );
        }),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown requested, finishing in-flight jobs...");
        let _ = shutdown_tx.send(true);
    });

    info!("Waiting for jobs...");
    Arc::new(pool).run(shutdown_rx).await;

    if let Err(e) = queue.release().await {
        warn!("{:#}", e);
    }

    info!(
        "Judge Worker stopped after {} job(s)",
        judged.load(Ordering::Relaxed)
    );
    Ok(())
}
