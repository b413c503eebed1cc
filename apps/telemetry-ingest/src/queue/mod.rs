pub mod postgres;
pub mod spool;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::{IngestConfig, QueueBackend};
use crate::readings::{DeadLetter, QueuedJob};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("queue I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("queue payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue payload is {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("job {0} is not held by this queue")]
    UnknownJob(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub backend: &'static str,
    pub pending: u64,
    pub leased: u64,
    pub dead_letters: u64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

/// Durable hand-off between the ingest gateway and the persistence workers.
///
/// A job returned by `dequeue` stays invisible to other consumers until it is acked,
/// nacked, dead-lettered or its lease runs out, after which it is delivered again.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns once the job is durable. Re-enqueuing a known job id is a no-op.
    async fn enqueue(&self, job: QueuedJob) -> Result<Uuid, QueueError>;

    /// Waits up to `wait` for a job whose `next_attempt_at` has passed. Every delivery,
    /// including one after a lapsed lease, increments the returned job's `attempts`.
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError>;

    async fn ack(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Releases the lease and schedules redelivery after `delay`, recording the attempt count.
    async fn nack(
        &self,
        job_id: Uuid,
        attempts: u32,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Moves the job to the dead-letter log and removes it from the live queue.
    async fn dead_letter(
        &self,
        job: &QueuedJob,
        attempts: u32,
        reason: &str,
    ) -> Result<(), QueueError>;

    /// Newest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn status(&self) -> Result<QueueStatus, QueueError>;
}

pub type SharedQueue = Arc<dyn JobQueue>;

pub async fn open_queue(config: &IngestConfig, db: &PgPool) -> Result<SharedQueue> {
    match config.queue_backend {
        QueueBackend::Spool => {
            let queue = spool::SpoolQueue::open(spool::SpoolConfig::from_ingest(config))
                .with_context(|| {
                    format!("failed to open spool queue at {}", config.spool_dir.display())
                })?;
            tracing::info!(dir = %config.spool_dir.display(), "spool queue ready");
            Ok(Arc::new(queue))
        }
        QueueBackend::Postgres => {
            let queue = postgres::PgJobQueue::new(
                db.clone(),
                Duration::from_secs(config.lease_seconds),
                Duration::from_millis(config.queue_poll_interval_ms),
            );
            queue
                .ensure_schema()
                .await
                .context("failed to prepare postgres queue tables")?;
            tracing::info!("postgres queue ready");
            Ok(Arc::new(queue))
        }
    }
}
