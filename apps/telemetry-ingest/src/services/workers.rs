//! Persistence worker pool: dequeue, write, then ack / nack / dead-letter.

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use rand::Rng;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use super::retry::{RetryDecision, RetryPolicy};
use super::stats::PipelineStats;
use crate::config::IngestConfig;
use crate::queue::SharedQueue;
use crate::readings::QueuedJob;
use crate::store::ReadingStore;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub dequeue_wait: Duration,
    pub write_timeout: Duration,
    pub poll_jitter: Duration,
    pub error_backoff: Duration,
    pub retry: RetryPolicy,
}

impl WorkerPoolConfig {
    pub fn from_ingest(config: &IngestConfig) -> Self {
        Self {
            workers: config.workers,
            dequeue_wait: Duration::from_millis(config.dequeue_wait_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
            poll_jitter: Duration::from_millis(config.poll_jitter_ms),
            error_backoff: Duration::from_secs(1),
            retry: RetryPolicy {
                max_attempts: config.max_attempts,
                base_delay: Duration::from_millis(config.retry_base_ms),
                max_delay: Duration::from_millis(config.retry_max_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Persisted(i64),
    Retrying { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// The queue refused the ack / nack / dead-letter; the lease will lapse and redeliver.
    Unsettled,
}

#[derive(Clone)]
pub struct WorkerPool {
    queue: SharedQueue,
    store: Arc<dyn ReadingStore>,
    stats: Arc<PipelineStats>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        queue: SharedQueue,
        store: Arc<dyn ReadingStore>,
        stats: Arc<PipelineStats>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            store,
            stats,
            config,
        }
    }

    pub fn start(&self, cancel: CancellationToken) -> RunHandle {
        let mut handles = Vec::with_capacity(self.config.workers);
        for i in 1..=self.config.workers.max(1) {
            let name = format!("persistence-worker-{i}");
            tracing::info!(worker.name = %name, "starting worker");
            let worker = self.clone();
            let cancel = cancel.clone();
            let span = info_span!("worker", worker.name = %name);
            handles.push(tokio::spawn(
                async move { worker.run(cancel).await }.instrument(span),
            ));
        }
        RunHandle { handles }
    }

    fn jitter(&self) -> Duration {
        if self.config.poll_jitter.is_zero() {
            return Duration::ZERO;
        }
        let jitter_millis = u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_millis))
    }

    /// Runs until `cancel` fires. Cancellation is only observed between jobs.
    async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.queue.dequeue(self.config.dequeue_wait) => next,
            };
            match next {
                Ok(Some(job)) => {
                    self.process(job).await;
                }
                Ok(None) => {
                    let pause = self.jitter();
                    if !pause.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "dequeue failed");
                    self.stats.record_error(format!("dequeue failed: {err}"));
                    let pause = self.config.error_backoff + self.jitter();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(pause) => {}
                    }
                }
            }
        }
        tracing::info!("worker stopped");
    }

    /// Handles one leased job to completion.
    pub async fn process(&self, job: QueuedJob) -> JobOutcome {
        let span = info_span!("job", job.id = %job.job_id, job.attempt = job.attempts);
        self.process_inner(job).instrument(span).await
    }

    async fn process_inner(&self, job: QueuedJob) -> JobOutcome {
        if self.config.retry.budget_spent(job.attempts) {
            let attempts = job.attempts.saturating_sub(1);
            let reason = format!(
                "retries exhausted after {attempts} attempts: {}",
                job.last_error.as_deref().unwrap_or("no outcome recorded")
            );
            return self.settle_dead_letter(&job, attempts, reason).await;
        }

        let started = Instant::now();
        self.stats.begin_write();
        let write = AssertUnwindSafe(tokio::time::timeout(
            self.config.write_timeout,
            self.store.insert(job.job_id, &job.reading),
        ))
        .catch_unwind()
        .await;
        self.stats.end_write(started.elapsed());

        let (transient, message) = match write {
            Ok(Ok(Ok(reading_id))) => return self.settle_success(&job, reading_id).await,
            Ok(Ok(Err(err))) => (err.is_transient(), err.to_string()),
            Ok(Err(_elapsed)) => (
                true,
                format!(
                    "storage write timed out after {}ms",
                    self.config.write_timeout.as_millis()
                ),
            ),
            Err(panic) => (false, format!("worker panicked: {}", panic_message(&*panic))),
        };
        self.stats.record_error(message.clone());

        match self
            .config
            .retry
            .decide(job.attempts.saturating_sub(1), transient)
        {
            RetryDecision::Retry { attempts, delay } => {
                tracing::warn!(error = %message, attempts, delay_ms = delay.as_millis() as u64, "write failed; retrying");
                match self.queue.nack(job.job_id, attempts, delay, &message).await {
                    Ok(()) => {
                        self.stats.record_retry();
                        JobOutcome::Retrying { attempts }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "nack failed; job will be redelivered after its lease");
                        JobOutcome::Unsettled
                    }
                }
            }
            RetryDecision::DeadLetter {
                attempts,
                exhausted,
            } => {
                let reason = if exhausted {
                    format!("retries exhausted after {attempts} attempts: {message}")
                } else {
                    message
                };
                self.settle_dead_letter(&job, attempts, reason).await
            }
        }
    }

    async fn settle_dead_letter(&self, job: &QueuedJob, attempts: u32, reason: String) -> JobOutcome {
        tracing::error!(reason = %reason, attempts, "dead-lettering job");
        match self.queue.dead_letter(job, attempts, &reason).await {
            Ok(()) => {
                self.stats.record_dead_letter();
                JobOutcome::DeadLettered { attempts }
            }
            Err(err) => {
                tracing::error!(error = %err, "dead-letter failed; job will be redelivered after its lease");
                JobOutcome::Unsettled
            }
        }
    }

    async fn settle_success(&self, job: &QueuedJob, reading_id: i64) -> JobOutcome {
        let unix_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        self.stats.record_persisted(unix_ms);
        tracing::debug!(reading_id, "reading persisted");
        if let Err(err) = self.queue.ack(job.job_id).await {
            // The row exists; redelivery resolves to the same id.
            tracing::warn!(error = %err, reading_id, "ack failed after persisting");
            return JobOutcome::Unsettled;
        }
        self.stats.clear_error();
        JobOutcome::Persisted(reading_id)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[derive(Debug)]
pub struct RunHandle {
    handles: Vec<JoinHandle<()>>,
}

impl RunHandle {
    pub async fn wait_for_shutdown(self) {
        join_all(self.handles)
            .await
            .into_iter()
            .for_each(|result| {
                if let Err(error) = result {
                    tracing::warn!(%error, "persistence worker task panicked");
                }
            });
    }
}
