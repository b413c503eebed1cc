use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Counters shared by the gateway and the workers. Reporting only; nothing reads them to
/// make decisions.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub enqueue_failures: AtomicU64,
    pub persisted: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub inflight_writes: AtomicU64,
    pub last_persist_unix_ms: AtomicU64,
    pub average_write_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, utoipa::ToSchema)]
pub struct PipelineCounters {
    pub accepted: u64,
    pub rejected: u64,
    pub enqueue_failures: u64,
    pub persisted: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub inflight_writes: u64,
    pub last_persist_unix_ms: Option<u64>,
    pub average_write_micros: u64,
    pub last_error: Option<String>,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue_failure(&self, err: impl Into<String>) {
        self.enqueue_failures.fetch_add(1, Ordering::Relaxed);
        self.record_error(err);
    }

    pub fn begin_write(&self) {
        self.inflight_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_write(&self, elapsed: Duration) {
        self.inflight_writes.fetch_sub(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let previous = self.average_write_micros.load(Ordering::Relaxed);
        let average = if previous == 0 {
            micros
        } else {
            (previous.saturating_mul(7).saturating_add(micros)) / 8
        };
        self.average_write_micros.store(average, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, unix_ms: u64) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
        self.last_persist_unix_ms.store(unix_ms, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn snapshot(&self) -> PipelineCounters {
        let last_persist = self.last_persist_unix_ms.load(Ordering::Relaxed);
        PipelineCounters {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            enqueue_failures: self.enqueue_failures.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            inflight_writes: self.inflight_writes.load(Ordering::Relaxed),
            last_persist_unix_ms: (last_persist != 0).then_some(last_persist),
            average_write_micros: self.average_write_micros.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}
