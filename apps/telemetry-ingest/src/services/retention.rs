use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::IngestConfig;
use crate::store::PgReadingStore;

/// Periodically deletes readings older than the configured age.
pub struct RetentionService {
    store: PgReadingStore,
    max_age: ChronoDuration,
    interval: Duration,
}

impl RetentionService {
    /// `None` when retention is disabled.
    pub fn maybe_new(store: PgReadingStore, config: &IngestConfig) -> Option<Self> {
        if config.retention_days == 0 {
            return None;
        }
        Some(Self {
            store,
            max_age: ChronoDuration::days(i64::from(config.retention_days)),
            interval: Duration::from_secs(config.retention_sweep_seconds),
        })
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = retention_cutoff(Utc::now(), self.max_age);
                        match self.store.purge_older_than(cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => tracing::info!(removed, cutoff = %cutoff, "purged expired readings"),
                            Err(err) => tracing::warn!("retention sweep failed: {err:#}"),
                        }
                    }
                }
            }
        });
    }
}

fn retention_cutoff(now: DateTime<Utc>, max_age: ChronoDuration) -> DateTime<Utc> {
    now - max_age
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db;
    use chrono::TimeZone;
    use std::path::PathBuf;

    #[test]
    fn cutoff_is_measured_back_from_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        assert_eq!(
            retention_cutoff(now, ChronoDuration::days(30)),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn zero_days_disables_retention() {
        let mut config = test_config(PathBuf::from("/tmp/spool"));
        let pool = db::connect_lazy(&config.database_url, 1).unwrap();
        assert!(RetentionService::maybe_new(PgReadingStore::new(pool.clone()), &config).is_none());
        config.retention_days = 7;
        assert!(RetentionService::maybe_new(PgReadingStore::new(pool), &config).is_some());
    }
}
