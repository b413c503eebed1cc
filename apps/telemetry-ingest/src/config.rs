use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

const DEFAULT_SETUP_CONFIG_PATH: &str = "/etc/telemetry-ingest/config.json";
const DEFAULT_SPOOL_DIR: &str = "/var/lib/telemetry-ingest/spool";

fn setup_config_path() -> PathBuf {
    env_optional_string("INGEST_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    /// Journal files on local disk.
    Spool,
    /// Tables in the readings database.
    Postgres,
}

impl QueueBackend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "spool" | "file" | "local" => Some(Self::Spool),
            "postgres" | "postgresql" | "db" => Some(Self::Postgres),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    ingest_queue_backend: Option<String>,
    #[serde(default)]
    ingest_spool_dir: Option<String>,
    #[serde(default)]
    ingest_workers: Option<usize>,
    #[serde(default)]
    ingest_max_attempts: Option<u32>,
    #[serde(default)]
    ingest_retention_days: Option<u32>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path();
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

/// Setup-file values only fill in what the environment leaves unset.
fn apply_setup_overrides(config: &mut IngestConfig, overrides: &SetupConfigOverrides) {
    let env_allows = |key: &str| env_optional_string(key).is_none();

    if env_allows("INGEST_QUEUE_BACKEND") {
        if let Some(backend) = overrides
            .ingest_queue_backend
            .as_deref()
            .and_then(QueueBackend::parse)
        {
            config.queue_backend = backend;
        }
    }
    if env_allows("INGEST_SPOOL_DIR") {
        if let Some(dir) = overrides
            .ingest_spool_dir
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
        {
            config.spool_dir = PathBuf::from(dir);
        }
    }
    if env_allows("INGEST_WORKERS") {
        if let Some(workers) = overrides.ingest_workers.filter(|v| *v != 0) {
            config.workers = workers.min(MAX_WORKERS);
        }
    }
    if env_allows("INGEST_MAX_ATTEMPTS") {
        if let Some(attempts) = overrides.ingest_max_attempts.filter(|v| *v != 0) {
            config.max_attempts = attempts.min(MAX_ATTEMPTS);
        }
    }
    if env_allows("INGEST_RETENTION_DAYS") {
        if let Some(days) = overrides.ingest_retention_days {
            config.retention_days = days;
        }
    }
}

const MAX_WORKERS: usize = 64;
const MAX_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub database_url: String,
    pub db_pool_size: u32,
    pub queue_backend: QueueBackend,
    pub spool_dir: PathBuf,
    pub spool_compact_after: u64,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub dequeue_wait_ms: u64,
    pub lease_seconds: u64,
    pub queue_poll_interval_ms: u64,
    pub write_timeout_ms: u64,
    pub poll_jitter_ms: u64,
    pub credential_cache_seconds: u64,
    /// Zero keeps readings forever.
    pub retention_days: u32,
    pub retention_sweep_seconds: u64,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env_optional_string("INGEST_DATABASE_URL")
            .or_else(|| env_optional_string("DATABASE_URL"))
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("INGEST_DATABASE_URL or DATABASE_URL is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let queue_backend = match env_optional_string("INGEST_QUEUE_BACKEND") {
            Some(raw) => QueueBackend::parse(&raw).with_context(|| {
                format!("INGEST_QUEUE_BACKEND must be `spool` or `postgres` (got {raw:?})")
            })?,
            None => QueueBackend::Spool,
        };

        let mut config = Self {
            database_url,
            db_pool_size: env_u32("INGEST_DB_POOL_SIZE", 10).clamp(1, 200),
            queue_backend,
            spool_dir: PathBuf::from(env_string("INGEST_SPOOL_DIR", DEFAULT_SPOOL_DIR)),
            spool_compact_after: env_u64("INGEST_SPOOL_COMPACT_AFTER", 1000).max(1),
            workers: (env_u64("INGEST_WORKERS", 4) as usize).clamp(1, MAX_WORKERS),
            max_attempts: env_u32("INGEST_MAX_ATTEMPTS", 3).clamp(1, MAX_ATTEMPTS),
            retry_base_ms: env_u64("INGEST_RETRY_BASE_MS", 2000).clamp(10, 600_000),
            retry_max_ms: env_u64("INGEST_RETRY_MAX_MS", 60_000).clamp(10, 3_600_000),
            dequeue_wait_ms: env_u64("INGEST_DEQUEUE_WAIT_MS", 1000).clamp(10, 30_000),
            lease_seconds: env_u64("INGEST_LEASE_SECONDS", 60).clamp(5, 3600),
            queue_poll_interval_ms: env_u64("INGEST_QUEUE_POLL_MS", 250).clamp(5, 10_000),
            write_timeout_ms: env_u64("INGEST_WRITE_TIMEOUT_MS", 10_000).clamp(100, 300_000),
            poll_jitter_ms: env_u64("INGEST_POLL_JITTER_MS", 100).min(10_000),
            credential_cache_seconds: env_u64("INGEST_CREDENTIAL_CACHE_SECONDS", 60).min(3600),
            retention_days: env_u32("INGEST_RETENTION_DAYS", 0),
            retention_sweep_seconds: env_u64("INGEST_RETENTION_SWEEP_SECONDS", 3600)
                .clamp(60, 7 * 24 * 3600),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides);
        }
        config.validate()?;

        Ok(config)
    }

    fn validate(&mut self) -> Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("INGEST_DATABASE_URL resolved to an empty value");
        }
        if self.queue_backend == QueueBackend::Spool && !self.spool_dir.is_absolute() {
            anyhow::bail!("INGEST_SPOOL_DIR must be an absolute path");
        }
        if self.retry_max_ms < self.retry_base_ms {
            self.retry_max_ms = self.retry_base_ms;
        }
        // A job must not be handed to a second worker while the first is still writing.
        let write_timeout_secs = self.write_timeout_ms.div_ceil(1000);
        if self.lease_seconds <= write_timeout_secs {
            anyhow::bail!(
                "INGEST_LEASE_SECONDS ({}) must exceed the write timeout ({}s)",
                self.lease_seconds,
                write_timeout_secs
            );
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    env_optional_string(key).unwrap_or_else(|| default.to_string())
}

fn env_optional_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}

#[cfg(test)]
pub(crate) fn test_config(spool_dir: PathBuf) -> IngestConfig {
    IngestConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        db_pool_size: 2,
        queue_backend: QueueBackend::Spool,
        spool_dir,
        spool_compact_after: 1000,
        workers: 1,
        max_attempts: 3,
        retry_base_ms: 10,
        retry_max_ms: 40,
        dequeue_wait_ms: 20,
        lease_seconds: 30,
        queue_poll_interval_ms: 5,
        write_timeout_ms: 500,
        poll_jitter_ms: 0,
        credential_cache_seconds: 0,
        retention_days: 0,
        retention_sweep_seconds: 3600,
    }
}
