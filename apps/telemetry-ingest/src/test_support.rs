use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use uuid::Uuid;

use crate::auth::{CredentialCheck, CredentialValidator, Principal};
use crate::config::test_config;
use crate::queue::spool::{SpoolConfig, SpoolQueue};
use crate::readings::NormalizedReading;
use crate::state::AppState;
use crate::store::{ReadingStore, StoreError};

pub const TEST_API_KEY: &str = "test-gateway-key";

pub fn sample_reading(gateway_id: &str, node_id: &str) -> NormalizedReading {
    NormalizedReading {
        gateway_id: gateway_id.to_string(),
        node_id: node_id.to_string(),
        timestamp: Utc::now(),
        humidity: Some(61.5),
        moisture: Some(33.0),
        temperature: Some(19.25),
        battery_voltage: Some(3.9),
        measurements: None,
        submitted_by: Some(1),
    }
}

/// App state over a spool queue in a fresh temp dir and a pool that never connects unless
/// a handler actually queries. Keep the `TempDir` alive for the duration of the test.
pub fn test_state() -> (AppState, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(dir.path().to_path_buf());
    let db = crate::db::connect_lazy(&config.database_url, 1).expect("lazy pool");
    let queue = Arc::new(
        SpoolQueue::open(SpoolConfig::from_ingest(&config)).expect("spool queue"),
    );
    let state = AppState::new(config, db, queue, StaticCredentials::shared());
    (state, dir)
}

fn test_database_url() -> Option<String> {
    env::var("INGEST_TEST_DATABASE_URL")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Returns a pool whose connections all use a fresh schema, or `None` when no test
/// database is configured.
pub async fn setup_test_pool(label: &str) -> Result<Option<(PgPool, String)>> {
    let Some(database_url) = test_database_url() else {
        return Ok(None);
    };
    let schema = format!(
        "ingest_test_{label}_{}",
        Uuid::new_v4().simple().to_string().get(..8).unwrap_or("0")
    );

    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.clone();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&database_url)
        .await?;
    Ok(Some((pool, schema)))
}

pub async fn drop_test_schema(schema: &str) {
    let Some(database_url) = test_database_url() else {
        return;
    };
    let Ok(admin_pool) = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await
    else {
        return;
    };
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin_pool)
        .await;
}

/// Accepts exactly one key and reports everything else as unknown.
pub struct StaticCredentials {
    pub secret: String,
    pub principal: Principal,
}

impl StaticCredentials {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            secret: TEST_API_KEY.to_string(),
            principal: Principal {
                key_id: 1,
                user_id: 42,
                key_name: "test gateway".to_string(),
                expires_at: None,
            },
        })
    }
}

#[async_trait]
impl CredentialValidator for StaticCredentials {
    async fn validate_credential(&self, secret: &str) -> Result<CredentialCheck, sqlx::Error> {
        if secret == self.secret {
            Ok(CredentialCheck::Valid(self.principal.clone()))
        } else {
            Ok(CredentialCheck::NotFound)
        }
    }
}

pub enum FakeOutcome {
    Ok,
    Transient,
    Rejected,
    Panic,
}

/// In-memory store with scripted failures; keyed by job id like the real table.
pub struct FakeStore {
    rows: Mutex<HashMap<Uuid, (i64, NormalizedReading)>>,
    script: Mutex<Vec<FakeOutcome>>,
    next_id: AtomicI64,
    pub calls: AtomicI64,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    /// Outcomes are consumed in order; once exhausted every call succeeds.
    pub fn scripted(script: Vec<FakeOutcome>) -> Self {
        let mut script = script;
        script.reverse();
        Self {
            rows: Mutex::new(HashMap::new()),
            script: Mutex::new(script),
            next_id: AtomicI64::new(1),
            calls: AtomicI64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        self.rows
            .lock()
            .map(|rows| rows.contains_key(&job_id))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ReadingStore for FakeStore {
    async fn insert(&self, job_id: Uuid, reading: &NormalizedReading) -> Result<i64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop())
            .unwrap_or(FakeOutcome::Ok);
        match outcome {
            FakeOutcome::Ok => {}
            FakeOutcome::Transient => {
                return Err(StoreError::Transient("connection refused".to_string()))
            }
            FakeOutcome::Rejected => {
                return Err(StoreError::Rejected("invalid byte sequence".to_string()))
            }
            FakeOutcome::Panic => panic!("store exploded"),
        }
        let mut rows = self.rows.lock().expect("rows lock");
        if let Some((id, _)) = rows.get(&job_id) {
            return Ok(*id);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        rows.insert(job_id, (id, reading.clone()));
        Ok(id)
    }
}
