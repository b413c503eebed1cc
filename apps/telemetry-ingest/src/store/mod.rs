mod codec;
mod postgres;
pub mod schema;

pub use codec::{decode_measurements, encode_measurements};
pub use postgres::PgReadingStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::readings::NormalizedReading;

pub const DEFAULT_QUERY_LIMIT: i64 = 100;
pub const MAX_QUERY_LIMIT: i64 = 1000;

/// Persistence failure, split by whether trying again can help.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Transient(String),
    #[error("reading rejected by storage: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        classify_db_error(err)
    }
}

/// Data exceptions (class 22) and integrity violations (class 23) will fail the same way
/// on every attempt. Everything else, including connection loss, pool exhaustion and
/// serialization failures, is worth retrying.
pub fn classify_db_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) => {
            let code = db.code();
            let class = code.as_deref().map(|code| &code[..code.len().min(2)]);
            match class {
                Some("22") | Some("23") => StoreError::Rejected(err.to_string()),
                _ => StoreError::Transient(err.to_string()),
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Rejected(err.to_string())
        }
        _ => StoreError::Transient(err.to_string()),
    }
}

/// Write side used by the persistence workers.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Stores the reading produced by `job_id` and returns its row id. Calling this again
    /// for the same job returns the existing id instead of inserting a duplicate.
    async fn insert(&self, job_id: Uuid, reading: &NormalizedReading) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadingQuery {
    pub gateway_id: Option<String>,
    pub node_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ReadingQuery {
    fn default() -> Self {
        Self {
            gateway_id: None,
            node_id: None,
            since: None,
            limit: DEFAULT_QUERY_LIMIT,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ReadingStats {
    pub total_readings: i64,
    pub total_gateways: i64,
    pub total_nodes: i64,
    pub latest_reading_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_transient() {
        assert!(classify_db_error(sqlx::Error::PoolTimedOut).is_transient());
        assert!(classify_db_error(sqlx::Error::PoolClosed).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(classify_db_error(sqlx::Error::Io(io)).is_transient());
    }

    #[test]
    fn decode_failures_are_terminal() {
        let err = sqlx::Error::Decode("bad jsonb".into());
        assert!(!classify_db_error(err).is_transient());
    }
}
