use axum::extract::FromRef;
use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::SharedCredentials;
use crate::config::IngestConfig;
use crate::ingest::IngestGateway;
use crate::queue::SharedQueue;
use crate::services::stats::PipelineStats;
use crate::store::PgReadingStore;

#[derive(Clone)]
pub struct AppState {
    pub config: IngestConfig,
    pub readings: PgReadingStore,
    pub queue: SharedQueue,
    pub gateway: IngestGateway,
    pub credentials: SharedCredentials,
    pub stats: Arc<PipelineStats>,
}

impl AppState {
    pub fn new(
        config: IngestConfig,
        db: PgPool,
        queue: SharedQueue,
        credentials: SharedCredentials,
    ) -> Self {
        let stats = Arc::new(PipelineStats::new());
        Self {
            readings: PgReadingStore::new(db),
            gateway: IngestGateway::new(queue.clone(), stats.clone()),
            config,
            queue,
            credentials,
            stats,
        }
    }
}

impl FromRef<AppState> for SharedCredentials {
    fn from_ref(state: &AppState) -> SharedCredentials {
        state.credentials.clone()
    }
}
