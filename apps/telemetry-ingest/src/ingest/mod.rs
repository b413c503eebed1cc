mod normalize;

pub use normalize::{normalize, parse_raw_reading, parse_timestamp, RawReading, ValidationError};

use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Principal;
use crate::queue::{QueueError, SharedQueue};
use crate::readings::QueuedJob;
use crate::services::stats::PipelineStats;

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 200;

/// Namespace for job ids derived from `Idempotency-Key` headers.
const IDEMPOTENCY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_8a3b_4b71_9e0d_5c2a_1f47_b3d8);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub job_id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("queue unavailable: {0}")]
    Unavailable(#[source] QueueError),
}

/// Validates readings and hands them to the durable queue. A reading counts as accepted
/// only once the queue has made it durable.
#[derive(Clone)]
pub struct IngestGateway {
    queue: SharedQueue,
    stats: Arc<PipelineStats>,
}

impl IngestGateway {
    pub fn new(queue: SharedQueue, stats: Arc<PipelineStats>) -> Self {
        Self { queue, stats }
    }

    pub async fn submit(
        &self,
        raw: RawReading,
        principal: &Principal,
        idempotency_key: Option<&str>,
    ) -> Result<Submission, SubmitError> {
        let now = Utc::now();
        let prepared = job_id_for(principal, idempotency_key)
            .and_then(|job_id| Ok((job_id, normalize(raw, Some(principal.user_id), now)?)));
        let (job_id, reading) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.stats.record_rejected();
                tracing::debug!(error = %err, key_id = principal.key_id, "rejected reading");
                return Err(err.into());
            }
        };

        let gateway_id = reading.gateway_id.clone();
        match self.queue.enqueue(QueuedJob::new(job_id, reading, now)).await {
            Ok(job_id) => {
                self.stats.record_accepted();
                tracing::debug!(job_id = %job_id, gateway_id = %gateway_id, "reading queued");
                Ok(Submission { job_id })
            }
            Err(QueueError::TooLarge { size, limit }) => {
                self.stats.record_rejected();
                Err(ValidationError::PayloadTooLarge { size, limit }.into())
            }
            Err(err) => {
                self.stats.record_enqueue_failure(err.to_string());
                tracing::error!(error = %err, gateway_id = %gateway_id, "enqueue failed");
                Err(SubmitError::Unavailable(err))
            }
        }
    }

    pub async fn submit_json(
        &self,
        body: &[u8],
        principal: &Principal,
        idempotency_key: Option<&str>,
    ) -> Result<Submission, SubmitError> {
        match parse_raw_reading(body) {
            Ok(raw) => self.submit(raw, principal, idempotency_key).await,
            Err(err) => {
                self.stats.record_rejected();
                Err(err.into())
            }
        }
    }
}

/// Random unless the caller supplied an idempotency key, in which case the id is stable
/// per API key and header value.
pub fn job_id_for(
    principal: &Principal,
    idempotency_key: Option<&str>,
) -> Result<Uuid, ValidationError> {
    let Some(key) = idempotency_key.map(str::trim).filter(|key| !key.is_empty()) else {
        return Ok(Uuid::new_v4());
    };
    if key.chars().count() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ValidationError::IdempotencyKeyTooLong(MAX_IDEMPOTENCY_KEY_LEN));
    }
    let name = format!("{}:{key}", principal.key_id);
    Ok(Uuid::new_v5(&IDEMPOTENCY_NAMESPACE, name.as_bytes()))
}
