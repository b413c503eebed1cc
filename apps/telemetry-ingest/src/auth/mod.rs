pub(crate) mod api_keys;

pub use api_keys::{api_key_hash, PgCredentialValidator};

use async_trait::async_trait;
use axum::extract::{FromRef, FromRequestParts};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::error::AppError;

pub const API_KEY_HEADER: &str = "x-api-key";
const MISSING_CREDENTIAL: &str =
    "Authentication required. Provide X-API-Key header or Bearer token.";
const MAX_CACHED_KEYS: usize = 4096;

/// The identity behind a valid API key.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub key_id: i64,
    pub user_id: i64,
    pub key_name: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CredentialCheck {
    Valid(Principal),
    Inactive,
    Expired,
    NotFound,
}

#[async_trait]
pub trait CredentialValidator: Send + Sync {
    async fn validate_credential(&self, secret: &str) -> Result<CredentialCheck, sqlx::Error>;
}

pub type SharedCredentials = Arc<dyn CredentialValidator>;

struct CachedPrincipal {
    principal: Principal,
    cached_at: Instant,
}

/// Remembers valid keys for `ttl` so steady-state submissions skip the database.
///
/// Only `Valid` results are cached; a revoked key keeps working until its entry ages out.
pub struct CachedCredentials {
    inner: SharedCredentials,
    ttl: Duration,
    entries: RwLock<HashMap<String, CachedPrincipal>>,
}

impl CachedCredentials {
    pub fn new(inner: SharedCredentials, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn cached(&self, key: &str) -> Option<CredentialCheck> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        if entry.cached_at.elapsed() >= self.ttl {
            return None;
        }
        if entry
            .principal
            .expires_at
            .is_some_and(|expires_at| expires_at <= Utc::now())
        {
            return Some(CredentialCheck::Expired);
        }
        Some(CredentialCheck::Valid(entry.principal.clone()))
    }
}

#[async_trait]
impl CredentialValidator for CachedCredentials {
    async fn validate_credential(&self, secret: &str) -> Result<CredentialCheck, sqlx::Error> {
        if self.ttl.is_zero() {
            return self.inner.validate_credential(secret).await;
        }
        let key = api_key_hash(secret);
        if let Some(check) = self.cached(&key).await {
            return Ok(check);
        }

        let check = self.inner.validate_credential(secret).await?;
        let mut entries = self.entries.write().await;
        match &check {
            CredentialCheck::Valid(principal) => {
                entries.insert(
                    key,
                    CachedPrincipal {
                        principal: principal.clone(),
                        cached_at: Instant::now(),
                    },
                );
            }
            _ => {
                entries.remove(&key);
            }
        }
        if entries.len() > MAX_CACHED_KEYS {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        }
        Ok(check)
    }
}

/// `X-API-Key` wins over `Authorization: Bearer`; both carry the same kind of secret.
pub fn presented_secret(headers: &HeaderMap) -> Option<String> {
    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let bearer = || {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    api_key.or_else(bearer).map(str::to_string)
}

#[derive(Debug, Clone)]
pub struct GatewayAuth(pub Principal);

impl<S> FromRequestParts<S> for GatewayAuth
where
    SharedCredentials: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &S,
    ) -> impl Future<Output = Result<Self, Self::Rejection>> + Send {
        let credentials = <SharedCredentials as FromRef<S>>::from_ref(state);
        let secret = presented_secret(&parts.headers);

        async move {
            let secret = secret.ok_or_else(|| AppError::unauthorized(MISSING_CREDENTIAL))?;
            match credentials.validate_credential(&secret).await {
                Ok(CredentialCheck::Valid(principal)) => Ok(GatewayAuth(principal)),
                Ok(CredentialCheck::Inactive) => {
                    Err(AppError::unauthorized("API key is inactive"))
                }
                Ok(CredentialCheck::Expired) => Err(AppError::unauthorized("API key has expired")),
                Ok(CredentialCheck::NotFound) => Err(AppError::unauthorized("Invalid API key")),
                Err(err) => {
                    tracing::error!(error = %err, "credential lookup failed");
                    Err(AppError::unavailable("Credential store unavailable", 5))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingValidator {
        calls: AtomicUsize,
        result: CredentialCheck,
    }

    #[async_trait]
    impl CredentialValidator for CountingValidator {
        async fn validate_credential(&self, _secret: &str) -> Result<CredentialCheck, sqlx::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.result.clone())
        }
    }

    fn principal(expires_at: Option<DateTime<Utc>>) -> Principal {
        Principal {
            key_id: 3,
            user_id: 9,
            key_name: "field gateway".to_string(),
            expires_at,
        }
    }

    #[test]
    fn api_key_header_takes_precedence_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer token-b"));
        assert_eq!(presented_secret(&headers).as_deref(), Some("token-b"));

        headers.insert(API_KEY_HEADER, HeaderValue::from_static("  key-a "));
        assert_eq!(presented_secret(&headers).as_deref(), Some("key-a"));

        let mut blank = HeaderMap::new();
        blank.insert(API_KEY_HEADER, HeaderValue::from_static("   "));
        blank.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(presented_secret(&blank), None);
    }

    #[tokio::test]
    async fn valid_keys_are_served_from_cache() {
        let inner = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
            result: CredentialCheck::Valid(principal(None)),
        });
        let cache = CachedCredentials::new(inner.clone(), Duration::from_secs(60));

        for _ in 0..3 {
            let check = cache.validate_credential("secret").await.unwrap();
            assert_eq!(check, CredentialCheck::Valid(principal(None)));
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejections_are_not_cached() {
        let inner = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
            result: CredentialCheck::NotFound,
        });
        let cache = CachedCredentials::new(inner.clone(), Duration::from_secs(60));

        cache.validate_credential("nope").await.unwrap();
        cache.validate_credential("nope").await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cached_key_past_its_expiry_is_reported_expired() {
        let expires_at = Utc::now() + chrono::Duration::milliseconds(30);
        let inner = Arc::new(CountingValidator {
            calls: AtomicUsize::new(0),
            result: CredentialCheck::Valid(principal(Some(expires_at))),
        });
        let cache = CachedCredentials::new(inner.clone(), Duration::from_secs(60));

        assert!(matches!(
            cache.validate_credential("secret").await.unwrap(),
            CredentialCheck::Valid(_)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            cache.validate_credential("secret").await.unwrap(),
            CredentialCheck::Expired
        );
    }
}
