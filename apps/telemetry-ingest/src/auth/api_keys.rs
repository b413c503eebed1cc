use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::task::JoinHandle;

use super::{CredentialCheck, CredentialValidator, Principal};

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    user_id: i64,
    name: String,
    is_active: bool,
    expires_at: Option<DateTime<Utc>>,
}

pub fn api_key_hash(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn evaluate(row: ApiKeyRow, now: DateTime<Utc>) -> CredentialCheck {
    if !row.is_active {
        return CredentialCheck::Inactive;
    }
    if row.expires_at.is_some_and(|expires_at| expires_at <= now) {
        return CredentialCheck::Expired;
    }
    CredentialCheck::Valid(Principal {
        key_id: row.id,
        user_id: row.user_id,
        key_name: row.name,
        expires_at: row.expires_at,
    })
}

/// Records key usage off the request path; a failed update only costs the timestamp.
fn touch_last_used(db: PgPool, key_id: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(key_id)
            .bind(Utc::now())
            .execute(&db)
            .await
        {
            tracing::debug!(key_id, error = %err, "failed to record api key usage");
        }
    })
}

/// Looks keys up in the `api_keys` table by SHA-256 digest.
#[derive(Clone)]
pub struct PgCredentialValidator {
    db: PgPool,
}

impl PgCredentialValidator {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CredentialValidator for PgCredentialValidator {
    async fn validate_credential(&self, secret: &str) -> Result<CredentialCheck, sqlx::Error> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Ok(CredentialCheck::NotFound);
        }

        let row: Option<ApiKeyRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, name, is_active, expires_at
            FROM api_keys
            WHERE key_hash = $1
            LIMIT 1
            "#,
        )
        .bind(api_key_hash(secret))
        .fetch_optional(&self.db)
        .await?;

        let Some(row) = row else {
            return Ok(CredentialCheck::NotFound);
        };
        let key_id = row.id;
        let check = evaluate(row, Utc::now());

        if matches!(check, CredentialCheck::Valid(_)) {
            touch_last_used(self.db.clone(), key_id);
        }
        Ok(check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ensure_schema;
    use crate::test_support::{drop_test_schema, setup_test_pool};

    fn row(is_active: bool, expires_at: Option<DateTime<Utc>>) -> ApiKeyRow {
        ApiKeyRow {
            id: 5,
            user_id: 11,
            name: "north field".to_string(),
            is_active,
            expires_at,
        }
    }

    #[test]
    fn hash_is_lowercase_hex_sha256() {
        assert_eq!(
            api_key_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(api_key_hash(" abc "), api_key_hash("abc"));
    }

    #[test]
    fn inactive_and_expired_keys_are_refused() {
        let now = Utc::now();
        assert_eq!(evaluate(row(false, None), now), CredentialCheck::Inactive);
        assert_eq!(
            evaluate(row(true, Some(now - chrono::Duration::seconds(1))), now),
            CredentialCheck::Expired
        );
        let CredentialCheck::Valid(principal) =
            evaluate(row(true, Some(now + chrono::Duration::days(1))), now)
        else {
            panic!("expected a valid key");
        };
        assert_eq!(principal.user_id, 11);
        assert_eq!(principal.key_name, "north field");
    }

    #[tokio::test]
    async fn usage_update_failure_is_absorbed() {
        let pool = crate::db::connect_lazy("postgresql://postgres@127.0.0.1:1/telemetry", 1).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(15), touch_last_used(pool, 5))
            .await
            .expect("usage update never finished")
            .expect("usage update task panicked");
    }

    #[tokio::test]
    async fn looks_up_keys_by_digest() -> anyhow::Result<()> {
        let Some((pool, schema)) = setup_test_pool("api_keys").await? else {
            return Ok(());
        };
        ensure_schema(&pool).await?;
        sqlx::query("INSERT INTO api_keys (user_id, name, key_hash) VALUES ($1, $2, $3)")
            .bind(7_i64)
            .bind("gateway")
            .bind(api_key_hash("s3cret"))
            .execute(&pool)
            .await?;

        let validator = PgCredentialValidator::new(pool.clone());
        assert!(matches!(
            validator.validate_credential("s3cret").await?,
            CredentialCheck::Valid(Principal { user_id: 7, .. })
        ));
        assert_eq!(
            validator.validate_credential("wrong").await?,
            CredentialCheck::NotFound
        );
        let mut last_used: Option<DateTime<Utc>> = None;
        for _ in 0..50 {
            last_used = sqlx::query_scalar("SELECT last_used_at FROM api_keys WHERE user_id = 7")
                .fetch_one(&pool)
                .await?;
            if last_used.is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(last_used.is_some());

        drop_test_schema(&schema).await;
        Ok(())
    }
}
