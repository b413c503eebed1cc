use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sensor_readings (
        id BIGSERIAL PRIMARY KEY,
        ingest_job_id UUID NOT NULL,
        submitted_by BIGINT NULL,
        gateway_id VARCHAR(50) NOT NULL,
        node_id VARCHAR(50) NOT NULL,
        ts TIMESTAMPTZ NOT NULL,
        humidity DOUBLE PRECISION NULL,
        moisture DOUBLE PRECISION NULL,
        temperature DOUBLE PRECISION NULL,
        battery_voltage DOUBLE PRECISION NULL,
        measurements JSONB NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS sensor_readings_ingest_job_id_key ON sensor_readings (ingest_job_id)",
    "CREATE INDEX IF NOT EXISTS sensor_readings_ts_idx ON sensor_readings (ts DESC, id DESC)",
    "CREATE INDEX IF NOT EXISTS sensor_readings_gateway_ts_idx ON sensor_readings (gateway_id, ts DESC)",
    "CREATE INDEX IF NOT EXISTS sensor_readings_node_ts_idx ON sensor_readings (node_id, ts DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS api_keys (
        id BIGSERIAL PRIMARY KEY,
        user_id BIGINT NOT NULL,
        name VARCHAR(100) NOT NULL,
        key_hash CHAR(64) NOT NULL UNIQUE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        expires_at TIMESTAMPTZ NULL,
        last_used_at TIMESTAMPTZ NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
];

/// Creates the readings and API key tables when they are missing. Safe to run on every start.
pub async fn ensure_schema(db: &PgPool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(db).await?;
    }
    Ok(())
}
