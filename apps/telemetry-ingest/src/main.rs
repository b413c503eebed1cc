use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use telemetry_ingest::auth::{CachedCredentials, PgCredentialValidator};
use telemetry_ingest::services::retention::RetentionService;
use telemetry_ingest::services::workers::{WorkerPool, WorkerPoolConfig};
use telemetry_ingest::{cli, config, db, openapi, queue, routes, state, store};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_ingest=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

async fn bind_listener(addr: &str) -> Result<TcpListener> {
    match TcpListener::bind(addr).await {
        Ok(listener) => Ok(listener),
        Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Failed to bind telemetry-ingest listener on {addr}: port already in use. Stop the other service using this port or re-run with --port to choose another port.",
            );
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to bind telemetry-ingest listener on {addr}"))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    if args.print_openapi {
        println!(
            "{}",
            serde_json::to_string_pretty(&openapi::openapi_json())?
        );
        return Ok(());
    }

    init_tracing()?;

    let config = config::IngestConfig::from_env()?;
    let pool = db::connect_lazy(&config.database_url, config.db_pool_size)?;

    if let Err(err) = store::schema::ensure_schema(&pool).await {
        tracing::warn!("failed to ensure reading schema: {err:#}");
    }
    let queue = queue::open_queue(&config, &pool).await?;

    let credentials = Arc::new(CachedCredentials::new(
        Arc::new(PgCredentialValidator::new(pool.clone())),
        Duration::from_secs(config.credential_cache_seconds),
    ));
    let state = state::AppState::new(config.clone(), pool.clone(), queue.clone(), credentials);

    let cancel = CancellationToken::new();
    let workers = if args.no_workers {
        tracing::info!("persistence workers disabled for this process");
        None
    } else {
        let pool = WorkerPool::new(
            queue.clone(),
            Arc::new(state.readings.clone()),
            state.stats.clone(),
            WorkerPoolConfig::from_ingest(&config),
        );
        Some(pool.start(cancel.clone()))
    };
    if let Some(retention) = RetentionService::maybe_new(state.readings.clone(), &config) {
        retention.start(cancel.clone());
    }

    let app = routes::router(state);
    let addr = format!("{}:{}", args.host, args.port);
    let listener = bind_listener(&addr).await?;
    tracing::info!(bind = %addr, backend = ?config.queue_backend, workers = config.workers, "telemetry-ingest listening");

    let shutdown = cancel.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
            _ = shutdown.cancelled() => {}
        }
    })
    .await?;

    cancel.cancel();
    if let Some(workers) = workers {
        workers.wait_for_shutdown().await;
    }
    tracing::info!("telemetry-ingest stopped");
    Ok(())
}
