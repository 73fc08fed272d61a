use std::sync::Arc;

use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::{error, info};

use pulse_indexer::block_writer::PostgresBlockWriter;
use pulse_indexer::config::AppConfig;
use pulse_indexer::metrics;
use pulse_indexer::orchestrator::{Orchestrator, OrchestratorConfig};
use pulse_indexer::rpc_client::AlloyRpcClient;
use pulse_indexer::telemetry::{self, TelemetryConfig};

fn build_pool(config: &AppConfig) -> Result<Pool, Box<dyn std::error::Error>> {
    let mut pool_config = PoolConfig::new();
    pool_config.host = Some(config.db_host.clone());
    pool_config.port = Some(config.db_port);
    pool_config.dbname = Some(config.db_name.clone());
    pool_config.user = Some(config.db_user.clone());
    pool_config.password = Some(config.db_password.clone());
    pool_config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pool_config.pool = Some(deadpool_postgres::PoolConfig::new(config.db_max_connections));

    Ok(pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match AppConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: configuration error: {e}");
            std::process::exit(1);
        }
    };

    telemetry::init_tracing(TelemetryConfig {
        log_level: config.log_level.clone(),
        log_format: config.log_format.clone(),
        log_file: config.log_file.clone(),
        rotation: "daily".to_string(),
    })?;

    if let Err(e) = metrics::init_metrics() {
        error!(error = %e, "failed to initialize metrics registry");
    }

    info!(chain_id = config.chain_id, rpc_url = %config.rpc_url, "starting indexer");

    let pool = match build_pool(&config) {
        Ok(pool) => pool,
        Err(e) => {
            eprintln!("FATAL: failed to build database pool: {e}");
            std::process::exit(1);
        }
    };

    // Startup health check: DB reachability (spec §7).
    {
        let client = pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
    }

    let rpc = match AlloyRpcClient::connect(
        &config.rpc_url,
        config.rpc_ws_url.as_deref(),
        config.chain_id,
        config.rpc_retries,
        config.rpc_timeout_ms,
    )
    .await
    {
        Ok(rpc) => Arc::new(rpc),
        Err(e) => {
            eprintln!("FATAL: failed to connect to RPC endpoint: {e}");
            std::process::exit(1);
        }
    };

    let writer = Arc::new(PostgresBlockWriter::new(pool));

    let orchestrator = Arc::new(Orchestrator::new(
        rpc,
        writer,
        OrchestratorConfig {
            start_block: config.indexer_start_block,
            batch_size: config.indexer_batch_size,
            parallel_batches: config.indexer_parallel_batches,
            block_delay_ms: config.indexer_block_delay_ms,
            enable_reorg_check: config.indexer_enable_reorg_check,
            rpc_retries: config.rpc_retries,
            poll_interval_ms: config.indexer_poll_interval_ms,
        },
    ));

    orchestrator.initialize().await?;

    let shutdown_orchestrator = orchestrator.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_orchestrator.stop().await;
    });

    orchestrator.start().await?;

    if let Ok(progress) = orchestrator.progress().await {
        info!(
            indexed = progress.indexed,
            last_block = ?progress.last_block,
            total_transactions = progress.total_transactions,
            progress_pct = %progress.progress_pct,
            "shutdown summary"
        );
    }

    Ok(())
}

/// Waits for SIGINT or SIGTERM. A second signal while already shutting down
/// is ignored by the orchestrator's own idempotent `stop()`.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
