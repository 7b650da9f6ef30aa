use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use broker::{BrokerFacade, GatewayTransport, SimTransport};
use common::{BrokerAdapter, BrokerKind, Config, EvaluatorClient};
use market::{BarCache, BarStore, CacheConfig, DataApiClient};
use orchestrator::{HttpEvaluatorClient, Orchestrator, OrchestratorConfig};
use store::SqliteStrategyStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(broker = %cfg.broker, user_id = %cfg.user_id, "maestro starting");

    // ── Database ──────────────────────────────────────────────────────────────
    let db = SqlitePool::connect(&cfg.database_url)
        .await
        .context("failed to connect to database")?;
    sqlx::migrate!("../../migrations")
        .run(&db)
        .await
        .context("database migration failed")?;
    info!("database ready");

    // ── Market data ───────────────────────────────────────────────────────────
    let upstream = Arc::new(DataApiClient::new(&cfg.data_base_url, &cfg.data_api_key));
    let cache = Arc::new(BarCache::new(
        BarStore::new(db.clone()),
        upstream,
        CacheConfig::default(),
    ));

    // ── Broker (selected by config) ───────────────────────────────────────────
    let broker: Arc<dyn BrokerAdapter> = match cfg.broker {
        BrokerKind::Gateway => {
            info!("gateway broker selected");
            Arc::new(BrokerFacade::new(GatewayTransport::new(
                &cfg.gateway_base_url,
                &cfg.gateway_api_key,
                &cfg.gateway_api_secret,
            )))
        }
        BrokerKind::Sim => {
            info!("simulated broker selected; no order leaves this process");
            Arc::new(BrokerFacade::new(SimTransport::new(100_000.0)))
        }
    };

    // ── Strategy repository ───────────────────────────────────────────────────
    let repository = Arc::new(SqliteStrategyStore::new(db));

    // ── Evaluator (optional) ──────────────────────────────────────────────────
    let evaluator: Option<Arc<dyn EvaluatorClient>> = cfg
        .evaluator_url
        .as_deref()
        .map(|url| Arc::new(HttpEvaluatorClient::new(url)) as Arc<dyn EvaluatorClient>);

    // ── Orchestrator ──────────────────────────────────────────────────────────
    let orch_cfg = OrchestratorConfig {
        user_id: cfg.user_id.clone(),
        poll_interval: Duration::from_secs(cfg.poll_interval_secs),
        evaluation_interval: Duration::from_secs(cfg.evaluation_interval_secs),
        max_concurrent_strategies: cfg.max_concurrent_strategies,
        env: cfg.execution_env(),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(repository, cache, broker, evaluator, orch_cfg);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx));

    // ── Shutdown ──────────────────────────────────────────────────────────────
    info!("all subsystems started; waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received; draining");
    let _ = shutdown_tx.send(true);
    let _ = orchestrator_task.await;
    info!("maestro stopped");
    Ok(())
}
