use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use common::{
    Bar, BrokerAdapter, EvalRequest, EvaluatorClient, ExecutionEnv, Recommendation, Result,
    StrategyRecord, StrategyStatus, StrategyStore, Timeframe,
};
use engine::StrategyEngine;
use market::{BarCache, GetBarsOptions};

use crate::evaluator::evaluate_or_keep;
use crate::instance::{InstanceHandle, InstanceMsg, InstanceSnapshot};
use crate::lock::SymbolLocks;
use crate::queue::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub user_id: String,
    pub poll_interval: Duration,
    pub fanout_interval: Duration,
    pub evaluation_interval: Duration,
    pub reconcile_interval: Duration,
    pub max_concurrent_strategies: usize,
    pub lock_timeout: Duration,
    pub shutdown_grace: Duration,
    pub env: ExecutionEnv,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            user_id: "default".to_string(),
            poll_interval: Duration::from_secs(30),
            fanout_interval: Duration::from_secs(5),
            evaluation_interval: Duration::from_secs(900),
            reconcile_interval: Duration::from_secs(60),
            max_concurrent_strategies: 16,
            lock_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(15),
            env: ExecutionEnv::default(),
        }
    }
}

type SeriesKey = (String, Timeframe);

/// The top-level long-running process: discovers strategy records, runs one
/// FSM instance per record, fans bars out, reconciles broker truth, and
/// consults the evaluator.
pub struct Orchestrator {
    store: Arc<dyn StrategyStore>,
    cache: Arc<BarCache>,
    broker: Arc<dyn BrokerAdapter>,
    evaluator: Option<Arc<dyn EvaluatorClient>>,
    locks: Arc<SymbolLocks>,
    retry: RetryPolicy,
    cfg: OrchestratorConfig,
    instances: HashMap<String, InstanceHandle>,
    subscribers: HashMap<SeriesKey, Vec<String>>,
    last_delivered: HashMap<SeriesKey, i64>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StrategyStore>,
        cache: Arc<BarCache>,
        broker: Arc<dyn BrokerAdapter>,
        evaluator: Option<Arc<dyn EvaluatorClient>>,
        cfg: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            broker,
            evaluator,
            locks: Arc::new(SymbolLocks::new()),
            retry: RetryPolicy::default(),
            cfg,
            instances: HashMap::new(),
            subscribers: HashMap::new(),
            last_delivered: HashMap::new(),
        }
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn is_running(&self, strategy_id: &str) -> bool {
        self.instances.contains_key(strategy_id)
    }

    pub async fn snapshot(&self, strategy_id: &str) -> Option<InstanceSnapshot> {
        self.instances.get(strategy_id)?.snapshot().await
    }

    /// Main loop. Returns once the shutdown signal fires and instances have
    /// drained.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(user_id = %self.cfg.user_id, "orchestrator starting");
        self.recover_active().await;

        let mut poll = tokio::time::interval(self.cfg.poll_interval);
        let mut fanout = tokio::time::interval(self.cfg.fanout_interval);
        let mut evaluation = tokio::time::interval(self.cfg.evaluation_interval);
        let mut reconcile = tokio::time::interval(self.cfg.reconcile_interval);

        loop {
            tokio::select! {
                _ = poll.tick() => self.discover_pending().await,
                _ = fanout.tick() => self.fan_out().await,
                _ = evaluation.tick() => self.evaluation_pass().await,
                _ = reconcile.tick() => self.reconcile_pass().await,
                _ = shutdown.changed() => {
                    info!("shutdown signal received; stopping intake");
                    break;
                }
            }
        }

        self.drain().await;
        info!("orchestrator stopped");
    }

    /// Startup recovery: re-adopt records already ACTIVE from a previous
    /// run.
    pub async fn recover_active(&mut self) {
        let records = match self.store.find_active(&self.cfg.user_id).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "failed to load active records at startup");
                return;
            }
        };
        for record in records {
            self.adopt(record, true).await;
        }
    }

    /// One discovery poll: pick up PENDING records until capacity.
    pub async fn discover_pending(&mut self) {
        let records = match self.store.find_pending(&self.cfg.user_id).await {
            Ok(records) => records,
            Err(e) => {
                error!(error = %e, "discovery poll failed");
                return;
            }
        };
        for record in records {
            if self.instances.contains_key(&record.id) {
                continue;
            }
            if self.instances.len() >= self.cfg.max_concurrent_strategies {
                info!(
                    pending = %record.id,
                    cap = self.cfg.max_concurrent_strategies,
                    "at capacity; record stays PENDING"
                );
                break;
            }
            self.adopt(record, false).await;
        }
    }

    /// Compile, warm up, activate and register one record. Failures mark
    /// the record FAILED with the diagnostic and never create an instance.
    async fn adopt(&mut self, record: StrategyRecord, already_active: bool) {
        let strategy_id = record.id.clone();
        match self.build_instance(&record).await {
            Ok((handle, warm_until)) => {
                if !already_active {
                    if let Err(e) = self.store.activate(&strategy_id).await {
                        error!(%strategy_id, error = %e, "activation failed; discarding instance");
                        handle.drain(self.cfg.shutdown_grace).await;
                        return;
                    }
                }
                let key = (handle.symbol.clone(), handle.timeframe);
                if let Some(ts) = warm_until {
                    let entry = self.last_delivered.entry(key.clone()).or_insert(ts);
                    *entry = (*entry).max(ts);
                }
                self.subscribers
                    .entry(key)
                    .or_default()
                    .push(strategy_id.clone());
                info!(
                    %strategy_id,
                    symbol = %handle.symbol,
                    timeframe = %handle.timeframe,
                    "strategy instance registered"
                );
                self.instances.insert(strategy_id, handle);
            }
            Err(e) => {
                error!(%strategy_id, error = %e, "adoption failed");
                if let Err(store_err) = self.store.mark_failed(&strategy_id, &e.to_string()).await
                {
                    error!(%strategy_id, error = %store_err, "could not mark record FAILED");
                }
            }
        }
    }

    /// Compile the document, build the engine, and replay the warm-up
    /// window. Returns the handle and the newest warmed bar timestamp.
    async fn build_instance(
        &self,
        record: &StrategyRecord,
    ) -> Result<(InstanceHandle, Option<i64>)> {
        let ir = Arc::new(compiler::compile(&record.yaml_content)?);
        let mut eng =
            StrategyEngine::new(Arc::clone(&ir), Arc::clone(&self.broker), self.cfg.env.clone())?;

        let window = engine::warmup_window(&ir);
        let mut warm_until = None;
        if window > 0 {
            let bars = self
                .cache
                .get_bars(
                    &ir.symbol,
                    ir.timeframe,
                    window,
                    GetBarsOptions {
                        detect_gaps: true,
                        backfill_gaps: true,
                        force_refresh: false,
                    },
                )
                .await?;
            engine::warm_up(&mut eng, &bars).await?;
            warm_until = bars.last().map(|b| b.timestamp_ms);
        }

        Ok((InstanceHandle::spawn(record.id.clone(), eng), warm_until))
    }

    /// One fan-out tick: for every series with subscribers, pull the latest
    /// bar and deliver it once, in order, to each interested instance.
    pub async fn fan_out(&mut self) {
        let keys: Vec<SeriesKey> = self.subscribers.keys().cloned().collect();
        for key in keys {
            let bar = match self.cache.latest_bar(&key.0, key.1).await {
                Ok(Some(bar)) => bar,
                Ok(None) => continue,
                Err(e) => {
                    warn!(symbol = %key.0, timeframe = %key.1, error = %e, "latest-bar fetch failed");
                    continue;
                }
            };
            let last = self.last_delivered.get(&key).copied().unwrap_or(i64::MIN);
            if bar.timestamp_ms <= last {
                continue;
            }
            self.deliver(&key, bar).await;
            self.last_delivered.insert(key, bar.timestamp_ms);
        }
    }

    async fn deliver(&self, key: &SeriesKey, bar: Bar) {
        let Some(ids) = self.subscribers.get(key) else {
            return;
        };
        for id in ids {
            if let Some(handle) = self.instances.get(id) {
                if !handle.send(InstanceMsg::Bar(bar)).await {
                    warn!(strategy_id = %id, "instance channel closed; bar dropped");
                }
            }
        }
    }

    /// Periodic broker reconciliation, serialized per symbol with the
    /// advisory lock. Broker truth replaces every local open-order set.
    pub async fn reconcile_pass(&mut self) {
        let mut symbols: Vec<String> = self
            .instances
            .values()
            .map(|h| h.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();

        for symbol in symbols {
            let _guard = match self.locks.acquire(&symbol, self.cfg.lock_timeout).await {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(%symbol, error = %e, "reconciliation skipped; lock unavailable");
                    continue;
                }
            };

            let broker = Arc::clone(&self.broker);
            let env = self.cfg.env.clone();
            let sym = symbol.clone();
            let orders = match retry_with_backoff(&self.retry, "get_open_orders", || {
                let broker = Arc::clone(&broker);
                let env = env.clone();
                let sym = sym.clone();
                async move { broker.get_open_orders(&sym, &env).await }
            })
            .await
            {
                Ok(orders) => orders,
                Err(e) => {
                    warn!(%symbol, error = %e, "reconciliation fetch failed");
                    continue;
                }
            };

            for handle in self.instances.values().filter(|h| h.symbol == symbol) {
                handle.send(InstanceMsg::Reconcile(orders.clone())).await;
            }
        }
    }

    /// Consult the evaluator for every live instance and act on its
    /// recommendation. Evaluator failures degrade to keep.
    pub async fn evaluation_pass(&mut self) {
        let Some(evaluator) = self.evaluator.clone() else {
            return;
        };

        let ids: Vec<String> = self.instances.keys().cloned().collect();
        for id in ids {
            let Some(handle) = self.instances.get(&id) else {
                continue;
            };
            let Some(snapshot) = handle.snapshot().await else {
                continue;
            };
            let request = EvalRequest {
                strategy_id: id.clone(),
                symbol: handle.symbol.clone(),
                timeframe: handle.timeframe.to_string(),
                state: snapshot.state.to_string(),
                position_size: snapshot.position_size,
                bars_processed: snapshot.bar_count,
            };

            let verdict = evaluate_or_keep(evaluator.as_ref(), &request).await;
            info!(
                strategy_id = %id,
                recommendation = ?verdict.recommendation,
                confidence = verdict.confidence,
                reason = %verdict.reason,
                "evaluation verdict"
            );
            match verdict.recommendation {
                Recommendation::Keep => {}
                Recommendation::Close => {
                    self.close_strategy(&id, &format!("advisor: {}", verdict.reason))
                        .await;
                }
                Recommendation::Swap => match verdict.suggested_strategy {
                    Some(yaml) => {
                        self.swap_strategy(&id, &yaml, &verdict.reason).await;
                    }
                    None => warn!(
                        strategy_id = %id,
                        "swap recommended without a suggested strategy; keeping"
                    ),
                },
            }
        }
    }

    /// Close one strategy: cancel its entries, stop its task, close the
    /// record. Takes the symbol lock.
    pub async fn close_strategy(&mut self, strategy_id: &str, reason: &str) {
        let Some(handle) = self.instances.remove(strategy_id) else {
            return;
        };
        let symbol = handle.symbol.clone();
        let guard = self.locks.acquire(&symbol, self.cfg.lock_timeout).await;
        if let Err(e) = &guard {
            warn!(strategy_id, error = %e, "closing without symbol lock");
        }

        handle.close(reason).await;
        self.unsubscribe(strategy_id);
        if let Err(e) = self.store.close(strategy_id, Some(reason)).await {
            error!(strategy_id, error = %e, "record close failed");
        }
        info!(strategy_id, %symbol, reason, "strategy closed");
    }

    /// Swap: cancel the old strategy, create the replacement record, and
    /// bring it live — all under the per-symbol lock.
    pub async fn swap_strategy(&mut self, strategy_id: &str, new_yaml: &str, reason: &str) {
        let Some(handle) = self.instances.remove(strategy_id) else {
            return;
        };
        let symbol = handle.symbol.clone();
        let timeframe = handle.timeframe;

        let _guard = match self.locks.acquire(&symbol, self.cfg.lock_timeout).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(strategy_id, error = %e, "swap aborted; lock unavailable");
                self.instances.insert(strategy_id.to_string(), handle);
                return;
            }
        };

        handle.close(&format!("swapped: {reason}")).await;
        self.unsubscribe(strategy_id);
        if let Err(e) = self
            .store
            .close(strategy_id, Some(&format!("swapped: {reason}")))
            .await
        {
            error!(strategy_id, error = %e, "record close failed during swap");
        }

        match self
            .store
            .create(
                &self.cfg.user_id,
                &symbol,
                timeframe,
                new_yaml,
                StrategyStatus::Pending,
            )
            .await
        {
            Ok(replacement) => {
                info!(
                    old = strategy_id,
                    new = %replacement.id,
                    symbol,
                    "swap replacement created"
                );
                self.adopt(replacement, false).await;
            }
            Err(e) => error!(strategy_id, error = %e, "failed to create swap replacement"),
        }
    }

    fn unsubscribe(&mut self, strategy_id: &str) {
        for ids in self.subscribers.values_mut() {
            ids.retain(|id| id != strategy_id);
        }
        self.subscribers.retain(|_, ids| !ids.is_empty());
    }

    /// Shutdown drain: stop intake, let in-flight bars settle, abandon
    /// anything that exceeds the grace window.
    async fn drain(&mut self) {
        let handles: Vec<InstanceHandle> = self
            .instances
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            handle.drain(self.cfg.shutdown_grace).await;
        }
    }
}
