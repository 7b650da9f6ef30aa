use std::sync::Arc;

use tracing::{debug, info, warn};

use common::{Bar, BrokerAdapter, ExecutionEnv, Order, OrderSide, Result};
use compiler::expr::evaluate;
use compiler::features::{self, BoundFeature, FeatureCtx};
use compiler::{CompiledIr, FreezePoint, FsmState};

use crate::context::BarContext;
use crate::levels::{self, PlanLevels};
use crate::state::RuntimeState;

/// One FSM execution engine per live strategy.
///
/// Owns the compiled IR, a broker adapter reference, the broker-environment
/// config, and all runtime state. `process_bar` must never be in flight
/// twice for the same instance; the orchestrator serializes delivery.
pub struct StrategyEngine {
    ir: Arc<CompiledIr>,
    broker: Arc<dyn BrokerAdapter>,
    env: ExecutionEnv,
    features: Vec<BoundFeature>,
    pub state: RuntimeState,
    pub levels: Vec<PlanLevels>,
}

impl StrategyEngine {
    pub fn new(
        ir: Arc<CompiledIr>,
        broker: Arc<dyn BrokerAdapter>,
        env: ExecutionEnv,
    ) -> Result<Self> {
        let bound: Result<Vec<BoundFeature>> =
            ir.feature_plan.iter().map(features::bind).collect();
        let plan_levels = ir.order_plans.iter().map(PlanLevels::seed).collect();
        Ok(Self {
            state: RuntimeState::new(ir.initial_state),
            levels: plan_levels,
            features: bound?,
            broker,
            env,
            ir,
        })
    }

    pub fn ir(&self) -> &CompiledIr {
        &self.ir
    }

    pub(crate) fn ir_arc(&self) -> Arc<CompiledIr> {
        Arc::clone(&self.ir)
    }

    pub(crate) fn broker(&self) -> Arc<dyn BrokerAdapter> {
        Arc::clone(&self.broker)
    }

    pub fn env(&self) -> &ExecutionEnv {
        &self.env
    }

    pub fn fsm_state(&self) -> FsmState {
        self.state.state
    }

    pub fn symbol(&self) -> &str {
        &self.ir.symbol
    }

    /// Process one bar. In replay mode every side-effectful action is
    /// suppressed but features, timers and transitions still run.
    pub async fn process_bar(&mut self, bar: &Bar, replay: bool) -> Result<()> {
        // 1. Bookkeeping.
        self.state.bar_count += 1;
        self.state.push_bar(*bar);

        // 2. Broker truth sync when we believe nothing is open.
        if self.state.open_orders.is_empty() && !replay {
            if let Err(e) = self.sync_open_orders().await {
                warn!(symbol = %self.ir.symbol, error = %e, "broker sync failed; continuing bar");
            }
        }

        // 3. Features, along the topologically sorted plan.
        self.compute_features(bar);

        // 4. Dynamic plan levels, unless frozen.
        if !self.state.levels_frozen {
            self.refresh_levels();
        }

        // 5. Deferred freeze: configured freeze point already reached (e.g.
        //    re-load into ARMED) but levels only now materialized.
        self.apply_deferred_freeze();

        // 6. Timers.
        self.state.tick_timers();

        // 7. Transitions, in declaration order; at most one commits.
        self.evaluate_transitions(replay).await;

        // 8. Dwell counter.
        self.state.state_bar_count += 1;

        Ok(())
    }

    fn compute_features(&mut self, bar: &Bar) {
        let mut computed = std::collections::BTreeMap::new();
        for feature in &self.features {
            let ctx = FeatureCtx {
                bar,
                window: &self.state.bars,
                computed: &computed,
            };
            let value = match feature.compute(&ctx) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        symbol = %self.ir.symbol,
                        feature = %feature.name,
                        error = %e,
                        "feature compute failed; recording NaN"
                    );
                    f64::NAN
                }
            };
            computed.insert(feature.name.clone(), value);
        }
        for feature in &self.features {
            let value = computed.get(&feature.name).copied().unwrap_or(f64::NAN);
            self.state.record_feature(&feature.name, value);
        }
    }

    fn refresh_levels(&mut self) {
        let ir = Arc::clone(&self.ir);
        for (plan, plan_levels) in ir.order_plans.iter().zip(self.levels.iter_mut()) {
            let ctx = BarContext {
                state: &self.state,
                primary_levels: None,
            };
            for error in levels::refresh(plan_levels, plan, &ctx) {
                warn!(
                    symbol = %ir.symbol,
                    plan = %plan.id,
                    error = %error,
                    "dynamic level evaluation failed; keeping previous value"
                );
            }
        }
    }

    fn freeze_point_matches(&self, state: FsmState) -> bool {
        match self.ir.execution.freeze_levels_on {
            Some(FreezePoint::Armed) => state == FsmState::Armed,
            Some(FreezePoint::Triggered) => state == FsmState::Placed,
            None => false,
        }
    }

    fn levels_materialized(&self) -> bool {
        self.levels.iter().all(|l| l.materialized)
    }

    fn apply_deferred_freeze(&mut self) {
        if !self.state.levels_frozen
            && self.freeze_point_matches(self.state.state)
            && self.levels_materialized()
        {
            self.state.levels_frozen = true;
            self.state.log_line("plan levels frozen");
            info!(symbol = %self.ir.symbol, "plan levels frozen");
        }
    }

    async fn evaluate_transitions(&mut self, replay: bool) {
        let ir = Arc::clone(&self.ir);
        let current = self.state.state;

        for transition in ir.transitions.iter().filter(|t| t.from == current) {
            // Dwell gate: PLACED is sticky for one bar against anything but
            // entry confirmation.
            if transition.from == FsmState::Placed
                && transition.to != FsmState::Managing
                && self.state.state_bar_count < 1
            {
                continue;
            }

            let truthy = {
                let ctx = BarContext {
                    state: &self.state,
                    primary_levels: self.levels.first(),
                };
                match evaluate(&transition.when, &ctx) {
                    Ok(value) => value.truthy(),
                    Err(e) => {
                        warn!(
                            symbol = %ir.symbol,
                            label = %transition.label,
                            error = %e,
                            "predicate failed; treating as false"
                        );
                        false
                    }
                }
            };
            if !truthy {
                continue;
            }

            // Entry-confirmation gate: MANAGING requires broker-confirmed
            // evidence of the entry, so a silently failed submission can
            // never look like a fill.
            if transition.to == FsmState::Managing {
                if !replay {
                    match self.sync_open_orders().await {
                        Ok(()) => {}
                        Err(e) => {
                            warn!(
                                symbol = %ir.symbol,
                                error = %e,
                                "broker sync failed; MANAGING gate stays closed"
                            );
                            continue;
                        }
                    }
                }
                if self.state.open_orders.is_empty() && self.state.position_size == 0.0 {
                    debug!(
                        symbol = %ir.symbol,
                        "no live orders and flat; MANAGING gate blocks"
                    );
                    continue;
                }
            }

            self.commit(transition, replay).await;
            break;
        }
    }

    async fn commit(&mut self, transition: &compiler::StateTransition, replay: bool) {
        let from = self.state.state;
        self.state.state = transition.to;
        self.state.state_bar_count = 0;

        if transition.to == FsmState::Idle || transition.to == FsmState::Exited {
            self.state.clear_timers();
        }

        // Freeze on reaching the configured point, as part of the commit, so
        // the levels captured are the ones computed on the committing bar.
        if !self.state.levels_frozen
            && self.freeze_point_matches(transition.to)
            && self.levels_materialized()
        {
            self.state.levels_frozen = true;
            self.state.log_line("plan levels frozen");
        }

        info!(
            symbol = %self.ir.symbol,
            from = %from,
            to = %transition.to,
            label = %transition.label,
            replay,
            "transition committed"
        );
        self.state
            .log_line(format!("{from} -> {} ({})", transition.to, transition.label));

        for action in &transition.actions {
            if let Err(e) = self.dispatch(action, replay).await {
                warn!(
                    symbol = %self.ir.symbol,
                    label = %transition.label,
                    error = %e,
                    "action failed; aborting remaining actions of this transition"
                );
                self.state
                    .log_line(format!("action failed ({}): {e}", transition.label));
                break;
            }
        }
    }

    /// Pull open orders from the broker and replace the local set.
    pub(crate) async fn sync_open_orders(&mut self) -> Result<()> {
        let orders = self
            .broker
            .get_open_orders(&self.ir.symbol, &self.env)
            .await?;
        if orders.len() != self.state.open_orders.len() {
            debug!(
                symbol = %self.ir.symbol,
                local = self.state.open_orders.len(),
                broker = orders.len(),
                "open-order count changed on sync"
            );
        }
        self.state.open_orders = orders;
        Ok(())
    }

    /// Replace the local open-order set with broker truth obtained by the
    /// reconciliation loop. Returns whether anything changed.
    pub fn replace_open_orders(&mut self, orders: Vec<Order>) -> bool {
        let changed = orders.len() != self.state.open_orders.len()
            || orders
                .iter()
                .zip(&self.state.open_orders)
                .any(|(a, b)| a.id != b.id);
        if changed {
            info!(
                symbol = %self.ir.symbol,
                local = self.state.open_orders.len(),
                broker = orders.len(),
                "reconciliation replaced local open orders with broker truth"
            );
            self.state.log_line(format!(
                "reconciled open orders: {} -> {}",
                self.state.open_orders.len(),
                orders.len()
            ));
        }
        self.state.open_orders = orders;
        changed
    }

    /// External fill notification. Buys add to the signed position, sells
    /// subtract; zero crossings are logged as open/close events.
    pub fn update_position(&mut self, qty: f64, side: OrderSide) {
        let delta = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let old = self.state.position_size;
        let new = old + delta;
        self.state.position_size = new;

        if old == 0.0 && new != 0.0 {
            info!(symbol = %self.ir.symbol, size = new, "position opened");
            self.state.log_line(format!("position opened: {new}"));
        } else if old != 0.0 && new == 0.0 {
            info!(symbol = %self.ir.symbol, "position closed");
            self.state.log_line("position closed");
        } else if old != 0.0 && old.signum() != new.signum() {
            info!(symbol = %self.ir.symbol, from = old, to = new, "position flipped");
            self.state.log_line(format!("position flipped: {old} -> {new}"));
        }
    }

    /// Feed the daily realized-PnL tracker behind the loss-limit guard.
    pub fn record_realized_pnl(&mut self, pnl: f64) {
        self.state.daily_pnl += pnl;
    }
}
