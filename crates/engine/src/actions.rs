use std::collections::HashSet;

use tracing::{debug, info, warn};

use common::{hours, Error, Result};
use compiler::ActionSpec;

use crate::engine::StrategyEngine;

impl StrategyEngine {
    /// Execute one transition action. Replay short-circuits everything with
    /// an observable effect outside the engine.
    pub(crate) async fn dispatch(&mut self, action: &ActionSpec, replay: bool) -> Result<()> {
        match action {
            ActionSpec::Noop => Ok(()),
            ActionSpec::Log { message } => {
                info!(symbol = %self.symbol(), "{message}");
                self.state.log_line(message.clone());
                Ok(())
            }
            ActionSpec::StartTimer { name, bars } => {
                self.state.start_timer(name, *bars);
                debug!(symbol = %self.symbol(), timer = %name, bars, "timer started");
                Ok(())
            }
            ActionSpec::CancelEntries => self.cancel_entries(replay).await,
            ActionSpec::SubmitOrderPlan { plan_id } => {
                self.submit_order_plan(plan_id, replay).await
            }
        }
    }

    /// The guarded submission cascade. Every guard must pass, in order; a
    /// failed guard logs and returns without submission. Only a broker-side
    /// failure (cancellation or submission) is an error.
    async fn submit_order_plan(&mut self, plan_id: &str, replay: bool) -> Result<()> {
        // 1. Replay never touches the broker.
        if replay {
            return Ok(());
        }

        // 2. Kill switch.
        if !self.env().allow_live_orders {
            warn!(symbol = %self.symbol(), plan = %plan_id, "live orders disabled; submission blocked");
            self.state.log_line("submission blocked: live orders disabled");
            return Ok(());
        }

        // Regular-hours gate, when the strategy is RTH-only.
        if self.ir().execution.rth_only {
            let in_session = self
                .state
                .current_bar()
                .map(|b| hours::is_rth(b.timestamp_ms))
                .unwrap_or(false);
            if !in_session {
                info!(symbol = %self.symbol(), plan = %plan_id, "outside regular hours; submission blocked");
                self.state.log_line("submission blocked: outside regular hours");
                return Ok(());
            }
        }

        // 3. Daily loss limit.
        if let Some(limit) = self.env().daily_loss_limit {
            if self.state.daily_pnl <= -limit {
                warn!(
                    symbol = %self.symbol(),
                    daily_pnl = self.state.daily_pnl,
                    limit,
                    "daily loss limit reached; submission blocked"
                );
                self.state.log_line("submission blocked: daily loss limit");
                return Ok(());
            }
        }

        let ir = self.ir_arc();
        let Some(plan) = ir.plan(plan_id) else {
            return Err(Error::Internal(format!("unknown order plan '{plan_id}'")));
        };
        let plan_index = ir
            .order_plans
            .iter()
            .position(|p| p.id == plan_id)
            .expect("plan exists");

        // 4. Open-order ceiling, counting the orders this plan will create.
        if let Some(limit) = self.env().max_orders_per_symbol {
            let expected_new = match plan.mode {
                common::PlanMode::SplitBracket => plan.targets.len() * 3,
                common::PlanMode::Single => 3,
            };
            if self.state.open_orders.len() + expected_new > limit {
                warn!(
                    symbol = %self.symbol(),
                    open = self.state.open_orders.len(),
                    expected_new,
                    limit,
                    "order ceiling would be exceeded; submission blocked"
                );
                self.state.log_line("submission blocked: order ceiling");
                return Ok(());
            }
        }

        // 5. Anything still open is cancelled first. A cancellation failure
        //    aborts the whole submission.
        if !self.state.open_orders.is_empty() {
            self.cancel_open_orders_internal().await?;
        }

        // 6. Quantity, possibly sized from buying power.
        let entry_price = self.levels[plan_index].entry;
        let qty = self.resolve_quantity(plan.qty, entry_price).await?;
        if qty <= 0.0 {
            warn!(
                symbol = %self.symbol(),
                plan = %plan_id,
                entry_price,
                "dynamic sizing produced zero quantity; submission aborted"
            );
            self.state
                .log_line("submission aborted: sized quantity is zero");
            return Ok(());
        }

        // 7. Submit. A failure propagates; the bar handler logs it and the
        //    MANAGING gate keeps the FSM honest.
        let order_plan = self.levels[plan_index].to_order_plan(plan, &ir.symbol, qty);
        let broker = self.broker();
        let orders = broker.submit_order_plan(&order_plan, self.env()).await?;
        info!(
            symbol = %self.symbol(),
            plan = %plan_id,
            orders = orders.len(),
            qty,
            "order plan submitted"
        );
        self.state
            .log_line(format!("submitted plan {plan_id}: {} order(s)", orders.len()));
        self.state.open_orders.extend(orders);
        Ok(())
    }

    /// Dynamic sizing: `floor(buying_power * factor / entry)`, clamped to
    /// the document quantity and the hard per-order/per-symbol constraints.
    async fn resolve_quantity(&mut self, doc_qty: f64, entry_price: f64) -> Result<f64> {
        if !self.env().enable_dynamic_sizing {
            return Ok(doc_qty);
        }
        if !(entry_price.is_finite() && entry_price > 0.0) {
            return Ok(0.0);
        }

        let account = self.broker().account(self.env()).await?;
        let mut qty = (account.buying_power * self.env().sizing_factor / entry_price).floor();
        qty = qty.min(doc_qty);
        if let Some(max_qty) = self.env().max_order_qty {
            qty = qty.min(max_qty);
        }
        if let Some(max_notional) = self.env().max_notional_per_symbol {
            qty = qty.min((max_notional / entry_price).floor());
        }
        Ok(qty.max(0.0))
    }

    /// Cancel every locally known open entry. Used by the orchestrator when
    /// closing or swapping a strategy; same guard and failure semantics as
    /// the `cancel_entries` action.
    pub async fn cancel_all_entries(&mut self) -> Result<()> {
        self.cancel_entries(false).await
    }

    /// The `cancel_entries` action: guarded by the safety flag, throws when
    /// any cancellation fails.
    async fn cancel_entries(&mut self, replay: bool) -> Result<()> {
        if replay {
            return Ok(());
        }
        if !self.env().allow_cancel_entries {
            warn!(symbol = %self.symbol(), "entry cancellation disabled; skipping");
            self.state.log_line("cancel skipped: cancellation disabled");
            return Ok(());
        }
        if self.state.open_orders.is_empty() {
            return Ok(());
        }
        self.cancel_open_orders_internal().await
    }

    /// Cancel all locally known open orders. The local set afterwards
    /// retains exactly the failures and excludes the successes; any failure
    /// is an error.
    async fn cancel_open_orders_internal(&mut self) -> Result<()> {
        let total = self.state.open_orders.len();
        let symbol = self.symbol().to_string();
        let broker = self.broker();
        let result = broker
            .cancel_open_entries(&symbol, &self.state.open_orders, self.env())
            .await?;

        let failed_ids: HashSet<&str> =
            result.failed.iter().map(|f| f.order_id.as_str()).collect();
        self.state
            .open_orders
            .retain(|o| failed_ids.contains(o.id.as_str()));

        if result.all_succeeded() {
            info!(symbol = %self.symbol(), cancelled = total, "open orders cancelled");
            self.state
                .log_line(format!("cancelled {total} open order(s)"));
            Ok(())
        } else {
            for failure in &result.failed {
                warn!(
                    symbol = %self.symbol(),
                    order_id = %failure.order_id,
                    reason = %failure.reason,
                    "cancellation failed"
                );
            }
            self.state.log_line(format!(
                "cancellation failed for {} of {total} order(s)",
                result.failed.len()
            ));
            Err(Error::CancellationFailure {
                failed: result.failed.len(),
                total,
            })
        }
    }
}
