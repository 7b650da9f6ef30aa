use async_trait::async_trait;
use tracing::{info, warn};

use common::{
    AccountSnapshot, BrokerAdapter, CancellationResult, Error, ExecutionEnv, FailedCancel,
    Order, OrderPlan, OrderSide, PlanMode, Result,
};

use crate::transport::{BracketOrder, BrokerTransport};

/// The default `BrokerAdapter` implementation every concrete transport is
/// wrapped in. Responsibilities: order-constraint enforcement before
/// dispatch, split-bracket expansion, and rollback of already-submitted
/// brackets when a later one fails.
pub struct BrokerFacade<T> {
    transport: T,
}

impl<T: BrokerTransport> BrokerFacade<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Hard constraint enforcement. The engine may pre-filter, but this is
    /// where violations actually stop an order.
    fn enforce_constraints(&self, plan: &OrderPlan, env: &ExecutionEnv) -> Result<()> {
        if !symbol_is_valid(&plan.symbol) {
            return Err(Error::BrokerPermanent(format!(
                "invalid symbol '{}'",
                plan.symbol
            )));
        }
        // Level invariants recheck: dynamic levels bypass the compile-time
        // check, so the materialized numbers are validated here.
        plan.validate()?;

        if let Some(max_qty) = env.max_order_qty {
            if plan.qty > max_qty {
                return Err(Error::BrokerPermanent(format!(
                    "qty {} exceeds max order qty {max_qty}",
                    plan.qty
                )));
            }
        }
        if let Some(max_notional) = env.max_notional_per_symbol {
            let notional = plan.qty * plan.entry_price;
            if notional > max_notional {
                return Err(Error::BrokerPermanent(format!(
                    "notional {notional:.2} exceeds per-symbol cap {max_notional:.2}"
                )));
            }
        }
        Ok(())
    }

    /// Cancel everything submitted so far after a partial bracket failure.
    /// Rollback failures are logged, not surfaced; the original error wins.
    async fn rollback(&self, symbol: &str, submitted: &[Order], env: &ExecutionEnv) {
        warn!(
            symbol,
            orders = submitted.len(),
            "rolling back partially submitted bracket set"
        );
        for order in submitted {
            if let Err(e) = self.transport.cancel_order(symbol, &order.id, env).await {
                warn!(
                    symbol,
                    order_id = %order.id,
                    error = %e,
                    "rollback cancellation failed; order may remain live"
                );
            }
        }
    }
}

/// Split a plan into child brackets. Ratio children round to the nearest
/// unit; the last child absorbs the rounding remainder so the quantities
/// always sum to the plan quantity.
pub fn expand_brackets(plan: &OrderPlan) -> Vec<BracketOrder> {
    let bracket = |index: usize, qty: f64, take_profit: f64| BracketOrder {
        bracket_id: format!("{}-{}", plan.id, index + 1),
        symbol: plan.symbol.clone(),
        side: plan.side,
        qty,
        entry_price: plan.entry_price,
        take_profit,
        stop_loss: plan.stop_price,
    };

    match plan.mode {
        PlanMode::Single => {
            let tp = plan.targets.first().map(|t| t.price).unwrap_or(plan.entry_price);
            vec![bracket(0, plan.qty, tp)]
        }
        PlanMode::SplitBracket => {
            let mut out = Vec::with_capacity(plan.targets.len());
            let mut allocated = 0.0;
            for (i, target) in plan.targets.iter().enumerate() {
                let qty = if i + 1 == plan.targets.len() {
                    plan.qty - allocated
                } else {
                    (plan.qty * target.ratio).round()
                };
                allocated += qty;
                out.push(bracket(i, qty, target.price));
            }
            out
        }
    }
}

#[async_trait]
impl<T: BrokerTransport> BrokerAdapter for BrokerFacade<T> {
    async fn submit_order_plan(&self, plan: &OrderPlan, env: &ExecutionEnv)
        -> Result<Vec<Order>> {
        self.enforce_constraints(plan, env)?;

        // Account sanity: enough buying power for the full entry notional.
        let account = self.transport.account_state(env).await?;
        let notional = plan.qty * plan.entry_price;
        if account.buying_power < notional {
            return Err(Error::BrokerPermanent(format!(
                "insufficient buying power: {:.2} < {notional:.2}",
                account.buying_power
            )));
        }

        let brackets = expand_brackets(plan);
        let mut submitted: Vec<Order> = Vec::new();

        for bracket in &brackets {
            if bracket.qty <= 0.0 {
                continue;
            }
            match self.transport.submit_bracket(bracket, env).await {
                Ok(orders) => submitted.extend(orders),
                Err(e) => {
                    self.rollback(&plan.symbol, &submitted, env).await;
                    return Err(e);
                }
            }
        }

        info!(
            symbol = %plan.symbol,
            plan = %plan.id,
            brackets = brackets.len(),
            orders = submitted.len(),
            "order plan dispatched"
        );
        Ok(submitted)
    }

    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        env: &ExecutionEnv,
    ) -> Result<Order> {
        if !symbol_is_valid(symbol) {
            return Err(Error::BrokerPermanent(format!("invalid symbol '{symbol}'")));
        }
        if qty <= 0.0 {
            return Err(Error::BrokerPermanent(format!("non-positive qty {qty}")));
        }
        if let Some(max_qty) = env.max_order_qty {
            if qty > max_qty {
                return Err(Error::BrokerPermanent(format!(
                    "qty {qty} exceeds max order qty {max_qty}"
                )));
            }
        }
        self.transport.submit_market(symbol, qty, side, env).await
    }

    /// Cancel each order individually, partitioning per-order outcomes.
    /// Partial failure is reported in the result, never as an error.
    async fn cancel_open_entries(
        &self,
        symbol: &str,
        orders: &[Order],
        env: &ExecutionEnv,
    ) -> Result<CancellationResult> {
        let mut result = CancellationResult::default();
        for order in orders {
            match self.transport.cancel_order(symbol, &order.id, env).await {
                Ok(()) => result.succeeded.push(order.id.clone()),
                Err(e) => result.failed.push(FailedCancel {
                    order_id: order.id.clone(),
                    reason: e.to_string(),
                }),
            }
        }
        if !result.failed.is_empty() {
            warn!(
                symbol,
                failed = result.failed.len(),
                total = orders.len(),
                "cancellation partially failed"
            );
        }
        Ok(result)
    }

    async fn get_open_orders(&self, symbol: &str, env: &ExecutionEnv) -> Result<Vec<Order>> {
        self.transport.open_orders(symbol, env).await
    }

    async fn account(&self, env: &ExecutionEnv) -> Result<AccountSnapshot> {
        self.transport.account_state(env).await
    }
}

/// US equity tickers: 1-6 uppercase letters, with an optional class suffix.
fn symbol_is_valid(symbol: &str) -> bool {
    let (root, class) = match symbol.split_once('.') {
        Some((root, class)) => (root, class),
        None => (symbol, ""),
    };
    let root_ok = !root.is_empty()
        && root.len() <= 6
        && root.chars().all(|c| c.is_ascii_uppercase());
    let class_ok = class.is_empty()
        || (class.len() == 1 && class.chars().all(|c| c.is_ascii_uppercase()));
    root_ok && class_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::BracketTarget;

    fn plan(qty: f64, ratios: &[f64], mode: PlanMode) -> OrderPlan {
        OrderPlan {
            id: "p1".to_string(),
            symbol: "SPY".to_string(),
            side: OrderSide::Buy,
            qty,
            entry_price: 100.0,
            entry_lo: 99.5,
            entry_hi: 100.5,
            stop_price: 97.0,
            targets: ratios
                .iter()
                .enumerate()
                .map(|(i, &ratio)| BracketTarget {
                    price: 104.0 + i as f64,
                    ratio,
                })
                .collect(),
            mode,
        }
    }

    #[test]
    fn split_quantities_sum_to_plan_qty() {
        let brackets = expand_brackets(&plan(10.0, &[0.3, 0.3, 0.4], PlanMode::SplitBracket));
        let total: f64 = brackets.iter().map(|b| b.qty).sum();
        assert_eq!(brackets.len(), 3);
        assert!((total - 10.0).abs() < 1e-9);
    }

    #[test]
    fn last_child_absorbs_rounding_remainder() {
        // 7 * 0.5 rounds to 4; the last child gets the remaining 3.
        let brackets = expand_brackets(&plan(7.0, &[0.5, 0.5], PlanMode::SplitBracket));
        assert_eq!(brackets[0].qty, 4.0);
        assert_eq!(brackets[1].qty, 3.0);
    }

    #[test]
    fn single_mode_emits_one_bracket_at_first_target() {
        let brackets = expand_brackets(&plan(10.0, &[0.5, 0.5], PlanMode::Single));
        assert_eq!(brackets.len(), 1);
        assert_eq!(brackets[0].qty, 10.0);
        assert_eq!(brackets[0].take_profit, 104.0);
    }

    #[test]
    fn symbol_validation() {
        assert!(symbol_is_valid("SPY"));
        assert!(symbol_is_valid("GOOGL"));
        assert!(symbol_is_valid("BRK.B"));
        assert!(!symbol_is_valid(""));
        assert!(!symbol_is_valid("spy"));
        assert!(!symbol_is_valid("TOOLONGG"));
        assert!(!symbol_is_valid("BTC-USD"));
    }
}
