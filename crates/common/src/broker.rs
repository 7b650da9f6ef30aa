use async_trait::async_trait;

use crate::{
    AccountSnapshot, CancellationResult, ExecutionEnv, Order, OrderPlan, OrderSide, Result,
};

/// Abstraction over the broker connection.
///
/// The facade in `crates/broker` implements this for any transport
/// (simulated or REST gateway), layering constraint enforcement and
/// split-bracket expansion in front of it. Only the FSM engine's action
/// dispatcher and the reconciliation loop should hold a reference to a
/// `dyn BrokerAdapter`.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Materialize an order plan as one or more bracket orders and submit
    /// them. Returns every order created, entry legs first.
    async fn submit_order_plan(&self, plan: &OrderPlan, env: &ExecutionEnv)
        -> Result<Vec<Order>>;

    /// Submit a plain market order.
    async fn submit_market_order(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        env: &ExecutionEnv,
    ) -> Result<Order>;

    /// Cancel the given open entry orders. Partial failure is reported in
    /// the result rather than as an error.
    async fn cancel_open_entries(
        &self,
        symbol: &str,
        orders: &[Order],
        env: &ExecutionEnv,
    ) -> Result<CancellationResult>;

    /// Current open orders at the broker for one symbol. This is the truth
    /// the engine reconciles against.
    async fn get_open_orders(&self, symbol: &str, env: &ExecutionEnv) -> Result<Vec<Order>>;

    /// Account buying power and equity, used for dynamic sizing.
    async fn account(&self, env: &ExecutionEnv) -> Result<AccountSnapshot>;
}
