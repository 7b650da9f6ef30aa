use async_trait::async_trait;

use common::{AccountSnapshot, ExecutionEnv, Order, OrderSide, Result};

/// One child bracket after split expansion: an entry with its paired
/// take-profit and stop-loss.
#[derive(Debug, Clone, PartialEq)]
pub struct BracketOrder {
    pub bracket_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub entry_price: f64,
    pub take_profit: f64,
    pub stop_loss: f64,
}

/// The raw wire operations a concrete broker connection provides.
///
/// The facade layers constraint enforcement, split-bracket expansion and
/// rollback on top; transports only move single brackets and orders.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Submit one bracket; returns the created orders (entry, TP, stop).
    async fn submit_bracket(
        &self,
        bracket: &BracketOrder,
        env: &ExecutionEnv,
    ) -> Result<Vec<Order>>;

    async fn submit_market(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        env: &ExecutionEnv,
    ) -> Result<Order>;

    /// Cancel a single order by id.
    async fn cancel_order(&self, symbol: &str, order_id: &str, env: &ExecutionEnv)
        -> Result<()>;

    async fn open_orders(&self, symbol: &str, env: &ExecutionEnv) -> Result<Vec<Order>>;

    async fn account_state(&self, env: &ExecutionEnv) -> Result<AccountSnapshot>;
}
