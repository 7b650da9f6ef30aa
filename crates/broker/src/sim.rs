use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use common::{
    AccountSnapshot, Error, ExecutionEnv, Order, OrderKind, OrderSide, Result,
};

use crate::transport::{BracketOrder, BrokerTransport};

/// Simulated broker transport. No order ever leaves the process; brackets
/// are held in an in-memory book per symbol.
///
/// Failure injection (`fail_brackets_after`, `refuse_cancel`) exists so the
/// facade's rollback and cancellation-partition behavior can be exercised
/// in tests and dry runs.
pub struct SimTransport {
    account: RwLock<AccountSnapshot>,
    open: Arc<RwLock<HashMap<String, Vec<Order>>>>,
    submitted_brackets: AtomicUsize,
    /// After this many successful brackets, submissions fail.
    fail_brackets_after: Option<usize>,
    /// Order ids that refuse cancellation.
    refuse_cancel: HashSet<String>,
}

impl SimTransport {
    pub fn new(initial_buying_power: f64) -> Self {
        info!(buying_power = initial_buying_power, "SimTransport initialized");
        Self {
            account: RwLock::new(AccountSnapshot {
                buying_power: initial_buying_power,
                equity: initial_buying_power,
            }),
            open: Arc::new(RwLock::new(HashMap::new())),
            submitted_brackets: AtomicUsize::new(0),
            fail_brackets_after: None,
            refuse_cancel: HashSet::new(),
        }
    }

    pub fn fail_brackets_after(mut self, count: usize) -> Self {
        self.fail_brackets_after = Some(count);
        self
    }

    pub fn refuse_cancel(mut self, order_ids: &[&str]) -> Self {
        self.refuse_cancel = order_ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Direct view of the simulated book, for assertions and dashboards.
    pub fn book(&self) -> Arc<RwLock<HashMap<String, Vec<Order>>>> {
        Arc::clone(&self.open)
    }
}

#[async_trait]
impl BrokerTransport for SimTransport {
    async fn submit_bracket(
        &self,
        bracket: &BracketOrder,
        _env: &ExecutionEnv,
    ) -> Result<Vec<Order>> {
        let already = self.submitted_brackets.load(Ordering::SeqCst);
        if let Some(limit) = self.fail_brackets_after {
            if already >= limit {
                return Err(Error::BrokerTransient(format!(
                    "simulated failure submitting bracket {}",
                    bracket.bracket_id
                )));
            }
        }
        self.submitted_brackets.fetch_add(1, Ordering::SeqCst);

        let orders = vec![
            Order::leg(
                &bracket.symbol,
                bracket.side,
                bracket.qty,
                bracket.entry_price,
                OrderKind::Entry,
                &bracket.bracket_id,
            ),
            Order::leg(
                &bracket.symbol,
                bracket.side.opposite(),
                bracket.qty,
                bracket.take_profit,
                OrderKind::TakeProfit,
                &bracket.bracket_id,
            ),
            Order::leg(
                &bracket.symbol,
                bracket.side.opposite(),
                bracket.qty,
                bracket.stop_loss,
                OrderKind::StopLoss,
                &bracket.bracket_id,
            ),
        ];

        debug!(
            symbol = %bracket.symbol,
            bracket = %bracket.bracket_id,
            qty = bracket.qty,
            "sim bracket accepted"
        );
        self.open
            .write()
            .await
            .entry(bracket.symbol.clone())
            .or_default()
            .extend(orders.clone());
        Ok(orders)
    }

    async fn submit_market(
        &self,
        symbol: &str,
        qty: f64,
        side: OrderSide,
        _env: &ExecutionEnv,
    ) -> Result<Order> {
        // Market orders fill immediately in the sim; nothing rests on the
        // book.
        debug!(symbol, qty, ?side, "sim market order filled");
        Ok(Order::market(symbol, side, qty))
    }

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        _env: &ExecutionEnv,
    ) -> Result<()> {
        if self.refuse_cancel.contains(order_id) {
            return Err(Error::BrokerPermanent(format!(
                "sim refuses to cancel order {order_id}"
            )));
        }
        let mut open = self.open.write().await;
        if let Some(orders) = open.get_mut(symbol) {
            orders.retain(|o| o.id != order_id);
        }
        Ok(())
    }

    async fn open_orders(&self, symbol: &str, _env: &ExecutionEnv) -> Result<Vec<Order>> {
        Ok(self
            .open
            .read()
            .await
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn account_state(&self, _env: &ExecutionEnv) -> Result<AccountSnapshot> {
        Ok(*self.account.read().await)
    }
}
