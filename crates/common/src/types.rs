use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One closed OHLCV interval of market data at a given timeframe.
///
/// Bars for a `(symbol, timeframe)` pair form a strictly increasing sequence
/// by `timestamp_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Check the OHLCV shape invariant:
    /// `low <= min(open, close) <= max(open, close) <= high`, `volume >= 0`.
    pub fn validate(&self) -> Result<()> {
        let body_lo = self.open.min(self.close);
        let body_hi = self.open.max(self.close);
        if !(self.low <= body_lo && body_hi <= self.high) {
            return Err(Error::Internal(format!(
                "malformed bar at {}: o={} h={} l={} c={}",
                self.timestamp_ms, self.open, self.high, self.low, self.close
            )));
        }
        if self.volume < 0.0 {
            return Err(Error::Internal(format!(
                "negative volume {} at {}",
                self.volume, self.timestamp_ms
            )));
        }
        Ok(())
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp_ms)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Bar interval supported by the data layer and the strategy DSL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT")]
pub enum Timeframe {
    #[serde(rename = "1m")]
    #[sqlx(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    #[sqlx(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    #[sqlx(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    #[sqlx(rename = "1h")]
    H1,
    #[serde(rename = "1d")]
    #[sqlx(rename = "1d")]
    D1,
}

impl Timeframe {
    /// Nominal bar interval in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::M1 => 60_000,
            Timeframe::M5 => 300_000,
            Timeframe::M15 => 900_000,
            Timeframe::H1 => 3_600_000,
            Timeframe::D1 => 86_400_000,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::D1 => "1d",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "1d" => Ok(Timeframe::D1),
            other => Err(Error::Config(format!("unknown timeframe '{other}'"))),
        }
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Role an order plays inside a bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Entry,
    TakeProfit,
    StopLoss,
}

/// A single broker order, either standalone or one leg of a bracket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    /// `None` = market order; `Some(price)` = limit/stop price.
    pub limit_price: Option<f64>,
    pub kind: OrderKind,
    /// Groups the legs of one bracket; `None` for standalone orders.
    pub bracket_id: Option<String>,
}

impl Order {
    pub fn market(symbol: impl Into<String>, side: OrderSide, qty: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            qty,
            limit_price: None,
            kind: OrderKind::Entry,
            bracket_id: None,
        }
    }

    pub fn leg(
        symbol: impl Into<String>,
        side: OrderSide,
        qty: f64,
        price: f64,
        kind: OrderKind,
        bracket_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            side,
            qty,
            limit_price: Some(price),
            kind,
            bracket_id: Some(bracket_id.into()),
        }
    }
}

/// Outcome of a batch cancellation: which orders were cancelled and which
/// were not, with the broker's reason per failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancellationResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<FailedCancel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCancel {
    pub order_id: String,
    pub reason: String,
}

impl CancellationResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// How an order plan is materialized at the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanMode {
    #[default]
    Single,
    SplitBracket,
}

/// One take-profit target: exit `ratio` of the position at `price`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BracketTarget {
    pub price: f64,
    pub ratio: f64,
}

/// A fully materialized order plan, ready for the broker adapter.
///
/// All price levels are concrete numbers here; the engine re-evaluates any
/// dynamic expressions before handing the plan over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderPlan {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub entry_price: f64,
    pub entry_lo: f64,
    pub entry_hi: f64,
    pub stop_price: f64,
    pub targets: Vec<BracketTarget>,
    pub mode: PlanMode,
}

impl OrderPlan {
    /// Check the level-ordering invariants. For BUY: stop below the entry
    /// zone and every target above it; mirrored for SELL. Ratios must sum
    /// to 1.0 within 1e-6.
    pub fn validate(&self) -> Result<()> {
        let fail = |reason: String| {
            Err(Error::BrokerPermanent(format!(
                "order plan '{}': {reason}",
                self.id
            )))
        };

        if self.entry_lo > self.entry_hi {
            return fail(format!(
                "entry zone inverted: {} > {}",
                self.entry_lo, self.entry_hi
            ));
        }
        if self.qty <= 0.0 {
            return fail(format!("non-positive quantity {}", self.qty));
        }

        let ratio_sum: f64 = self.targets.iter().map(|t| t.ratio).sum();
        if (ratio_sum - 1.0).abs() > 1e-6 {
            return fail(format!("target ratios sum to {ratio_sum}, expected 1.0"));
        }

        match self.side {
            OrderSide::Buy => {
                if self.stop_price >= self.entry_lo {
                    return fail(format!(
                        "BUY stop {} must be below entry zone low {}",
                        self.stop_price, self.entry_lo
                    ));
                }
                for t in &self.targets {
                    if t.price <= self.entry_hi {
                        return fail(format!(
                            "BUY target {} must be above entry zone high {}",
                            t.price, self.entry_hi
                        ));
                    }
                }
            }
            OrderSide::Sell => {
                if self.stop_price <= self.entry_hi {
                    return fail(format!(
                        "SELL stop {} must be above entry zone high {}",
                        self.stop_price, self.entry_hi
                    ));
                }
                for t in &self.targets {
                    if t.price >= self.entry_lo {
                        return fail(format!(
                            "SELL target {} must be below entry zone low {}",
                            t.price, self.entry_lo
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Lifecycle status of a persisted strategy record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
pub enum StrategyStatus {
    Draft,
    Pending,
    Active,
    Closed,
    Failed,
}

impl std::fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyStatus::Draft => "DRAFT",
            StrategyStatus::Pending => "PENDING",
            StrategyStatus::Active => "ACTIVE",
            StrategyStatus::Closed => "CLOSED",
            StrategyStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// A strategy as persisted by the repository. Uniqueness is on `id` only;
/// the orchestrator owns concurrency policy for same-symbol records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub status: StrategyStatus,
    pub yaml_content: String,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Broker-environment configuration threaded through every adapter call:
/// which account to act on, the safety switches, and the hard order
/// constraints the facade enforces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEnv {
    pub account_id: String,
    /// Kill switch. When false no order ever reaches the broker.
    pub allow_live_orders: bool,
    /// Guards the `cancel_entries` action.
    pub allow_cancel_entries: bool,
    pub max_order_qty: Option<f64>,
    pub max_notional_per_symbol: Option<f64>,
    pub max_orders_per_symbol: Option<usize>,
    /// Daily realized-loss limit in account currency; submissions are
    /// blocked once breached.
    pub daily_loss_limit: Option<f64>,
    pub enable_dynamic_sizing: bool,
    /// Fraction of buying power a dynamically sized entry may consume.
    pub sizing_factor: f64,
}

impl Default for ExecutionEnv {
    fn default() -> Self {
        Self {
            account_id: "default".to_string(),
            allow_live_orders: false,
            allow_cancel_entries: true,
            max_order_qty: None,
            max_notional_per_symbol: None,
            max_orders_per_symbol: None,
            daily_loss_limit: None,
            enable_dynamic_sizing: false,
            sizing_factor: 0.75,
        }
    }
}

/// Point-in-time account state used for sizing and sanity checks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub buying_power: f64,
    pub equity: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(side: OrderSide, stop: f64, targets: &[(f64, f64)]) -> OrderPlan {
        OrderPlan {
            id: "p1".into(),
            symbol: "SPY".into(),
            side,
            qty: 10.0,
            entry_price: 100.0,
            entry_lo: 99.5,
            entry_hi: 100.5,
            stop_price: stop,
            targets: targets
                .iter()
                .map(|&(price, ratio)| BracketTarget { price, ratio })
                .collect(),
            mode: PlanMode::SplitBracket,
        }
    }

    #[test]
    fn bar_validate_rejects_high_below_body() {
        let bar = Bar {
            timestamp_ms: 0,
            open: 10.0,
            high: 9.0,
            low: 8.0,
            close: 9.5,
            volume: 1.0,
        };
        assert!(bar.validate().is_err());
    }

    #[test]
    fn bar_validate_accepts_well_formed() {
        let bar = Bar {
            timestamp_ms: 0,
            open: 10.0,
            high: 10.5,
            low: 9.5,
            close: 10.2,
            volume: 0.0,
        };
        assert!(bar.validate().is_ok());
    }

    #[test]
    fn buy_plan_requires_stop_below_zone() {
        let p = plan(OrderSide::Buy, 99.6, &[(102.0, 1.0)]);
        assert!(p.validate().is_err());

        let p = plan(OrderSide::Buy, 98.0, &[(102.0, 1.0)]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn sell_plan_requires_targets_below_zone() {
        let p = plan(OrderSide::Sell, 102.0, &[(99.6, 1.0)]);
        assert!(p.validate().is_err());

        let p = plan(OrderSide::Sell, 102.0, &[(97.0, 1.0)]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn ratios_must_sum_to_one() {
        let p = plan(OrderSide::Buy, 98.0, &[(102.0, 0.5), (104.0, 0.4)]);
        assert!(p.validate().is_err());

        let p = plan(OrderSide::Buy, 98.0, &[(102.0, 0.5), (104.0, 0.5)]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn timeframe_round_trips_through_str() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::H1,
            Timeframe::D1,
        ] {
            let parsed: Timeframe = tf.to_string().parse().unwrap();
            assert_eq!(parsed, tf);
        }
    }
}
