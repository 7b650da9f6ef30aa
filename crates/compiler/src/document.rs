use std::collections::BTreeMap;

use serde::Deserialize;

use common::{Error, Result};

/// The declarative strategy document as the user writes it (YAML).
///
/// Unknown fields are tolerated (additive evolution is allowed); missing or
/// retyped fields fail compilation loudly during schema validation.
///
/// ```yaml
/// meta:
///   name: pullback long
///   symbol: SPY
///   timeframe: 5m
/// features:
///   - name: ema20
///     indicator: ema
///     params: { period: 20 }
///   - name: rsi
///     params: { period: 14 }
/// rules:
///   arm: "rsi < 30"
///   trigger: "close > ema20"
///   invalidate: "close < stop"
/// order_plans:
///   - side: buy
///     qty: 10
///     entry: "ema20 + 0.25"
///     entry_zone: ["ema20", "ema20 + 0.5"]
///     stop: "close - 1.2 * atr"
///     targets:
///       - { price: "entry + 2 * (entry - stop)", ratio: 1.0 }
/// execution:
///   entry_timeout_bars: 5
///   rth_only: true
///   freeze_levels_on: armed
/// risk:
///   max_risk_per_trade: 0.01
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct StrategyDoc {
    pub meta: Option<MetaSection>,
    #[serde(default)]
    pub features: Vec<FeatureDecl>,
    pub rules: Option<RulesSection>,
    #[serde(default)]
    pub order_plans: Vec<OrderPlanDoc>,
    pub execution: Option<ExecutionSection>,
    pub risk: Option<RiskSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaSection {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureDecl {
    pub name: String,
    /// Registry id; defaults to the feature name itself, so plain
    /// `- name: close` binds the bar builtin.
    pub indicator: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesSection {
    pub arm: Option<String>,
    pub trigger: Option<String>,
    pub invalidate: Option<String>,
    pub disarm: Option<String>,
}

/// A level that is either a literal number or an expression string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumOrExpr {
    Num(f64),
    Expr(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetDecl {
    pub price: NumOrExpr,
    pub ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideDecl {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderPlanDoc {
    pub id: Option<String>,
    pub side: Option<SideDecl>,
    pub qty: Option<f64>,
    pub entry: Option<NumOrExpr>,
    /// `[low, high]`; defaults to a zero-width zone at `entry`.
    pub entry_zone: Option<Vec<NumOrExpr>>,
    pub stop: Option<NumOrExpr>,
    #[serde(default)]
    pub targets: Vec<TargetDecl>,
    pub mode: Option<ModeDecl>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeDecl {
    Single,
    SplitBracket,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
    pub entry_timeout_bars: Option<u32>,
    pub rth_only: Option<bool>,
    pub freeze_levels_on: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskSection {
    pub max_risk_per_trade: Option<f64>,
}

impl StrategyDoc {
    /// Deserialize the YAML text. Shape-level failures (not YAML at all,
    /// or a field of the wrong type) surface as schema errors at `$`.
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).map_err(|e| Error::Schema {
            path: "$".to_string(),
            reason: e.to_string(),
        })
    }
}
