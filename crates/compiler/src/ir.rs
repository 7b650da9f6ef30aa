use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use common::{OrderSide, PlanMode, Timeframe};

use crate::expr::Expr;

/// The five scheduler states every strategy instance moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FsmState {
    Idle,
    Armed,
    Placed,
    Managing,
    Exited,
}

impl std::fmt::Display for FsmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FsmState::Idle => "IDLE",
            FsmState::Armed => "ARMED",
            FsmState::Placed => "PLACED",
            FsmState::Managing => "MANAGING",
            FsmState::Exited => "EXITED",
        };
        write!(f, "{s}")
    }
}

/// Classification of a feature by what it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Projection of the current bar (open, close, ...).
    Builtin,
    /// Window function over the bar history.
    Indicator,
    /// Bar-internal statistic (wick sizes, body ratio, ...).
    Microstructure,
}

/// One entry of the topologically sorted feature plan. Pure data: the
/// compute function is re-bound from the registry at engine start, which
/// keeps the IR comparable and serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub name: String,
    /// Registry id this feature binds to ("ema", "rsi", ...).
    pub indicator: String,
    pub kind: FeatureKind,
    pub params: BTreeMap<String, f64>,
    /// Names of declared features this one reads, already plan-ordered.
    pub deps: Vec<String>,
}

/// A guarded FSM edge. `when` is evaluated against the feature snapshot;
/// on commit the actions run in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: FsmState,
    pub to: FsmState,
    pub when: Expr,
    pub actions: Vec<ActionSpec>,
    /// Rule name this edge was lowered from, for logs.
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ActionSpec {
    StartTimer { name: String, bars: u32 },
    SubmitOrderPlan { plan_id: String },
    CancelEntries,
    Log { message: String },
    Noop,
}

/// A price level that is either a compile-time constant or an expression
/// re-evaluated every bar until levels freeze.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LevelSpec {
    Static(f64),
    Dynamic(Expr),
}

impl LevelSpec {
    pub fn static_value(&self) -> Option<f64> {
        match self {
            LevelSpec::Static(v) => Some(*v),
            LevelSpec::Dynamic(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetIr {
    pub price: LevelSpec,
    pub ratio: f64,
}

/// Order plan as lowered: dynamic expressions preserved separately from the
/// numeric snapshots the engine materializes each bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanIr {
    pub id: String,
    pub side: OrderSide,
    pub qty: f64,
    pub entry: LevelSpec,
    pub entry_lo: LevelSpec,
    pub entry_hi: LevelSpec,
    pub stop: LevelSpec,
    pub targets: Vec<TargetIr>,
    pub mode: PlanMode,
}

/// When plan levels stop tracking their expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezePoint {
    Armed,
    Triggered,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecConfig {
    pub entry_timeout_bars: Option<u32>,
    pub rth_only: bool,
    pub freeze_levels_on: Option<FreezePoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Fraction of equity a single trade may put at risk.
    pub max_risk_per_trade: f64,
}

/// The frozen, validated product of compilation. Compiling the same document
/// twice yields element-wise identical values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledIr {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub initial_state: FsmState,
    pub feature_plan: Vec<FeatureSpec>,
    pub transitions: Vec<StateTransition>,
    pub order_plans: Vec<PlanIr>,
    pub execution: ExecConfig,
    pub risk: RiskConfig,
}

impl CompiledIr {
    /// Largest lookback any planned feature needs; the orchestrator uses
    /// this to size the warm-up replay window.
    pub fn max_lookback(&self) -> usize {
        self.feature_plan
            .iter()
            .map(|f| crate::features::lookback(&f.indicator, &f.params))
            .max()
            .unwrap_or(0)
    }

    pub fn plan(&self, plan_id: &str) -> Option<&PlanIr> {
        self.order_plans.iter().find(|p| p.id == plan_id)
    }
}
