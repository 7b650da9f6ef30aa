//! Strategy compiler: turns a declarative YAML document into a frozen,
//! validated, deterministic `CompiledIr` (feature plan, FSM transitions,
//! order plans).

pub mod document;
pub mod expr;
pub mod features;
pub mod graph;
pub mod ir;
pub mod lower;
pub mod validate;

pub use document::StrategyDoc;
pub use ir::{
    ActionSpec, CompiledIr, ExecConfig, FeatureKind, FeatureSpec, FreezePoint, FsmState,
    LevelSpec, PlanIr, RiskConfig, StateTransition, TargetIr,
};
pub use lower::{ENTRY_TIMER, ENTRY_TIMER_EXPIRED, PLAN_VARS};

use common::Result;

/// Compile a strategy document.
///
/// Pipeline: schema validation, expression parsing, name resolution and
/// type check, feature DAG construction, lowering, order-plan invariant
/// checks. Pure: the same input always produces an identical IR.
pub fn compile(yaml: &str) -> Result<CompiledIr> {
    let doc = StrategyDoc::from_yaml(yaml)?;
    validate::schema(&doc)?;
    let ir = lower::lower(&doc)?;
    for plan in &ir.order_plans {
        validate::plan_invariants(plan)?;
    }
    Ok(ir)
}
