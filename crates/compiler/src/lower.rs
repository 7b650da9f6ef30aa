use std::collections::{BTreeMap, BTreeSet};

use common::{Error, OrderSide, PlanMode, Result, Timeframe};

use crate::document::{ModeDecl, NumOrExpr, SideDecl, StrategyDoc};
use crate::expr::{self, Expr, Scope, Ty};
use crate::features;
use crate::graph;
use crate::ir::{
    ActionSpec, CompiledIr, ExecConfig, FeatureSpec, FreezePoint, FsmState, LevelSpec, PlanIr,
    RiskConfig, StateTransition, TargetIr,
};

/// Name of the bar-countdown timer armed on entering ARMED.
pub const ENTRY_TIMER: &str = "entry_timeout";

/// Pseudo-identifier the engine exposes while the entry timer has expired.
pub const ENTRY_TIMER_EXPIRED: &str = "entry_timer_expired";

/// Variables scoped to the active order plan, visible to rules and to
/// dynamic level expressions.
pub const PLAN_VARS: &[&str] = &["entry", "stop", "eL", "eH", "t1"];

/// Stages 2-5: parse and resolve every expression, build the feature DAG,
/// and lower the document onto the canonical FSM scaffold.
pub fn lower(doc: &StrategyDoc) -> Result<CompiledIr> {
    let meta = doc.meta.as_ref().expect("schema validated");
    let symbol = meta.symbol.clone().expect("schema validated");
    let timeframe: Timeframe = meta
        .timeframe
        .as_deref()
        .expect("schema validated")
        .parse()?;

    // ── Stage 4: feature DAG ─────────────────────────────────────────────
    let mut specs: BTreeMap<String, FeatureSpec> = BTreeMap::new();
    for decl in &doc.features {
        let indicator = decl.indicator.clone().unwrap_or_else(|| decl.name.clone());
        let kind = features::kind_of(&indicator).ok_or_else(|| Error::Name {
            symbol: indicator.clone(),
            location: format!("features.{}", decl.name),
        })?;
        let deps: Vec<String> = features::deps_of(&indicator)
            .iter()
            .map(|d| d.to_string())
            .collect();
        specs.insert(
            decl.name.clone(),
            FeatureSpec {
                name: decl.name.clone(),
                indicator,
                kind,
                params: decl.params.clone(),
                deps,
            },
        );
    }

    let nodes: BTreeMap<String, Vec<String>> = specs
        .values()
        .map(|s| (s.name.clone(), s.deps.clone()))
        .collect();
    let order = graph::topo_sort(&nodes)?;
    let feature_plan: Vec<FeatureSpec> = order
        .iter()
        .map(|name| specs.get(name).expect("planned name exists").clone())
        .collect();

    // ── Stages 2-3: expressions ──────────────────────────────────────────
    let feature_names: BTreeSet<String> = specs.keys().cloned().collect();
    let mut extras: Vec<&str> = features::BAR_BUILTINS.to_vec();
    extras.extend_from_slice(PLAN_VARS);
    extras.push(ENTRY_TIMER_EXPIRED);
    let scope = Scope {
        features: &feature_names,
        extras: &extras,
    };

    let rules = doc.rules.as_ref().expect("schema validated");
    let parse_rule = |text: &Option<String>, location: &str| -> Result<Option<Expr>> {
        match text.as_deref() {
            None => Ok(None),
            Some(src) => {
                let expr = expr::parse(src, location)?;
                expr::resolve(&expr, &scope, location)?;
                Ok(Some(expr))
            }
        }
    };

    let arm = parse_rule(&rules.arm, "rules.arm")?;
    let trigger = parse_rule(&rules.trigger, "rules.trigger")?.expect("schema validated");
    let invalidate = parse_rule(&rules.invalidate, "rules.invalidate")?;
    let disarm = parse_rule(&rules.disarm, "rules.disarm")?;

    // ── Order plans ──────────────────────────────────────────────────────
    let mut order_plans = Vec::with_capacity(doc.order_plans.len());
    for (i, plan) in doc.order_plans.iter().enumerate() {
        let id = plan.id.clone().unwrap_or_else(|| format!("plan-{}", i + 1));
        let level = |value: &NumOrExpr, field: &str| -> Result<LevelSpec> {
            lower_level(value, &scope, &format!("order_plans[{i}].{field}"))
        };

        let entry = level(plan.entry.as_ref().expect("schema validated"), "entry")?;
        let (entry_lo, entry_hi) = match &plan.entry_zone {
            Some(zone) => (level(&zone[0], "entry_zone[0]")?, level(&zone[1], "entry_zone[1]")?),
            None => (entry.clone(), entry.clone()),
        };
        let stop = level(plan.stop.as_ref().expect("schema validated"), "stop")?;

        let mut targets = Vec::with_capacity(plan.targets.len());
        for (j, target) in plan.targets.iter().enumerate() {
            targets.push(TargetIr {
                price: level(&target.price, &format!("targets[{j}].price"))?,
                ratio: target.ratio,
            });
        }

        order_plans.push(PlanIr {
            id,
            side: match plan.side.expect("schema validated") {
                SideDecl::Buy => OrderSide::Buy,
                SideDecl::Sell => OrderSide::Sell,
            },
            qty: plan.qty.expect("schema validated"),
            entry,
            entry_lo,
            entry_hi,
            stop,
            targets,
            mode: match plan.mode {
                Some(ModeDecl::SplitBracket) => PlanMode::SplitBracket,
                _ => PlanMode::Single,
            },
        });
    }

    // ── Execution / risk config ──────────────────────────────────────────
    let execution = ExecConfig {
        entry_timeout_bars: doc.execution.as_ref().and_then(|e| e.entry_timeout_bars),
        rth_only: doc
            .execution
            .as_ref()
            .and_then(|e| e.rth_only)
            .unwrap_or(false),
        freeze_levels_on: doc
            .execution
            .as_ref()
            .and_then(|e| e.freeze_levels_on.as_deref())
            .map(|s| match s {
                "armed" => FreezePoint::Armed,
                _ => FreezePoint::Triggered,
            }),
    };
    let risk = RiskConfig {
        max_risk_per_trade: doc
            .risk
            .as_ref()
            .and_then(|r| r.max_risk_per_trade)
            .unwrap_or(0.01),
    };

    // ── Stage 5: transitions on the canonical scaffold ───────────────────
    let transitions = scaffold(
        arm,
        trigger,
        invalidate,
        disarm,
        &execution,
        &order_plans,
    );

    Ok(CompiledIr {
        symbol,
        timeframe,
        initial_state: FsmState::Idle,
        feature_plan,
        transitions,
        order_plans,
        execution,
        risk,
    })
}

fn lower_level(value: &NumOrExpr, scope: &Scope, location: &str) -> Result<LevelSpec> {
    match value {
        NumOrExpr::Num(n) => Ok(LevelSpec::Static(*n)),
        NumOrExpr::Expr(src) => {
            let expr = expr::parse(src, location)?;
            let ty = expr::resolve(&expr, scope, location)?;
            if ty != Ty::Num {
                return Err(Error::Parse {
                    location: location.to_string(),
                    message: "level expression must be numeric".to_string(),
                });
            }
            Ok(LevelSpec::Dynamic(expr))
        }
    }
}

/// The canonical FSM:
/// `IDLE --arm--> ARMED --trigger--> PLACED --(entry filled)--> MANAGING
/// --invalidate--> EXITED`, plus timeout/disarm escapes back to IDLE.
///
/// Escape edges are declared before the MANAGING progression so that an
/// invalidation observed while PLACED wins over entry confirmation on the
/// same bar. Emission order is fixed; it is the stable transition order the
/// determinism guarantee refers to.
fn scaffold(
    arm: Option<Expr>,
    trigger: Expr,
    invalidate: Option<Expr>,
    disarm: Option<Expr>,
    execution: &ExecConfig,
    plans: &[PlanIr],
) -> Vec<StateTransition> {
    let mut transitions = Vec::new();

    // IDLE -> ARMED
    let mut arm_actions = Vec::new();
    if let Some(bars) = execution.entry_timeout_bars {
        arm_actions.push(ActionSpec::StartTimer {
            name: ENTRY_TIMER.to_string(),
            bars,
        });
    }
    arm_actions.push(ActionSpec::Log {
        message: "armed".to_string(),
    });
    transitions.push(StateTransition {
        from: FsmState::Idle,
        to: FsmState::Armed,
        when: arm.unwrap_or(Expr::Bool(true)),
        actions: arm_actions,
        label: "arm".to_string(),
    });

    // ARMED -> PLACED, submitting every plan in declaration order.
    let mut trigger_actions: Vec<ActionSpec> = plans
        .iter()
        .map(|p| ActionSpec::SubmitOrderPlan {
            plan_id: p.id.clone(),
        })
        .collect();
    trigger_actions.push(ActionSpec::Log {
        message: "entry submitted".to_string(),
    });
    transitions.push(StateTransition {
        from: FsmState::Armed,
        to: FsmState::Placed,
        when: trigger,
        actions: trigger_actions,
        label: "trigger".to_string(),
    });

    // ARMED -> IDLE on timer expiry or explicit disarm.
    if let Some(when) = escape_predicate(execution, &disarm) {
        transitions.push(StateTransition {
            from: FsmState::Armed,
            to: FsmState::Idle,
            when,
            actions: vec![ActionSpec::Log {
                message: "disarmed".to_string(),
            }],
            label: "disarm".to_string(),
        });
    }

    // PLACED -> EXITED on invalidation (dwell-gated by the engine).
    if let Some(invalidate) = &invalidate {
        transitions.push(StateTransition {
            from: FsmState::Placed,
            to: FsmState::Exited,
            when: invalidate.clone(),
            actions: vec![
                ActionSpec::CancelEntries,
                ActionSpec::Log {
                    message: "invalidated".to_string(),
                },
            ],
            label: "invalidate".to_string(),
        });
    }

    // PLACED -> IDLE on timer expiry or disarm (dwell-gated).
    if let Some(when) = escape_predicate(execution, &disarm) {
        transitions.push(StateTransition {
            from: FsmState::Placed,
            to: FsmState::Idle,
            when,
            actions: vec![
                ActionSpec::CancelEntries,
                ActionSpec::Log {
                    message: "entry window expired".to_string(),
                },
            ],
            label: "disarm".to_string(),
        });
    }

    // PLACED -> MANAGING, guarded at runtime by the entry-confirmation gate.
    transitions.push(StateTransition {
        from: FsmState::Placed,
        to: FsmState::Managing,
        when: Expr::Bool(true),
        actions: vec![ActionSpec::Log {
            message: "entry filled".to_string(),
        }],
        label: "entry_filled".to_string(),
    });

    // MANAGING -> EXITED on invalidation.
    if let Some(invalidate) = invalidate {
        transitions.push(StateTransition {
            from: FsmState::Managing,
            to: FsmState::Exited,
            when: invalidate,
            actions: vec![
                ActionSpec::CancelEntries,
                ActionSpec::Log {
                    message: "invalidated".to_string(),
                },
            ],
            label: "invalidate".to_string(),
        });
    }

    transitions
}

fn escape_predicate(execution: &ExecConfig, disarm: &Option<Expr>) -> Option<Expr> {
    let timer = execution
        .entry_timeout_bars
        .map(|_| Expr::Ident(ENTRY_TIMER_EXPIRED.to_string()));
    match (timer, disarm) {
        (Some(timer), Some(disarm)) => Some(Expr::Binary {
            op: expr::BinaryOp::Or,
            lhs: Box::new(timer),
            rhs: Box::new(disarm.clone()),
        }),
        (Some(timer), None) => Some(timer),
        (None, Some(disarm)) => Some(disarm.clone()),
        (None, None) => None,
    }
}
