use common::{BracketTarget, OrderPlan};
use compiler::expr::{evaluate, EvalContext};
use compiler::{LevelSpec, PlanIr};

/// Numeric snapshot of one order plan's price levels, recomputed each bar
/// from the dynamic expressions until levels freeze.
#[derive(Debug, Clone)]
pub struct PlanLevels {
    pub plan_id: String,
    pub entry: f64,
    pub entry_lo: f64,
    pub entry_hi: f64,
    pub stop: f64,
    pub targets: Vec<f64>,
    /// False until every dynamic expression has produced a finite value at
    /// least once. Freezing is deferred while false.
    pub materialized: bool,
}

impl PlanLevels {
    /// Seed from the IR's static values; dynamic levels start as NaN until
    /// the first refresh.
    pub fn seed(plan: &PlanIr) -> Self {
        let seed_level = |level: &LevelSpec| level.static_value().unwrap_or(f64::NAN);
        Self {
            plan_id: plan.id.clone(),
            entry: seed_level(&plan.entry),
            entry_lo: seed_level(&plan.entry_lo),
            entry_hi: seed_level(&plan.entry_hi),
            stop: seed_level(&plan.stop),
            targets: plan.targets.iter().map(|t| seed_level(&t.price)).collect(),
            materialized: plan.entry.static_value().is_some()
                && plan.entry_lo.static_value().is_some()
                && plan.entry_hi.static_value().is_some()
                && plan.stop.static_value().is_some()
                && plan.targets.iter().all(|t| t.price.static_value().is_some()),
        }
    }

    /// First target price, exposed to expressions as `t1`.
    pub fn t1(&self) -> f64 {
        self.targets.first().copied().unwrap_or(f64::NAN)
    }

    /// Materialize a broker-ready plan at the current levels.
    pub fn to_order_plan(&self, plan: &PlanIr, symbol: &str, qty: f64) -> OrderPlan {
        OrderPlan {
            id: plan.id.clone(),
            symbol: symbol.to_string(),
            side: plan.side,
            qty,
            entry_price: self.entry,
            entry_lo: self.entry_lo,
            entry_hi: self.entry_hi,
            stop_price: self.stop,
            targets: plan
                .targets
                .iter()
                .zip(&self.targets)
                .map(|(t, &price)| BracketTarget {
                    price,
                    ratio: t.ratio,
                })
                .collect(),
            mode: plan.mode,
        }
    }
}

/// A context wrapper that overlays the plan-scoped variables (`entry`,
/// `stop`, `eL`, `eH`, `t1`) on top of the bar/feature context.
pub struct PlanScope<'a> {
    pub inner: &'a dyn EvalContext,
    pub entry: f64,
    pub stop: f64,
    pub e_lo: f64,
    pub e_hi: f64,
    pub t1: f64,
}

impl EvalContext for PlanScope<'_> {
    fn value(&self, name: &str) -> Option<f64> {
        match name {
            "entry" => Some(self.entry),
            "stop" => Some(self.stop),
            "eL" => Some(self.e_lo),
            "eH" => Some(self.e_hi),
            "t1" => Some(self.t1),
            _ => self.inner.value(name),
        }
    }

    fn history(&self, name: &str, bars_ago: usize) -> Option<f64> {
        self.inner.history(name, bars_ago)
    }
}

/// Re-evaluate the dynamic levels of one plan.
///
/// Levels update progressively in a fixed order (entry, zone low, zone
/// high, stop, targets), so a later expression sees the values already
/// recomputed this bar. An expression error leaves that level at its
/// previous value and is reported to the caller for logging.
pub fn refresh(
    levels: &mut PlanLevels,
    plan: &PlanIr,
    ctx: &dyn EvalContext,
) -> Vec<common::Error> {
    let mut errors = Vec::new();

    let mut eval_into = |slot: &mut f64, spec: &LevelSpec, snapshot: &PlanLevels| {
        let LevelSpec::Dynamic(expr) = spec else {
            return;
        };
        let scoped = PlanScope {
            inner: ctx,
            entry: snapshot.entry,
            stop: snapshot.stop,
            e_lo: snapshot.entry_lo,
            e_hi: snapshot.entry_hi,
            t1: snapshot.t1(),
        };
        match evaluate(expr, &scoped) {
            Ok(value) => *slot = value.as_num(),
            Err(e) => errors.push(e),
        }
    };

    let mut snapshot = levels.clone();
    eval_into(&mut levels.entry, &plan.entry, &snapshot);
    snapshot.entry = levels.entry;
    eval_into(&mut levels.entry_lo, &plan.entry_lo, &snapshot);
    snapshot.entry_lo = levels.entry_lo;
    eval_into(&mut levels.entry_hi, &plan.entry_hi, &snapshot);
    snapshot.entry_hi = levels.entry_hi;
    eval_into(&mut levels.stop, &plan.stop, &snapshot);
    snapshot.stop = levels.stop;
    for (i, target) in plan.targets.iter().enumerate() {
        eval_into(&mut levels.targets[i], &target.price, &snapshot);
        snapshot.targets[i] = levels.targets[i];
    }

    if !levels.materialized {
        let all_finite = levels.entry.is_finite()
            && levels.entry_lo.is_finite()
            && levels.entry_hi.is_finite()
            && levels.stop.is_finite()
            && levels.targets.iter().all(|t| t.is_finite());
        levels.materialized = all_finite;
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use compiler::expr::parse;
    use compiler::{LevelSpec, PlanIr, TargetIr};
    use common::{OrderSide, PlanMode};
    use std::collections::HashMap;

    struct MapCtx(HashMap<String, f64>);

    impl EvalContext for MapCtx {
        fn value(&self, name: &str) -> Option<f64> {
            self.0.get(name).copied()
        }
        fn history(&self, _: &str, _: usize) -> Option<f64> {
            None
        }
    }

    fn dynamic_plan() -> PlanIr {
        PlanIr {
            id: "p1".into(),
            side: OrderSide::Buy,
            qty: 10.0,
            entry: LevelSpec::Static(100.0),
            entry_lo: LevelSpec::Static(99.5),
            entry_hi: LevelSpec::Static(100.5),
            stop: LevelSpec::Dynamic(parse("close - 1.2 * atr", "test").unwrap()),
            targets: vec![TargetIr {
                price: LevelSpec::Dynamic(parse("entry + 2 * (entry - stop)", "test").unwrap()),
                ratio: 1.0,
            }],
            mode: PlanMode::Single,
        }
    }

    #[test]
    fn seed_marks_fully_static_plans_materialized() {
        let plan = PlanIr {
            stop: LevelSpec::Static(95.0),
            targets: vec![TargetIr {
                price: LevelSpec::Static(110.0),
                ratio: 1.0,
            }],
            ..dynamic_plan()
        };
        assert!(PlanLevels::seed(&plan).materialized);
    }

    #[test]
    fn refresh_computes_dynamic_stop_and_target() {
        let plan = dynamic_plan();
        let mut levels = PlanLevels::seed(&plan);
        assert!(!levels.materialized);

        let ctx = MapCtx(HashMap::from([
            ("close".to_string(), 101.0),
            ("atr".to_string(), 2.5),
        ]));
        let errors = refresh(&mut levels, &plan, &ctx);
        assert!(errors.is_empty());

        let expected_stop = 101.0 - 1.2 * 2.5;
        assert!((levels.stop - expected_stop).abs() < 1e-9);
        // Target sees the stop recomputed this bar.
        let expected_target = 100.0 + 2.0 * (100.0 - expected_stop);
        assert!((levels.targets[0] - expected_target).abs() < 1e-9);
        assert!(levels.materialized);
    }

    #[test]
    fn eval_error_keeps_previous_value() {
        let plan = PlanIr {
            stop: LevelSpec::Dynamic(parse("missing_feature - 1", "test").unwrap()),
            ..dynamic_plan()
        };
        let mut levels = PlanLevels::seed(&plan);
        levels.stop = 97.0;

        let ctx = MapCtx(HashMap::new());
        let errors = refresh(&mut levels, &plan, &ctx);
        assert_eq!(errors.len(), 1);
        assert!((levels.stop - 97.0).abs() < 1e-9);
        // The target still recomputes, reading the retained stop.
        assert!((levels.targets[0] - 106.0).abs() < 1e-9);
    }
}
