use std::collections::BTreeSet;

use common::{Error, OrderSide, Result};

use crate::document::{OrderPlanDoc, StrategyDoc};
use crate::ir::PlanIr;

fn schema_err(path: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::Schema {
        path: path.into(),
        reason: reason.into(),
    }
}

/// Stage 1: shape-level validation of the declarative document, before any
/// expression is parsed.
pub fn schema(doc: &StrategyDoc) -> Result<()> {
    let meta = doc
        .meta
        .as_ref()
        .ok_or_else(|| schema_err("meta", "section is required"))?;
    match meta.symbol.as_deref() {
        Some(s) if !s.trim().is_empty() => {}
        _ => return Err(schema_err("meta.symbol", "symbol is required")),
    }
    let tf = meta
        .timeframe
        .as_deref()
        .ok_or_else(|| schema_err("meta.timeframe", "timeframe is required"))?;
    tf.parse::<common::Timeframe>()
        .map_err(|_| schema_err("meta.timeframe", format!("unknown timeframe '{tf}'")))?;

    let rules = doc
        .rules
        .as_ref()
        .ok_or_else(|| schema_err("rules", "section is required"))?;
    match rules.trigger.as_deref() {
        Some(r) if !r.trim().is_empty() => {}
        _ => return Err(schema_err("rules.trigger", "trigger rule is required")),
    }

    if doc.order_plans.is_empty() {
        return Err(schema_err("order_plans", "at least one order plan is required"));
    }
    for (i, plan) in doc.order_plans.iter().enumerate() {
        plan_shape(plan, i)?;
    }

    let mut seen = BTreeSet::new();
    for decl in &doc.features {
        if !seen.insert(decl.name.as_str()) {
            return Err(schema_err(
                format!("features.{}", decl.name),
                "duplicate feature name",
            ));
        }
    }

    if let Some(exec) = &doc.execution {
        if let Some(freeze) = exec.freeze_levels_on.as_deref() {
            if freeze != "armed" && freeze != "triggered" {
                return Err(schema_err(
                    "execution.freeze_levels_on",
                    format!("expected 'armed' or 'triggered', got '{freeze}'"),
                ));
            }
        }
    }

    if let Some(risk) = &doc.risk {
        if let Some(r) = risk.max_risk_per_trade {
            if !(r > 0.0 && r <= 1.0) {
                return Err(schema_err(
                    "risk.max_risk_per_trade",
                    format!("must be in (0, 1], got {r}"),
                ));
            }
        }
    }

    Ok(())
}

fn plan_shape(plan: &OrderPlanDoc, index: usize) -> Result<()> {
    let path = |field: &str| format!("order_plans[{index}].{field}");

    if plan.side.is_none() {
        return Err(schema_err(path("side"), "side is required"));
    }
    match plan.qty {
        Some(q) if q > 0.0 => {}
        Some(q) => return Err(schema_err(path("qty"), format!("must be positive, got {q}"))),
        None => return Err(schema_err(path("qty"), "qty is required")),
    }
    if plan.entry.is_none() {
        return Err(schema_err(path("entry"), "entry level is required"));
    }
    if plan.stop.is_none() {
        return Err(schema_err(path("stop"), "stop level is required"));
    }
    if let Some(zone) = &plan.entry_zone {
        if zone.len() != 2 {
            return Err(schema_err(
                path("entry_zone"),
                format!("expected [low, high], got {} element(s)", zone.len()),
            ));
        }
    }
    if plan.targets.is_empty() {
        return Err(schema_err(path("targets"), "at least one target is required"));
    }

    let mut ratio_sum = 0.0;
    for (j, target) in plan.targets.iter().enumerate() {
        if !(0.0..=1.0).contains(&target.ratio) {
            return Err(schema_err(
                format!("order_plans[{index}].targets[{j}].ratio"),
                format!("must be in [0, 1], got {}", target.ratio),
            ));
        }
        ratio_sum += target.ratio;
    }
    if (ratio_sum - 1.0).abs() > 1e-6 {
        return Err(schema_err(
            path("targets"),
            format!("ratios sum to {ratio_sum}, expected 1.0"),
        ));
    }

    Ok(())
}

/// Stage 6: level-ordering invariants, checked on the static snapshots.
/// Dynamic levels are skipped here and rechecked at runtime.
pub fn plan_invariants(plan: &PlanIr) -> Result<()> {
    let fail = |reason: String| {
        Err(Error::Schema {
            path: format!("order_plans.{}", plan.id),
            reason,
        })
    };

    let lo = plan.entry_lo.static_value();
    let hi = plan.entry_hi.static_value();
    let stop = plan.stop.static_value();

    if let (Some(lo), Some(hi)) = (lo, hi) {
        if lo > hi {
            return fail(format!("entry zone inverted: {lo} > {hi}"));
        }
    }

    match plan.side {
        OrderSide::Buy => {
            if let (Some(stop), Some(lo)) = (stop, lo) {
                if stop >= lo {
                    return fail(format!("BUY stop {stop} must be below entry zone low {lo}"));
                }
            }
            if let Some(hi) = hi {
                for t in &plan.targets {
                    if let Some(price) = t.price.static_value() {
                        if price <= hi {
                            return fail(format!(
                                "BUY target {price} must be above entry zone high {hi}"
                            ));
                        }
                    }
                }
            }
        }
        OrderSide::Sell => {
            if let (Some(stop), Some(hi)) = (stop, hi) {
                if stop <= hi {
                    return fail(format!("SELL stop {stop} must be above entry zone high {hi}"));
                }
            }
            if let Some(lo) = lo {
                for t in &plan.targets {
                    if let Some(price) = t.price.static_value() {
                        if price >= lo {
                            return fail(format!(
                                "SELL target {price} must be below entry zone low {lo}"
                            ));
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
