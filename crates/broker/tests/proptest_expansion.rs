use proptest::prelude::*;

use broker::expand_brackets;
use common::{BracketTarget, OrderPlan, OrderSide, PlanMode};

fn plan_with(qty: f64, raw_ratios: Vec<f64>) -> OrderPlan {
    // Normalize arbitrary positive weights into ratios summing to 1.0.
    let total: f64 = raw_ratios.iter().sum();
    let targets = raw_ratios
        .iter()
        .enumerate()
        .map(|(i, &w)| BracketTarget {
            price: 110.0 + i as f64,
            ratio: w / total,
        })
        .collect();
    OrderPlan {
        id: "p".to_string(),
        symbol: "SPY".to_string(),
        side: OrderSide::Buy,
        qty,
        entry_price: 100.0,
        entry_lo: 99.0,
        entry_hi: 101.0,
        stop_price: 95.0,
        targets,
        mode: PlanMode::SplitBracket,
    }
}

proptest! {
    /// Child quantities always sum exactly to the plan quantity, whatever
    /// the ratio split, with the remainder absorbed by the last child.
    #[test]
    fn split_children_conserve_quantity(
        qty in 1.0f64..5_000.0,
        weights in proptest::collection::vec(0.05f64..1.0, 1..6),
    ) {
        let qty = qty.round();
        let plan = plan_with(qty, weights);
        let brackets = expand_brackets(&plan);

        prop_assert_eq!(brackets.len(), plan.targets.len());
        let total: f64 = brackets.iter().map(|b| b.qty).sum();
        prop_assert!((total - qty).abs() < 1e-9, "children sum {} != {}", total, qty);
    }

    /// Every non-final child is a whole-unit rounding of its ratio share.
    #[test]
    fn non_final_children_are_rounded_shares(
        qty in 1.0f64..5_000.0,
        weights in proptest::collection::vec(0.05f64..1.0, 2..6),
    ) {
        let qty = qty.round();
        let plan = plan_with(qty, weights);
        let brackets = expand_brackets(&plan);

        for (bracket, target) in brackets.iter().zip(&plan.targets).take(brackets.len() - 1) {
            prop_assert_eq!(bracket.qty, (qty * target.ratio).round());
        }
    }
}
