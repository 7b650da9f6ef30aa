use compiler::expr::EvalContext;
use compiler::lower::ENTRY_TIMER;

use crate::levels::PlanLevels;
use crate::state::RuntimeState;

/// The evaluation context rules see: bar builtins, the feature snapshot,
/// plan-scoped variables from the primary order plan, the timer flag, and
/// per-name history.
pub struct BarContext<'a> {
    pub state: &'a RuntimeState,
    /// Levels of the first order plan; rules address them as
    /// `entry`, `stop`, `eL`, `eH`, `t1`.
    pub primary_levels: Option<&'a PlanLevels>,
}

impl EvalContext for BarContext<'_> {
    fn value(&self, name: &str) -> Option<f64> {
        if let Some(bar) = self.state.current_bar() {
            match name {
                "open" => return Some(bar.open),
                "high" => return Some(bar.high),
                "low" => return Some(bar.low),
                "close" | "price" => return Some(bar.close),
                "volume" => return Some(bar.volume),
                _ => {}
            }
        }

        match name {
            "entry_timer_expired" => Some(if self.state.expired_timers.contains(ENTRY_TIMER) {
                1.0
            } else {
                0.0
            }),
            "entry" => self.primary_levels.map(|l| l.entry),
            "stop" => self.primary_levels.map(|l| l.stop),
            "eL" => self.primary_levels.map(|l| l.entry_lo),
            "eH" => self.primary_levels.map(|l| l.entry_hi),
            "t1" => self.primary_levels.map(|l| l.t1()),
            _ => self.state.features.get(name).copied(),
        }
    }

    fn history(&self, name: &str, bars_ago: usize) -> Option<f64> {
        // Bar builtins read the bar history; everything else its ring.
        let bars = &self.state.bars;
        if matches!(name, "open" | "high" | "low" | "close" | "price" | "volume") {
            if bars_ago >= bars.len() {
                return None;
            }
            let bar = &bars[bars.len() - 1 - bars_ago];
            return Some(match name {
                "open" => bar.open,
                "high" => bar.high,
                "low" => bar.low,
                "close" | "price" => bar.close,
                _ => bar.volume,
            });
        }
        self.state
            .rings
            .get(name)
            .and_then(|ring| ring.get(bars_ago))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Bar;
    use compiler::FsmState;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            timestamp_ms: ts,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
        }
    }

    #[test]
    fn builtins_read_current_bar() {
        let mut state = RuntimeState::new(FsmState::Idle);
        state.push_bar(bar(0, 100.0));
        state.push_bar(bar(60_000, 101.0));
        let ctx = BarContext {
            state: &state,
            primary_levels: None,
        };
        assert_eq!(ctx.value("close"), Some(101.0));
        assert_eq!(ctx.value("price"), Some(101.0));
        assert_eq!(ctx.history("close", 1), Some(100.0));
        assert_eq!(ctx.history("close", 2), None);
    }

    #[test]
    fn feature_history_reads_ring() {
        let mut state = RuntimeState::new(FsmState::Idle);
        state.record_feature("rsi", 40.0);
        state.record_feature("rsi", 35.0);
        let ctx = BarContext {
            state: &state,
            primary_levels: None,
        };
        assert_eq!(ctx.value("rsi"), Some(35.0));
        assert_eq!(ctx.history("rsi", 0), Some(35.0));
        assert_eq!(ctx.history("rsi", 1), Some(40.0));
        assert_eq!(ctx.history("rsi", 2), None);
    }

    #[test]
    fn timer_flag_reflects_expiry() {
        let mut state = RuntimeState::new(FsmState::Armed);
        {
            let ctx = BarContext {
                state: &state,
                primary_levels: None,
            };
            assert_eq!(ctx.value("entry_timer_expired"), Some(0.0));
        }
        state.start_timer(ENTRY_TIMER, 1);
        state.tick_timers();
        let ctx = BarContext {
            state: &state,
            primary_levels: None,
        };
        assert_eq!(ctx.value("entry_timer_expired"), Some(1.0));
    }
}
