use std::collections::{BTreeMap, BTreeSet, VecDeque};

use common::{Bar, Order};
use compiler::FsmState;

/// How many bars of history an instance retains.
pub const BAR_HISTORY_CAP: usize = 200;

/// Ring depth per feature.
pub const FEATURE_HISTORY_CAP: usize = 100;

/// One line of the per-instance activity log.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub bar_count: u64,
    pub timestamp_ms: i64,
    pub message: String,
}

/// Mutable per-instance runtime state. Everything the FSM owns between bars
/// lives here; the engine wraps it with the bar-processing contract.
pub struct RuntimeState {
    pub state: FsmState,
    /// All bars processed, warm-up included.
    pub bar_count: u64,
    /// Bars since the last committed transition.
    pub state_bar_count: u64,
    /// Oldest first, current bar last. Capped at `BAR_HISTORY_CAP`.
    pub bars: Vec<Bar>,
    /// Feature snapshot for the current bar.
    pub features: BTreeMap<String, f64>,
    /// Per-feature rings, newest at the front. `rings[name][0]` is the
    /// current bar's value.
    pub rings: BTreeMap<String, VecDeque<f64>>,
    pub open_orders: Vec<Order>,
    /// Signed position: positive long, negative short.
    pub position_size: f64,
    /// Bar-countdown timers: name -> bars remaining.
    pub timers: BTreeMap<String, u32>,
    /// Timers that have counted down to zero and not been cleared.
    pub expired_timers: BTreeSet<String>,
    pub levels_frozen: bool,
    /// Realized PnL for the current session, fed to the loss-limit guard.
    pub daily_pnl: f64,
    /// Append-only; the owner may trim via `trim_log`.
    pub log: Vec<ActivityEntry>,
}

impl RuntimeState {
    pub fn new(initial: FsmState) -> Self {
        Self {
            state: initial,
            bar_count: 0,
            state_bar_count: 0,
            bars: Vec::new(),
            features: BTreeMap::new(),
            rings: BTreeMap::new(),
            open_orders: Vec::new(),
            position_size: 0.0,
            timers: BTreeMap::new(),
            expired_timers: BTreeSet::new(),
            levels_frozen: false,
            daily_pnl: 0.0,
            log: Vec::new(),
        }
    }

    pub fn push_bar(&mut self, bar: Bar) {
        self.bars.push(bar);
        if self.bars.len() > BAR_HISTORY_CAP {
            self.bars.remove(0);
        }
    }

    pub fn current_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn record_feature(&mut self, name: &str, value: f64) {
        self.features.insert(name.to_string(), value);
        let ring = self.rings.entry(name.to_string()).or_default();
        ring.push_front(value);
        if ring.len() > FEATURE_HISTORY_CAP {
            ring.pop_back();
        }
    }

    /// Decrement every running timer; a timer reaching zero moves to the
    /// expired set.
    pub fn tick_timers(&mut self) {
        let mut fired = Vec::new();
        for (name, remaining) in self.timers.iter_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                fired.push(name.clone());
            }
        }
        for name in fired {
            self.timers.remove(&name);
            self.expired_timers.insert(name);
        }
    }

    pub fn start_timer(&mut self, name: &str, bars: u32) {
        self.expired_timers.remove(name);
        if bars == 0 {
            self.expired_timers.insert(name.to_string());
        } else {
            self.timers.insert(name.to_string(), bars);
        }
    }

    /// Timers do not survive a state change.
    pub fn clear_timers(&mut self) {
        self.timers.clear();
        self.expired_timers.clear();
    }

    pub fn log_line(&mut self, message: impl Into<String>) {
        let (bar_count, timestamp_ms) = match self.current_bar() {
            Some(bar) => (self.bar_count, bar.timestamp_ms),
            None => (self.bar_count, 0),
        };
        self.log.push(ActivityEntry {
            bar_count,
            timestamp_ms,
            message: message.into(),
        });
    }

    /// Drop the oldest log entries, keeping the newest `keep`.
    pub fn trim_log(&mut self, keep: usize) {
        if self.log.len() > keep {
            let drop = self.log.len() - keep;
            self.log.drain(..drop);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_history_is_capped() {
        let mut state = RuntimeState::new(FsmState::Idle);
        for i in 0..(BAR_HISTORY_CAP + 10) {
            state.push_bar(Bar {
                timestamp_ms: i as i64 * 60_000,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
            });
        }
        assert_eq!(state.bars.len(), BAR_HISTORY_CAP);
        assert_eq!(state.bars[0].timestamp_ms, 10 * 60_000);
    }

    #[test]
    fn feature_ring_keeps_newest_first() {
        let mut state = RuntimeState::new(FsmState::Idle);
        for i in 0..5 {
            state.record_feature("rsi", i as f64);
        }
        let ring = &state.rings["rsi"];
        assert_eq!(ring[0], 4.0);
        assert_eq!(ring[4], 0.0);
    }

    #[test]
    fn feature_ring_is_capped() {
        let mut state = RuntimeState::new(FsmState::Idle);
        for i in 0..(FEATURE_HISTORY_CAP + 5) {
            state.record_feature("x", i as f64);
        }
        assert_eq!(state.rings["x"].len(), FEATURE_HISTORY_CAP);
    }

    #[test]
    fn timer_expires_after_countdown() {
        let mut state = RuntimeState::new(FsmState::Armed);
        state.start_timer("entry_timeout", 2);
        state.tick_timers();
        assert!(state.expired_timers.is_empty());
        state.tick_timers();
        assert!(state.expired_timers.contains("entry_timeout"));
        assert!(state.timers.is_empty());
    }

    #[test]
    fn zero_bar_timer_expires_immediately() {
        let mut state = RuntimeState::new(FsmState::Armed);
        state.start_timer("t", 0);
        assert!(state.expired_timers.contains("t"));
    }

    #[test]
    fn trim_log_keeps_newest() {
        let mut state = RuntimeState::new(FsmState::Idle);
        for i in 0..10 {
            state.log_line(format!("line {i}"));
        }
        state.trim_log(3);
        assert_eq!(state.log.len(), 3);
        assert_eq!(state.log[0].message, "line 7");
    }
}
