//! Per-strategy FSM execution engine: bar loop, transitions, actions and
//! warm-up replay.

mod actions;
mod context;
mod engine;
mod levels;
mod replay;
mod state;

pub use engine::StrategyEngine;
pub use levels::PlanLevels;
pub use replay::{warm_up, warmup_window};
pub use state::{ActivityEntry, RuntimeState, BAR_HISTORY_CAP, FEATURE_HISTORY_CAP};
