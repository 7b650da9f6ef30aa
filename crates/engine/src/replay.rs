use tracing::info;

use common::{Bar, Result};
use compiler::CompiledIr;

use crate::engine::StrategyEngine;
use crate::state::BAR_HISTORY_CAP;

/// Bars of history to feed a fresh engine before its first live bar: the
/// largest feature lookback, bounded by history retention.
pub fn warmup_window(ir: &CompiledIr) -> usize {
    ir.max_lookback().min(BAR_HISTORY_CAP)
}

/// Replay a back-window of historical bars through the engine.
///
/// Side effects are suppressed by the replay flag carried through the
/// action dispatcher; features, timers and transitions still run, so the
/// engine arrives at the correct state for the first live bar.
pub async fn warm_up(engine: &mut StrategyEngine, bars: &[Bar]) -> Result<()> {
    for bar in bars {
        engine.process_bar(bar, true).await?;
    }
    info!(
        symbol = %engine.symbol(),
        bars = bars.len(),
        state = %engine.fsm_state(),
        "warm-up replay complete"
    );
    Ok(())
}
