use common::{hours, Bar, Timeframe};

/// A hole in a bar sequence that overlaps market hours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    /// Timestamp of the first missing bar.
    pub start_ms: i64,
    /// Timestamp of the first bar after the hole (exclusive end).
    pub end_ms: i64,
    pub missing_bars: u32,
}

/// Scan consecutive bars for gaps: a step larger than 1.5x the expected
/// interval whose missing span overlaps regular trading hours. Overnight
/// and weekend silence is not a gap.
pub fn detect_gaps(bars: &[Bar], timeframe: Timeframe) -> Vec<Gap> {
    let interval = timeframe.duration_ms();
    let mut gaps = Vec::new();

    for pair in bars.windows(2) {
        let delta = pair[1].timestamp_ms - pair[0].timestamp_ms;
        if delta as f64 <= interval as f64 * 1.5 {
            continue;
        }
        let start_ms = pair[0].timestamp_ms + interval;
        let end_ms = pair[1].timestamp_ms;
        if !hours::overlaps_rth(start_ms, end_ms) {
            continue;
        }
        gaps.push(Gap {
            start_ms,
            end_ms,
            missing_bars: ((delta / interval) - 1).max(1) as u32,
        });
    }

    gaps
}
