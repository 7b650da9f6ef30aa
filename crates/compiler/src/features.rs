use std::collections::BTreeMap;

use common::{Bar, Error, Result};

use crate::ir::{FeatureKind, FeatureSpec};

/// What a feature compute sees: the current bar, the bar window (oldest
/// first, current bar last), and every feature earlier in the plan already
/// computed for this bar.
pub struct FeatureCtx<'a> {
    pub bar: &'a Bar,
    pub window: &'a [Bar],
    pub computed: &'a BTreeMap<String, f64>,
}

impl FeatureCtx<'_> {
    fn closes(&self) -> Vec<f64> {
        self.window.iter().map(|b| b.close).collect()
    }

    fn prev(&self) -> Option<&Bar> {
        if self.window.len() >= 2 {
            self.window.get(self.window.len() - 2)
        } else {
            None
        }
    }

    fn dep(&self, name: &str) -> f64 {
        self.computed.get(name).copied().unwrap_or(f64::NAN)
    }
}

type Compute = Box<dyn Fn(&FeatureCtx) -> Result<f64> + Send + Sync>;

/// A feature-plan entry bound to its compute function. Produced from a
/// `FeatureSpec` at engine start; the IR itself stays pure data.
pub struct BoundFeature {
    pub name: String,
    pub kind: FeatureKind,
    pub deps: Vec<String>,
    pub lookback: usize,
    compute: Compute,
}

impl BoundFeature {
    pub fn compute(&self, ctx: &FeatureCtx) -> Result<f64> {
        (self.compute)(ctx)
    }
}

/// Bar builtins usable in any expression without declaration.
pub const BAR_BUILTINS: &[&str] = &["open", "high", "low", "close", "volume", "price"];

/// Registry id -> kind, for every built-in the compiler accepts.
pub fn kind_of(indicator: &str) -> Option<FeatureKind> {
    let kind = match indicator {
        "open" | "high" | "low" | "close" | "volume" | "price" => FeatureKind::Builtin,
        "sma" | "ema" | "rsi" | "macd" | "macd_signal" | "macd_histogram" | "atr"
        | "true_range" | "bollinger_upper" | "bollinger_lower" | "bollinger_width"
        | "volume_sma" | "vwap" => FeatureKind::Indicator,
        "bar_range" | "body_ratio" | "upper_wick" | "lower_wick" | "close_position"
        | "gap_pct" => FeatureKind::Microstructure,
        _ => return None,
    };
    Some(kind)
}

/// Fixed dependency list per registry entry. Dependencies name other
/// *declared* features; the compiler turns them into DAG edges.
pub fn deps_of(indicator: &str) -> &'static [&'static str] {
    match indicator {
        "macd_signal" => &["macd"],
        "macd_histogram" => &["macd", "macd_signal"],
        "bollinger_width" => &["bollinger_upper", "bollinger_lower"],
        _ => &[],
    }
}

/// Bars of history the compute needs before it stops returning NaN.
pub fn lookback(indicator: &str, params: &BTreeMap<String, f64>) -> usize {
    let period = param(params, "period", default_period(indicator)) as usize;
    match indicator {
        "open" | "high" | "low" | "close" | "volume" | "price" | "bar_range"
        | "body_ratio" | "upper_wick" | "lower_wick" | "close_position" => 1,
        "gap_pct" | "true_range" => 2,
        "sma" | "volume_sma" | "vwap" | "bollinger_upper" | "bollinger_lower"
        | "bollinger_width" => period,
        "ema" => period * 3,
        "rsi" | "atr" => period + 1,
        "macd" => param(params, "slow", 26.0) as usize * 3,
        "macd_signal" | "macd_histogram" => {
            (param(params, "slow", 26.0) + param(params, "signal", 9.0)) as usize * 3
        }
        _ => period,
    }
}

fn default_period(indicator: &str) -> f64 {
    match indicator {
        "rsi" | "atr" => 14.0,
        "bollinger_upper" | "bollinger_lower" | "bollinger_width" => 20.0,
        _ => 20.0,
    }
}

fn param(params: &BTreeMap<String, f64>, key: &str, default: f64) -> f64 {
    params.get(key).copied().unwrap_or(default)
}

/// Bind a plan entry to its compute function. Fails on an unknown registry
/// id (the compiler catches this earlier; engine start rechecks).
pub fn bind(spec: &FeatureSpec) -> Result<BoundFeature> {
    let indicator = spec.indicator.clone();
    let kind = kind_of(&indicator).ok_or_else(|| Error::Name {
        symbol: indicator.clone(),
        location: format!("features.{}", spec.name),
    })?;

    let p = spec.params.clone();
    let period = param(&p, "period", default_period(&indicator)) as usize;
    let fast = param(&p, "fast", 12.0) as usize;
    let slow = param(&p, "slow", 26.0) as usize;
    let signal = param(&p, "signal", 9.0) as usize;
    let k = param(&p, "k", 2.0);
    let dep_names: Vec<String> = spec.deps.clone();

    let compute: Compute = match indicator.as_str() {
        "open" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.open)),
        "high" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.high)),
        "low" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.low)),
        "close" | "price" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.close)),
        "volume" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.volume)),

        "sma" => Box::new(move |ctx: &FeatureCtx| Ok(mean_tail(&ctx.closes(), period))),
        "ema" => Box::new(move |ctx: &FeatureCtx| Ok(ema_tail(&ctx.closes(), period))),
        "rsi" => Box::new(move |ctx: &FeatureCtx| Ok(wilder_rsi(&ctx.closes(), period))),
        "macd" => Box::new(move |ctx: &FeatureCtx| {
            let closes = ctx.closes();
            Ok(macd_line(&closes, fast, slow))
        }),
        "macd_signal" => Box::new(move |ctx: &FeatureCtx| {
            let closes = ctx.closes();
            Ok(macd_signal_line(&closes, fast, slow, signal))
        }),
        "macd_histogram" => {
            let macd_dep = dep_names.first().cloned().unwrap_or_else(|| "macd".into());
            let sig_dep = dep_names
                .get(1)
                .cloned()
                .unwrap_or_else(|| "macd_signal".into());
            Box::new(move |ctx: &FeatureCtx| Ok(ctx.dep(&macd_dep) - ctx.dep(&sig_dep)))
        }
        "atr" => Box::new(move |ctx: &FeatureCtx| Ok(wilder_atr(ctx.window, period))),
        "true_range" => Box::new(|ctx: &FeatureCtx| {
            Ok(ctx
                .prev()
                .map(|prev| true_range(ctx.bar, prev))
                .unwrap_or(f64::NAN))
        }),
        "bollinger_upper" => Box::new(move |ctx: &FeatureCtx| {
            let closes = ctx.closes();
            Ok(mean_tail(&closes, period) + k * stddev_tail(&closes, period))
        }),
        "bollinger_lower" => Box::new(move |ctx: &FeatureCtx| {
            let closes = ctx.closes();
            Ok(mean_tail(&closes, period) - k * stddev_tail(&closes, period))
        }),
        "bollinger_width" => {
            let upper_dep = dep_names
                .first()
                .cloned()
                .unwrap_or_else(|| "bollinger_upper".into());
            let lower_dep = dep_names
                .get(1)
                .cloned()
                .unwrap_or_else(|| "bollinger_lower".into());
            Box::new(move |ctx: &FeatureCtx| Ok(ctx.dep(&upper_dep) - ctx.dep(&lower_dep)))
        }
        "volume_sma" => Box::new(move |ctx: &FeatureCtx| {
            let volumes: Vec<f64> = ctx.window.iter().map(|b| b.volume).collect();
            Ok(mean_tail(&volumes, period))
        }),
        "vwap" => Box::new(move |ctx: &FeatureCtx| Ok(rolling_vwap(ctx.window, period))),

        "bar_range" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.high - ctx.bar.low)),
        "body_ratio" => Box::new(|ctx: &FeatureCtx| {
            let range = ctx.bar.high - ctx.bar.low;
            if range <= 0.0 {
                Ok(0.0)
            } else {
                Ok((ctx.bar.close - ctx.bar.open).abs() / range)
            }
        }),
        "upper_wick" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.high - ctx.bar.open.max(ctx.bar.close))),
        "lower_wick" => Box::new(|ctx: &FeatureCtx| Ok(ctx.bar.open.min(ctx.bar.close) - ctx.bar.low)),
        "close_position" => Box::new(|ctx: &FeatureCtx| {
            let range = ctx.bar.high - ctx.bar.low;
            if range <= 0.0 {
                Ok(0.5)
            } else {
                Ok((ctx.bar.close - ctx.bar.low) / range)
            }
        }),
        "gap_pct" => Box::new(|ctx: &FeatureCtx| {
            Ok(ctx
                .prev()
                .map(|prev| {
                    if prev.close == 0.0 {
                        f64::NAN
                    } else {
                        (ctx.bar.open - prev.close) / prev.close * 100.0
                    }
                })
                .unwrap_or(f64::NAN))
        }),

        other => {
            return Err(Error::Name {
                symbol: other.to_string(),
                location: format!("features.{}", spec.name),
            })
        }
    };

    Ok(BoundFeature {
        name: spec.name.clone(),
        kind,
        deps: spec.deps.clone(),
        lookback: lookback(&indicator, &spec.params),
        compute,
    })
}

// ─── Indicator math ───────────────────────────────────────────────────────────

fn mean_tail(data: &[f64], period: usize) -> f64 {
    if period == 0 || data.len() < period {
        return f64::NAN;
    }
    let tail = &data[data.len() - period..];
    tail.iter().sum::<f64>() / period as f64
}

fn stddev_tail(data: &[f64], period: usize) -> f64 {
    if period == 0 || data.len() < period {
        return f64::NAN;
    }
    let tail = &data[data.len() - period..];
    let mean = tail.iter().sum::<f64>() / period as f64;
    let var = tail.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    var.sqrt()
}

/// Exponential moving average of the tail of `data`.
/// Seeded with the SMA of the first `period` values of the considered slice.
fn ema_tail(data: &[f64], period: usize) -> f64 {
    if period == 0 || data.len() < period {
        return f64::NAN;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let start = data.len().saturating_sub(period * 3); // enough history
    let slice = &data[start..];

    let seed_len = period.min(slice.len());
    let mut ema_val: f64 = slice[..seed_len].iter().sum::<f64>() / seed_len as f64;
    for &value in &slice[seed_len..] {
        ema_val = value * k + ema_val * (1.0 - k);
    }
    ema_val
}

/// Wilder's smoothed RSI, the standard charting definition.
fn wilder_rsi(closes: &[f64], period: usize) -> f64 {
    if period < 2 || closes.len() < period + 1 {
        return f64::NAN;
    }

    let changes: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let initial = &changes[..period];

    let mut avg_gain = initial.iter().filter(|&&c| c > 0.0).sum::<f64>() / period as f64;
    let mut avg_loss =
        initial.iter().filter(|&&c| c < 0.0).map(|c| c.abs()).sum::<f64>() / period as f64;

    for &change in &changes[period..] {
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { change.abs() } else { 0.0 };
        avg_gain = (avg_gain * (period - 1) as f64 + gain) / period as f64;
        avg_loss = (avg_loss * (period - 1) as f64 + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

fn macd_line(closes: &[f64], fast: usize, slow: usize) -> f64 {
    if closes.len() < slow {
        return f64::NAN;
    }
    ema_tail(closes, fast) - ema_tail(closes, slow)
}

/// EMA of the MACD line over the last `signal` values of its series.
fn macd_signal_line(closes: &[f64], fast: usize, slow: usize, signal: usize) -> f64 {
    if closes.len() < slow + signal {
        return f64::NAN;
    }
    let series_len = (signal * 3).min(closes.len() - slow + 1);
    let macd_series: Vec<f64> = (0..series_len)
        .map(|i| {
            let end = closes.len() - (series_len - 1 - i);
            macd_line(&closes[..end], fast, slow)
        })
        .collect();
    ema_tail(&macd_series, signal)
}

fn true_range(bar: &Bar, prev: &Bar) -> f64 {
    let hl = bar.high - bar.low;
    let hc = (bar.high - prev.close).abs();
    let lc = (bar.low - prev.close).abs();
    hl.max(hc).max(lc)
}

/// Wilder-smoothed average true range.
fn wilder_atr(window: &[Bar], period: usize) -> f64 {
    if period == 0 || window.len() < period + 1 {
        return f64::NAN;
    }
    let trs: Vec<f64> = window
        .windows(2)
        .map(|w| true_range(&w[1], &w[0]))
        .collect();

    let mut atr = trs[..period].iter().sum::<f64>() / period as f64;
    for &tr in &trs[period..] {
        atr = (atr * (period - 1) as f64 + tr) / period as f64;
    }
    atr
}

/// Volume-weighted average of the typical price over the last `period` bars.
fn rolling_vwap(window: &[Bar], period: usize) -> f64 {
    if period == 0 || window.len() < period {
        return f64::NAN;
    }
    let tail = &window[window.len() - period..];
    let vol: f64 = tail.iter().map(|b| b.volume).sum();
    if vol <= 0.0 {
        return f64::NAN;
    }
    let pv: f64 = tail
        .iter()
        .map(|b| (b.high + b.low + b.close) / 3.0 * b.volume)
        .sum();
    pv / vol
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(ts: i64, close: f64) -> Bar {
        Bar {
            timestamp_ms: ts,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
        }
    }

    fn window(closes: &[f64]) -> Vec<Bar> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| bar(i as i64 * 60_000, c))
            .collect()
    }

    fn spec(name: &str, indicator: &str, params: &[(&str, f64)]) -> FeatureSpec {
        FeatureSpec {
            name: name.to_string(),
            indicator: indicator.to_string(),
            kind: kind_of(indicator).unwrap(),
            params: params.iter().map(|&(k, v)| (k.to_string(), v)).collect(),
            deps: deps_of(indicator).iter().map(|s| s.to_string()).collect(),
        }
    }

    fn compute(indicator: &str, params: &[(&str, f64)], closes: &[f64]) -> f64 {
        let bound = bind(&spec("f", indicator, params)).unwrap();
        let bars = window(closes);
        let ctx = FeatureCtx {
            bar: bars.last().unwrap(),
            window: &bars,
            computed: &BTreeMap::new(),
        };
        bound.compute(&ctx).unwrap()
    }

    #[test]
    fn rsi_returns_nan_when_insufficient_data() {
        let v = compute("rsi", &[("period", 14.0)], &[100.0; 14]);
        assert!(v.is_nan());
    }

    #[test]
    fn rsi_all_gains_returns_100() {
        let closes: Vec<f64> = (0..5).map(|i| 10.0 + i as f64).collect();
        let v = compute("rsi", &[("period", 3.0)], &closes);
        assert!((v - 100.0).abs() < 1e-6, "expected ~100, got {v}");
    }

    #[test]
    fn rsi_all_losses_returns_0() {
        let closes: Vec<f64> = (0..5).map(|i| 14.0 - i as f64).collect();
        let v = compute("rsi", &[("period", 3.0)], &closes);
        assert!(v.abs() < 1e-6, "expected ~0, got {v}");
    }

    #[test]
    fn sma_of_constant_series_is_constant() {
        let v = compute("sma", &[("period", 5.0)], &[42.0; 10]);
        assert!((v - 42.0).abs() < 1e-9);
    }

    #[test]
    fn ema_tracks_trend_above_sma() {
        // On a rising series the EMA sits above the SMA of the same period.
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let ema = compute("ema", &[("period", 10.0)], &closes);
        let sma = compute("sma", &[("period", 10.0)], &closes);
        assert!(ema > sma, "ema {ema} should exceed sma {sma} in an uptrend");
    }

    #[test]
    fn atr_positive_on_moving_series() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i % 5) as f64).collect();
        let v = compute("atr", &[("period", 14.0)], &closes);
        assert!(v > 0.0);
    }

    #[test]
    fn macd_histogram_reads_computed_deps() {
        let bound = bind(&spec("hist", "macd_histogram", &[])).unwrap();
        let bars = window(&[100.0; 3]);
        let computed =
            BTreeMap::from([("macd".to_string(), 1.5), ("macd_signal".to_string(), 0.5)]);
        let ctx = FeatureCtx {
            bar: bars.last().unwrap(),
            window: &bars,
            computed: &computed,
        };
        assert!((bound.compute(&ctx).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn microstructure_wicks() {
        let b = Bar {
            timestamp_ms: 0,
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: 1.0,
        };
        let bars = vec![b];
        let ctx = FeatureCtx {
            bar: &bars[0],
            window: &bars,
            computed: &BTreeMap::new(),
        };
        let upper = bind(&spec("uw", "upper_wick", &[])).unwrap();
        let lower = bind(&spec("lw", "lower_wick", &[])).unwrap();
        assert!((upper.compute(&ctx).unwrap() - 1.0).abs() < 1e-9);
        assert!((lower.compute(&ctx).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_indicator_fails_bind() {
        let mut s = spec("x", "sma", &[]);
        s.indicator = "quantum_flux".to_string();
        assert!(bind(&s).is_err());
    }

    #[test]
    fn bollinger_upper_above_lower() {
        let closes: Vec<f64> = (0..40).map(|i| 100.0 + ((i * 7) % 11) as f64).collect();
        let upper = compute("bollinger_upper", &[("period", 20.0)], &closes);
        let lower = compute("bollinger_lower", &[("period", 20.0)], &closes);
        assert!(upper > lower);
    }
}
