use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use common::{Bar, MarketDataSource, Result, Timeframe};

use crate::gaps::{detect_gaps, Gap};
use crate::store::BarStore;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How long a memory entry stays fresh.
    pub ttl: Duration,
    /// Bars retained per `(symbol, timeframe)` entry.
    pub max_size: usize,
    /// Store coverage below this fraction of the requested limit triggers a
    /// full-range upstream fetch instead of a newest-only top-up.
    pub gap_threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            max_size: 10_000,
            gap_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GetBarsOptions {
    pub force_refresh: bool,
    pub detect_gaps: bool,
    pub backfill_gaps: bool,
}

struct MemEntry {
    bars: Vec<Bar>,
    last_fetch: Instant,
}

type Key = (String, Timeframe);

/// Three-tier bar cache: memory with TTL, the durable store, and the
/// upstream market-data source for whatever is missing.
///
/// Refreshes for one `(symbol, timeframe)` are serialized through a per-key
/// mutex, so concurrent callers coalesce onto a single upstream fetch.
pub struct BarCache {
    memory: RwLock<HashMap<Key, MemEntry>>,
    refresh_locks: Mutex<HashMap<Key, Arc<Mutex<()>>>>,
    store: BarStore,
    upstream: Arc<dyn MarketDataSource>,
    cfg: CacheConfig,
}

impl BarCache {
    pub fn new(store: BarStore, upstream: Arc<dyn MarketDataSource>, cfg: CacheConfig) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            store,
            upstream,
            cfg,
        }
    }

    /// Serve the last `limit` bars, oldest first.
    pub async fn get_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        opts: GetBarsOptions,
    ) -> Result<Vec<Bar>> {
        let key: Key = (symbol.to_string(), timeframe);

        // Tier 1: memory.
        if !opts.force_refresh {
            if let Some(bars) = self.from_memory(&key, limit).await {
                return Ok(bars);
            }
        }

        // One refresh at a time per key; late arrivals re-check memory.
        let key_lock = self.key_lock(&key).await;
        let _guard = key_lock.lock().await;
        if !opts.force_refresh {
            if let Some(bars) = self.from_memory(&key, limit).await {
                return Ok(bars);
            }
        }

        let bars = self.refresh(symbol, timeframe, limit, opts).await?;
        self.memory.write().await.insert(
            key,
            MemEntry {
                bars: bars.clone(),
                last_fetch: Instant::now(),
            },
        );

        Ok(tail(&bars, limit))
    }

    /// Newest bar for a series, refreshing through the tiers.
    pub async fn latest_bar(&self, symbol: &str, timeframe: Timeframe) -> Result<Option<Bar>> {
        let bars = self
            .get_bars(
                symbol,
                timeframe,
                1,
                GetBarsOptions {
                    force_refresh: true,
                    ..GetBarsOptions::default()
                },
            )
            .await?;
        Ok(bars.last().copied())
    }

    async fn from_memory(&self, key: &Key, limit: usize) -> Option<Vec<Bar>> {
        let memory = self.memory.read().await;
        let entry = memory.get(key)?;
        if entry.last_fetch.elapsed() > self.cfg.ttl {
            return None;
        }
        Some(tail(&entry.bars, limit))
    }

    async fn key_lock(&self, key: &Key) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks.entry(key.clone()).or_default().clone()
    }

    /// Tier 2 + 3: store fetch, gap repair, tail top-up, persistence.
    async fn refresh(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
        opts: GetBarsOptions,
    ) -> Result<Vec<Bar>> {
        let stored = self.store.recent_bars(symbol, timeframe, limit).await?;
        let mut merged: BTreeMap<i64, Bar> =
            stored.iter().map(|b| (b.timestamp_ms, *b)).collect();

        // Gap repair inside the stored range.
        if opts.detect_gaps && stored.len() >= 2 {
            let gaps = detect_gaps(&stored, timeframe);
            if !gaps.is_empty() {
                info!(
                    symbol,
                    timeframe = %timeframe,
                    gaps = gaps.len(),
                    "gaps detected in stored bars"
                );
            }
            if opts.backfill_gaps {
                for gap in &gaps {
                    if let Err(e) = self.backfill_gap(symbol, timeframe, gap, &mut merged).await
                    {
                        warn!(
                            symbol,
                            start = gap.start_ms,
                            end = gap.end_ms,
                            error = %e,
                            "gap backfill failed; continuing with remaining gaps"
                        );
                    }
                }
            }
        }

        // Tail top-up: thin coverage refetches the whole range, otherwise
        // only bars newer than what the store already has. A forced refresh
        // always probes for newer bars, even at full coverage.
        if merged.len() < limit || opts.force_refresh {
            let coverage = merged.len() as f64 / limit.max(1) as f64;
            let fetched = if coverage < self.cfg.gap_threshold {
                debug!(symbol, coverage, "coverage below threshold; full upstream fetch");
                self.upstream
                    .fetch_bars(symbol, timeframe, None, None, limit)
                    .await?
            } else {
                let newest = self.store.latest_timestamp(symbol, timeframe).await?;
                self.upstream
                    .fetch_bars(
                        symbol,
                        timeframe,
                        newest.map(|ts| ts + timeframe.duration_ms()),
                        None,
                        limit,
                    )
                    .await?
            };

            let net_new: Vec<Bar> = fetched
                .into_iter()
                .filter(|b| b.validate().is_ok() && !merged.contains_key(&b.timestamp_ms))
                .collect();
            if !net_new.is_empty() {
                self.store.insert_bars(symbol, timeframe, &net_new).await?;
                for bar in net_new {
                    merged.insert(bar.timestamp_ms, bar);
                }
            }
        }

        // Cap to the retention bound, newest kept.
        let mut bars: Vec<Bar> = merged.into_values().collect();
        if bars.len() > self.cfg.max_size {
            bars.drain(..bars.len() - self.cfg.max_size);
        }
        Ok(bars)
    }

    async fn backfill_gap(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        gap: &Gap,
        merged: &mut BTreeMap<i64, Bar>,
    ) -> Result<()> {
        let fetched = self
            .upstream
            .fetch_bars(
                symbol,
                timeframe,
                Some(gap.start_ms),
                Some(gap.end_ms - 1),
                gap.missing_bars as usize,
            )
            .await?;

        let in_range: Vec<Bar> = fetched
            .into_iter()
            .filter(|b| {
                b.timestamp_ms >= gap.start_ms
                    && b.timestamp_ms < gap.end_ms
                    && b.validate().is_ok()
            })
            .collect();

        if in_range.is_empty() {
            return Ok(());
        }

        let inserted = self.store.insert_bars(symbol, timeframe, &in_range).await?;
        debug!(
            symbol,
            start = gap.start_ms,
            fetched = in_range.len(),
            inserted,
            "gap backfilled"
        );
        for bar in in_range {
            merged.insert(bar.timestamp_ms, bar);
        }
        Ok(())
    }
}

fn tail(bars: &[Bar], limit: usize) -> Vec<Bar> {
    let start = bars.len().saturating_sub(limit);
    bars[start..].to_vec()
}
