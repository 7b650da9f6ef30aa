use async_trait::async_trait;

use crate::{Bar, Result, Timeframe};

/// Upstream market-data source, the third tier of the bar cache.
///
/// Implementations fetch closed bars for a range; the cache is responsible
/// for persistence, deduplication and gap repair.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Fetch up to `limit` bars for `(symbol, timeframe)`, oldest first.
    /// `start_ms`/`end_ms` bound the range when present (inclusive).
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>>;
}
