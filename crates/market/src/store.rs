use sqlx::{Row, SqlitePool};

use common::{Bar, Result, Timeframe};

/// Durable bar storage, the middle tier of the cache. The primary key
/// `(symbol, timeframe, timestamp_ms)` deduplicates on insert, so writers
/// never need to check for existing rows.
#[derive(Clone)]
pub struct BarStore {
    pool: SqlitePool,
}

impl BarStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert bars, ignoring ones already present. Returns the number of
    /// net-new rows.
    pub async fn insert_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bars: &[Bar],
    ) -> Result<u64> {
        let tf = timeframe.to_string();
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for bar in bars {
            let result = sqlx::query(
                r#"
                INSERT INTO bars (symbol, timeframe, timestamp_ms, open, high, low, close, volume)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT(symbol, timeframe, timestamp_ms) DO NOTHING
                "#,
            )
            .bind(symbol)
            .bind(&tf)
            .bind(bar.timestamp_ms)
            .bind(bar.open)
            .bind(bar.high)
            .bind(bar.low)
            .bind(bar.close)
            .bind(bar.volume)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// The newest `limit` bars, returned oldest first.
    pub async fn recent_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp_ms, open, high, low, close, volume
            FROM bars
            WHERE symbol = ?1 AND timeframe = ?2
            ORDER BY timestamp_ms DESC
            LIMIT ?3
            "#,
        )
        .bind(symbol)
        .bind(timeframe.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut bars: Vec<Bar> = rows.into_iter().map(row_to_bar).collect();
        bars.reverse();
        Ok(bars)
    }

    pub async fn latest_timestamp(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT MAX(timestamp_ms) AS ts FROM bars WHERE symbol = ?1 AND timeframe = ?2",
        )
        .bind(symbol)
        .bind(timeframe.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<Option<i64>, _>("ts")?)
    }

    pub async fn count(&self, symbol: &str, timeframe: Timeframe) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM bars WHERE symbol = ?1 AND timeframe = ?2",
        )
        .bind(symbol)
        .bind(timeframe.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

fn row_to_bar(row: sqlx::sqlite::SqliteRow) -> Bar {
    Bar {
        timestamp_ms: row.get("timestamp_ms"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
    }
}
