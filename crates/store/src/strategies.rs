use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::info;

use common::{Error, Result, StrategyRecord, StrategyStatus, StrategyStore, Timeframe};

/// SQLite implementation of the strategy repository.
///
/// Lifecycle methods load the row, verify the transition is legal, apply
/// it, and write the audit row — all inside one transaction.
#[derive(Clone)]
pub struct SqliteStrategyStore {
    pool: SqlitePool,
}

impl SqliteStrategyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn fetch(&self, strategy_id: &str) -> Result<StrategyRecord> {
        let row = sqlx::query(
            "SELECT * FROM strategies WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(strategy_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::Internal(format!("strategy '{strategy_id}' not found")))?;
        row_to_record(row)
    }

    async fn find_by_status(
        &self,
        user_id: &str,
        status: StrategyStatus,
    ) -> Result<Vec<StrategyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM strategies
            WHERE user_id = ?1 AND status = ?2 AND deleted_at IS NULL
            ORDER BY rowid ASC
            "#,
        )
        .bind(user_id)
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_record).collect()
    }

    /// Load, check the transition, apply updates, audit — one transaction.
    async fn transition(
        &self,
        strategy_id: &str,
        allowed_from: &[StrategyStatus],
        to: StrategyStatus,
        event: &str,
        detail: Option<&str>,
        stamp: Stamp,
    ) -> Result<StrategyRecord> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT status FROM strategies WHERE id = ?1 AND deleted_at IS NULL",
        )
        .bind(strategy_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::Internal(format!("strategy '{strategy_id}' not found")))?;
        let current: String = row.get("status");
        let current = parse_status(&current)?;

        if !allowed_from.contains(&current) {
            return Err(Error::Internal(format!(
                "strategy '{strategy_id}': illegal transition {current} -> {to}"
            )));
        }

        let now = Utc::now().to_rfc3339();
        match stamp {
            Stamp::Activated => {
                sqlx::query(
                    "UPDATE strategies SET status = ?1, activated_at = ?2 WHERE id = ?3",
                )
                .bind(to.to_string())
                .bind(&now)
                .bind(strategy_id)
                .execute(&mut *tx)
                .await?;
            }
            Stamp::Closed => {
                sqlx::query(
                    "UPDATE strategies SET status = ?1, closed_at = ?2, close_reason = ?3 WHERE id = ?4",
                )
                .bind(to.to_string())
                .bind(&now)
                .bind(detail)
                .bind(strategy_id)
                .execute(&mut *tx)
                .await?;
            }
            Stamp::Cleared => {
                sqlx::query(
                    "UPDATE strategies SET status = ?1, closed_at = NULL, close_reason = NULL WHERE id = ?2",
                )
                .bind(to.to_string())
                .bind(strategy_id)
                .execute(&mut *tx)
                .await?;
            }
            Stamp::None => {
                sqlx::query("UPDATE strategies SET status = ?1 WHERE id = ?2")
                    .bind(to.to_string())
                    .bind(strategy_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        audit(&mut tx, strategy_id, event, detail).await?;
        tx.commit().await?;

        info!(strategy_id, from = %current, to = %to, event, "lifecycle transition");
        self.fetch(strategy_id).await
    }

    /// Audit rows for one strategy, oldest first (diagnostics/tests).
    pub async fn audit_trail(&self, strategy_id: &str) -> Result<Vec<(String, Option<String>)>> {
        let rows = sqlx::query(
            "SELECT event, detail FROM audit_log WHERE strategy_id = ?1 ORDER BY id ASC",
        )
        .bind(strategy_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("event"), r.get("detail")))
            .collect())
    }
}

enum Stamp {
    Activated,
    Closed,
    Cleared,
    None,
}

#[async_trait]
impl StrategyStore for SqliteStrategyStore {
    async fn create(
        &self,
        user_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        yaml_content: &str,
        status: StrategyStatus,
    ) -> Result<StrategyRecord> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO strategies (id, user_id, symbol, timeframe, status, yaml_content)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(symbol)
        .bind(timeframe.to_string())
        .bind(status.to_string())
        .bind(yaml_content)
        .execute(&mut *tx)
        .await?;
        audit(&mut tx, &id, "created", Some(&status.to_string())).await?;
        tx.commit().await?;

        info!(strategy_id = %id, user_id, symbol, "strategy record created");
        self.fetch(&id).await
    }

    async fn find_pending(&self, user_id: &str) -> Result<Vec<StrategyRecord>> {
        self.find_by_status(user_id, StrategyStatus::Pending).await
    }

    async fn find_active(&self, user_id: &str) -> Result<Vec<StrategyRecord>> {
        self.find_by_status(user_id, StrategyStatus::Active).await
    }

    async fn activate(&self, strategy_id: &str) -> Result<StrategyRecord> {
        self.transition(
            strategy_id,
            &[StrategyStatus::Pending],
            StrategyStatus::Active,
            "activated",
            None,
            Stamp::Activated,
        )
        .await
    }

    async fn close(&self, strategy_id: &str, reason: Option<&str>) -> Result<StrategyRecord> {
        self.transition(
            strategy_id,
            &[StrategyStatus::Active, StrategyStatus::Pending],
            StrategyStatus::Closed,
            "closed",
            reason,
            Stamp::Closed,
        )
        .await
    }

    async fn reopen(&self, strategy_id: &str) -> Result<StrategyRecord> {
        self.transition(
            strategy_id,
            &[StrategyStatus::Closed],
            StrategyStatus::Pending,
            "reopened",
            None,
            Stamp::Cleared,
        )
        .await
    }

    async fn mark_failed(&self, strategy_id: &str, error: &str) -> Result<StrategyRecord> {
        self.transition(
            strategy_id,
            &[
                StrategyStatus::Draft,
                StrategyStatus::Pending,
                StrategyStatus::Active,
            ],
            StrategyStatus::Failed,
            "failed",
            Some(error),
            Stamp::None,
        )
        .await
    }
}

async fn audit(
    tx: &mut Transaction<'_, Sqlite>,
    strategy_id: &str,
    event: &str,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (strategy_id, event, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
    )
    .bind(strategy_id)
    .bind(event)
    .bind(detail)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn parse_status(s: &str) -> Result<StrategyStatus> {
    Ok(match s {
        "DRAFT" => StrategyStatus::Draft,
        "PENDING" => StrategyStatus::Pending,
        "ACTIVE" => StrategyStatus::Active,
        "CLOSED" => StrategyStatus::Closed,
        "FAILED" => StrategyStatus::Failed,
        other => return Err(Error::Internal(format!("unknown status '{other}'"))),
    })
}

fn row_to_record(row: sqlx::sqlite::SqliteRow) -> Result<StrategyRecord> {
    let status: String = row.get("status");
    let timeframe: String = row.get("timeframe");
    let parse_ts = |value: Option<String>| -> Option<DateTime<Utc>> {
        value
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    Ok(StrategyRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        symbol: row.get("symbol"),
        timeframe: timeframe.parse::<Timeframe>()?,
        status: parse_status(&status)?,
        yaml_content: row.get("yaml_content"),
        activated_at: parse_ts(row.get("activated_at")),
        closed_at: parse_ts(row.get("closed_at")),
        close_reason: row.get("close_reason"),
        deleted_at: parse_ts(row.get("deleted_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SqliteStrategyStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .expect("migrations");
        SqliteStrategyStore::new(pool)
    }

    async fn pending_record(store: &SqliteStrategyStore) -> StrategyRecord {
        store
            .create(
                "user-1",
                "SPY",
                Timeframe::M5,
                "meta: {symbol: SPY}",
                StrategyStatus::Pending,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn pending_records_are_discoverable() {
        let store = store().await;
        let record = pending_record(&store).await;

        let pending = store.find_pending("user-1").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, record.id);

        assert!(store.find_pending("someone-else").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn activate_stamps_and_moves_status() {
        let store = store().await;
        let record = pending_record(&store).await;

        let active = store.activate(&record.id).await.unwrap();
        assert_eq!(active.status, StrategyStatus::Active);
        assert!(active.activated_at.is_some());

        assert!(store.find_pending("user-1").await.unwrap().is_empty());
        assert_eq!(store.find_active("user-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn close_then_reopen_round_trip() {
        let store = store().await;
        let record = pending_record(&store).await;
        store.activate(&record.id).await.unwrap();

        let closed = store.close(&record.id, Some("manual")).await.unwrap();
        assert_eq!(closed.status, StrategyStatus::Closed);
        assert_eq!(closed.close_reason.as_deref(), Some("manual"));
        assert!(closed.closed_at.is_some());

        let reopened = store.reopen(&record.id).await.unwrap();
        assert_eq!(reopened.status, StrategyStatus::Pending);
        assert!(reopened.closed_at.is_none());
        assert!(reopened.close_reason.is_none());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = store().await;
        let record = pending_record(&store).await;

        // PENDING -> PENDING via reopen is not legal.
        assert!(store.reopen(&record.id).await.is_err());

        store.activate(&record.id).await.unwrap();
        // ACTIVE -> ACTIVE is not legal either.
        assert!(store.activate(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn mark_failed_records_diagnostic() {
        let store = store().await;
        let record = pending_record(&store).await;

        let failed = store
            .mark_failed(&record.id, "schema error at meta.symbol")
            .await
            .unwrap();
        assert_eq!(failed.status, StrategyStatus::Failed);

        let trail = store.audit_trail(&record.id).await.unwrap();
        let events: Vec<&str> = trail.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(events, vec!["created", "failed"]);
        assert_eq!(
            trail[1].1.as_deref(),
            Some("schema error at meta.symbol")
        );
    }

    #[tokio::test]
    async fn every_lifecycle_call_writes_an_audit_row() {
        let store = store().await;
        let record = pending_record(&store).await;
        store.activate(&record.id).await.unwrap();
        store.close(&record.id, Some("advisor")).await.unwrap();
        store.reopen(&record.id).await.unwrap();

        let trail = store.audit_trail(&record.id).await.unwrap();
        let events: Vec<&str> = trail.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(events, vec!["created", "activated", "closed", "reopened"]);
    }
}
