use async_trait::async_trait;

use crate::{Result, StrategyRecord, StrategyStatus, Timeframe};

/// The strategy repository consumed by the orchestrator.
///
/// Every lifecycle call is atomic and produces an audit-log row. Soft-deleted
/// records (`deleted_at` set) are invisible to the finders.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    /// Insert a new record (user submission, or the replacement side of a
    /// swap).
    async fn create(
        &self,
        user_id: &str,
        symbol: &str,
        timeframe: Timeframe,
        yaml_content: &str,
        status: StrategyStatus,
    ) -> Result<StrategyRecord>;

    /// Records in PENDING for this user, oldest first.
    async fn find_pending(&self, user_id: &str) -> Result<Vec<StrategyRecord>>;

    /// Records in ACTIVE for this user (used at startup recovery).
    async fn find_active(&self, user_id: &str) -> Result<Vec<StrategyRecord>>;

    /// PENDING -> ACTIVE. Stamps `activated_at`.
    async fn activate(&self, strategy_id: &str) -> Result<StrategyRecord>;

    /// ACTIVE/PENDING -> CLOSED. Stamps `closed_at` and the reason.
    async fn close(&self, strategy_id: &str, reason: Option<&str>) -> Result<StrategyRecord>;

    /// CLOSED -> PENDING, clearing close metadata.
    async fn reopen(&self, strategy_id: &str) -> Result<StrategyRecord>;

    /// Any state -> FAILED with a diagnostic. Terminal except explicit reset.
    async fn mark_failed(&self, strategy_id: &str, error: &str) -> Result<StrategyRecord>;
}
