use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// What the advisor recommends for a running strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    Keep,
    Swap,
    Close,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalRequest {
    pub strategy_id: String,
    pub symbol: String,
    pub timeframe: String,
    /// Current FSM state name, for the advisor's context.
    pub state: String,
    pub position_size: f64,
    pub bars_processed: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvalVerdict {
    pub recommendation: Recommendation,
    pub confidence: f64,
    pub reason: String,
    /// Replacement strategy document, present when recommending a swap.
    pub suggested_strategy: Option<String>,
}

impl EvalVerdict {
    /// The degraded verdict used when the advisor is unreachable or returns
    /// garbage: keep running.
    pub fn keep(reason: impl Into<String>) -> Self {
        Self {
            recommendation: Recommendation::Keep,
            confidence: 0.0,
            reason: reason.into(),
            suggested_strategy: None,
        }
    }
}

/// The evaluator/advisor service consumed by the orchestrator.
#[async_trait]
pub trait EvaluatorClient: Send + Sync {
    async fn evaluate(&self, request: &EvalRequest) -> Result<EvalVerdict>;
}
