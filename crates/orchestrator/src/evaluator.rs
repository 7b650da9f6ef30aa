use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::warn;

use common::{EvalRequest, EvalVerdict, Error, EvaluatorClient, Result};

/// HTTP client for the evaluator/advisor service.
pub struct HttpEvaluatorClient {
    base_url: String,
    http: Client,
}

impl HttpEvaluatorClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(50);

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::builder()
                .use_rustls_tls()
                .timeout(Self::DEFAULT_TIMEOUT)
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl EvaluatorClient for HttpEvaluatorClient {
    async fn evaluate(&self, request: &EvalRequest) -> Result<EvalVerdict> {
        let url = format!("{}/v1/evaluate", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Http(format!("evaluator HTTP {status}: {body}")));
        }
        resp.json::<EvalVerdict>()
            .await
            .map_err(|e| Error::Http(e.to_string()))
    }
}

/// Evaluate with the degrade-to-keep policy: any transport or decode
/// failure becomes a `keep` verdict.
pub async fn evaluate_or_keep(
    client: &dyn EvaluatorClient,
    request: &EvalRequest,
) -> EvalVerdict {
    match client.evaluate(request).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(
                strategy_id = %request.strategy_id,
                error = %e,
                "evaluator unavailable; keeping strategy"
            );
            EvalVerdict::keep(format!("evaluator unavailable: {e}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Recommendation;

    struct FailingEvaluator;

    #[async_trait]
    impl EvaluatorClient for FailingEvaluator {
        async fn evaluate(&self, _request: &EvalRequest) -> Result<EvalVerdict> {
            Err(Error::Http("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn failures_degrade_to_keep() {
        let request = EvalRequest {
            strategy_id: "s1".to_string(),
            symbol: "SPY".to_string(),
            timeframe: "5m".to_string(),
            state: "MANAGING".to_string(),
            position_size: 10.0,
            bars_processed: 42,
        };
        let verdict = evaluate_or_keep(&FailingEvaluator, &request).await;
        assert_eq!(verdict.recommendation, Recommendation::Keep);
    }
}
