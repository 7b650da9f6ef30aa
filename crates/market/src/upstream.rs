use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use common::{Bar, Error, MarketDataSource, Result, Timeframe};

/// REST client for the upstream market-data API, the third cache tier.
pub struct DataApiClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl DataApiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
        }
    }
}

#[async_trait]
impl MarketDataSource for DataApiClient {
    async fn fetch_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Bar>> {
        let mut url = format!(
            "{}/v1/bars?symbol={symbol}&timeframe={timeframe}&limit={limit}",
            self.base_url
        );
        if let Some(start) = start_ms {
            url.push_str(&format!("&start={start}"));
        }
        if let Some(end) = end_ms {
            url.push_str(&format!("&end={end}"));
        }

        debug!(symbol, timeframe = %timeframe, limit, "fetching upstream bars");
        let resp = self
            .http
            .get(&url)
            .header("X-API-KEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(if status.is_server_error() {
                Error::BrokerTransient(format!("data API HTTP {status}: {body}"))
            } else {
                Error::Http(format!("data API HTTP {status}: {body}"))
            });
        }

        let payload: BarsResponse = resp.json().await.map_err(|e| Error::Http(e.to_string()))?;
        let mut bars: Vec<Bar> = payload
            .bars
            .into_iter()
            .map(|b| Bar {
                timestamp_ms: b.t,
                open: b.o,
                high: b.h,
                low: b.l,
                close: b.c,
                volume: b.v,
            })
            .collect();
        bars.sort_by_key(|b| b.timestamp_ms);
        Ok(bars)
    }
}

#[derive(Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Vec<BarPayload>,
}

#[derive(Deserialize)]
struct BarPayload {
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}
