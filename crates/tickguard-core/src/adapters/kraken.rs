use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::data_source::{FetchFuture, PriceSource, SourceError};
use crate::http_client::{HttpClient, HttpRequest, ReqwestHttpClient};
use crate::{parse_decimal, PairKey, ProviderId, ProviderKind, SourcePrice};

use super::{fetch_body, join_url, malformed};

const DEFAULT_BASE_URL: &str = "https://api.kraken.com";

/// Kraken public ticker adapter. Reports the last trade price (`c[0]`).
#[derive(Clone)]
pub struct KrakenAdapter {
    id: ProviderId,
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    timeout: Duration,
}

impl Default for KrakenAdapter {
    fn default() -> Self {
        Self::with_http_client(Arc::new(ReqwestHttpClient::new()))
    }
}

impl KrakenAdapter {
    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            id: ProviderKind::Kraken.default_id(),
            http_client,
            base_url: String::from(DEFAULT_BASE_URL),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_id(mut self, id: ProviderId) -> Self {
        self.id = id;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn parse_price(&self, body: &str) -> Result<SourcePrice, SourceError> {
        let response: KrakenTickerResponse =
            serde_json::from_str(body).map_err(|error| malformed(&self.id, error))?;

        if let Some(first) = response.error.first() {
            return Err(classify_api_error(&self.id, first));
        }

        // Kraken answers with its own pair alias (e.g. XXBTZUSD) as the only key.
        let Some(ticker) = response.result.values().next() else {
            return Err(malformed(&self.id, "ticker result is empty"));
        };
        let Some(last_trade) = ticker.c.first() else {
            return Err(malformed(&self.id, "ticker has no last trade"));
        };

        let value = parse_decimal("c", last_trade)?;
        Ok(SourcePrice::new(value)?)
    }
}

impl PriceSource for KrakenAdapter {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn fetch<'a>(&'a self, pair: &'a PairKey) -> FetchFuture<'a> {
        Box::pin(async move {
            let kraken_pair = format!("{}{}", kraken_asset(pair.asset.as_str()), pair.quote);
            let path = format!("0/public/Ticker?pair={}", urlencoding::encode(&kraken_pair));
            let request = HttpRequest::get(join_url(&self.base_url, &path))
                .with_header("accept", "application/json")
                .with_timeout(self.timeout);

            let body = fetch_body(self.http_client.as_ref(), &self.id, request).await?;
            self.parse_price(&body)
        })
    }
}

fn kraken_asset(ticker: &str) -> &str {
    match ticker {
        "BTC" => "XBT",
        "DOGE" => "XDG",
        other => other,
    }
}

/// Kraken reports failures in-band with HTTP 200 and an `error` array.
fn classify_api_error(provider: &ProviderId, code: &str) -> SourceError {
    let message = format!("{provider} api error: {code}");
    if code.starts_with("EAPI:Rate limit") || code.starts_with("EGeneral:Too many requests") {
        SourceError::rate_limited(message)
    } else if code.starts_with("EService:") || code.starts_with("EGeneral:Temporary lockout") {
        SourceError::transient(message)
    } else {
        SourceError::permanent(message)
    }
}

#[derive(Debug, Deserialize)]
struct KrakenTickerResponse {
    #[serde(default)]
    error: Vec<String>,
    #[serde(default)]
    result: BTreeMap<String, KrakenTicker>,
}

#[derive(Debug, Deserialize)]
struct KrakenTicker {
    c: Vec<String>,
}
