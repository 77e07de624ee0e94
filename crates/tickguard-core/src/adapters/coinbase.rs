use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::data_source::{FetchFuture, PriceSource, SourceError};
use crate::http_client::{HttpClient, HttpRequest, ReqwestHttpClient};
use crate::{parse_decimal, PairKey, ProviderId, ProviderKind, SourcePrice};

use super::{fetch_body, join_url, malformed};

const DEFAULT_BASE_URL: &str = "https://api.coinbase.com";

/// Coinbase public spot price adapter (`/v2/prices/{BASE}-{QUOTE}/spot`).
#[derive(Clone)]
pub struct CoinbaseAdapter {
    id: ProviderId,
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    timeout: Duration,
}

impl Default for CoinbaseAdapter {
    fn default() -> Self {
        Self::with_http_client(Arc::new(ReqwestHttpClient::new()))
    }
}

impl CoinbaseAdapter {
    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            id: ProviderKind::Coinbase.default_id(),
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

    fn parse_price(&self, body: &str, pair: &PairKey) -> Result<SourcePrice, SourceError> {
        let response: CoinbaseSpotResponse =
            serde_json::from_str(body).map_err(|error| malformed(&self.id, error))?;

        if !response.data.base.eq_ignore_ascii_case(pair.asset.as_str())
            || !response.data.currency.eq_ignore_ascii_case(pair.quote.as_str())
        {
            return Err(malformed(
                &self.id,
                format!(
                    "asked for {pair}, got {}/{}",
                    response.data.base, response.data.currency
                ),
            ));
        }

        let value = parse_decimal("amount", &response.data.amount)?;
        Ok(SourcePrice::new(value)?)
    }
}

impl PriceSource for CoinbaseAdapter {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn fetch<'a>(&'a self, pair: &'a PairKey) -> FetchFuture<'a> {
        Box::pin(async move {
            let product = format!("{}-{}", pair.asset, pair.quote);
            let path = format!("v2/prices/{}/spot", urlencoding::encode(&product));
            let request = HttpRequest::get(join_url(&self.base_url, &path))
                .with_header("accept", "application/json")
                .with_timeout(self.timeout);

            let body = fetch_body(self.http_client.as_ref(), &self.id, request).await?;
            self.parse_price(&body, pair)
        })
    }
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpotResponse {
    data: CoinbaseSpotData,
}

#[derive(Debug, Deserialize)]
struct CoinbaseSpotData {
    amount: String,
    base: String,
    currency: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::SourceErrorKind;
    use crate::http_client::{HttpResponse, ScriptedHttpClient};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn parses_spot_amount_string() {
        let http = ScriptedHttpClient::responding(HttpResponse::ok_json(
            r#"{"data":{"amount":"3120.455","base":"ETH","currency":"USD"}}"#,
        ));
        let adapter = CoinbaseAdapter::with_http_client(http.clone());
        let pair = PairKey::parse("eth", "usd").expect("valid pair");

        let price = adapter.fetch(&pair).await.expect("price");

        assert_eq!(price.value, dec!(3120.455));
        assert_eq!(
            http.requests()[0].url,
            "https://api.coinbase.com/v2/prices/ETH-USD/spot"
        );
    }

    #[tokio::test]
    async fn missing_product_is_permanent() {
        let http = ScriptedHttpClient::responding(HttpResponse::with_status(
            404,
            r#"{"errors":[{"id":"not_found","message":"Invalid currency"}]}"#,
        ));
        let adapter = CoinbaseAdapter::with_http_client(http);
        let pair = PairKey::parse("NOPE", "USD").expect("valid pair");

        let error = adapter.fetch(&pair).await.expect_err("404");
        assert_eq!(error.kind(), SourceErrorKind::Permanent);
    }

    #[tokio::test]
    async fn mismatched_pair_is_malformed() {
        let http = ScriptedHttpClient::responding(HttpResponse::ok_json(
            r#"{"data":{"amount":"1.0","base":"USDC","currency":"USD"}}"#,
        ));
        let adapter = CoinbaseAdapter::with_http_client(http);
        let pair = PairKey::parse("BTC", "USD").expect("valid pair");

        let error = adapter.fetch(&pair).await.expect_err("wrong pair");
        assert_eq!(error.kind(), SourceErrorKind::Malformed);
    }
}
