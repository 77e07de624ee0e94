use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::data_source::{FetchFuture, PriceSource, SourceError};
use crate::http_client::{HttpAuth, HttpClient, HttpRequest, ReqwestHttpClient};
use crate::{parse_decimal, AssetId, PairKey, ProviderId, ProviderKind, SourcePrice, UtcDateTime};

use super::{fetch_body, join_url, malformed};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// CoinGecko `simple/price` adapter.
///
/// CoinGecko keys coins by slug rather than ticker; common tickers are mapped
/// and anything else is tried as a lowercase slug.
#[derive(Clone)]
pub struct CoinGeckoAdapter {
    id: ProviderId,
    http_client: Arc<dyn HttpClient>,
    base_url: String,
    auth: HttpAuth,
    timeout: Duration,
}

impl Default for CoinGeckoAdapter {
    fn default() -> Self {
        Self::with_http_client(Arc::new(ReqwestHttpClient::new()))
    }
}

impl CoinGeckoAdapter {
    pub fn with_http_client(http_client: Arc<dyn HttpClient>) -> Self {
        Self {
            id: ProviderKind::Coingecko.default_id(),
            http_client,
            base_url: String::from(DEFAULT_BASE_URL),
            auth: HttpAuth::None,
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

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.auth = HttpAuth::Header {
            name: String::from(API_KEY_HEADER),
            value: api_key.into(),
        };
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn request_for(&self, coin_id: &str, vs_currency: &str) -> HttpRequest {
        let path = format!(
            "simple/price?ids={}&vs_currencies={}&include_last_updated_at=true",
            urlencoding::encode(coin_id),
            urlencoding::encode(vs_currency)
        );
        HttpRequest::get(join_url(&self.base_url, &path))
            .with_header("accept", "application/json")
            .with_auth(&self.auth)
            .with_timeout(self.timeout)
    }

    fn parse_price(
        &self,
        body: &str,
        coin_id: &str,
        vs_currency: &str,
    ) -> Result<SourcePrice, SourceError> {
        let payload: Value = serde_json::from_str(body).map_err(|error| malformed(&self.id, error))?;

        let Some(coin) = payload.get(coin_id) else {
            return Err(SourceError::permanent(format!(
                "{} does not list coin '{coin_id}'",
                self.id
            )));
        };

        let Some(raw_price) = coin.get(vs_currency) else {
            return Err(SourceError::permanent(format!(
                "{} has no '{vs_currency}' quote for '{coin_id}'",
                self.id
            )));
        };

        // Read the literal digits; never round-trip through f64.
        let literal = match raw_price {
            Value::Number(number) => number.to_string(),
            Value::String(text) => text.clone(),
            other => return Err(malformed(&self.id, format!("price is not a number: {other}"))),
        };
        let value = parse_decimal("price", &literal)?;
        let mut price = SourcePrice::new(value)?;

        if let Some(seconds) = coin.get("last_updated_at").and_then(Value::as_i64) {
            if let Ok(as_of) = UtcDateTime::from_unix_seconds(seconds) {
                price = price.with_as_of(as_of);
            }
        }

        Ok(price)
    }
}

impl PriceSource for CoinGeckoAdapter {
    fn id(&self) -> ProviderId {
        self.id.clone()
    }

    fn fetch<'a>(&'a self, pair: &'a PairKey) -> FetchFuture<'a> {
        Box::pin(async move {
            let coin_id = coin_slug(&pair.asset);
            let vs_currency = pair.quote.as_str().to_ascii_lowercase();
            let request = self.request_for(&coin_id, &vs_currency);

            let body = fetch_body(self.http_client.as_ref(), &self.id, request).await?;
            self.parse_price(&body, &coin_id, &vs_currency)
        })
    }
}

fn coin_slug(asset: &AssetId) -> String {
    let slug = match asset.as_str() {
        "BTC" => "bitcoin",
        "ETH" => "ethereum",
        "SOL" => "solana",
        "USDC" => "usd-coin",
        "USDT" => "tether",
        "BNB" => "binancecoin",
        "XRP" => "ripple",
        "ADA" => "cardano",
        "DOGE" => "dogecoin",
        "DOT" => "polkadot",
        "AVAX" => "avalanche-2",
        "LINK" => "chainlink",
        "MATIC" => "matic-network",
        other => return other.to_ascii_lowercase(),
    };
    String::from(slug)
}
