//! Provider adapters. Each one owns its vendor's URL layout and JSON schema
//! and returns a normalized [`SourcePrice`](crate::SourcePrice).

mod coinbase;
mod coingecko;
mod kraken;

pub use coinbase::CoinbaseAdapter;
pub use coingecko::CoinGeckoAdapter;
pub use kraken::KrakenAdapter;

use crate::data_source::SourceError;
use crate::http_client::{HttpClient, HttpRequest};
use crate::ProviderId;

/// Execute `request` and return the body of a 2xx response.
///
/// Transport errors and non-2xx statuses are classified here so adapters
/// only deal with parsing.
pub(crate) async fn fetch_body(
    http_client: &dyn HttpClient,
    provider: &ProviderId,
    request: HttpRequest,
) -> Result<String, SourceError> {
    let response = http_client
        .execute(request)
        .await
        .map_err(|error| error.into_source_error(provider))?;

    if !response.is_success() {
        return Err(SourceError::from_status(provider, response.status));
    }

    Ok(response.body)
}

pub(crate) fn malformed(provider: &ProviderId, detail: impl std::fmt::Display) -> SourceError {
    SourceError::malformed(format!("{provider} returned an unreadable payload: {detail}"))
}

fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}
