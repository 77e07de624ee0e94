//! Contract every provider adapter honors, checked against scripted HTTP.
//!
//! Each adapter must turn its vendor payload into an exact decimal price and
//! classify failures the same way, so the resolver can treat them alike.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tickguard_core::{
    CoinGeckoAdapter, CoinbaseAdapter, HttpClient, HttpError, HttpResponse, KrakenAdapter,
    PairKey, PriceSource, ScriptedHttpClient, SourceErrorKind,
};

struct ProviderCase {
    name: &'static str,
    build: fn(Arc<dyn HttpClient>) -> Arc<dyn PriceSource>,
    btc_usd_body: &'static str,
    expected: Decimal,
    url_fragment: &'static str,
}

fn provider_cases() -> Vec<ProviderCase> {
    vec![
        ProviderCase {
            name: "coingecko",
            build: |http| Arc::new(CoinGeckoAdapter::with_http_client(http)),
            btc_usd_body: r#"{"bitcoin":{"usd":67187.330000001,"last_updated_at":1711357200}}"#,
            expected: dec!(67187.330000001),
            url_fragment: "ids=bitcoin",
        },
        ProviderCase {
            name: "coinbase",
            build: |http| Arc::new(CoinbaseAdapter::with_http_client(http)),
            btc_usd_body: r#"{"data":{"amount":"67187.33","base":"BTC","currency":"USD"}}"#,
            expected: dec!(67187.33),
            url_fragment: "BTC-USD",
        },
        ProviderCase {
            name: "kraken",
            build: |http| Arc::new(KrakenAdapter::with_http_client(http)),
            btc_usd_body: r#"{"error":[],"result":{"XXBTZUSD":{"c":["67187.30000","0.00100000"]}}}"#,
            expected: dec!(67187.3),
            url_fragment: "pair=XBTUSD",
        },
    ]
}

fn btc_usd() -> PairKey {
    PairKey::parse("BTC", "USD").expect("valid pair")
}

async fn fetch_with(
    case: &ProviderCase,
    outcome: Result<HttpResponse, HttpError>,
) -> (Result<Decimal, SourceErrorKind>, Arc<ScriptedHttpClient>) {
    let http = Arc::new(ScriptedHttpClient::new(vec![outcome]));
    let source = (case.build)(http.clone());
    let result = source
        .fetch(&btc_usd())
        .await
        .map(|price| price.value)
        .map_err(|error| error.kind());
    (result, http)
}

#[tokio::test]
async fn every_adapter_parses_an_exact_decimal_price() {
    for case in provider_cases() {
        let (result, http) = fetch_with(&case, Ok(HttpResponse::ok_json(case.btc_usd_body))).await;

        let value = result.unwrap_or_else(|kind| panic!("{}: fetch failed with {kind:?}", case.name));
        assert_eq!(value, case.expected, "{}: price", case.name);

        let requests = http.requests();
        assert_eq!(requests.len(), 1, "{}: exactly one request", case.name);
        assert!(
            requests[0].url.contains(case.url_fragment),
            "{}: url '{}' should contain '{}'",
            case.name,
            requests[0].url,
            case.url_fragment
        );
    }
}

#[tokio::test]
async fn every_adapter_reports_its_own_provider_id() {
    for case in provider_cases() {
        let source = (case.build)(Arc::new(ScriptedHttpClient::default()));
        assert_eq!(source.id().as_str(), case.name);
    }
}

#[tokio::test]
async fn status_codes_classify_the_same_across_adapters() {
    let expectations = [
        (429, SourceErrorKind::RateLimited),
        (503, SourceErrorKind::Transient),
        (500, SourceErrorKind::Transient),
        (408, SourceErrorKind::Transient),
        (401, SourceErrorKind::Permanent),
        (404, SourceErrorKind::Permanent),
    ];

    for case in provider_cases() {
        for (status, expected) in expectations {
            let (result, _) =
                fetch_with(&case, Ok(HttpResponse::with_status(status, "{}"))).await;
            assert_eq!(
                result,
                Err(expected),
                "{}: status {status}",
                case.name
            );
        }
    }
}

#[tokio::test]
async fn transport_failures_are_transient_unless_marked_otherwise() {
    for case in provider_cases() {
        let (result, _) = fetch_with(&case, Err(HttpError::new("connection reset"))).await;
        assert_eq!(result, Err(SourceErrorKind::Transient), "{}", case.name);

        let (result, _) =
            fetch_with(&case, Err(HttpError::non_retryable("invalid url"))).await;
        assert_eq!(result, Err(SourceErrorKind::Permanent), "{}", case.name);
    }
}

#[tokio::test]
async fn unreadable_payloads_are_malformed_and_not_retried() {
    for case in provider_cases() {
        for body in ["not json", "{}", r#"{"data":null,"result":{}}"#] {
            let (result, _) = fetch_with(&case, Ok(HttpResponse::ok_json(body))).await;
            let kind = result.expect_err("payload has no price");
            assert!(
                matches!(kind, SourceErrorKind::Malformed | SourceErrorKind::Permanent),
                "{}: body {body:?} gave {kind:?}",
                case.name
            );
        }
    }
}

#[tokio::test]
async fn non_positive_prices_are_rejected() {
    let bodies = [
        r#"{"bitcoin":{"usd":0}}"#,
        r#"{"data":{"amount":"-1","base":"BTC","currency":"USD"}}"#,
        r#"{"error":[],"result":{"XXBTZUSD":{"c":["0.00000","1"]}}}"#,
    ];

    for (case, body) in provider_cases().iter().zip(bodies) {
        let (result, _) = fetch_with(case, Ok(HttpResponse::ok_json(body))).await;
        assert_eq!(result, Err(SourceErrorKind::Malformed), "{}", case.name);
    }
}
