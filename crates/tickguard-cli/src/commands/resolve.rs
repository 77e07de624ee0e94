use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tickguard_core::{
    Freshness, MetricsSnapshot, PriceResolver, ProviderFailure, ProviderId, ResolutionRequest,
    ResolutionResult, ResolveError, TickguardConfig, UtcDateTime,
};

use crate::cli::ResolveArgs;
use crate::error::CliError;
use crate::output::{ErrorView, Outcome};

use super::CommandResult;

#[derive(Debug, Serialize)]
struct ResolveResponseData {
    prices: Vec<PriceView>,
    metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
struct PriceView {
    pair: String,
    status: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderId>,
    from_cache: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetched_at: Option<UtcDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    age_ms: Option<u64>,
}

pub async fn run(args: &ResolveArgs, config: &TickguardConfig) -> Result<CommandResult, CliError> {
    let freshness = freshness(args);
    let requests = args
        .assets
        .iter()
        .map(|asset| {
            ResolutionRequest::parse(asset, &args.quote)
                .map(|request| request.with_freshness(freshness))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let resolver = Arc::new(PriceResolver::builder().with_config(config)?.build()?);
    let results = resolver.resolve_many(requests).await;

    collect(results, resolver.metrics())
}

fn freshness(args: &ResolveArgs) -> Freshness {
    if args.allow_stale {
        Freshness::AllowStale
    } else if args.refresh {
        Freshness::Refresh
    } else if let Some(secs) = args.max_age_secs {
        Freshness::MaxAge(Duration::from_secs(secs))
    } else {
        Freshness::Ttl
    }
}

fn collect(
    results: Vec<Result<ResolutionResult, ResolveError>>,
    metrics: MetricsSnapshot,
) -> Result<CommandResult, CliError> {
    let mut prices = Vec::with_capacity(results.len());
    let mut outcome = Outcome::Ok;
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut source_chain: Vec<ProviderId> = Vec::new();
    let mut latency_ms = 0;
    let mut all_cached = !results.is_empty();

    for result in results {
        match result {
            Ok(resolved) => {
                let status = if resolved.degraded {
                    Outcome::Degraded
                } else {
                    Outcome::Ok
                };
                outcome = outcome.max(status);
                latency_ms = latency_ms.max(resolved.latency_ms);
                all_cached &= resolved.from_cache;
                extend_chain(&mut source_chain, &resolved.source_chain);
                warnings.extend(resolved.warnings);
                errors.extend(resolved.failures.iter().map(failure_view));
                prices.push(PriceView {
                    pair: resolved.pair.to_string(),
                    status,
                    value: Some(resolved.value),
                    provider: Some(resolved.provider),
                    from_cache: resolved.from_cache,
                    fetched_at: Some(resolved.fetched_at),
                    age_ms: Some(u64::try_from(resolved.age.as_millis()).unwrap_or(u64::MAX)),
                });
            }
            Err(error) => {
                outcome = outcome.max(Outcome::Unavailable);
                all_cached = false;
                let pair = match &error {
                    ResolveError::AllProvidersExhausted { pair, failures } => {
                        let tried = failures
                            .iter()
                            .map(|failure| failure.provider.clone())
                            .collect::<Vec<_>>();
                        extend_chain(&mut source_chain, &tried);
                        errors.extend(failures.iter().map(failure_view));
                        pair.clone()
                    }
                    ResolveError::TaskFailed { pair, .. } => pair.clone(),
                };
                errors.push(ErrorView {
                    code: error.code().to_owned(),
                    message: error.to_string(),
                    provider: None,
                    retryable: false,
                });
                prices.push(PriceView {
                    pair: pair.to_string(),
                    status: Outcome::Unavailable,
                    value: None,
                    provider: None,
                    from_cache: false,
                    fetched_at: None,
                    age_ms: None,
                });
            }
        }
    }

    let data = serde_json::to_value(ResolveResponseData { prices, metrics })?;
    Ok(CommandResult::ok(data)
        .with_outcome(outcome)
        .with_warnings(warnings)
        .with_errors(errors)
        .with_latency(latency_ms)
        .with_cache_hit(all_cached)
        .with_source_chain(source_chain))
}

fn failure_view(failure: &ProviderFailure) -> ErrorView {
    ErrorView {
        code: failure.code().to_owned(),
        message: format!(
            "{} (attempts: {})",
            failure.error.message(),
            failure.attempts
        ),
        provider: Some(failure.provider.clone()),
        retryable: failure.error.retryable(),
    }
}

fn extend_chain(chain: &mut Vec<ProviderId>, providers: &[ProviderId]) {
    for provider in providers {
        if !chain.contains(provider) {
            chain.push(provider.clone());
        }
    }
}
