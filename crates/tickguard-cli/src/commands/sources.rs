use serde::Serialize;
use tickguard_core::{
    PriceResolver, ProviderId, ProviderKind, ProviderSnapshot, QuotaConfig, TickguardConfig,
};

use crate::error::CliError;

use super::CommandResult;

#[derive(Debug, Serialize)]
struct SourcesResponseData {
    sources: Vec<SourceView>,
}

#[derive(Debug, Serialize)]
struct SourceView {
    id: ProviderId,
    kind: ProviderKind,
    enabled: bool,
    priority: u32,
    request_timeout_ms: u64,
    api_key_env: String,
    api_key_present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quota: Option<QuotaConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    runtime: Option<ProviderSnapshot>,
}

/// Lists configured providers without calling any of them.
pub fn run(config: &TickguardConfig) -> Result<CommandResult, CliError> {
    let resolver = PriceResolver::builder().with_config(config)?.build()?;
    let mut snapshots = resolver.provider_snapshots();

    let mut sources = config
        .providers
        .iter()
        .map(|provider| {
            let id = provider.provider_id();
            let runtime = if provider.enabled {
                snapshots
                    .iter()
                    .position(|snapshot| snapshot.id == id)
                    .map(|index| snapshots.swap_remove(index))
            } else {
                None
            };
            SourceView {
                id,
                kind: provider.kind,
                enabled: provider.enabled,
                priority: provider.priority,
                request_timeout_ms: provider.request_timeout_ms,
                api_key_env: provider.api_key_env(),
                api_key_present: provider.api_key().is_some(),
                base_url: provider.base_url.clone(),
                quota: provider.quota,
                runtime,
            }
        })
        .collect::<Vec<_>>();
    sources.sort_by_key(|source| (!source.enabled, source.priority));

    let source_chain = resolver.provider_order();
    let data = serde_json::to_value(SourcesResponseData { sources })?;
    Ok(CommandResult::ok(data).with_source_chain(source_chain))
}

#[cfg(test)]
mod tests {
    use tickguard_core::{ProviderConfig, ProviderKind, TickguardConfig};

    use super::run;

    #[test]
    fn lists_enabled_providers_in_priority_order_with_breaker_state() {
        let mut kraken = ProviderConfig::new(ProviderKind::Kraken, 0);
        kraken.max_concurrency = Some(2);
        let mut coinbase = ProviderConfig::new(ProviderKind::Coinbase, 5);
        coinbase.enabled = false;
        let config = TickguardConfig {
            providers: vec![
                ProviderConfig::new(ProviderKind::Coingecko, 1),
                coinbase,
                kraken,
            ],
            ..TickguardConfig::default()
        };

        let result = run(&config).expect("lists sources");
        let sources = result.data["sources"].as_array().expect("array");

        assert_eq!(sources.len(), 3);
        assert_eq!(sources[0]["id"], "kraken");
        assert_eq!(sources[0]["runtime"]["max_concurrency"], 2);
        assert_eq!(sources[0]["runtime"]["breaker"]["state"], "closed");
        assert_eq!(sources[1]["id"], "coingecko");
        assert_eq!(sources[2]["id"], "coinbase");
        assert!(sources[2].get("runtime").is_none());
        assert_eq!(result.source_chain.len(), 2);
    }
}
