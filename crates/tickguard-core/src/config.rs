//! Startup configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) yields the stock
//! three-provider setup. Secrets never live in the file: API keys and the
//! admin reset token are read from the environment variables the config
//! names.
//!
//! ```toml
//! [[providers]]
//! kind = "coingecko"
//! priority = 0
//! failure_threshold = 5
//! cooldown_secs = 60
//!
//! [[providers]]
//! kind = "kraken"
//! priority = 1
//! max_concurrency = 2
//!
//! [cache]
//! ttl_secs = 3600
//!
//! [failsafe]
//! halt_threshold_pct = 10
//! ```

use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize};

use crate::cache::PriceCache;
use crate::failsafe::FailSafeMonitor;
use crate::provider_policy::ProviderPolicy;
use crate::retry::{Backoff, RetryPolicy};
use crate::{parse_decimal, ConfigError, ProviderId, ProviderKind};

pub const ADMIN_TOKEN_ENV: &str = "TICKGUARD_ADMIN_TOKEN";
pub const CONFIG_PATH_ENV: &str = "TICKGUARD_CONFIG";

/// Longest breaker cooldown a provider may configure: one day.
pub const MAX_COOLDOWN_SECS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TickguardConfig {
    pub providers: Vec<ProviderConfig>,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub failsafe: FailSafeConfig,
    pub logging: LoggingConfig,
}

impl Default for TickguardConfig {
    fn default() -> Self {
        Self {
            providers: ProviderKind::ALL
                .iter()
                .zip(0_u32..)
                .map(|(kind, priority)| ProviderConfig::new(*kind, priority))
                .collect(),
            cache: CacheConfig::default(),
            retry: RetryConfig::default(),
            failsafe: FailSafeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TickguardConfig {
    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load `path` when given, else `$TICKGUARD_CONFIG`, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => match env::var(CONFIG_PATH_ENV) {
                Ok(path) if !path.trim().is_empty() => Self::load(path.trim()),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let enabled = self.enabled_providers().collect::<Vec<_>>();
        if enabled.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        let mut seen = HashSet::new();
        for provider in &enabled {
            let id = provider.provider_id();
            if !seen.insert(id.clone()) {
                return Err(ConfigError::DuplicateProvider {
                    id: id.to_string(),
                });
            }
            provider.validate()?;
        }

        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.ttl_secs", "must be > 0"));
        }
        if self.cache.max_entries == Some(0) {
            return Err(ConfigError::invalid("cache.max_entries", "must be > 0 when set"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be >= 1"));
        }
        if self.retry.base_backoff_ms == 0 {
            return Err(ConfigError::invalid("retry.base_backoff_ms", "must be > 0"));
        }
        if self.retry.max_backoff_ms < self.retry.base_backoff_ms {
            return Err(ConfigError::invalid(
                "retry.max_backoff_ms",
                "must be >= retry.base_backoff_ms",
            ));
        }

        let threshold = self.failsafe.halt_threshold_pct;
        if threshold <= Decimal::ZERO || threshold > Decimal::ONE_HUNDRED {
            return Err(ConfigError::invalid(
                "failsafe.halt_threshold_pct",
                format!("must be in (0, 100], got {threshold}"),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "cannot be empty"));
        }

        Ok(())
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|provider| provider.enabled)
    }
}

/// One configured upstream provider.
///
/// Unset resilience fields fall back to the per-kind defaults of
/// [`ProviderPolicy::default_for`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ProviderId>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquire_timeout_ms: Option<u64>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Environment variable holding the API key. Defaults to
    /// `TICKGUARD_<KIND>_API_KEY`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaConfig {
    pub limit: u32,
    pub window_secs: u64,
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, priority: u32) -> Self {
        Self {
            kind,
            id: None,
            priority,
            enabled: true,
            failure_threshold: None,
            cooldown_secs: None,
            max_concurrency: None,
            acquire_timeout_ms: None,
            request_timeout_ms: default_request_timeout_ms(),
            quota: None,
            base_url: None,
            api_key_env: None,
        }
    }

    pub fn provider_id(&self) -> ProviderId {
        self.id.clone().unwrap_or_else(|| self.kind.default_id())
    }

    pub fn policy(&self) -> ProviderPolicy {
        let mut policy = ProviderPolicy::default_for(self.kind, self.priority);
        policy.provider_id = self.provider_id();

        if let Some(failure_threshold) = self.failure_threshold {
            policy.breaker.failure_threshold = failure_threshold;
        }
        if let Some(cooldown_secs) = self.cooldown_secs {
            policy.breaker.cooldown = Duration::from_secs(cooldown_secs);
        }
        if let Some(max_concurrency) = self.max_concurrency {
            policy.max_concurrency = max_concurrency;
        }
        if let Some(acquire_timeout_ms) = self.acquire_timeout_ms {
            policy.acquire_timeout = Duration::from_millis(acquire_timeout_ms);
        }
        if let Some(quota) = self.quota {
            policy = policy.with_quota(quota.limit, Duration::from_secs(quota.window_secs));
        }
        policy
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn api_key_env(&self) -> String {
        self.api_key_env.clone().unwrap_or_else(|| {
            format!("TICKGUARD_{}_API_KEY", self.kind.as_str().to_ascii_uppercase())
        })
    }

    /// API key from the environment, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        env::var(self.api_key_env())
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let id = self.provider_id();
        if self.failure_threshold == Some(0) {
            return Err(ConfigError::invalid(
                format!("providers.{id}.failure_threshold"),
                "must be >= 1",
            ));
        }
        if self.cooldown_secs.is_some_and(|secs| secs > MAX_COOLDOWN_SECS) {
            return Err(ConfigError::invalid(
                format!("providers.{id}.cooldown_secs"),
                "must be <= 86400",
            ));
        }
        if self.max_concurrency == Some(0) {
            return Err(ConfigError::invalid(
                format!("providers.{id}.max_concurrency"),
                "must be >= 1",
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                format!("providers.{id}.request_timeout_ms"),
                "must be > 0",
            ));
        }
        if let Some(quota) = self.quota {
            if quota.limit == 0 || quota.window_secs == 0 {
                return Err(ConfigError::invalid(
                    format!("providers.{id}.quota"),
                    "limit and window_secs must be > 0",
                ));
            }
        }
        if let Some(base_url) = &self.base_url {
            if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
                return Err(ConfigError::invalid(
                    format!("providers.{id}.base_url"),
                    "must be an http(s) URL",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3_600,
            max_entries: None,
        }
    }
}

impl CacheConfig {
    pub fn build(&self) -> PriceCache {
        let cache = PriceCache::new(Duration::from_secs(self.ttl_secs));
        match self.max_entries {
            Some(max_entries) => cache.with_max_entries(max_entries),
            None => cache,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 3_000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(self.base_backoff_ms),
                factor: 2.0,
                max: Duration::from_millis(self.max_backoff_ms),
                jitter: self.jitter,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FailSafeConfig {
    /// Percentage, e.g. `10` halts at a 10% drawdown from peak.
    #[serde(deserialize_with = "deserialize_decimal")]
    pub halt_threshold_pct: Decimal,
    pub admin_token_env: String,
}

impl Default for FailSafeConfig {
    fn default() -> Self {
        Self {
            halt_threshold_pct: Decimal::TEN,
            admin_token_env: String::from(ADMIN_TOKEN_ENV),
        }
    }
}

impl FailSafeConfig {
    /// Build the monitor, picking up the admin token from the environment.
    pub fn monitor(&self) -> Result<FailSafeMonitor, ConfigError> {
        let monitor = FailSafeMonitor::new(self.halt_threshold_pct)?;
        match env::var(&self.admin_token_env) {
            Ok(token) if !token.trim().is_empty() => Ok(monitor.with_admin_token(token.trim())),
            _ => {
                tracing::warn!(
                    env = %self.admin_token_env,
                    "no admin token configured; a fail-safe halt cannot be reset in this process"
                );
                Ok(monitor)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DecimalLiteral {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Accept `10`, `12.5` or `"12.5"` for decimal settings.
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    match DecimalLiteral::deserialize(deserializer)? {
        DecimalLiteral::Integer(value) => Ok(Decimal::from(value)),
        DecimalLiteral::Float(value) => Decimal::try_from(value)
            .map(|value| value.normalize())
            .map_err(D::Error::custom),
        DecimalLiteral::Text(text) => parse_decimal("halt_threshold_pct", &text).map_err(D::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn empty_document_yields_stock_setup() {
        let config = TickguardConfig::from_toml_str("").expect("defaults are valid");

        let ids = config
            .enabled_providers()
            .map(|provider| provider.provider_id().to_string())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["coingecko", "coinbase", "kraken"]);
        assert_eq!(config.cache.ttl_secs, 3_600);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.failsafe.halt_threshold_pct, dec!(10));
    }

    #[test]
    fn provider_overrides_apply_on_top_of_kind_defaults() {
        let config = TickguardConfig::from_toml_str(
            r#"
            [[providers]]
            kind = "kraken"
            id = "kraken-eu"
            priority = 4
            failure_threshold = 2
            cooldown_secs = 15

            [failsafe]
            halt_threshold_pct = 12.5
            "#,
        )
        .expect("valid config");

        let policy = config.providers[0].policy();
        assert_eq!(policy.provider_id.as_str(), "kraken-eu");
        assert_eq!(policy.priority, 4);
        assert_eq!(policy.breaker.failure_threshold, 2);
        assert_eq!(policy.breaker.cooldown, Duration::from_secs(15));
        assert_eq!(policy.max_concurrency, 2);
        assert_eq!(config.failsafe.halt_threshold_pct, dec!(12.5));
    }

    #[test]
    fn rejects_duplicate_provider_ids() {
        let error = TickguardConfig::from_toml_str(
            r#"
            [[providers]]
            kind = "coinbase"

            [[providers]]
            kind = "coinbase"
            priority = 1
            "#,
        )
        .expect_err("duplicate");

        assert!(matches!(error, ConfigError::DuplicateProvider { id } if id == "coinbase"));
    }

    #[test]
    fn rejects_all_providers_disabled() {
        let error = TickguardConfig::from_toml_str(
            r#"
            [[providers]]
            kind = "coinbase"
            enabled = false
            "#,
        )
        .expect_err("no providers");

        assert!(matches!(error, ConfigError::NoProviders));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for document in [
            "[cache]\nttl_secs = 0",
            "[retry]\nmax_attempts = 0",
            "[failsafe]\nhalt_threshold_pct = 150",
            "[[providers]]\nkind = \"kraken\"\nmax_concurrency = 0",
            "[[providers]]\nkind = \"kraken\"\ncooldown_secs = 86401",
        ] {
            assert!(
                matches!(
                    TickguardConfig::from_toml_str(document),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "{document}"
            );
        }
    }

    #[test]
    fn rejects_cooldown_beyond_one_day() {
        let error = TickguardConfig::from_toml_str(
            "[[providers]]\nkind=\"kraken\"\nfailure_threshold=1\ncooldown_secs=9223372036854775807",
        )
        .expect_err("cooldown too long");

        assert!(matches!(
            error,
            ConfigError::InvalidValue { ref field, .. } if field == "providers.kraken.cooldown_secs"
        ));

        let config = TickguardConfig::from_toml_str(
            "[[providers]]\nkind = \"kraken\"\ncooldown_secs = 86400",
        )
        .expect("one day is allowed");
        assert_eq!(
            config.providers[0].policy().breaker.cooldown,
            Duration::from_secs(MAX_COOLDOWN_SECS)
        );
    }

    #[test]
    fn fractional_threshold_accepts_a_float_literal() {
        let config = TickguardConfig::from_toml_str("[failsafe]\nhalt_threshold_pct = 12.5")
            .expect("float threshold parses");

        assert_eq!(config.failsafe.halt_threshold_pct, dec!(12.5));
        assert_eq!(config.failsafe.halt_threshold_pct.to_string(), "12.5");
        assert!(config.failsafe.monitor().is_ok());
    }

    #[test]
    fn rejects_unknown_provider_kind() {
        let error = TickguardConfig::from_toml_str("[[providers]]\nkind = \"binance\"")
            .expect_err("unknown kind");
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[cache]\nttl_secs = 30\nmax_entries = 100").expect("write");

        let config = TickguardConfig::load(file.path()).expect("load");
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.cache.max_entries, Some(100));
        assert_eq!(config.cache.build().ttl(), Duration::from_secs(30));
    }

    #[test]
    fn missing_file_reports_path() {
        let error = TickguardConfig::load("/nonexistent/tickguard.toml").expect_err("missing");
        assert!(error.to_string().contains("/nonexistent/tickguard.toml"));
    }

    #[test]
    fn api_key_env_defaults_per_kind() {
        let provider = ProviderConfig::new(ProviderKind::Coingecko, 0);
        assert_eq!(provider.api_key_env(), "TICKGUARD_COINGECKO_API_KEY");
    }
}
