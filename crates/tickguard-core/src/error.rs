use thiserror::Error;

/// Validation and contract errors exposed by `tickguard-core`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("asset identifier cannot be empty")]
    EmptyAsset,
    #[error("asset identifier length {len} exceeds max {max}")]
    AssetTooLong { len: usize, max: usize },
    #[error("asset identifier must start with an ASCII letter or digit: '{ch}'")]
    AssetInvalidStart { ch: char },
    #[error("asset identifier contains invalid character '{ch}' at index {index}")]
    AssetInvalidChar { ch: char, index: usize },

    #[error("quote currency must be 3 to 5 ASCII alphanumerics: '{value}'")]
    InvalidQuoteCurrency { value: String },

    #[error("provider id must be lowercase ascii, digits, '-' or '_': '{value}'")]
    InvalidProviderId { value: String },
    #[error("invalid provider kind '{value}', expected one of coingecko, coinbase, kraken")]
    InvalidProviderKind { value: String },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },

    #[error("field '{field}' must be positive, got {value}")]
    NonPositiveValue { field: &'static str, value: String },
    #[error("field '{field}' must be non-negative, got {value}")]
    NegativeValue { field: &'static str, value: String },
    #[error("field '{field}' is not a decimal number: '{value}'")]
    NotDecimal { field: &'static str, value: String },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config must declare at least one provider")]
    NoProviders,

    #[error("duplicate provider id '{id}'")]
    DuplicateProvider { id: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
