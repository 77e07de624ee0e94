use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{PairKey, ProviderId, UtcDateTime, ValidationError};

/// Price as reported by one provider, already normalized to a decimal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePrice {
    pub value: Decimal,
    /// Upstream timestamp when the provider reports one.
    pub as_of: Option<UtcDateTime>,
}

impl SourcePrice {
    pub fn new(value: Decimal) -> Result<Self, ValidationError> {
        Ok(Self {
            value: validate_price(value)?,
            as_of: None,
        })
    }

    pub fn with_as_of(mut self, as_of: UtcDateTime) -> Self {
        self.as_of = Some(as_of);
        self
    }
}

/// Canonical price record held in the cache and returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub pair: PairKey,
    pub value: Decimal,
    pub provider: ProviderId,
    pub fetched_at: UtcDateTime,
}

impl PricePoint {
    pub fn new(pair: PairKey, price: SourcePrice, provider: ProviderId) -> Self {
        Self {
            pair,
            value: price.value,
            provider,
            fetched_at: UtcDateTime::now(),
        }
    }
}

/// Parse an upstream decimal literal without going through binary floating point.
///
/// Accepts plain (`"67187.33"`) and scientific (`"6.718733e4"`) notation.
pub fn parse_decimal(field: &'static str, text: &str) -> Result<Decimal, ValidationError> {
    let trimmed = text.trim().trim_matches('"');
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| ValidationError::NotDecimal {
            field,
            value: text.to_owned(),
        })
}

fn validate_price(value: Decimal) -> Result<Decimal, ValidationError> {
    if value <= Decimal::ZERO {
        return Err(ValidationError::NonPositiveValue {
            field: "price",
            value: value.to_string(),
        });
    }
    Ok(value.normalize())
}
