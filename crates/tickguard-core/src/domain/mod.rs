//! # Domain Models
//!
//! Canonical domain types for tickguard price resolution.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`AssetId`] | Validated asset/token ticker |
//! | [`QuoteCurrency`] | Currency a price is denominated in |
//! | [`PairKey`] | (asset, quote) cache and request key |
//! | [`SourcePrice`] | Provider-reported decimal price |
//! | [`PricePoint`] | Canonical cached price with provenance |
//! | [`UtcDateTime`] | UTC timestamp |
//!
//! Monetary values are `rust_decimal::Decimal` end to end; nothing here
//! round-trips through `f64`.

mod asset;
mod price;
mod timestamp;

pub use asset::{AssetId, PairKey, QuoteCurrency};
pub use price::{parse_decimal, PricePoint, SourcePrice};
pub use timestamp::UtcDateTime;
