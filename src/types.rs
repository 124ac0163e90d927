//! Core data structures shared across the pricing and resolution pipeline.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::TaxGraphError;

/// Seconds in one week, the coarsest candle granularity in use.
pub const SECONDS_IN_WEEK: u64 = 604_800;

/// Wire spelling of a field whose value is pending resolution. Sources
/// that cannot name a counterparty (or an exchange) emit this marker.
pub const UNKNOWN_SENTINEL: &str = "__unknown";

/// Seconds in one day.
pub const SECONDS_IN_DAY: u64 = 86_400;

/// Which price of an OHLCV bar is reported as the transaction price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceSource {
    Open,
    High,
    Low,
    Close,
    /// Open when the transaction falls in the first half of the bar,
    /// close otherwise.
    Nearest,
}

impl FromStr for PriceSource {
    type Err = TaxGraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PriceSource::Open),
            "high" => Ok(PriceSource::High),
            "low" => Ok(PriceSource::Low),
            "close" => Ok(PriceSource::Close),
            "nearest" => Ok(PriceSource::Nearest),
            other => Err(TaxGraphError::value(format!(
                "historical price type must be one of open, high, low, close, nearest; got: {other}"
            ))),
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSource::Open => write!(f, "open"),
            PriceSource::High => write!(f, "high"),
            PriceSource::Low => write!(f, "low"),
            PriceSource::Close => write!(f, "close"),
            PriceSource::Nearest => write!(f, "nearest"),
        }
    }
}

/// A single OHLCV candlestick.
///
/// Immutable once produced; multi-hop pricing multiplies bars together
/// rather than mutating them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl HistoricalBar {
    /// Bar priced at exactly 1.0, used for same-asset conversions.
    pub fn unit(timestamp: DateTime<Utc>) -> Self {
        Self::constant(timestamp, Decimal::ONE, Duration::from_secs(SECONDS_IN_WEEK), Decimal::ZERO)
    }

    /// Zero-priced bar, used for untradeable assets.
    pub fn zero(timestamp: DateTime<Utc>) -> Self {
        Self::constant(timestamp, Decimal::ZERO, Duration::from_secs(SECONDS_IN_WEEK), Decimal::ZERO)
    }

    /// Flat bar where all four prices equal `rate`.
    pub fn constant(timestamp: DateTime<Utc>, rate: Decimal, duration: Duration, volume: Decimal) -> Self {
        HistoricalBar {
            duration,
            timestamp,
            open: rate,
            high: rate,
            low: rate,
            close: rate,
            volume,
        }
    }

    /// Select the transaction price from this bar.
    ///
    /// `Nearest` compares the transaction timestamp against the bar
    /// midpoint: first half reports the open, second half the close.
    pub fn price(&self, source: PriceSource, transaction_timestamp: DateTime<Utc>) -> Decimal {
        match source {
            PriceSource::Open => self.open,
            PriceSource::High => self.high,
            PriceSource::Low => self.low,
            PriceSource::Close => self.close,
            PriceSource::Nearest => {
                let elapsed = (transaction_timestamp - self.timestamp).num_milliseconds();
                if elapsed * 2 <= self.duration.as_millis() as i64 {
                    self.open
                } else {
                    self.close
                }
            }
        }
    }
}

/// Cache key for a historical price lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetPairAndTimestamp {
    pub timestamp: DateTime<Utc>,
    pub from_asset: String,
    pub to_asset: String,
    pub exchange: String,
}

impl AssetPairAndTimestamp {
    pub fn new(
        timestamp: DateTime<Utc>,
        from_asset: impl Into<String>,
        to_asset: impl Into<String>,
        exchange: impl Into<String>,
    ) -> Self {
        AssetPairAndTimestamp {
            timestamp,
            from_asset: from_asset.into(),
            to_asset: to_asset.into(),
            exchange: exchange.into(),
        }
    }

    /// Single-bar cache keys are floored to the minute: one minute is the
    /// most granular pricing available, and flooring maximizes cache reuse.
    /// Bundle keys are stored raw (offset +1 ms by the writer) and never
    /// collide with floored keys.
    pub fn floored_to_minute(&self) -> Self {
        let floored = self
            .timestamp
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(self.timestamp);
        AssetPairAndTimestamp {
            timestamp: floored,
            from_asset: self.from_asset.clone(),
            to_asset: self.to_asset.clone(),
            exchange: self.exchange.clone(),
        }
    }
}

/// A cached price entry: either a single bar keyed at minute resolution or
/// a bundle of weekly bars keyed at its raw (+1 ms) timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedPrice {
    Bar(HistoricalBar),
    Bundle(Vec<HistoricalBar>),
}

/// What an optimization pass must cover: every asset that appears in the
/// input transactions, and the earliest timestamp among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionManifest {
    pub first_transaction: DateTime<Utc>,
    pub assets: BTreeSet<String>,
    pub native_fiat: String,
}

impl TransactionManifest {
    pub fn new(
        first_transaction: DateTime<Utc>,
        assets: impl IntoIterator<Item = String>,
        native_fiat: impl Into<String>,
    ) -> Self {
        TransactionManifest {
            first_transaction,
            assets: assets.into_iter().collect(),
            native_fiat: native_fiat.into(),
        }
    }
}

/// Tri-state field value: distinguishes "not yet known, pending
/// resolution" from an actual (possibly zero) value. Absent-entirely is
/// modeled separately with `Option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaybeUnknown<T> {
    Unknown,
    Known(T),
}

impl<T> MaybeUnknown<T> {
    pub fn is_unknown(&self) -> bool {
        matches!(self, MaybeUnknown::Unknown)
    }

    pub fn known(&self) -> Option<&T> {
        match self {
            MaybeUnknown::Known(value) => Some(value),
            MaybeUnknown::Unknown => None,
        }
    }

    pub fn into_known(self) -> Option<T> {
        match self {
            MaybeUnknown::Known(value) => Some(value),
            MaybeUnknown::Unknown => None,
        }
    }
}

impl<T: fmt::Display> fmt::Display for MaybeUnknown<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaybeUnknown::Unknown => write!(f, "{UNKNOWN_SENTINEL}"),
            MaybeUnknown::Known(value) => value.fmt(f),
        }
    }
}

impl<T> From<T> for MaybeUnknown<T> {
    fn from(value: T) -> Self {
        MaybeUnknown::Known(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn bar() -> HistoricalBar {
        HistoricalBar {
            duration: Duration::from_secs(60),
            timestamp: Utc.with_ymd_and_hms(2022, 1, 1, 13, 30, 0).unwrap(),
            open: dec!(1.0),
            high: dec!(3.0),
            low: dec!(0.5),
            close: dec!(2.0),
            volume: Decimal::ZERO,
        }
    }

    #[test]
    fn test_price_selection_fixed_sources() {
        let b = bar();
        let ts = b.timestamp;
        assert_eq!(b.price(PriceSource::Open, ts), dec!(1.0));
        assert_eq!(b.price(PriceSource::High, ts), dec!(3.0));
        assert_eq!(b.price(PriceSource::Low, ts), dec!(0.5));
        assert_eq!(b.price(PriceSource::Close, ts), dec!(2.0));
    }

    #[test]
    fn test_price_selection_nearest() {
        let b = bar();
        for seconds in [-1i64, 0, 1, 29] {
            let ts = b.timestamp + chrono::Duration::seconds(seconds);
            assert_eq!(b.price(PriceSource::Nearest, ts), b.open, "offset {seconds}");
        }
        for seconds in [31i64, 59, 60, 61] {
            let ts = b.timestamp + chrono::Duration::seconds(seconds);
            assert_eq!(b.price(PriceSource::Nearest, ts), b.close, "offset {seconds}");
        }
    }

    #[test]
    fn test_price_source_parsing() {
        assert_eq!("nearest".parse::<PriceSource>().unwrap(), PriceSource::Nearest);
        assert!("Invalid".parse::<PriceSource>().is_err());
    }

    #[test]
    fn test_unit_bar_is_all_ones() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 8, 12, 0, 0).unwrap();
        let b = HistoricalBar::unit(ts);
        assert_eq!(b.open, Decimal::ONE);
        assert_eq!(b.high, Decimal::ONE);
        assert_eq!(b.low, Decimal::ONE);
        assert_eq!(b.close, Decimal::ONE);
        assert_eq!(b.volume, Decimal::ZERO);
    }

    #[test]
    fn test_key_flooring_truncates_to_minute() {
        let key = AssetPairAndTimestamp::new(
            Utc.with_ymd_and_hms(2021, 6, 1, 9, 15, 42).unwrap() + chrono::Duration::milliseconds(250),
            "BTC",
            "USD",
            "Kraken",
        );
        let floored = key.floored_to_minute();
        assert_eq!(floored.timestamp, Utc.with_ymd_and_hms(2021, 6, 1, 9, 15, 0).unwrap());
        assert_eq!(floored.from_asset, "BTC");
        // Flooring twice is a no-op.
        assert_eq!(floored.floored_to_minute(), floored);
    }

    #[test]
    fn test_maybe_unknown_accessors() {
        let known: MaybeUnknown<Decimal> = dec!(1.5).into();
        assert!(!known.is_unknown());
        assert_eq!(known.known(), Some(&dec!(1.5)));
        let unknown: MaybeUnknown<Decimal> = MaybeUnknown::Unknown;
        assert!(unknown.is_unknown());
        assert_eq!(unknown.known(), None);
    }
}
