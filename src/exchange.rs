//! Exchange client abstraction
//!
//! The pair converter consumes OHLCV candles and market lists through the
//! `ExchangeClient` trait; concrete REST adapters live outside this crate.
//! This module owns everything around the call itself: granularity ladders,
//! the per-exchange minimum-delay throttle, and the retry state machine
//! that absorbs transient server failures.

use async_trait::async_trait;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::TaxGraphError;

// Exchange names as they appear in transaction data.
pub const BINANCE: &str = "Binance.com";
pub const BINANCE_US: &str = "Binance US";
pub const BITFINEX: &str = "Bitfinex";
pub const COINBASE: &str = "Coinbase";
pub const COINBASE_PRO: &str = "Coinbase Pro";
pub const GATE: &str = "Gate";
pub const HUOBI: &str = "Huobi";
pub const KRAKEN: &str = "Kraken";
pub const OKEX: &str = "Okex";
pub const UPBIT: &str = "Upbit";

/// Exchanges a pricing client can be instantiated for.
pub static KNOWN_EXCHANGES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![BINANCE, BINANCE_US, BITFINEX, GATE, HUOBI, KRAKEN, OKEX, UPBIT]
});

// Public endpoints tolerate far fewer calls than their documentation
// suggests; these floors were measured, not published.
static REQUEST_DELAYS: Lazy<HashMap<&'static str, f64>> =
    Lazy::new(|| HashMap::from([(KRAKEN, 5.1), (BITFINEX, 5.0)]));

/// Candle durations supported across the exchange set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    OneHour,
    FourHours,
    SixHours,
    OneDay,
    OneWeek,
}

impl Granularity {
    pub fn seconds(&self) -> u64 {
        match self {
            Granularity::OneMinute => 60,
            Granularity::FiveMinutes => 300,
            Granularity::FifteenMinutes => 900,
            Granularity::OneHour => 3_600,
            Granularity::FourHours => 14_400,
            Granularity::SixHours => 21_600,
            Granularity::OneDay => 86_400,
            Granularity::OneWeek => 604_800,
        }
    }

    /// Timeframe label in the conventional REST spelling.
    pub fn label(&self) -> &'static str {
        match self {
            Granularity::OneMinute => "1m",
            Granularity::FiveMinutes => "5m",
            Granularity::FifteenMinutes => "15m",
            Granularity::OneHour => "1h",
            Granularity::FourHours => "4h",
            Granularity::SixHours => "6h",
            Granularity::OneDay => "1d",
            Granularity::OneWeek => "1w",
        }
    }
}

const STANDARD_LADDER: [Granularity; 7] = [
    Granularity::OneMinute,
    Granularity::FiveMinutes,
    Granularity::FifteenMinutes,
    Granularity::OneHour,
    Granularity::FourHours,
    Granularity::OneDay,
    Granularity::OneWeek,
];

// Coinbase Pro has no 4h candle; it offers 6h instead.
const COINBASE_PRO_LADDER: [Granularity; 7] = [
    Granularity::OneMinute,
    Granularity::FiveMinutes,
    Granularity::FifteenMinutes,
    Granularity::OneHour,
    Granularity::SixHours,
    Granularity::OneDay,
    Granularity::OneWeek,
];

/// The finest-to-coarsest candle ladder for an exchange. Point queries
/// start at the finest rung and coarsen until a candle matches.
pub fn granularity_ladder(exchange: &str) -> &'static [Granularity] {
    if exchange == COINBASE_PRO {
        &COINBASE_PRO_LADDER
    } else {
        &STANDARD_LADDER
    }
}

/// Position of `granularity` in the exchange's ladder, used as the starting
/// rung for coarsening retries.
pub fn ladder_position(exchange: &str, granularity: Granularity) -> Option<usize> {
    granularity_ladder(exchange).iter().position(|&g| g == granularity)
}

/// Market classification; only spot markets participate in routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketKind {
    Spot,
    Margin,
    Future,
    Other,
}

/// One tradable pair as reported by an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub base: String,
    pub quote: String,
    pub kind: MarketKind,
}

/// One OHLCV row: `[ms epoch, open, high, low, close, volume]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvRow {
    pub timestamp_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Failure classes an adapter reports; each drives a different retry arm.
#[derive(Debug, Error)]
pub enum ExchangeClientError {
    /// The exchange rejected the request (bad symbol, unsupported
    /// timeframe, ...). Not worth retrying at this granularity.
    #[error("exchange error: {0}")]
    Exchange(String),

    /// Request throttled by the server.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Server unreachable, network failure, or timeout.
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
}

/// OHLCV access over a named exchange. Implemented by REST adapters
/// outside this crate and by in-memory fakes in tests.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeClientError>;

    /// Fetch up to `limit` candles of `granularity` starting at `since_ms`.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        granularity: Granularity,
        since_ms: i64,
        limit: usize,
    ) -> Result<Vec<OhlcvRow>, ExchangeClientError>;
}

/// Instantiates clients by exchange name, so alternative-market exchanges
/// can be brought up lazily during graph construction.
pub trait ExchangeFactory: Send + Sync {
    fn create(&self, exchange: &str) -> Option<Arc<dyn ExchangeClient>>;
}

// ---------------------------------------------------------------------------
// Throttling
// ---------------------------------------------------------------------------

/// Enforces the per-exchange minimum delay between calls by recording the
/// last call instant per exchange.
#[derive(Debug, Default)]
pub struct RequestThrottle {
    last_request: DashMap<String, Instant>,
}

impl RequestThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configured minimum delay for `exchange` (zero for most).
    pub fn minimum_delay(exchange: &str) -> Duration {
        REQUEST_DELAYS
            .get(exchange)
            .map(|&secs| Duration::from_secs_f64(secs))
            .unwrap_or(Duration::ZERO)
    }

    fn residual(&self, exchange: &str, now: Instant) -> Duration {
        let minimum = Self::minimum_delay(exchange);
        if minimum.is_zero() {
            return Duration::ZERO;
        }
        match self.last_request.get(exchange) {
            Some(last) => minimum.saturating_sub(now.duration_since(*last)),
            None => Duration::ZERO,
        }
    }

    /// Wait out the residual of the exchange's minimum delay, then claim
    /// the slot.
    pub async fn wait_turn(&self, exchange: &str) {
        let residual = self.residual(exchange, Instant::now());
        if !residual.is_zero() {
            debug!("Delaying {exchange} request for {residual:?}");
            tokio::time::sleep(residual).await;
        }
        self.last_request.insert(exchange.to_string(), Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Retry state machine
// ---------------------------------------------------------------------------

/// Accumulated retry weight at which the fetch gives up.
pub const RETRY_WEIGHT_LIMIT: u32 = 9;

/// What to do about a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Brief pause, then stop trying this granularity.
    AbortGranularity { pause_ms: u64 },
    /// Pause and retry the same call, charging `cost` against the budget.
    Retry { pause_ms: u64, cost: u32 },
}

/// Classify a client error into a retry decision.
pub fn classify_error(error: &ExchangeClientError) -> RetryDecision {
    match error {
        ExchangeClientError::Exchange(_) => RetryDecision::AbortGranularity { pause_ms: 100 },
        ExchangeClientError::RateLimited(_) => RetryDecision::Retry { pause_ms: 100, cost: 3 },
        ExchangeClientError::Unavailable(_) => RetryDecision::Retry { pause_ms: 10_000, cost: 1 },
    }
}

/// Weight budget shared by all retries of one fetch.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetryBudget {
    spent: u32,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spent(&self) -> u32 {
        self.spent
    }

    /// Charge `cost`; returns `true` once the budget is exhausted.
    pub fn charge(&mut self, cost: u32) -> bool {
        self.spent += cost;
        self.spent >= RETRY_WEIGHT_LIMIT
    }
}

/// Result of a retried fetch that did not give up.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Rows(Vec<OhlcvRow>),
    /// The exchange rejected this granularity; the caller coarsens.
    Aborted,
}

/// Fetch OHLCV rows, waiting out the exchange throttle and absorbing
/// transient failures. Returns an error only when the retry budget is
/// exhausted; the caller is expected to checkpoint its caches before
/// propagating it.
pub async fn fetch_ohlcv_with_retry(
    client: &dyn ExchangeClient,
    throttle: &RequestThrottle,
    symbol: &str,
    granularity: Granularity,
    since_ms: i64,
    limit: usize,
) -> Result<FetchOutcome, TaxGraphError> {
    let mut budget = RetryBudget::new();
    loop {
        throttle.wait_turn(client.name()).await;
        match client.fetch_ohlcv(symbol, granularity, since_ms, limit).await {
            Ok(rows) => return Ok(FetchOutcome::Rows(rows)),
            Err(error) => match classify_error(&error) {
                RetryDecision::AbortGranularity { pause_ms } => {
                    debug!("Exchange error from {} for {symbol}: {error}", client.name());
                    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                    return Ok(FetchOutcome::Aborted);
                }
                RetryDecision::Retry { pause_ms, cost } => {
                    if budget.charge(cost) {
                        warn!(
                            "Maximum number of retries reached for {} {symbol}: {error}",
                            client.name()
                        );
                        return Err(TaxGraphError::runtime(format!(
                            "{} server error after retries: {error}",
                            client.name()
                        )));
                    }
                    debug!(
                        "Transient error from {} for {symbol} (weight {}/{RETRY_WEIGHT_LIMIT}): {error}",
                        client.name(),
                        budget.spent()
                    );
                    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
                }
            },
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory exchange fakes shared by converter and resolver tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted exchange: markets plus canned candle responses per symbol
    /// and granularity.
    pub struct ScriptedExchange {
        name: String,
        markets: Vec<Market>,
        // (symbol, granularity label) -> full candle series
        candles: Mutex<HashMap<(String, &'static str), Vec<OhlcvRow>>>,
        // Errors returned before any data, in order.
        errors: Mutex<Vec<ExchangeClientError>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedExchange {
        pub fn new(name: &str) -> Self {
            ScriptedExchange {
                name: name.to_string(),
                markets: Vec::new(),
                candles: Mutex::new(HashMap::new()),
                errors: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with_spot_market(mut self, base: &str, quote: &str) -> Self {
            self.markets.push(Market {
                id: format!("{base}{quote}"),
                base: base.to_string(),
                quote: quote.to_string(),
                kind: MarketKind::Spot,
            });
            self
        }

        pub fn with_candles(self, base: &str, quote: &str, granularity: Granularity, rows: Vec<OhlcvRow>) -> Self {
            self.candles
                .lock()
                .unwrap()
                .insert((format!("{base}/{quote}"), granularity.label()), rows);
            self
        }

        pub fn with_errors(self, errors: Vec<ExchangeClientError>) -> Self {
            *self.errors.lock().unwrap() = errors;
            self
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedExchange {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch_markets(&self) -> Result<Vec<Market>, ExchangeClientError> {
            Ok(self.markets.clone())
        }

        async fn fetch_ohlcv(
            &self,
            symbol: &str,
            granularity: Granularity,
            since_ms: i64,
            limit: usize,
        ) -> Result<Vec<OhlcvRow>, ExchangeClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut errors = self.errors.lock().unwrap();
                if !errors.is_empty() {
                    return Err(errors.remove(0));
                }
            }
            let candles = self.candles.lock().unwrap();
            let series = match candles.get(&(symbol.to_string(), granularity.label())) {
                Some(series) => series,
                None => return Ok(Vec::new()),
            };
            Ok(series
                .iter()
                .filter(|row| row.timestamp_ms >= since_ms)
                .take(limit)
                .cloned()
                .collect())
        }
    }

    /// Factory over a fixed set of scripted exchanges.
    pub struct ScriptedFactory {
        pub exchanges: HashMap<String, Arc<dyn ExchangeClient>>,
    }

    impl ScriptedFactory {
        pub fn new(clients: Vec<Arc<dyn ExchangeClient>>) -> Self {
            ScriptedFactory {
                exchanges: clients
                    .into_iter()
                    .map(|c| (c.name().to_string(), c))
                    .collect(),
            }
        }
    }

    impl ExchangeFactory for ScriptedFactory {
        fn create(&self, exchange: &str) -> Option<Arc<dyn ExchangeClient>> {
            self.exchanges.get(exchange).cloned()
        }
    }
}
