//! Pair-converter core
//!
//! Answers "what was the `from -> to` conversion rate at this timestamp on
//! this exchange" by routing over a time-indexed snapshot graph of the
//! exchange's markets. Pricing data comes from three tiers: an in-memory
//! bar/bundle cache persisted to disk, the bulk CSV subsystem for
//! exchanges that publish one, and the exchange REST client with
//! granularity coarsening.

mod optimize;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::PersistentCache;
use crate::csv_pricing::{Confirmation, CsvPricing};
use crate::error::{Result, TaxGraphError};
use crate::exchange::{
    fetch_ohlcv_with_retry, granularity_ladder, ladder_position, ExchangeClient, ExchangeFactory,
    FetchOutcome, Granularity, RequestThrottle, BINANCE, BINANCE_US, BITFINEX, GATE, KRAKEN, OKEX,
    UPBIT,
};
use crate::fiat::{FiatRateClient, FIAT_EXCHANGE};
use crate::graph::avl_tree::AvlTree;
use crate::graph::{ExchangeAliases, MappedGraph};
use crate::types::{
    AssetPairAndTimestamp, CachedPrice, HistoricalBar, PriceSource, TransactionManifest, UNKNOWN_SENTINEL,
    SECONDS_IN_DAY, SECONDS_IN_WEEK,
};

/// Routing cost for quote assets outside the priority table.
pub const STANDARD_WEIGHT: f64 = 50.0;

// Slightly above every fiat priority so native pairs win ties.
const ALTERNATIVE_MARKET_WEIGHT: f64 = 51.0;

/// Weeks of zero-volume padding prepended to each market's weekly bundle,
/// so airdrops received just before a market opened still price.
pub const MARKET_PADDING_IN_WEEKS: i64 = 4;

// Persist the price cache every this many lookups.
const CACHE_INTERVAL: u64 = 200;

// Priority for quote assets: fiat in order of trade volume, then stable
// coins in order of trade volume. Unlisted quotes are filtered out of the
// graph entirely.
static QUOTE_PRIORITY: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("USD", 1.0),
        ("JPY", 2.0),
        ("KRW", 3.0),
        ("EUR", 4.0),
        ("GBP", 5.0),
        ("AUD", 6.0),
        ("USDT", 7.0),
        ("USDC", 8.0),
        ("BUSD", 9.0),
        ("TUSD", 10.0),
        ("OUSD", 11.0),
    ])
});

/// First on the list has the most priority, based on BTC market volume.
static FIAT_PRIORITY: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("USD", 1.0),
        ("EUR", 2.0),
        ("JPY", 3.0),
        ("KRW", 4.0),
        ("GBP", 5.0),
        ("CAD", 6.0),
        ("AUD", 7.0),
        ("CHF", 8.0),
    ])
});

/// Fallback fiat set when the rate API list has not been fetched.
pub static DEFAULT_FIAT_LIST: Lazy<Vec<&'static str>> =
    Lazy::new(|| vec!["AUD", "CAD", "CHF", "EUR", "GBP", "JPY", "NZD", "USD"]);

// Alternative markets for stablecoins and thinly-listed assets: the
// exchange that actually carries a usable market for the pair.
static ALT_MARKET_EXCHANGES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("ASTUSDT", OKEX),
        ("ARKKRW", UPBIT),
        ("ATDUSDT", GATE),
        ("BETHETH", BINANCE),
        ("BNBUSDT", BINANCE_US),
        ("BSVUSDT", GATE),
        ("BOBAUSDT", GATE),
        ("BUSDUSDT", BINANCE),
        ("CAKEUSDT", BINANCE),
        ("CYBERUSDT", BINANCE),
        ("EDGUSDT", GATE),
        ("ETHWUSD", KRAKEN),
        ("MAVUSDT", BINANCE),
        ("NEXOUSDT", BITFINEX),
        ("OPUSDT", BINANCE),
        ("RVNUSDT", BINANCE),
        ("SEIUSDT", BINANCE),
        ("SGBUSD", KRAKEN),
        ("SOLOUSDT", GATE),
        ("SWEATUSDT", GATE),
        ("USDTUSD", KRAKEN),
        ("XYMUSDT", GATE),
    ])
});

static ALT_MARKET_BY_BASE: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("AST", "USDT"),
        ("ARK", "KRW"),
        ("ATD", "USDT"),
        ("BETH", "ETH"),
        ("BNB", "USDT"),
        ("BOBA", "USDT"),
        ("BSV", "USDT"),
        ("BUSD", "USDT"),
        ("CAKE", "USDT"),
        ("CYBER", "USDT"),
        ("EDG", "USDT"),
        ("ETHW", "USD"),
        ("MAV", "USDT"),
        ("NEXO", "USDT"),
        ("OP", "USDT"),
        ("RVN", "USDT"),
        ("SEI", "USDT"),
        ("SGB", "USD"),
        ("SOLO", "USDT"),
        ("SWEAT", "USDT"),
        ("USDT", "USD"),
        ("XYM", "USDT"),
    ]
});

// Pairs where an indirect route exists before the native market did;
// routing must be forced through the graph even though the direct market
// exists today.
static FORCE_ROUTING: Lazy<HashSet<&'static str>> = Lazy::new(|| HashSet::from(["OPUSD"]));

/// Historical pair pricing over per-exchange market graphs.
pub struct PairConverter {
    price_source: PriceSource,
    default_exchange: String,
    exchange_locked: bool,
    untradeable_assets: HashSet<String>,
    user_aliases: Option<ExchangeAliases>,
    cache_modifier: String,
    fiat_priority: HashMap<String, f64>,
    fiat_list: Vec<String>,
    fiat_client: Option<FiatRateClient>,

    factory: Arc<dyn ExchangeFactory>,
    exchanges: HashMap<String, Arc<dyn ExchangeClient>>,
    // market symbol -> exchanges carrying it, in priority order
    exchange_markets: HashMap<String, HashMap<String, Vec<String>>>,
    graph_trees: HashMap<String, AvlTree<DateTime<Utc>, MappedGraph>>,
    throttle: RequestThrottle,

    cache: HashMap<AssetPairAndTimestamp, CachedPrice>,
    store: PersistentCache,

    // exchange -> the exchange whose CSV archive prices it
    csv_sources: HashMap<String, String>,
    csv_readers: HashMap<String, CsvPricing>,
    csv_confirm: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    csv_force_download: bool,

    manifest: Option<TransactionManifest>,
    lookup_count: u64,
    csv_lag_warned: bool,
}

impl PairConverter {
    pub fn new(price_source: PriceSource, factory: Arc<dyn ExchangeFactory>) -> Self {
        PairConverter {
            price_source,
            default_exchange: KRAKEN.to_string(),
            exchange_locked: false,
            untradeable_assets: HashSet::new(),
            user_aliases: None,
            cache_modifier: String::new(),
            fiat_priority: FIAT_PRIORITY.iter().map(|(&k, &v)| (k.to_string(), v)).collect(),
            fiat_list: DEFAULT_FIAT_LIST.iter().map(|s| s.to_string()).collect(),
            fiat_client: None,
            factory,
            exchanges: HashMap::new(),
            exchange_markets: HashMap::new(),
            graph_trees: HashMap::new(),
            throttle: RequestThrottle::new(),
            cache: HashMap::new(),
            store: PersistentCache::default(),
            csv_sources: HashMap::from([(KRAKEN.to_string(), KRAKEN.to_string())]),
            csv_readers: HashMap::new(),
            csv_confirm: Arc::new(|_| false),
            csv_force_download: false,
            manifest: None,
            lookup_count: 0,
            csv_lag_warned: false,
        }
    }

    /// Build a converter from resolver configuration, loading its
    /// persisted price cache.
    pub fn from_config(config: &crate::config::ResolverConfig, factory: Arc<dyn ExchangeFactory>) -> Result<Self> {
        let mut converter = PairConverter::new(config.historical_price_type, factory)
            .with_exchange_locked(config.exchange_locked)
            .with_untradeable_assets(config.untradeable_assets.iter().cloned())
            .with_fiat_priority(config.fiat_priority.iter().cloned());
        if let Some(exchange) = &config.default_exchange {
            converter = converter.with_default_exchange(exchange);
        }
        if let Some(aliases) = &config.aliases {
            converter = converter.with_aliases(crate::config::parse_aliases(aliases)?);
        }
        if let Some(modifier) = &config.cache_modifier {
            converter = converter.with_cache_modifier(modifier);
        }
        if let Some(access_key) = &config.fiat_access_key {
            converter = converter.with_fiat_client(FiatRateClient::new(access_key));
        }
        Ok(converter.load_historical_price_cache())
    }

    pub fn with_default_exchange(mut self, exchange: &str) -> Self {
        self.default_exchange = exchange.to_string();
        self
    }

    pub fn with_exchange_locked(mut self, locked: bool) -> Self {
        self.exchange_locked = locked;
        if locked {
            debug!("Routing locked to single exchange {}.", self.default_exchange);
        }
        self
    }

    pub fn with_untradeable_assets<I: IntoIterator<Item = String>>(mut self, assets: I) -> Self {
        self.untradeable_assets = assets.into_iter().collect();
        self
    }

    pub fn with_aliases(mut self, aliases: ExchangeAliases) -> Self {
        self.user_aliases = Some(aliases);
        self
    }

    pub fn with_cache_modifier(mut self, modifier: &str) -> Self {
        self.cache_modifier = modifier.to_string();
        self
    }

    /// Ordered fiat priority override; first entry gets the lowest
    /// routing cost.
    pub fn with_fiat_priority<I: IntoIterator<Item = String>>(mut self, priority: I) -> Self {
        let mut weight = 1.0;
        let mut table = HashMap::new();
        for fiat in priority {
            table.insert(fiat, weight);
            weight += 1.0;
        }
        if !table.is_empty() {
            self.fiat_priority = table;
        }
        self
    }

    pub fn with_fiat_client(mut self, client: FiatRateClient) -> Self {
        self.fiat_client = Some(client);
        self
    }

    pub fn with_store(mut self, store: PersistentCache) -> Self {
        self.store = store;
        self
    }

    pub fn with_csv_confirmation(mut self, confirm: Arc<dyn Fn(&str) -> bool + Send + Sync>) -> Self {
        self.csv_confirm = confirm;
        self
    }

    pub fn with_csv_force_download(mut self) -> Self {
        self.csv_force_download = true;
        self
    }

    /// Load the persisted price cache for this converter's cache key.
    pub fn load_historical_price_cache(mut self) -> Self {
        if let Some(cache) = self.store.load(&self.cache_key()) {
            self.cache = cache;
        }
        self
    }

    pub fn name(&self) -> &'static str {
        "exchange-graph"
    }

    pub fn historical_price_type(&self) -> PriceSource {
        self.price_source
    }

    /// Cache key, suffixed by the exchange-lock and user cache modifiers
    /// so differently-configured runs never share price data.
    pub fn cache_key(&self) -> String {
        let exchange_modifier = if self.exchange_locked {
            self.default_exchange.replace(' ', "_")
        } else {
            String::new()
        };
        let parts: Vec<&str> = [exchange_modifier.as_str(), self.cache_modifier.as_str()]
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            self.name().to_string()
        } else {
            format!("{}_{}", self.name(), parts.join("_"))
        }
    }

    /// Record the manifest this run must cover. Graph snapshots are built
    /// lazily per exchange on the first price query.
    pub fn optimize(&mut self, manifest: TransactionManifest) {
        self.manifest = Some(manifest);
    }

    pub fn save_historical_price_cache(&self) {
        if let Err(e) = self.store.save(&self.cache_key(), &self.cache) {
            warn!("Failed to save historical price cache: {e}");
        }
    }

    /// Derive a conversion rate from the bar the native source returns,
    /// using the price selection mode chosen at construction.
    pub async fn get_conversion_rate(
        &mut self,
        timestamp: DateTime<Utc>,
        from_asset: &str,
        to_asset: &str,
        exchange: &str,
    ) -> Result<Option<Decimal>> {
        let key = AssetPairAndTimestamp::new(timestamp, from_asset, to_asset, exchange);
        let mut qualifier = "";
        let bar = match self.get_bar_from_cache(&key) {
            Some(bar) => {
                qualifier = "cache of ";
                Some(bar)
            }
            None => {
                let bar = self
                    .get_historic_bar_from_native_source(timestamp, from_asset, to_asset, exchange)
                    .await?;
                if let Some(bar) = &bar {
                    self.add_bar_to_cache(&key, bar.clone());
                }
                bar
            }
        };

        Ok(bar.map(|bar| {
            let rate = bar.price(self.price_source, timestamp);
            debug!(
                "Fetched {} conversion rate {rate} for {timestamp}/{from_asset}->{to_asset} from {qualifier}{}",
                self.price_source,
                self.name()
            );
            rate
        }))
    }

    /// Historical bar for `from -> to` at `timestamp`, routed on the graph
    /// snapshot in effect at that time.
    pub async fn get_historic_bar_from_native_source(
        &mut self,
        timestamp: DateTime<Utc>,
        from_asset: &str,
        to_asset: &str,
        exchange: &str,
    ) -> Result<Option<HistoricalBar>> {
        debug!("Converting {from_asset} to {to_asset}");

        if from_asset == to_asset {
            return Ok(Some(HistoricalBar::unit(timestamp)));
        }

        if self.is_fiat_pair(from_asset, to_asset).await? {
            return self.get_fiat_bar(timestamp, from_asset, to_asset).await;
        }

        if !self.graph_trees.contains_key(exchange) {
            self.cache_graph_snapshots(exchange).await?;
        }
        if self.graph_trees[exchange].find_max_value_less_than(&timestamp).is_none() {
            return Err(TaxGraphError::runtime(
                "the graph snapshot does not exist; an attempt is being made to route a price \
                 before the graph has been optimized, or an incorrect manifest was provided",
            ));
        }

        // Direct market on a single exchange: no routing needed.
        let market_symbol = format!("{from_asset}{to_asset}");
        let direct_exchange = self.exchange_markets[exchange]
            .get(&market_symbol)
            .filter(|_| !FORCE_ROUTING.contains(market_symbol.as_str()))
            .map(|exchanges| exchanges[0].clone());
        if let Some(market_exchange) = direct_exchange {
            debug!("Found market - {market_symbol} on single exchange, skipping routing.");
            return self
                .find_historical_bar(from_asset, to_asset, timestamp, &market_exchange)
                .await;
        }

        // Resolve the route and the source serving each hop on the
        // snapshot in effect at the query time; alias hops are priced
        // straight from the graph's constant bars.
        enum HopSource {
            AliasBar(HistoricalBar),
            Market(String),
        }
        let mut hops: Vec<(String, String, HopSource)> = Vec::new();
        {
            let current_graph = self.graph_trees[exchange]
                .find_max_value_less_than(&timestamp)
                .expect("snapshot checked above");

            if !current_graph.contains_vertex(from_asset) || !current_graph.contains_vertex(to_asset) {
                if self.untradeable_assets.contains(from_asset) {
                    info!("Untradeable asset found - {from_asset}. Assigning ZERO price.");
                    return Ok(Some(HistoricalBar::zero(timestamp)));
                }
                return Err(TaxGraphError::runtime(format!(
                    "the asset {from_asset} or {to_asset} is missing from the {exchange} graph for {timestamp}"
                )));
            }

            let pricing_path = match current_graph.dijkstra(from_asset, to_asset) {
                Some(path) => path,
                None => {
                    debug!("No path found for {from_asset} to {to_asset}.");
                    return Ok(None);
                }
            };
            debug!("Found path - {pricing_path:?}");

            for asset in &pricing_path {
                if !current_graph.is_optimized(asset) {
                    return Err(TaxGraphError::runtime(format!("the asset {asset} is not optimized")));
                }
            }

            for pair in pricing_path.windows(2) {
                let (from, to) = (&pair[0], &pair[1]);
                let source = if let Some(alias_bar) = current_graph.get_alias_bar(from, to, timestamp) {
                    HopSource::AliasBar(alias_bar)
                } else {
                    let market_exchange = self.exchange_markets[exchange]
                        .get(&format!("{from}{to}"))
                        .map(|exchanges| exchanges[0].clone())
                        .ok_or_else(|| {
                            TaxGraphError::runtime(format!("no market recorded for routed hop {from}{to}"))
                        })?;
                    HopSource::Market(market_exchange)
                };
                hops.push((from.clone(), to.clone(), source));
            }
        }

        let mut result: Option<HistoricalBar> = None;
        for (hop_from, hop_to, hop_source) in hops {
            let hop_bar = if self.is_fiat_pair(&hop_from, &hop_to).await? {
                self.get_fiat_bar(timestamp, &hop_from, &hop_to).await?
            } else {
                match hop_source {
                    HopSource::AliasBar(bar) => Some(bar),
                    HopSource::Market(market_exchange) => {
                        self.find_historical_bar(&hop_from, &hop_to, timestamp, &market_exchange).await?
                    }
                }
            };

            let hop_bar = match hop_bar {
                Some(bar) => bar,
                None => {
                    debug!(
                        "No pricing data found for hop. This could be caused by airdropped coins that \
                         do not have a market yet. Market - {hop_from}{hop_to}, Timestamp - {timestamp}"
                    );
                    return Ok(None);
                }
            };

            result = Some(match result {
                None => hop_bar,
                Some(acc) => HistoricalBar {
                    duration: acc.duration.max(hop_bar.duration),
                    timestamp,
                    open: acc.open * hop_bar.open,
                    high: acc.high * hop_bar.high,
                    low: acc.low * hop_bar.low,
                    close: acc.close * hop_bar.close,
                    volume: acc.volume + hop_bar.volume,
                },
            });
        }

        Ok(result)
    }

    /// Single-bar lookup: minute-floored cache first, then a bundle query
    /// at one-minute granularity whose first bar is cached and returned.
    pub async fn find_historical_bar(
        &mut self,
        from_asset: &str,
        to_asset: &str,
        timestamp: DateTime<Utc>,
        exchange: &str,
    ) -> Result<Option<HistoricalBar>> {
        let key = AssetPairAndTimestamp::new(timestamp, from_asset, to_asset, exchange);
        if let Some(bar) = self.get_bar_from_cache(&key) {
            debug!("Retrieved cache for {timestamp}/{from_asset}->{to_asset} for {exchange}");
            return Ok(Some(bar));
        }

        let bars = self
            .find_historical_bars(from_asset, to_asset, timestamp, exchange, false, Granularity::OneMinute)
            .await?;

        match bars.and_then(|mut bars| if bars.is_empty() { None } else { Some(bars.remove(0)) }) {
            Some(bar) => {
                if (timestamp - bar.timestamp).num_seconds().unsigned_abs() > SECONDS_IN_DAY {
                    return Err(TaxGraphError::runtime(
                        "the time difference between the requested and returned timestamps is greater \
                         than a day; the graph probably hasn't been optimized",
                    ));
                }
                self.add_bar_to_cache(&key, bar.clone());
                Ok(Some(bar))
            }
            None => Ok(None),
        }
    }

    /// Bundle lookup: CSV subsystem (when registered for the exchange),
    /// then cached bundles, then the exchange client over the granularity
    /// ladder. For point queries the ladder coarsens whenever the returned
    /// candle misses the requested timestamp by more than one bucket.
    pub async fn find_historical_bars(
        &mut self,
        from_asset: &str,
        to_asset: &str,
        timestamp: DateTime<Utc>,
        exchange: &str,
        all_bars: bool,
        timespan: Granularity,
    ) -> Result<Option<Vec<HistoricalBar>>> {
        let mut timestamp = timestamp;
        let mut result: Vec<HistoricalBar> = Vec::new();
        self.lookup_count += 1;

        let ladder = granularity_ladder(exchange);
        let mut retry = ladder_position(exchange, timespan)
            .ok_or_else(|| TaxGraphError::value(format!("invalid time span {}", timespan.label())))?;
        let mut ms_timestamp = timestamp.timestamp_millis();

        // Tier 1: bulk CSV data, more accurate than the candle endpoint.
        if let Some(csv_bars) = self
            .find_csv_bars(from_asset, to_asset, timestamp, exchange, all_bars)
            .await?
        {
            if !csv_bars.is_empty() {
                if all_bars {
                    let last = csv_bars[csv_bars.len() - 1].timestamp;
                    timestamp = last + chrono::Duration::milliseconds(1);
                    ms_timestamp = timestamp.timestamp_millis();
                    debug!(
                        "Retrieved bars up to {ms_timestamp} from CSV for {from_asset}/{to_asset} for \
                         {exchange}. Continuing with REST API."
                    );
                    result = csv_bars;
                } else {
                    debug!("Retrieved bar from CSV for {timestamp}/{from_asset}->{to_asset} for {exchange}");
                    return Ok(Some(csv_bars));
                }
            }
        }

        // Tier 2: previously fetched bundles.
        let mut within_last_week = false;
        if all_bars {
            let bundle_key = AssetPairAndTimestamp::new(timestamp, from_asset, to_asset, exchange);
            if let Some(CachedPrice::Bundle(cached)) = self.cache.get(&bundle_key) {
                if !cached.is_empty() {
                    result.extend(cached.iter().cloned());
                    let last = result[result.len() - 1].timestamp;
                    timestamp = last + chrono::Duration::milliseconds(1);
                    ms_timestamp = timestamp.timestamp_millis();
                }
            }
            // A bundle reaching into the current week cannot gain another
            // complete weekly candle; skip the REST refresh.
            if let Some(last) = result.last() {
                if (Utc::now() - last.timestamp).num_seconds() < SECONDS_IN_WEEK as i64 {
                    within_last_week = true;
                }
            }
        }

        // Tier 3: the exchange candle endpoint.
        while retry < ladder.len() && !within_last_week {
            let timeframe = ladder[retry];
            let client = self
                .exchanges
                .get(exchange)
                .cloned()
                .ok_or_else(|| TaxGraphError::runtime(format!("no client instantiated for {exchange}")))?;
            let symbol = format!("{from_asset}/{to_asset}");
            let limit = if all_bars { 1500 } else { 1 };

            let outcome = match fetch_ohlcv_with_retry(
                client.as_ref(),
                &self.throttle,
                &symbol,
                timeframe,
                ms_timestamp,
                limit,
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    info!("Maximum number of retries reached. Saving to cache and exiting.");
                    self.save_historical_price_cache();
                    return Err(e);
                }
            };

            let rows = match outcome {
                FetchOutcome::Rows(rows) => rows,
                FetchOutcome::Aborted => Vec::new(),
            };

            if let Some(first) = rows.first() {
                let returned_timestamp = DateTime::<Utc>::from_timestamp_millis(first.timestamp_ms)
                    .ok_or_else(|| TaxGraphError::runtime("exchange returned an unrepresentable timestamp"))?;
                let gap = (returned_timestamp - timestamp).num_seconds();
                if gap > timeframe.seconds() as i64 && !all_bars {
                    if retry == ladder.len() - 1 {
                        info!(
                            "For {from_asset}/{to_asset} requested candle for {timestamp} (ms \
                             {ms_timestamp}) doesn't match the returned timestamp {returned_timestamp}. \
                             It is assumed the asset was not tradeable at the time of acquisition, so \
                             the first weekly candle is used for pricing. Please check the price of \
                             {from_asset} at {timestamp}."
                        );
                    } else {
                        debug!(
                            "For {from_asset}/{to_asset} requested candle for {timestamp} (ms \
                             {ms_timestamp}), but got {returned_timestamp}. Continuing with larger timeframe."
                        );
                        retry += 1;
                        continue;
                    }
                }

                if retry > 0 && timeframe != Granularity::OneWeek {
                    self.warn_coarse_candle(exchange, from_asset, timestamp, timeframe, returned_timestamp);
                }
            }

            if !rows.is_empty() {
                if !all_bars {
                    let first = &rows[0];
                    result = vec![HistoricalBar {
                        duration: Duration::from_secs(timeframe.seconds()),
                        timestamp,
                        open: first.open,
                        high: first.high,
                        low: first.low,
                        close: first.close,
                        volume: first.volume,
                    }];
                    break;
                }
                ms_timestamp = rows[rows.len() - 1].timestamp_ms + 1;
                for row in &rows {
                    result.push(HistoricalBar {
                        duration: Duration::from_secs(timeframe.seconds()),
                        timestamp: DateTime::<Utc>::from_timestamp_millis(row.timestamp_ms)
                            .ok_or_else(|| TaxGraphError::runtime("exchange returned an unrepresentable timestamp"))?,
                        open: row.open,
                        high: row.high,
                        low: row.low,
                        close: row.close,
                        volume: row.volume,
                    });
                }
            } else if all_bars {
                // End of records: checkpoint the bundle.
                let bundle_key = AssetPairAndTimestamp::new(timestamp, from_asset, to_asset, exchange);
                self.cache.insert(bundle_key, CachedPrice::Bundle(result.clone()));
                break;
            } else {
                retry += 1;
            }
        }

        if self.lookup_count % CACHE_INTERVAL == 0 {
            self.save_historical_price_cache();
        }

        Ok(if result.is_empty() { None } else { Some(result) })
    }

    fn warn_coarse_candle(
        &mut self,
        exchange: &str,
        from_asset: &str,
        timestamp: DateTime<Utc>,
        timeframe: Granularity,
        returned_timestamp: DateTime<Utc>,
    ) {
        if exchange == KRAKEN {
            if !self.csv_lag_warned {
                info!(
                    "Prices from the Kraken exchange for the latest quarter may not be accurate until \
                     CSV data is available."
                );
                self.csv_lag_warned = true;
            }
        } else {
            info!(
                "The most accurate candle was not able to be used for pricing the asset {from_asset} at \
                 {timestamp}. The {} candle for {returned_timestamp} was used. The price may be inaccurate.",
                timeframe.label()
            );
        }
    }

    // CSV tier of the bundle lookup; `None` when the exchange has no CSV
    // source registered.
    async fn find_csv_bars(
        &mut self,
        from_asset: &str,
        to_asset: &str,
        timestamp: DateTime<Utc>,
        exchange: &str,
        all_bars: bool,
    ) -> Result<Option<Vec<HistoricalBar>>> {
        let source = match self.csv_sources.get(exchange) {
            Some(source) => source.clone(),
            None => return Ok(None),
        };
        let manifest = match &self.manifest {
            Some(manifest) => manifest.clone(),
            None => return Ok(None),
        };
        if !self.csv_readers.contains_key(&source) {
            let confirm = self.csv_confirm.clone();
            let confirm: Confirmation = Box::new(move |prompt| confirm(prompt));
            let mut reader = CsvPricing::new(&manifest, self.store.clone(), confirm);
            if self.csv_force_download {
                reader = reader.with_force_download();
            }
            self.csv_readers.insert(source.clone(), reader);
        }
        let reader = self.csv_readers.get_mut(&source).expect("reader just inserted");

        if all_bars {
            reader
                .find_historical_bars(from_asset, to_asset, timestamp, true, Granularity::OneWeek)
                .await
        } else {
            Ok(reader
                .find_historical_bar(from_asset, to_asset, timestamp)
                .await?
                .map(|bar| vec![bar]))
        }
    }

    // ------------------------------------------------------------------
    // Fiat handling
    // ------------------------------------------------------------------

    pub(crate) async fn is_fiat(&mut self, asset: &str) -> Result<bool> {
        if let Some(client) = &mut self.fiat_client {
            return client.is_fiat(asset).await;
        }
        Ok(self.fiat_list.iter().any(|f| f == asset))
    }

    pub(crate) async fn is_fiat_pair(&mut self, from_asset: &str, to_asset: &str) -> Result<bool> {
        Ok(self.is_fiat(from_asset).await? && self.is_fiat(to_asset).await?)
    }

    /// Daily fiat rate as a constant bar. The API is USD-anchored: the
    /// fetched `USD -> X` rate is cached together with its exact
    /// reciprocal under the reversed key, so the opposite direction never
    /// needs the network.
    pub(crate) async fn get_fiat_bar(
        &mut self,
        timestamp: DateTime<Utc>,
        from_asset: &str,
        to_asset: &str,
    ) -> Result<Option<HistoricalBar>> {
        let key = AssetPairAndTimestamp::new(timestamp, from_asset, to_asset, FIAT_EXCHANGE);
        if let Some(bar) = self.get_bar_from_cache(&key) {
            debug!("Retrieved cache for {timestamp}/{from_asset}->{to_asset} for {FIAT_EXCHANGE}");
            return Ok(Some(bar));
        }

        if from_asset != "USD" && to_asset != "USD" {
            return Err(TaxGraphError::value(
                "fiat conversion is only available to/from USD at this time",
            ));
        }
        let currency = if from_asset == "USD" { to_asset } else { from_asset };

        let client = self
            .fiat_client
            .as_ref()
            .ok_or_else(|| TaxGraphError::value("no fiat access key configured"))?;
        let rate = match client.fetch_usd_rate(timestamp.date_naive(), currency).await {
            Ok(rate) => rate,
            Err(e) => {
                info!("Giving up on fiat rate. Saving to cache.");
                self.save_historical_price_cache();
                return Err(e);
            }
        };
        let usd_rate = match rate {
            Some(rate) => rate,
            None => return Ok(None),
        };

        let (usd_bar, reverse_bar) = self.cache_fiat_rate(timestamp, currency, usd_rate);
        Ok(Some(if from_asset == "USD" { usd_bar } else { reverse_bar }))
    }

    // Cache a day's `USD -> currency` rate under both directions: the
    // forward constant bar and its exact reciprocal under the reversed
    // key. The service returns one rate per day with no OHLCV, so every
    // price of each bar is the same.
    pub(crate) fn cache_fiat_rate(
        &mut self,
        timestamp: DateTime<Utc>,
        currency: &str,
        usd_rate: Decimal,
    ) -> (HistoricalBar, HistoricalBar) {
        let day = Duration::from_secs(SECONDS_IN_DAY);
        let usd_bar = HistoricalBar::constant(timestamp, usd_rate, day, Decimal::ZERO);
        let reverse_bar = HistoricalBar::constant(timestamp, Decimal::ONE / usd_rate, day, Decimal::ZERO);

        let usd_key = AssetPairAndTimestamp::new(timestamp, "USD", currency, FIAT_EXCHANGE);
        let reverse_key = AssetPairAndTimestamp::new(timestamp, currency, "USD", FIAT_EXCHANGE);
        self.add_bar_to_cache(&usd_key, usd_bar.clone());
        self.add_bar_to_cache(&reverse_key, reverse_bar.clone());

        (usd_bar, reverse_bar)
    }

    // ------------------------------------------------------------------
    // Cache plumbing
    // ------------------------------------------------------------------

    fn get_bar_from_cache(&self, key: &AssetPairAndTimestamp) -> Option<HistoricalBar> {
        match self.cache.get(&key.floored_to_minute()) {
            Some(CachedPrice::Bar(bar)) => Some(bar.clone()),
            _ => None,
        }
    }

    fn add_bar_to_cache(&mut self, key: &AssetPairAndTimestamp, bar: HistoricalBar) {
        self.cache.insert(key.floored_to_minute(), CachedPrice::Bar(bar));
    }

    #[cfg(test)]
    pub(crate) fn cached_entry_count(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    pub(crate) fn seed_bar_for_tests(&mut self, key: &AssetPairAndTimestamp, bar: HistoricalBar) {
        self.add_bar_to_cache(key, bar);
    }

    #[cfg(test)]
    pub(crate) fn graph_tree(&self, exchange: &str) -> Option<&AvlTree<DateTime<Utc>, MappedGraph>> {
        self.graph_trees.get(exchange)
    }
}

/// Pricing-exchange resolution shared by graph construction.
impl PairConverter {
    // The exchange whose client actually answers pricing calls: unknown
    // or locked callers are redirected to the configured default, and the
    // redirect inherits the default's CSV source when it has one.
    pub(crate) fn pricing_exchange_for(&mut self, exchange: &str) -> Result<String> {
        let mut exchange = exchange.to_string();
        let known = crate::exchange::KNOWN_EXCHANGES.contains(&exchange.as_str());
        if exchange == UNKNOWN_SENTINEL || !known || self.exchange_locked {
            if self.exchange_locked {
                debug!("Price routing locked to {} type for {exchange}.", self.default_exchange);
            } else {
                debug!("Using default exchange {} type for {exchange}.", self.default_exchange);
            }
            if let Some(source) = self.csv_sources.get(&self.default_exchange).cloned() {
                self.csv_sources.insert(exchange.clone(), source);
            }
            exchange = self.default_exchange.clone();
        }

        // The exchange could have been added as an alternative-market
        // client; its markets would not have been built.
        if !self.graph_trees.contains_key(&exchange) || !self.exchange_markets.contains_key(&exchange) {
            if self.exchange_locked {
                exchange = self.default_exchange.clone();
            } else if !crate::exchange::KNOWN_EXCHANGES.contains(&exchange.as_str()) {
                return Err(TaxGraphError::value(format!("unrecognized exchange: {exchange}")));
            }
        }

        Ok(exchange)
    }
}

#[cfg(test)]
mod tests;
