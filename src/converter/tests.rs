use super::*;
use crate::cache::PersistentCache;
use crate::csv_pricing::{chunk_file_name, pair_key, PairWindow, PAIR_INDEX_CACHE_KEY};
use crate::exchange::testing::{ScriptedExchange, ScriptedFactory};
use crate::exchange::{ExchangeClient, Granularity, OhlcvRow, BINANCE, KRAKEN};
use crate::types::TransactionManifest;
use chrono::TimeZone;
use rust_decimal_macros::dec;
use std::collections::HashMap as StdHashMap;
use std::io::Write as _;

// 2020-01-06 00:00 UTC, a Monday, and the first transaction time used in
// every manifest below.
const MONDAY: i64 = 1_578_268_800;
const WEEK: i64 = 604_800;

fn scratch_store(name: &str) -> PersistentCache {
    let dir = std::env::temp_dir().join(format!("taxgraph-converter-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    PersistentCache::new(dir)
}

fn manifest(assets: &[&str]) -> TransactionManifest {
    TransactionManifest::new(
        Utc.timestamp_opt(MONDAY, 0).unwrap(),
        assets.iter().map(|a| a.to_string()),
        "USD",
    )
}

fn query_time() -> DateTime<Utc> {
    // 2020-01-08 12:00 UTC
    Utc.with_ymd_and_hms(2020, 1, 8, 12, 0, 0).unwrap()
}

fn weekly_row(epoch: i64, close: Decimal, volume: Decimal) -> OhlcvRow {
    OhlcvRow {
        timestamp_ms: epoch * 1000,
        open: close,
        high: close,
        low: close,
        close,
        volume,
    }
}

fn minute_row(timestamp: DateTime<Utc>, open: Decimal, high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> OhlcvRow {
    OhlcvRow {
        timestamp_ms: timestamp.timestamp_millis(),
        open,
        high,
        low,
        close,
        volume,
    }
}

fn converter_with(clients: Vec<Arc<dyn ExchangeClient>>, store_name: &str) -> PairConverter {
    PairConverter::new(PriceSource::High, Arc::new(ScriptedFactory::new(clients)))
        .with_store(scratch_store(store_name))
}

#[tokio::test]
async fn test_direct_market_uses_single_exchange() {
    let binance: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(BINANCE)
            .with_spot_market("BTC", "USD")
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneWeek,
                vec![
                    weekly_row(MONDAY, dec!(8000), dec!(120)),
                    weekly_row(MONDAY + WEEK, dec!(8100), dec!(130)),
                ],
            )
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneMinute,
                vec![minute_row(query_time(), dec!(8000), dec!(8100), dec!(7900), dec!(8050), dec!(10.5))],
            ),
    );
    let mut converter = converter_with(vec![binance.clone()], "direct-market");
    converter.optimize(manifest(&["BTC"]));

    let bar = converter
        .get_historic_bar_from_native_source(query_time(), "BTC", "USD", BINANCE)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(bar.high, dec!(8100));
    assert_eq!(bar.open, dec!(8000));
    assert_eq!(bar.close, dec!(8050));
    assert_eq!(bar.timestamp, query_time());
    assert_eq!(bar.duration, Duration::from_secs(60));
}

#[tokio::test]
async fn test_same_asset_returns_unit_bar() {
    let mut converter = converter_with(vec![], "unit-bar");
    let bar = converter
        .get_historic_bar_from_native_source(query_time(), "BTC", "BTC", BINANCE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bar.open, Decimal::ONE);
    assert_eq!(bar.high, Decimal::ONE);
    assert_eq!(bar.low, Decimal::ONE);
    assert_eq!(bar.close, Decimal::ONE);
    assert_eq!(bar.volume, Decimal::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_multi_hop_routing_multiplies_bars() {
    let binance: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(BINANCE)
            .with_spot_market("BTC", "USDT")
            .with_candles(
                "BTC",
                "USDT",
                Granularity::OneWeek,
                vec![
                    weekly_row(MONDAY, dec!(8000), dec!(500)),
                    weekly_row(MONDAY + WEEK, dec!(8100), dec!(510)),
                ],
            )
            .with_candles(
                "BTC",
                "USDT",
                Granularity::OneMinute,
                vec![minute_row(query_time(), dec!(0.9980), dec!(0.9981), dec!(0.9979), dec!(0.9980), dec!(10))],
            ),
    );
    let kraken: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(KRAKEN)
            .with_candles(
                "USDT",
                "USD",
                Granularity::OneWeek,
                vec![
                    weekly_row(MONDAY, dec!(1.0), dec!(900)),
                    weekly_row(MONDAY + WEEK, dec!(1.0), dec!(910)),
                ],
            )
            .with_candles(
                "USDT",
                "USD",
                Granularity::OneMinute,
                vec![minute_row(query_time(), dec!(1.0001), dec!(1.0002), dec!(1.0000), dec!(1.0001), dec!(25))],
            ),
    );
    let mut converter = converter_with(vec![binance, kraken], "multi-hop");
    converter.optimize(manifest(&["BTC"]));

    let bar = converter
        .get_historic_bar_from_native_source(query_time(), "BTC", "USD", BINANCE)
        .await
        .unwrap()
        .unwrap();

    // BTC -> USDT -> USD: prices multiply across hops, volumes add.
    assert_eq!(bar.close, dec!(0.9980) * dec!(1.0001));
    assert_eq!(bar.high, dec!(0.9981) * dec!(1.0002));
    assert_eq!(bar.volume, dec!(35));
    assert_eq!(bar.timestamp, query_time());

    // Before the market opened (inside the padded window) there is no
    // route, so the lookup is absent rather than an error.
    let early = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let absent = converter
        .get_historic_bar_from_native_source(early, "BTC", "USD", BINANCE)
        .await
        .unwrap();
    assert!(absent.is_none());
}

#[tokio::test]
async fn test_alias_pair_prices_through_target() {
    let binance: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(BINANCE)
            .with_spot_market("BTC", "USD")
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneWeek,
                vec![
                    weekly_row(MONDAY, dec!(8000), dec!(120)),
                    weekly_row(MONDAY + WEEK, dec!(8100), dec!(130)),
                ],
            )
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneMinute,
                vec![minute_row(query_time(), dec!(8000), dec!(8100), dec!(7900), dec!(8050), dec!(10.5))],
            ),
    );
    let mut converter = converter_with(vec![binance], "alias");
    converter.optimize(manifest(&["BTC"]));

    let bar = converter
        .get_historic_bar_from_native_source(query_time(), "XBT", "USD", BINANCE)
        .await
        .unwrap()
        .unwrap();

    // XBT -> BTC is a factor-1 alias hop; prices equal the BTC/USD bar.
    assert_eq!(bar.high, dec!(8100));
    assert_eq!(bar.low, dec!(7900));
    assert_eq!(bar.close, dec!(8050));
    // The alias hop carries a volume of 1.
    assert_eq!(bar.volume, dec!(11.5));
}

#[tokio::test]
async fn test_fiat_reciprocal_cache_round_trip() {
    let mut converter = converter_with(vec![], "fiat-reciprocal");
    let timestamp = Utc.with_ymd_and_hms(2020, 4, 4, 12, 0, 0).unwrap();
    let rate = dec!(0.9223);
    converter.cache_fiat_rate(timestamp, "EUR", rate);

    // EUR -> USD comes from the cached reciprocal without a network call.
    let bar = converter
        .get_historic_bar_from_native_source(timestamp, "EUR", "USD", "Coinbase")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bar.open, Decimal::ONE / rate);
    assert_eq!(bar.close, Decimal::ONE / rate);
    assert_eq!(bar.volume, Decimal::ZERO);
    assert_eq!(bar.duration, Duration::from_secs(SECONDS_IN_DAY));

    // And the forward direction is the rate itself.
    let back = converter
        .get_historic_bar_from_native_source(timestamp, "USD", "EUR", "Coinbase")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(back.high, rate);
}

#[tokio::test]
async fn test_non_usd_fiat_pair_is_a_value_error() {
    let mut converter = converter_with(vec![], "fiat-cross");
    let timestamp = Utc.with_ymd_and_hms(2020, 4, 4, 12, 0, 0).unwrap();
    let result = converter
        .get_historic_bar_from_native_source(timestamp, "EUR", "JPY", "Coinbase")
        .await;
    assert!(matches!(result, Err(TaxGraphError::Value(_))));
}

#[tokio::test]
async fn test_untradeable_asset_prices_zero() {
    let binance: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(BINANCE)
            .with_spot_market("BTC", "USD")
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneWeek,
                vec![weekly_row(MONDAY, dec!(8000), dec!(120))],
            ),
    );
    let mut converter = converter_with(vec![binance], "untradeable")
        .with_untradeable_assets(vec!["CSOV".to_string()]);
    converter.optimize(manifest(&["BTC", "CSOV"]));

    let bar = converter
        .get_historic_bar_from_native_source(query_time(), "CSOV", "USD", BINANCE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bar.high, Decimal::ZERO);
    assert_eq!(bar.close, Decimal::ZERO);
}

#[tokio::test]
async fn test_query_before_optimize_is_an_error() {
    let mut converter = converter_with(vec![], "no-manifest");
    let result = converter
        .get_historic_bar_from_native_source(query_time(), "BTC", "USD", BINANCE)
        .await;
    assert!(matches!(result, Err(TaxGraphError::Value(_))));
}

#[tokio::test]
async fn test_reoptimizing_an_exchange_is_an_error() {
    let binance: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(BINANCE)
            .with_spot_market("BTC", "USD")
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneWeek,
                vec![weekly_row(MONDAY, dec!(8000), dec!(120))],
            )
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneMinute,
                vec![minute_row(query_time(), dec!(8000), dec!(8100), dec!(7900), dec!(8050), dec!(10.5))],
            ),
    );
    let mut converter = converter_with(vec![binance], "reoptimize");
    converter.optimize(manifest(&["BTC"]));

    converter
        .get_historic_bar_from_native_source(query_time(), "BTC", "USD", BINANCE)
        .await
        .unwrap();
    assert!(converter.graph_tree(BINANCE).is_some());

    let result = converter.cache_graph_snapshots(BINANCE).await;
    assert!(matches!(result, Err(TaxGraphError::Value(_))));
}

#[tokio::test]
async fn test_conversion_rate_uses_price_source_and_cache() {
    let binance: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(BINANCE)
            .with_spot_market("BTC", "USD")
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneWeek,
                vec![
                    weekly_row(MONDAY, dec!(8000), dec!(120)),
                    weekly_row(MONDAY + WEEK, dec!(8100), dec!(130)),
                ],
            )
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneMinute,
                vec![minute_row(query_time(), dec!(8000), dec!(8100), dec!(7900), dec!(8050), dec!(10.5))],
            ),
    );
    let mut converter = converter_with(vec![binance.clone()], "conversion-rate");
    converter.optimize(manifest(&["BTC"]));

    let rate = converter
        .get_conversion_rate(query_time(), "BTC", "USD", BINANCE)
        .await
        .unwrap()
        .unwrap();
    // The converter was built with the `High` price source.
    assert_eq!(rate, dec!(8100));
    assert!(converter.cached_entry_count() > 0);

    // A second lookup is served from the cache: no further client calls.
    let calls_before = binance.calls.load(std::sync::atomic::Ordering::SeqCst);
    let rate_again = converter
        .get_conversion_rate(query_time(), "BTC", "USD", BINANCE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rate_again, dec!(8100));
    assert_eq!(binance.calls.load(std::sync::atomic::Ordering::SeqCst), calls_before);
}

#[tokio::test(start_paused = true)]
async fn test_kraken_point_query_prefers_csv_chunks() {
    let kraken: Arc<ScriptedExchange> = Arc::new(
        ScriptedExchange::new(KRAKEN)
            .with_spot_market("BTC", "USD")
            .with_candles(
                "BTC",
                "USD",
                Granularity::OneWeek,
                vec![
                    weekly_row(MONDAY, dec!(7400), dec!(220)),
                    weekly_row(MONDAY + WEEK, dec!(7500), dec!(230)),
                ],
            ),
    );
    let store = scratch_store("kraken-csv");

    // Pre-chunked one-minute data for XBTUSD covering the query minute.
    let query = Utc.with_ymd_and_hms(2020, 1, 8, 12, 0, 30).unwrap();
    let minute_epoch = (query.timestamp() / 60) * 60;
    let window = PairWindow { start: minute_epoch - 600, end: minute_epoch + 600 };
    let index: StdHashMap<String, PairWindow> = StdHashMap::from([(pair_key("XBT", "USD", 1), window)]);
    store.save(PAIR_INDEX_CACHE_KEY, &index).unwrap();

    let chunk_size = 30 * 86_400;
    let file_epoch = (query.timestamp() / chunk_size) * chunk_size;
    let chunk_dir = store.base_dir().join("kraken");
    std::fs::create_dir_all(&chunk_dir).unwrap();
    let chunk_path = chunk_dir.join(chunk_file_name("XBT", "USD", file_epoch, 1));
    let file = std::fs::File::create(&chunk_path).unwrap();
    let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    writeln!(encoder, "{minute_epoch},7400,7450,7350,7420,2.5,9").unwrap();
    encoder.finish().unwrap();

    let mut converter = PairConverter::new(PriceSource::High, Arc::new(ScriptedFactory::new(vec![kraken.clone()])))
        .with_store(store);
    converter.optimize(manifest(&["BTC"]));

    let bar = converter
        .get_historic_bar_from_native_source(query, "BTC", "USD", KRAKEN)
        .await
        .unwrap()
        .unwrap();

    // The chunk file answered; the candle endpoint served only the
    // weekly optimization pulls.
    assert_eq!(bar.close, dec!(7420));
    assert_eq!(bar.timestamp.timestamp(), minute_epoch);
    assert_eq!(kraken.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
}
