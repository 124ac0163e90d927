//! Bulk CSV pricing subsystem
//!
//! Kraken publishes its full OHLCVT history as one large zip archive of
//! per-pair per-granularity CSVs, which is more accurate than its public
//! candle endpoint for anything older than the current quarter. This
//! subsystem downloads the archive, rechunks each pair into small gzipped
//! month-scale files, emulates the weekly granularity the archive lacks,
//! and serves historical bar queries straight from the chunk files.
//!
//! CSV row format: epoch seconds, open, high, low, close, volume, trades.

mod archive;
mod chunker;

pub use chunker::chunk_csv;

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error};

use crate::cache::PersistentCache;
use crate::error::{Result, TaxGraphError};
use crate::exchange::Granularity;
use crate::types::{HistoricalBar, TransactionManifest};

/// Cache key for the `(pair, minutes) -> (start, end)` window index.
pub const PAIR_INDEX_CACHE_KEY: &str = "kraken-csv-download";

/// Archive file name inside the csv cache directory.
pub const ARCHIVE_FILE_NAME: &str = "Kraken_OHLCVT.zip";

// Granularities shipped in the archive, in minutes; 10080 (weekly) is
// emulated from the daily files during chunking.
pub(crate) const MINUTES: [u32; 7] = [1, 5, 15, 60, 720, 1440, 10080];
pub(crate) const ONE_DAY_MINUTES: u32 = 1440;
pub(crate) const ONE_WEEK_MINUTES: u32 = 10080;

/// Base chunk span in seconds before the granularity multiplier.
pub(crate) const CHUNK_SIZE: i64 = 30 * 86_400;

/// Granularity multiplier cap, so coarse files stay single-chunk.
pub(crate) const MAX_MULTIPLIER: u32 = 500;

const SECONDS_IN_MINUTE: i64 = 60;
const CHUNKING_THREADS: usize = 3;
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// First/last row epoch for one `(pair, minutes)` series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairWindow {
    pub start: i64,
    pub end: i64,
}

/// Answers `yes`/`no` questions normally asked on an interactive console.
/// Batch runs inject a constant; tests inject a recorder.
pub type Confirmation = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Disk-backed historical bar source for the unified Kraken CSV archive.
pub struct CsvPricing {
    cache_dir: PathBuf,
    archive_path: PathBuf,
    store: PersistentCache,
    http: Client,
    cached_pairs: HashMap<String, PairWindow>,
    cache_loaded: bool,
    force_download: bool,
    unchunked_assets: BTreeSet<String>,
    confirm: Confirmation,
}

impl CsvPricing {
    /// Build against the standard cache layout:
    /// chunks under `<cache root>/kraken/`, archive under
    /// `<cache root>/kraken/csv/`.
    pub fn new(manifest: &TransactionManifest, store: PersistentCache, confirm: Confirmation) -> Self {
        let cache_dir = store.base_dir().join("kraken");
        let archive_path = cache_dir.join("csv").join(ARCHIVE_FILE_NAME);
        debug!("Assets pending chunking: {:?}", manifest.assets);
        CsvPricing {
            cache_dir,
            archive_path,
            store,
            http: Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("reqwest client"),
            cached_pairs: HashMap::new(),
            cache_loaded: false,
            force_download: false,
            unchunked_assets: manifest.assets.clone(),
            confirm,
        }
    }

    /// Skip the interactive download prompt.
    pub fn with_force_download(mut self) -> Self {
        self.force_download = true;
        self
    }

    pub fn cache_key(&self) -> &'static str {
        PAIR_INDEX_CACHE_KEY
    }

    fn load_pair_index(&mut self) {
        if !self.cache_loaded {
            debug!("Loading pair index for the CSV pricing subsystem.");
            self.cached_pairs = self.store.load(PAIR_INDEX_CACHE_KEY).unwrap_or_default();
            self.cache_loaded = true;
        }
    }

    fn save_pair_index(&self) -> Result<()> {
        self.store
            .save(PAIR_INDEX_CACHE_KEY, &self.cached_pairs)
            .map_err(|e| TaxGraphError::runtime(format!("failed to persist pair index: {e}")))
    }

    /// Single point-query bar at the finest granularity available.
    pub async fn find_historical_bar(
        &mut self,
        base_asset: &str,
        quote_asset: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<HistoricalBar>> {
        let bars = self
            .find_historical_bars(base_asset, quote_asset, timestamp, false, Granularity::OneMinute)
            .await?;
        Ok(bars.and_then(|mut bars| if bars.is_empty() { None } else { Some(bars.remove(0)) }))
    }

    /// Historical bars for a pair. Point queries (`all_bars == false`)
    /// return the single bar whose floored epoch matches; bundle queries
    /// return every bar at-or-after the query across the pair's window.
    /// Chunks the pair out of the archive on first use.
    pub async fn find_historical_bars(
        &mut self,
        base_asset: &str,
        quote_asset: &str,
        timestamp: DateTime<Utc>,
        all_bars: bool,
        timespan: Granularity,
    ) -> Result<Option<Vec<HistoricalBar>>> {
        // The archive spells BTC as XBT.
        let base_asset = if base_asset == "BTC" { "XBT" } else { base_asset };
        let epoch = timestamp.timestamp();
        debug!("Retrieving bar for {base_asset}{quote_asset} at {epoch}");

        self.load_pair_index();

        let start_index = granularity_index(timespan)?;
        if self
            .cached_pairs
            .contains_key(&pair_key(base_asset, quote_asset, MINUTES[0]))
        {
            debug!("Retrieving cached bars for {base_asset}, {quote_asset} at {epoch}");
            return self.retrieve_cached_bars(base_asset, quote_asset, epoch, all_bars, start_index);
        }

        if self.unzip_and_chunk(base_asset, quote_asset, all_bars).await? {
            return self.retrieve_cached_bars(base_asset, quote_asset, epoch, all_bars, start_index);
        }

        Ok(None)
    }

    // Serve a query from the on-disk chunk files, starting at the
    // requested granularity and coarsening whenever the timestamp falls
    // outside the pair's recorded window or the row is absent.
    fn retrieve_cached_bars(
        &self,
        base_asset: &str,
        quote_asset: &str,
        timestamp: i64,
        all_bars: bool,
        start_index: usize,
    ) -> Result<Option<Vec<HistoricalBar>>> {
        let mut retry = start_index;

        while retry < MINUTES.len() {
            let minutes = MINUTES[retry];
            let window = match self.cached_pairs.get(&pair_key(base_asset, quote_asset, minutes)) {
                Some(window) => *window,
                None => {
                    debug!("No cached pair found for {base_asset}, {quote_asset} at {minutes} minutes");
                    retry += 1;
                    continue;
                }
            };

            if (timestamp < window.start || timestamp > window.end) && !all_bars {
                debug!(
                    "Out of range - {timestamp} < {} or {timestamp} > {}",
                    window.start, window.end
                );
                retry += 1;
                continue;
            }

            let duration_chunk_size = CHUNK_SIZE * i64::from(minutes.min(MAX_MULTIPLIER));
            let bar_seconds = i64::from(minutes) * SECONDS_IN_MINUTE;
            // Floor the query to the bar boundary at this granularity.
            let duration_timestamp = (timestamp / bar_seconds) * bar_seconds;
            let mut file_timestamp = (timestamp / duration_chunk_size) * duration_chunk_size;
            let mut result: Vec<HistoricalBar> = Vec::new();

            while file_timestamp < window.end {
                let file_name = chunk_file_name(base_asset, quote_asset, file_timestamp, minutes);
                let file_path = self.cache_dir.join(&file_name);
                if all_bars {
                    debug!(
                        "Retrieving bars for {base_asset} -> {quote_asset} starting from {duration_timestamp} from {file_timestamp} stamped file."
                    );
                } else {
                    debug!(
                        "Retrieving {base_asset} -> {quote_asset} at {duration_timestamp} from {file_timestamp} stamped file."
                    );
                }

                match std::fs::File::open(&file_path) {
                    Ok(file) => {
                        let reader = std::io::BufReader::new(flate2::read::GzDecoder::new(file));
                        for line in reader.lines() {
                            let line = line?;
                            let row = chunker::ChunkRow::parse(&line)?;
                            if all_bars && row.epoch >= duration_timestamp {
                                result.push(row.to_bar(minutes)?);
                            } else if !all_bars && row.epoch == duration_timestamp {
                                return Ok(Some(vec![row.to_bar(minutes)?]));
                            }
                        }
                    }
                    Err(_) => {
                        error!("No such file={file_path:?} (skipping) {timestamp}.");
                    }
                }

                file_timestamp = if all_bars {
                    file_timestamp + duration_chunk_size
                } else {
                    window.end
                };
            }

            if !result.is_empty() {
                return Ok(Some(result));
            }
            retry += 1;
        }

        Ok(None)
    }
}

/// Window-index key for one pair at one granularity.
pub(crate) fn pair_key(base: &str, quote: &str, minutes: u32) -> String {
    format!("{base}{quote}{minutes}")
}

/// On-disk name of one chunk file.
pub(crate) fn chunk_file_name(base: &str, quote: &str, epoch: i64, minutes: u32) -> String {
    format!("{base}{quote}_{epoch}_{minutes}.csv.gz")
}

// Starting rung in the minute ladder for a candle granularity. The
// subsystem is only queried at one-minute (point) and one-week (bundle)
// granularities; anything the archive does not ship is a caller bug.
fn granularity_index(timespan: Granularity) -> Result<usize> {
    let minutes = match timespan {
        Granularity::OneMinute => 1,
        Granularity::FiveMinutes => 5,
        Granularity::FifteenMinutes => 15,
        Granularity::OneHour => 60,
        Granularity::OneDay => ONE_DAY_MINUTES,
        Granularity::OneWeek => ONE_WEEK_MINUTES,
        other => {
            return Err(TaxGraphError::value(format!(
                "invalid timespan {} for CSV pricing",
                other.label()
            )))
        }
    };
    MINUTES
        .iter()
        .position(|&m| m == minutes)
        .ok_or_else(|| TaxGraphError::value(format!("invalid timespan {} for CSV pricing", timespan.label())))
}

pub(crate) fn decimal_from_csv(field: &str) -> Result<Decimal> {
    field
        .parse::<Decimal>()
        .map_err(|e| TaxGraphError::runtime(format!("bad decimal field {field:?} in chunk file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn scratch_store(name: &str) -> PersistentCache {
        let dir = std::env::temp_dir().join(format!("taxgraph-csv-test-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        PersistentCache::new(dir)
    }

    fn manifest() -> TransactionManifest {
        TransactionManifest::new(
            Utc.with_ymd_and_hms(2020, 1, 6, 0, 0, 0).unwrap(),
            vec!["BTC".to_string()],
            "USD",
        )
    }

    fn write_chunk(pricing: &CsvPricing, base: &str, quote: &str, epoch: i64, minutes: u32, rows: &[&str]) {
        std::fs::create_dir_all(&pricing.cache_dir).unwrap();
        let path = pricing.cache_dir.join(chunk_file_name(base, quote, epoch, minutes));
        let file = std::fs::File::create(path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        for row in rows {
            writeln!(encoder, "{row}").unwrap();
        }
        encoder.finish().unwrap();
    }

    fn pricing(name: &str) -> CsvPricing {
        CsvPricing::new(&manifest(), scratch_store(name), Box::new(|_| false))
    }

    #[test]
    fn test_granularity_index_rejects_unshipped_timespans() {
        assert_eq!(granularity_index(Granularity::OneMinute).unwrap(), 0);
        assert_eq!(granularity_index(Granularity::OneWeek).unwrap(), 6);
        assert!(granularity_index(Granularity::FourHours).is_err());
    }

    #[tokio::test]
    async fn test_point_query_returns_exact_floored_row() {
        let mut p = pricing("point-query");
        // Chunk epoch for 1-minute data: 30 days.
        let window = PairWindow { start: 1_577_836_800, end: 1_577_836_920 };
        p.cached_pairs.insert(pair_key("XBT", "USD", 1), window);
        p.cache_loaded = true;
        let file_epoch = (1_577_836_860 / CHUNK_SIZE) * CHUNK_SIZE;
        write_chunk(
            &p,
            "XBT",
            "USD",
            file_epoch,
            1,
            &[
                "1577836800,7200,7210,7190,7205,3.5,12",
                "1577836860,7205,7220,7200,7215,1.25,4",
            ],
        );

        // 30 seconds past the minute floors to the second row.
        let ts = Utc.timestamp_opt(1_577_836_890, 0).unwrap();
        let bar = p.find_historical_bar("BTC", "USD", ts).await.unwrap().unwrap();
        assert_eq!(bar.open, dec!(7205));
        assert_eq!(bar.close, dec!(7215));
        assert_eq!(bar.timestamp.timestamp(), 1_577_836_860);
        assert_eq!(bar.duration, std::time::Duration::from_secs(60));
        let _ = std::fs::remove_dir_all(p.store.base_dir());
    }

    #[tokio::test]
    async fn test_out_of_window_coarsens_to_next_granularity() {
        let mut p = pricing("coarsen");
        p.cache_loaded = true;
        // 1-minute data starts too late for the query; daily data covers it.
        p.cached_pairs.insert(
            pair_key("XBT", "USD", 1),
            PairWindow { start: 1_600_000_000, end: 1_600_001_000 },
        );
        p.cached_pairs.insert(
            pair_key("XBT", "USD", ONE_DAY_MINUTES),
            PairWindow { start: 1_577_750_400, end: 1_578_096_000 },
        );
        let day_chunk = CHUNK_SIZE * i64::from(MAX_MULTIPLIER);
        let query_epoch: i64 = 1_577_923_200;
        let file_epoch = (query_epoch / day_chunk) * day_chunk;
        write_chunk(
            &p,
            "XBT",
            "USD",
            file_epoch,
            ONE_DAY_MINUTES,
            &["1577923200,7300,7400,7250,7350,820.5,9001"],
        );

        let ts = Utc.timestamp_opt(query_epoch + 7_200, 0).unwrap();
        let bar = p.find_historical_bar("BTC", "USD", ts).await.unwrap().unwrap();
        assert_eq!(bar.close, dec!(7350));
        assert_eq!(bar.duration, std::time::Duration::from_secs(86_400));
        let _ = std::fs::remove_dir_all(p.store.base_dir());
    }

    #[tokio::test]
    async fn test_chunk_boundary_rows_resolve_from_their_own_chunks() {
        let mut p = pricing("boundary");
        p.cache_loaded = true;
        let chunk_size = CHUNK_SIZE; // 1-minute granularity
        let boundary = chunk_size * 20;
        let last_in_first = boundary - 60;
        p.cached_pairs.insert(
            pair_key("XBT", "USD", 1),
            PairWindow { start: last_in_first - 60, end: boundary + 60 },
        );
        write_chunk(
            &p,
            "XBT",
            "USD",
            boundary - chunk_size,
            1,
            &[&format!("{last_in_first},100,101,99,100.5,1,1")],
        );
        write_chunk(&p, "XBT", "USD", boundary, 1, &[&format!("{boundary},200,201,199,200.5,1,1")]);

        // Last minute of the first window.
        let bar = p
            .find_historical_bar("BTC", "USD", Utc.timestamp_opt(last_in_first + 59, 0).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bar.open, dec!(100));
        // First second of the next window.
        let bar = p
            .find_historical_bar("BTC", "USD", Utc.timestamp_opt(boundary, 0).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bar.open, dec!(200));
        let _ = std::fs::remove_dir_all(p.store.base_dir());
    }

    #[tokio::test]
    async fn test_bundle_query_collects_rows_at_or_after_epoch() {
        let mut p = pricing("bundle");
        p.cache_loaded = true;
        let week_chunk = CHUNK_SIZE * i64::from(MAX_MULTIPLIER);
        // Three weekly rows starting 2020-01-06 (a Monday).
        let monday: i64 = 1_578_268_800 - 604_800;
        p.cached_pairs.insert(
            pair_key("XBT", "USD", ONE_WEEK_MINUTES),
            PairWindow { start: monday, end: monday + 2 * 604_800 },
        );
        let file_epoch = (monday / week_chunk) * week_chunk;
        write_chunk(
            &p,
            "XBT",
            "USD",
            file_epoch,
            ONE_WEEK_MINUTES,
            &[
                &format!("{monday},7000,7100,6900,7050,10,100"),
                &format!("{},7050,7200,7000,7150,11,110", monday + 604_800),
                &format!("{},7150,7300,7100,7250,12,120", monday + 2 * 604_800),
            ],
        );

        let bars = p
            .find_historical_bars(
                "BTC",
                "USD",
                Utc.timestamp_opt(monday + 604_800, 0).unwrap(),
                true,
                Granularity::OneWeek,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(7150));
        assert_eq!(bars[1].close, dec!(7250));
        let _ = std::fs::remove_dir_all(p.store.base_dir());
    }

    #[tokio::test]
    async fn test_unknown_pair_without_archive_is_absent() {
        let mut p = pricing("unknown-pair");
        p.cache_loaded = true;
        let ts = Utc.with_ymd_and_hms(2020, 1, 6, 0, 0, 0).unwrap();
        let result = p
            .find_historical_bars("ETH", "USD", ts, false, Granularity::OneMinute)
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
