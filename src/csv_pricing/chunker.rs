//! CSV rechunking and weekly candle emulation
//!
//! Archive files carry one pair at one granularity across its whole
//! history. Queries want small files addressable by timestamp, so rows are
//! regrouped into windows of `CHUNK_SIZE * min(minutes, 500)` seconds and
//! written as gzipped per-window files. The archive has no weekly
//! granularity; it is emulated while the daily file passes through.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use super::{
    chunk_file_name, decimal_from_csv, pair_key, PairWindow, CHUNK_SIZE, MAX_MULTIPLIER,
    ONE_DAY_MINUTES, ONE_WEEK_MINUTES,
};
use crate::error::{Result, TaxGraphError};
use crate::types::HistoricalBar;

const DAYS_IN_WEEK: usize = 7;

/// One archive row, kept as text so chunking is a pure regrouping pass
/// with no numeric round-tripping.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChunkRow {
    pub epoch: i64,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub trades: String,
}

impl ChunkRow {
    pub(crate) fn parse(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.trim().split(',').collect();
        if fields.len() < 6 {
            return Err(TaxGraphError::runtime(format!("malformed CSV row: {line:?}")));
        }
        let epoch = fields[0]
            .parse::<i64>()
            .map_err(|e| TaxGraphError::runtime(format!("bad epoch in CSV row {line:?}: {e}")))?;
        Ok(ChunkRow {
            epoch,
            open: fields[1].to_string(),
            high: fields[2].to_string(),
            low: fields[3].to_string(),
            close: fields[4].to_string(),
            volume: fields[5].to_string(),
            trades: fields.get(6).unwrap_or(&"0").to_string(),
        })
    }

    fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{},{}",
            self.epoch, self.open, self.high, self.low, self.close, self.volume, self.trades
        )
    }

    pub(crate) fn to_bar(&self, minutes: u32) -> Result<HistoricalBar> {
        Ok(HistoricalBar {
            duration: Duration::from_secs(u64::from(minutes) * 60),
            timestamp: Utc
                .timestamp_opt(self.epoch, 0)
                .single()
                .ok_or_else(|| TaxGraphError::runtime(format!("bad epoch {} in chunk file", self.epoch)))?,
            open: decimal_from_csv(&self.open)?,
            high: decimal_from_csv(&self.high)?,
            low: decimal_from_csv(&self.low)?,
            close: decimal_from_csv(&self.close)?,
            volume: decimal_from_csv(&self.volume)?,
        })
    }
}

/// Rechunk one archive entry (`<PAIR>_<MINUTES>.csv`) into per-window
/// gzip files under `cache_dir`, emulating weekly candles for the daily
/// entry. Returns the `(pair, minutes) -> (start, end)` windows observed.
pub fn chunk_csv(file_name: &str, contents: &str, cache_dir: &Path) -> Result<HashMap<String, PairWindow>> {
    std::fs::create_dir_all(cache_dir)?;
    let stem = file_name.strip_suffix(".csv").unwrap_or(file_name);
    let (pair, minutes_str) = stem
        .rsplit_once('_')
        .ok_or_else(|| TaxGraphError::runtime(format!("unrecognized archive entry name: {file_name}")))?;
    let minutes: u32 = minutes_str
        .parse()
        .map_err(|e| TaxGraphError::runtime(format!("bad granularity in entry name {file_name}: {e}")))?;
    let chunk_size = CHUNK_SIZE * i64::from(minutes.min(MAX_MULTIPLIER));

    let mut pair_start: Option<i64> = None;
    let mut pair_end: Option<i64> = None;
    let mut chunk: Vec<ChunkRow> = Vec::new();
    let mut next_timestamp: Option<i64> = None;

    let flush = |chunk: &[ChunkRow], pair_start: &mut Option<i64>| -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if pair_start.is_none() {
            *pair_start = Some(chunk[0].epoch);
        }
        let file_timestamp = (chunk[0].epoch / chunk_size) * chunk_size;
        write_chunk(cache_dir, pair, file_timestamp, minutes, chunk)?;
        if minutes == ONE_DAY_MINUTES {
            let week_rows = emulate_weekly(chunk)?;
            // Same file timestamp is fine: daily chunks already use the
            // capped multiplier, so the weekly lookup lands on this file.
            write_chunk(cache_dir, pair, file_timestamp, ONE_WEEK_MINUTES, &week_rows)?;
        }
        Ok(())
    };

    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let row = ChunkRow::parse(line)?;
        let boundary = *next_timestamp.get_or_insert(((row.epoch + chunk_size) / chunk_size) * chunk_size);
        if row.epoch % chunk_size == 0 || row.epoch > boundary {
            flush(&chunk, &mut pair_start)?;
            chunk.clear();
            next_timestamp = Some(boundary + chunk_size);
        }
        chunk.push(row);
    }
    if !chunk.is_empty() {
        pair_end = Some(chunk[chunk.len() - 1].epoch);
        flush(&chunk, &mut pair_start)?;
    }

    let mut windows = HashMap::new();
    if let (Some(start), Some(end)) = (pair_start, pair_end) {
        windows.insert(pair_key_raw(pair, minutes), PairWindow { start, end });
        if minutes == ONE_DAY_MINUTES {
            windows.insert(pair_key_raw(pair, ONE_WEEK_MINUTES), PairWindow { start, end });
        }
    }
    debug!("Chunked {file_name}: windows {windows:?}");
    Ok(windows)
}

fn pair_key_raw(pair: &str, minutes: u32) -> String {
    pair_key(pair, "", minutes)
}

fn write_chunk(cache_dir: &Path, pair: &str, file_timestamp: i64, minutes: u32, rows: &[ChunkRow]) -> Result<()> {
    let path = cache_dir.join(chunk_file_name(pair, "", file_timestamp, minutes));
    let file = std::fs::File::create(&path)?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    for row in rows {
        writeln!(encoder, "{}", row.to_line())?;
    }
    encoder.finish()?;
    Ok(())
}

// Build weekly rows from daily ones. Each week starts on the Monday at or
// after the chunk's first row and covers the 1..=7 daily rows before the
// following Monday; days the source skipped (no volume) contribute
// nothing. OHLC is the arithmetic mean of the days present, volume and
// trades are summed, an all-missing week emits zeros.
// TODO: emit a true candle instead (open = Monday open, close = last-day
// close, high = max, low = min); the mean understates weekly range.
fn emulate_weekly(chunk: &[ChunkRow]) -> Result<Vec<ChunkRow>> {
    let first_timestamp = Utc
        .timestamp_opt(chunk[0].epoch, 0)
        .single()
        .ok_or_else(|| TaxGraphError::runtime(format!("bad epoch {} in daily chunk", chunk[0].epoch)))?;
    let mut next_monday = next_monday_after(first_timestamp);

    let adjusted: Vec<&ChunkRow> = chunk
        .iter()
        .filter(|row| row.epoch >= next_monday.timestamp())
        .collect();

    let mut week_rows = Vec::new();
    let mut i = 0;
    while i < adjusted.len() {
        let following_monday = next_monday + chrono::Duration::days(DAYS_IN_WEEK as i64);
        let week: Vec<&ChunkRow> = adjusted[i..(i + DAYS_IN_WEEK).min(adjusted.len())]
            .iter()
            .copied()
            .filter(|row| row.epoch < following_monday.timestamp())
            .collect();

        let monday_epoch = next_monday.timestamp();
        if week.is_empty() {
            week_rows.push(ChunkRow {
                epoch: monday_epoch,
                open: "0".to_string(),
                high: "0".to_string(),
                low: "0".to_string(),
                close: "0".to_string(),
                volume: "0".to_string(),
                trades: "0".to_string(),
            });
        } else {
            week_rows.push(ChunkRow {
                epoch: monday_epoch,
                open: column_mean(&week, |r| &r.open)?.to_string(),
                high: column_mean(&week, |r| &r.high)?.to_string(),
                low: column_mean(&week, |r| &r.low)?.to_string(),
                close: column_mean(&week, |r| &r.close)?.to_string(),
                volume: column_sum(&week, |r| &r.volume)?.to_string(),
                trades: column_sum(&week, |r| &r.trades)?.to_string(),
            });
        }

        i += week.len();
        next_monday = following_monday;
    }

    Ok(week_rows)
}

fn column_mean(rows: &[&ChunkRow], field: fn(&ChunkRow) -> &str) -> Result<Decimal> {
    Ok(column_sum(rows, field)? / Decimal::from(rows.len()))
}

fn column_sum(rows: &[&ChunkRow], field: fn(&ChunkRow) -> &str) -> Result<Decimal> {
    let mut sum = Decimal::ZERO;
    for &row in rows {
        sum += decimal_from_csv(field(row))?;
    }
    Ok(sum)
}

// The strictly-next Monday: a Monday input advances a full week.
fn next_monday_after(date: DateTime<Utc>) -> DateTime<Utc> {
    let mut days_ahead = (DAYS_IN_WEEK as i64 - i64::from(date.weekday().num_days_from_monday())) % DAYS_IN_WEEK as i64;
    if days_ahead == 0 {
        days_ahead = DAYS_IN_WEEK as i64;
    }
    date + chrono::Duration::days(days_ahead)
}
