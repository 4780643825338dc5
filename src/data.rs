//! Candle data loading and slicing
//!
//! CSV files carry a `Date,Open,High,Low,Close,Volume` header (extra columns
//! are ignored) with timestamps formatted `%Y-%m-%d %H:%M:%S`. Loaded series
//! are sorted and de-duplicated by timestamp.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::Path;
use tracing::{debug, warn};

use crate::types::Candle;

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const COLUMNS: [&str; 6] = ["date", "open", "high", "low", "close", "volume"];

/// Parse `%Y-%m-%d %H:%M:%S`, or RFC 3339 as a fallback
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s.trim(), DATETIME_FORMAT)
        .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        .ok()
        .or_else(|| s.trim().parse::<DateTime<Utc>>().ok())
}

/// Load OHLCV data from CSV file
///
/// Rows whose timestamp does not parse are skipped, as are rows failing
/// candle validation.
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let headers = reader.headers().context("Failed to read CSV header")?.clone();
    let mut index = [0usize; 6];
    for (slot, name) in index.iter_mut().zip(COLUMNS) {
        *slot = headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
            .with_context(|| format!("Missing {} column in {}", name, path.display()))?;
    }

    let mut candles = Vec::new();
    let mut skipped = 0usize;

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;

        let Some(datetime) = record.get(index[0]).and_then(parse_datetime) else {
            skipped += 1;
            continue;
        };

        let field = |i: usize, name: &str| -> Result<f64> {
            record
                .get(index[i])
                .with_context(|| format!("Missing {} in row {}", name, row_idx + 1))?
                .trim()
                .parse::<f64>()
                .with_context(|| format!("Failed to parse {} in row {}", name, row_idx + 1))
        };

        match Candle::new(
            datetime,
            field(1, "open")?,
            field(2, "high")?,
            field(3, "low")?,
            field(4, "close")?,
            field(5, "volume")?,
        ) {
            Ok(candle) => candles.push(candle),
            Err(e) => {
                debug!("Skipping row {}: {}", row_idx + 1, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("Skipped {} invalid rows in {}", skipped, path.display());
    }

    Ok(dedup_sorted(candles))
}

/// Sort by timestamp and keep the first candle of each timestamp
pub fn dedup_sorted(mut candles: Vec<Candle>) -> Vec<Candle> {
    candles.sort_by_key(|c| c.datetime);
    candles.dedup_by_key(|c| c.datetime);
    candles
}

/// Write candles with the same header and timestamp format `load_csv` reads
pub fn write_csv(path: impl AsRef<Path>, candles: &[Candle]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV file {}", path.display()))?;

    writer.write_record(["Date", "Open", "High", "Low", "Close", "Volume"])?;
    for c in candles {
        writer.write_record([
            c.datetime.format(DATETIME_FORMAT).to_string(),
            c.open.to_string(),
            c.high.to_string(),
            c.low.to_string(),
            c.close.to_string(),
            c.volume.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Candles with `start <= datetime < end`
pub fn slice_by_date(candles: &[Candle], start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle] {
    let from = candles.partition_point(|c| c.datetime < start);
    let to = candles.partition_point(|c| c.datetime < end);
    &candles[from..to.max(from)]
}

/// First and last timestamp of a series
pub fn date_range(candles: &[Candle]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    Some((candles.first()?.datetime, candles.last()?.datetime))
}
