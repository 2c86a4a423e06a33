//! 💾 Snapshot & History Persistence
//!
//! Flat-file, single-writer storage: an atomically-replaced `latest.json`
//! snapshot, an append-only newline-delimited JSON history log with a
//! per-calendar-day dedupe policy, and the shared daily BTC close history
//! loaded from CSV.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::pipeline::Snapshot;

/// One daily close of the BTC price history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub close: f64,
}

/// Raw CSV row shape for the price history file.
#[derive(Debug, Deserialize)]
struct PriceRow {
    date: String,
    close: f64,
}

/// Load `date,close` history (ascending) from CSV. Malformed rows are
/// skipped with a warning rather than failing the load.
pub fn load_price_history(path: &Path) -> Result<Vec<PricePoint>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open price history {:?}", path))?;
    let mut points = Vec::new();
    for (i, record) in reader.deserialize::<PriceRow>().enumerate() {
        match record {
            Ok(row) => match NaiveDate::parse_from_str(&row.date, "%Y-%m-%d") {
                Ok(date) => points.push(PricePoint {
                    date,
                    close: row.close,
                }),
                Err(e) => warn!("⚠️  Bad date in price history row {}: {}", i + 2, e),
            },
            Err(e) => warn!("⚠️  Bad price history row {}: {}", i + 2, e),
        }
    }
    points.sort_by_key(|p| p.date);
    Ok(points)
}

/// One row of the append-only history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRow {
    pub as_of_utc: DateTime<Utc>,
    pub composite: f64,
    pub version: String,
    /// Per-factor scores at the time of the row (null = excluded)
    pub factors: BTreeMap<String, Option<f64>>,
}

/// Flat-file store rooted at the data directory. All writes go through one
/// instance per process; the caller serializes refresh cycles.
pub struct SnapshotStore {
    data_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data dir {:?}", data_dir))?;
        Ok(SnapshotStore { data_dir })
    }

    pub fn latest_path(&self) -> PathBuf {
        self.data_dir.join("latest.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.ndjson")
    }

    pub fn price_history_path(&self) -> PathBuf {
        self.data_dir.join("btc_daily.csv")
    }

    pub fn feeds_dir(&self) -> PathBuf {
        self.data_dir.join("feeds")
    }

    /// Atomically replace `latest.json`: the full document is built in
    /// memory, written to a temp file, then renamed over the target so a
    /// reader never observes a partial snapshot.
    pub fn write_latest(&self, snapshot: &Snapshot) -> Result<()> {
        let target = self.latest_path();
        let tmp = self.data_dir.join("latest.json.tmp");
        let body = serde_json::to_string_pretty(snapshot).context("Failed to serialize snapshot")?;
        fs::write(&tmp, body).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &target).with_context(|| format!("Failed to replace {:?}", target))?;
        info!("💾 Snapshot written: composite={}", snapshot.composite_score);
        Ok(())
    }

    /// Read the persisted latest snapshot, if any.
    pub fn read_latest(&self) -> Result<Option<Snapshot>> {
        let path = self.latest_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        let snapshot = serde_json::from_str(&raw).context("Corrupt latest.json")?;
        Ok(Some(snapshot))
    }

    /// Last row of the history log, if any.
    pub fn last_history_row(&self) -> Result<Option<HistoryRow>> {
        let path = self.history_path();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let Some(line) = raw.lines().rev().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let row = serde_json::from_str(line).context("Corrupt history row")?;
        Ok(Some(row))
    }

    /// Append a history row unless the dedupe policy says the last row is
    /// still current. A row is appended only when the previous row is from
    /// a different UTC calendar day AND at least `min_elapsed_hours` have
    /// passed, so a refresh just after midnight does not double-log.
    ///
    /// Returns true when a row was appended.
    pub fn append_history_if_due(&self, row: &HistoryRow, min_elapsed_hours: f64) -> Result<bool> {
        if let Some(last) = self.last_history_row()? {
            let same_day = (last.as_of_utc.year(), last.as_of_utc.ordinal())
                == (row.as_of_utc.year(), row.as_of_utc.ordinal());
            let elapsed_hours =
                row.as_of_utc.signed_duration_since(last.as_of_utc).num_seconds() as f64 / 3600.0;
            if same_day || elapsed_hours < min_elapsed_hours {
                info!(
                    "⏭️  History append skipped (same_day={}, elapsed={:.1}h)",
                    same_day, elapsed_hours
                );
                return Ok(false);
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())
            .with_context(|| format!("Failed to open {:?}", self.history_path()))?;
        let line = serde_json::to_string(row).context("Failed to serialize history row")?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        info!("📈 History row appended for {}", row.as_of_utc.date_naive());
        Ok(true)
    }

    /// Load the shared daily BTC close history, empty when the file is
    /// absent (adjustments degrade to no-ops).
    pub fn load_prices(&self) -> Vec<PricePoint> {
        let path = self.price_history_path();
        if !path.exists() {
            warn!("⚠️  No price history at {:?} - adjustments disabled this cycle", path);
            return Vec::new();
        }
        match load_price_history(&path) {
            Ok(points) => points,
            Err(e) => {
                warn!("⚠️  Failed to load price history: {}", e);
                Vec::new()
            }
        }
    }
}
