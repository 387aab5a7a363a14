// =============================================================================
// Bar cache — in-memory TTL layer plus on-disk JSON fallback
// =============================================================================
//
// Two tiers with different jobs:
//
//   Memory — first stop in the fallback chain. Entries older than `ttl`
//            (default 6h) are never served; the chain moves on to live
//            sources.
//   Disk   — last resort after every live source has failed. Arbitrarily
//            stale data up to `max_age_days` (default 7) may be served;
//            the caller receives the age and decides what to do with it.
//
// Disk writes use the tmp + rename pattern so a crash mid-write never
// corrupts an existing cache file.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Bar, BarSeries};

/// On-disk cache file payload.
#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    symbol: String,
    fetched_at: DateTime<Utc>,
    bars: Vec<Bar>,
}

struct MemoryEntry {
    series: BarSeries,
    fetched_at: DateTime<Utc>,
}

pub struct BarCache {
    dir: PathBuf,
    ttl: Duration,
    max_age_days: f64,
    memory: RwLock<HashMap<String, MemoryEntry>>,
}

impl BarCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration, max_age_days: f64) -> Self {
        Self {
            dir: dir.into(),
            ttl,
            max_age_days,
            memory: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Memory tier
    // -------------------------------------------------------------------------

    /// Serve a series from memory when it is fresh (within TTL) and large
    /// enough. Returns the series and its age in hours.
    pub fn memory_get(&self, symbol: &str, min_rows: usize) -> Option<(BarSeries, f64)> {
        let memory = self.memory.read();
        let entry = memory.get(symbol)?;

        let age = Utc::now().signed_duration_since(entry.fetched_at);
        if age.num_seconds() < 0 || age.to_std().ok()? > self.ttl {
            return None;
        }
        if entry.series.len() < min_rows {
            return None;
        }

        let age_hours = age.num_seconds() as f64 / 3600.0;
        debug!(symbol, age_hours, "memory cache hit");
        Some((entry.series.clone(), age_hours))
    }

    // -------------------------------------------------------------------------
    // Store (both tiers)
    // -------------------------------------------------------------------------

    /// Record a freshly fetched series in memory and on disk. Disk failures
    /// degrade to a warning; the fetch itself already succeeded.
    pub fn store(&self, series: &BarSeries) {
        let now = Utc::now();
        self.memory.write().insert(
            series.symbol().to_string(),
            MemoryEntry {
                series: series.clone(),
                fetched_at: now,
            },
        );

        if let Err(e) = self.write_disk(series, now) {
            warn!(symbol = series.symbol(), error = %e, "disk cache write failed");
        }
    }

    fn write_disk(&self, series: &BarSeries, fetched_at: DateTime<Utc>) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let entry = DiskEntry {
            symbol: series.symbol().to_string(),
            fetched_at,
            bars: series.bars().to_vec(),
        };
        let path = self.disk_path(series.symbol());
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&entry)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(symbol = series.symbol(), path = %path.display(), "disk cache written");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Disk tier
    // -------------------------------------------------------------------------

    /// Serve a series from disk when it exists, parses, is within the
    /// maximum age, and is large enough. Returns the series and its age in
    /// hours — stale data is the caller's call.
    pub fn disk_get(&self, symbol: &str, min_rows: usize) -> Option<(BarSeries, f64)> {
        let path = self.disk_path(symbol);
        let content = std::fs::read_to_string(&path).ok()?;
        let entry: DiskEntry = match serde_json::from_str(&content) {
            Ok(e) => e,
            Err(e) => {
                warn!(symbol, path = %path.display(), error = %e, "corrupt disk cache entry ignored");
                return None;
            }
        };

        let age_hours =
            Utc::now().signed_duration_since(entry.fetched_at).num_seconds() as f64 / 3600.0;
        if age_hours < 0.0 || age_hours > self.max_age_days * 24.0 {
            debug!(symbol, age_hours, "disk cache entry too old");
            return None;
        }

        let series = BarSeries::from_bars(entry.symbol, entry.bars);
        if series.len() < min_rows {
            return None;
        }

        Some((series, age_hours))
    }

    fn disk_path(&self, symbol: &str) -> PathBuf {
        // Symbols are uppercase tickers; keep the filename conservative anyway.
        let safe: String = symbol
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    #[cfg(test)]
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

impl std::fmt::Debug for BarCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarCache")
            .field("dir", &self.dir)
            .field("ttl", &self.ttl)
            .field("max_age_days", &self.max_age_days)
            .field("memory_entries", &self.memory.read().len())
            .finish()
    }
}
