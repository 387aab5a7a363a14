// =============================================================================
// Market-data health log — append-only JSON lines
// =============================================================================
//
// One record per provider call, success or failure, so operators can see
// exactly how each series was obtained and which sources are degrading.
// The provider never reads this file; rotation is the operator's job.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{DataSource, FetchAttempt};

/// One line of the health log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<DataSource>,
    pub rows: usize,
    pub total_attempts: usize,
    pub total_latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_age_hours: Option<f64>,
    pub attempts: Vec<FetchAttempt>,
}

/// Append-only sink. Writes are serialized; a failed write degrades to a
/// warning so a full disk never takes the data path down with it.
pub struct HealthLog {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl HealthLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// A sink that drops every record (tests, dry runs).
    pub fn disabled() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &HealthRecord) {
        let Some(path) = &self.path else { return };
        let _guard = self.write_lock.lock();

        let result = (|| -> anyhow::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            serde_json::to_writer(&mut file, record)?;
            file.write_all(b"\n")?;
            Ok(())
        })();

        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "health log append failed");
        }
    }
}
