// =============================================================================
// Audit trail — one record per decision, order, veto, and failure
// =============================================================================
//
// Nothing the pipeline does goes unrecorded: every meta decision, RL
// override, risk veto, breaker block, order outcome, and terminal failure
// lands here. Records are kept in a bounded in-memory ring for the run
// summary and appended to a JSONL file for the operator.
// =============================================================================

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

/// In-memory retention cap.
const MAX_RECENT_RECORDS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Decision,
    Override,
    Veto,
    BreakerBlock,
    Order,
    Exit,
    Health,
    Failure,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    pub summary: String,
    /// Structured payload; shape depends on `kind`.
    pub detail: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        kind: AuditKind,
        symbol: Option<&str>,
        summary: impl Into<String>,
        detail: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            kind,
            symbol: symbol.map(str::to_string),
            summary: summary.into(),
            detail,
        }
    }
}

pub struct AuditTrail {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
    recent: RwLock<Vec<AuditRecord>>,
}

impl AuditTrail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
            recent: RwLock::new(Vec::new()),
        }
    }

    /// In-memory only (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
            recent: RwLock::new(Vec::new()),
        }
    }

    pub fn record(&self, record: AuditRecord) {
        if let Some(path) = &self.path {
            let _guard = self.write_lock.lock();
            let result = (|| -> anyhow::Result<()> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let mut file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                serde_json::to_writer(&mut file, &record)?;
                file.write_all(b"\n")?;
                Ok(())
            })();
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "audit append failed");
            }
        }

        let mut recent = self.recent.write();
        recent.push(record);
        let len = recent.len();
        if len > MAX_RECENT_RECORDS {
            recent.drain(..len - MAX_RECENT_RECORDS);
        }
    }

    pub fn recent(&self) -> Vec<AuditRecord> {
        self.recent.read().clone()
    }

    #[cfg(test)]
    pub fn records_of_kind(&self, kind: AuditKind) -> Vec<AuditRecord> {
        self.recent
            .read()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for AuditTrail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditTrail")
            .field("path", &self.path)
            .field("recent", &self.recent.read().len())
            .finish()
    }
}
