// =============================================================================
// State Store — atomic persistence with staleness detection
// =============================================================================
//
// Single writer for the persisted `SystemState`. Loading classifies the
// file's age and either annotates the state with staleness metadata or
// refuses outright:
//
//   FRESH    age <  24h   confidence 0.95
//   AGING    age <  48h   confidence 0.70   (warning)
//   STALE    age <  72h   confidence 0.30   (loud warning)
//   EXPIRED  age >= 72h   confidence 0.05   refuse to load, StateExpired
//
// Saving is atomic: write a temp sibling, fsync, rename. A crash between
// any two steps leaves the previous file intact. `last_updated_utc` is
// strictly increasing across successful saves.
// =============================================================================

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use super::{PortfolioSnapshot, StalenessMeta, StalenessStatus, SystemState};
use crate::errors::EngineError;

/// Default expiry threshold in hours; configurable via `STATE_EXPIRY_HOURS`.
pub const DEFAULT_EXPIRY_HOURS: f64 = 72.0;

pub struct StateStore {
    path: PathBuf,
    expiry_hours: f64,
    /// Serializes the save path and carries the monotonicity watermark.
    last_saved: Mutex<Option<DateTime<Utc>>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, expiry_hours: f64) -> Self {
        Self {
            path: path.into(),
            expiry_hours,
            last_saved: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // -------------------------------------------------------------------------
    // Load
    // -------------------------------------------------------------------------

    /// Load and classify the persisted state. Refuses EXPIRED files without
    /// touching them.
    pub fn load(&self) -> Result<SystemState, EngineError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            EngineError::Fatal(format!(
                "failed to read state file {}: {e}",
                self.path.display()
            ))
        })?;

        let mut state: SystemState = serde_json::from_str(&content).map_err(|e| {
            EngineError::Fatal(format!(
                "failed to parse state file {}: {e}",
                self.path.display()
            ))
        })?;

        let age = Utc::now().signed_duration_since(state.last_updated_utc);
        let age_hours = age.num_seconds().max(0) as f64 / 3600.0;
        let (status, confidence) = classify_staleness(age_hours, self.expiry_hours);

        match status {
            StalenessStatus::Fresh => {}
            StalenessStatus::Aging => {
                warn!(
                    age_hours = format!("{age_hours:.1}"),
                    "state is aging — confidence reduced"
                );
            }
            StalenessStatus::Stale => {
                warn!(
                    age_hours = format!("{age_hours:.1}"),
                    confidence,
                    "STATE IS STALE — positions and learned parameters may be badly out of date"
                );
            }
            StalenessStatus::Expired => {
                error!(
                    age_hours = format!("{age_hours:.1}"),
                    limit_hours = self.expiry_hours,
                    "state expired — refusing to load; operator must refresh state"
                );
                return Err(EngineError::StateExpired {
                    age_hours,
                    limit_hours: self.expiry_hours,
                });
            }
        }

        state.meta = Some(StalenessMeta {
            staleness_hours: age_hours,
            staleness_status: status,
            confidence,
        });

        info!(
            status = %status,
            age_hours = format!("{age_hours:.1}"),
            positions = state.positions.len(),
            closed_trades = state.closed_trades.len(),
            "state loaded"
        );
        Ok(state)
    }

    /// Load, or bootstrap a fresh state file when none exists yet (first run
    /// on a new deployment).
    pub fn load_or_bootstrap(
        &self,
        portfolio: PortfolioSnapshot,
    ) -> Result<SystemState, EngineError> {
        if self.path.exists() {
            return self.load();
        }
        warn!(path = %self.path.display(), "no state file — bootstrapping");
        let state = SystemState::new(portfolio);
        self.save(state.clone())?;
        Ok(state)
    }

    // -------------------------------------------------------------------------
    // Save
    // -------------------------------------------------------------------------

    /// Atomically persist `state`. Clears staleness metadata and stamps
    /// `last_updated_utc` with a value strictly greater than the previous
    /// save's.
    pub fn save(&self, mut state: SystemState) -> Result<SystemState, EngineError> {
        let mut last_saved = self.last_saved.lock();

        let now = Utc::now();
        let floor = last_saved
            .map(|prev| prev + Duration::milliseconds(1))
            .unwrap_or(now);
        let stamp = if now > floor { now } else { floor };

        state.last_updated_utc = stamp;
        state.meta = None;

        self.write_atomic(&state)?;
        *last_saved = Some(stamp);

        info!(
            last_updated_utc = %stamp,
            positions = state.positions.len(),
            "state saved (atomic)"
        );
        Ok(state)
    }

    /// temp → fsync → rename. Any crash in between leaves the previous
    /// state file untouched.
    fn write_atomic(&self, state: &SystemState) -> Result<(), EngineError> {
        let io_err = |step: &str, e: std::io::Error| {
            EngineError::Fatal(format!("state save failed ({step}): {e}"))
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| io_err("mkdir", e))?;
            }
        }

        let content = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::Fatal(format!("state serialise failed: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(|e| io_err("create", e))?;
            use std::io::Write;
            file.write_all(&content).map_err(|e| io_err("write", e))?;
            file.sync_all().map_err(|e| io_err("fsync", e))?;
        }
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err("rename", e))?;
        Ok(())
    }
}

/// Map an age in hours to a staleness status and confidence.
pub fn classify_staleness(age_hours: f64, expiry_hours: f64) -> (StalenessStatus, f64) {
    if age_hours >= expiry_hours {
        (StalenessStatus::Expired, 0.05)
    } else if age_hours >= 48.0 {
        (StalenessStatus::Stale, 0.30)
    } else if age_hours >= 24.0 {
        (StalenessStatus::Aging, 0.70)
    } else {
        (StalenessStatus::Fresh, 0.95)
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("expiry_hours", &self.expiry_hours)
            .finish()
    }
}
