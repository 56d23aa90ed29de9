//! Resumable extraction progress and the raw payload cache.
//!
//! The progress file records which fetch units already completed so a
//! restarted extraction skips them; the cache holds each unit's raw provider
//! payload keyed by unit id and fetch parameters. Both are written through
//! [`persist::write_atomic`], so a crash mid-write never corrupts the
//! previously committed file.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::persist;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMeta {
    pub limit: usize,
    pub days: u32,
    pub vs_currency: String,
    pub last_updated_utc: String,
}

/// Persisted ledger of completed fetch units plus run metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionState {
    pub completed_units: BTreeSet<String>,
    pub meta: StateMeta,
}

impl ExtractionState {
    pub fn is_completed(&self, unit_id: &str) -> bool {
        self.completed_units.contains(unit_id)
    }

    pub fn mark_completed(&mut self, unit_id: &str, limit: usize, days: u32, vs_currency: &str) {
        self.completed_units.insert(unit_id.to_string());
        self.meta = StateMeta {
            limit,
            days,
            vs_currency: vs_currency.to_string(),
            last_updated_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Missing file means a fresh extraction, not an error.
    pub fn load(&self) -> Result<ExtractionState> {
        if !self.path.exists() {
            return Ok(ExtractionState::default());
        }
        persist::read_json(&self.path)
    }

    pub fn save(&self, state: &ExtractionState) -> Result<()> {
        persist::write_json(&self.path, state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// On-disk cache of raw per-unit provider payloads.
pub struct RawCache {
    dir: PathBuf,
}

impl RawCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, unit_id: &str, vs_currency: &str, days: u32) -> PathBuf {
        let safe = format!("{unit_id}_{vs_currency}_{days}d").replace('/', "_");
        self.dir.join(format!("{safe}.json"))
    }

    pub fn contains(&self, unit_id: &str, vs_currency: &str, days: u32) -> bool {
        self.path_for(unit_id, vs_currency, days).exists()
    }

    pub fn load(&self, unit_id: &str, vs_currency: &str, days: u32) -> Result<serde_json::Value> {
        persist::read_json(&self.path_for(unit_id, vs_currency, days))
    }

    pub fn save(
        &self,
        unit_id: &str,
        vs_currency: &str,
        days: u32,
        payload: &serde_json::Value,
    ) -> Result<()> {
        persist::write_json(&self.path_for(unit_id, vs_currency, days), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("progress.json"));

        let state = store.load().unwrap();
        assert!(state.completed_units.is_empty());
    }

    #[test]
    fn state_round_trips_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("progress.json"));

        let mut state = store.load().unwrap();
        state.mark_completed("bitcoin", 20, 30, "usd");
        state.mark_completed("ethereum", 20, 30, "usd");
        store.save(&state).unwrap();

        let reloaded = store.load().unwrap();
        assert!(reloaded.is_completed("bitcoin"));
        assert!(reloaded.is_completed("ethereum"));
        assert!(!reloaded.is_completed("solana"));
        assert_eq!(reloaded.meta.limit, 20);
        assert_eq!(reloaded.meta.vs_currency, "usd");
    }

    #[test]
    fn cache_round_trips_payload_per_unit_and_params() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RawCache::new(dir.path());

        let payload = serde_json::json!({"prices": [[1700000000000u64, 42000.0]]});
        cache.save("bitcoin", "usd", 30, &payload).unwrap();

        assert!(cache.contains("bitcoin", "usd", 30));
        // Different fetch parameters are a different cache entry
        assert!(!cache.contains("bitcoin", "usd", 90));
        assert!(!cache.contains("bitcoin", "eur", 30));

        assert_eq!(cache.load("bitcoin", "usd", 30).unwrap(), payload);
    }
}
