//! Durable per-document write-ahead record for unsent edits.
//!
//! The record is written before every remote save and on page hide, and
//! cleared once the remote store confirms a save. Until that confirmation it is
//! the only copy of the edit that survives a crash; afterwards it is redundant.
//!
//! Every storage failure is logged and swallowed: the log is a backstop, and
//! the in-memory and remote paths keep working without it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::canonical::CanonicalDoc;
use crate::storage::LocalStore;

/// One unsent edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSaveRecord {
    pub content: CanonicalDoc,
    /// When the record was written, in milliseconds since Unix epoch.
    pub timestamp: u64,
    /// Remote version the edit was based on.
    pub version: u64,
}

/// Pending save records keyed by document storage key.
pub struct PendingSaveLog<S> {
    store: S,
    max_age_ms: u64,
}

impl<S: LocalStore> PendingSaveLog<S> {
    pub fn new(store: S, max_age_ms: u64) -> Self {
        Self { store, max_age_ms }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Replace the record for `key`. Returns whether the write landed.
    pub fn write(&self, key: &str, content: &CanonicalDoc, version: u64, now_ms: u64) -> bool {
        let record = PendingSaveRecord {
            content: content.clone(),
            timestamp: now_ms,
            version,
        };
        let json = match serde_json::to_string(&record) {
            Ok(json) => json,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize pending save");
                return false;
            }
        };
        match self.store.set_item(key, &json) {
            Ok(()) => {
                debug!(key, version, "Wrote pending save");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Failed to write pending save");
                false
            }
        }
    }

    /// Read the record for `key`.
    ///
    /// A record at least `max_age_ms` old is removed and never returned, and
    /// so is one that cannot be decoded.
    pub fn read(&self, key: &str, now_ms: u64) -> Option<PendingSaveRecord> {
        let json = match self.store.get_item(key) {
            Ok(Some(json)) => json,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read pending save");
                return None;
            }
        };

        let record: PendingSaveRecord = match serde_json::from_str(&json) {
            Ok(record) => record,
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupt pending save");
                self.clear(key);
                return None;
            }
        };

        let age = now_ms.saturating_sub(record.timestamp);
        if age >= self.max_age_ms {
            debug!(key, age_ms = age, "Discarding stale pending save");
            self.clear(key);
            return None;
        }

        Some(record)
    }

    pub fn clear(&self, key: &str) {
        if let Err(e) = self.store.remove_item(key) {
            warn!(key, error = %e, "Failed to clear pending save");
        }
    }
}
