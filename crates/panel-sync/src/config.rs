//! Tunables for a document session.
//!
//! Every duration is in milliseconds. Hosts usually take the defaults; the
//! wasm bindings accept a partial JS object and fill the rest from `Default`.

use serde::Deserialize;

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    /// Quiet period before a scheduled save is sent to the remote store
    pub save_debounce_ms: u64,
    /// How long after the last keystroke the user still counts as "typing"
    pub edit_decay_ms: u64,
    /// Window after an edit during which remote updates are deferred
    pub conflict_grace_ms: u64,
    /// Pending save records older than this are discarded
    pub pending_max_age_ms: u64,
    /// Maximum number of remembered `panelId-version` keys
    pub processed_versions_cap: usize,
    /// Prefix for pending save keys in local storage
    pub storage_key_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            save_debounce_ms: 300,
            edit_decay_ms: 3_000,
            conflict_grace_ms: 2_000,
            pending_max_age_ms: 5 * 60 * 1_000,
            processed_versions_cap: 50,
            storage_key_prefix: "pending_save_".to_string(),
        }
    }
}

impl SyncConfig {
    /// Parse a (possibly partial) JSON object. Missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable a safeguard outright.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.save_debounce_ms == 0 {
            return Err(ConfigError::Invalid("saveDebounceMs must be > 0"));
        }
        if self.processed_versions_cap == 0 {
            return Err(ConfigError::Invalid("processedVersionsCap must be > 0"));
        }
        if self.pending_max_age_ms == 0 {
            return Err(ConfigError::Invalid("pendingMaxAgeMs must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid config JSON: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.save_debounce_ms, 300);
        assert_eq!(config.pending_max_age_ms, 300_000);
        assert_eq!(config.processed_versions_cap, 50);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = SyncConfig::from_json(r#"{"saveDebounceMs": 500}"#).unwrap();
        assert_eq!(config.save_debounce_ms, 500);
        assert_eq!(config.edit_decay_ms, 3_000);
        assert_eq!(config.storage_key_prefix, "pending_save_");
    }

    #[test]
    fn test_rejects_zero_cap() {
        let err = SyncConfig::from_json(r#"{"processedVersionsCap": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SyncConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
