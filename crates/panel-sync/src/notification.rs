//! What the UI shows about a document's sync state.

use serde::Serialize;

/// Banner state for one document. `None` on the session means hidden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncNotification {
    pub message: String,
    /// Remote version waiting for a decision, if any.
    pub version: Option<u64>,
    /// Whether Save & Sync / Discard & Sync apply.
    pub has_remote_update: bool,
    /// Last remote save failure, verbatim.
    pub save_error: Option<String>,
}

impl SyncNotification {
    pub fn remote_update(version: u64) -> Self {
        Self {
            message: "This panel was changed elsewhere while you were editing.".to_string(),
            version: Some(version),
            has_remote_update: true,
            save_error: None,
        }
    }

    pub fn save_failed(error: impl Into<String>) -> Self {
        Self {
            message: "Your changes could not be saved.".to_string(),
            version: None,
            has_remote_update: false,
            save_error: Some(error.into()),
        }
    }

    /// Attach a save error, keeping any pending remote update visible.
    pub fn with_save_error(mut self, error: impl Into<String>) -> Self {
        self.save_error = Some(error.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(SyncNotification::remote_update(9)).unwrap();
        assert_eq!(json["version"], 9);
        assert_eq!(json["hasRemoteUpdate"], true);
        assert!(json["saveError"].is_null());
    }

    #[test]
    fn test_save_error_kept_with_update() {
        let notification = SyncNotification::remote_update(2).with_save_error("offline");
        assert!(notification.has_remote_update);
        assert_eq!(notification.save_error.as_deref(), Some("offline"));
    }
}
