//! Debounced, two-phase saving.
//!
//! Every local change is written to the pending save log right away and a
//! remote save is scheduled `debounce_ms` later; a newer change replaces the
//! scheduled payload and restarts the wait. When the save runs, the log is
//! written first and cleared only after the remote store confirms. Until then
//! the log record is the authoritative copy of the edit.

use tracing::{debug, info, warn};

use crate::canonical::{CanonicalDoc, ContentHash};
use crate::pending::PendingSaveLog;
use crate::remote::{DocKey, RemoteError, RemoteStore, SaveOptions};
use crate::storage::LocalStore;

/// A save waiting for its debounce to elapse.
#[derive(Debug, Clone)]
pub struct ScheduledSave {
    pub content: CanonicalDoc,
    /// Remote version the edit was based on.
    pub base_version: u64,
    pub due_at_ms: u64,
}

/// Result of a confirmed remote save.
#[derive(Debug, Clone)]
pub struct SavedDocument {
    pub content: CanonicalDoc,
    pub hash: ContentHash,
    /// Version reported by the remote store after the save.
    pub version: u64,
}

pub struct SaveCoordinator<S> {
    log: PendingSaveLog<S>,
    storage_key: String,
    debounce_ms: u64,
    scheduled: Option<ScheduledSave>,
    last_saved_content: Option<CanonicalDoc>,
}

impl<S: LocalStore> SaveCoordinator<S> {
    pub fn new(log: PendingSaveLog<S>, storage_key: String, debounce_ms: u64) -> Self {
        Self {
            log,
            storage_key,
            debounce_ms,
            scheduled: None,
            last_saved_content: None,
        }
    }

    pub fn log(&self) -> &PendingSaveLog<S> {
        &self.log
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// Record a local change and (re)start the debounce.
    pub fn schedule(&mut self, content: CanonicalDoc, base_version: u64, now_ms: u64) {
        self.log
            .write(&self.storage_key, &content, base_version, now_ms);
        let due_at_ms = now_ms + self.debounce_ms;
        if self.scheduled.is_some() {
            debug!(key = %self.storage_key, due_at_ms, "Rescheduled save");
        }
        self.scheduled = Some(ScheduledSave {
            content,
            base_version,
            due_at_ms,
        });
    }

    pub fn scheduled(&self) -> Option<&ScheduledSave> {
        self.scheduled.as_ref()
    }

    pub fn has_scheduled(&self) -> bool {
        self.scheduled.is_some()
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        self.scheduled
            .as_ref()
            .is_some_and(|save| now_ms >= save.due_at_ms)
    }

    /// Drop the scheduled save. The log record stays.
    pub fn cancel(&mut self) {
        self.scheduled = None;
    }

    /// Drop the scheduled save and its log record.
    pub fn discard(&mut self) {
        self.scheduled = None;
        self.log.clear(&self.storage_key);
    }

    /// Write the log record without scheduling anything.
    pub fn write_log(&self, content: &CanonicalDoc, base_version: u64, now_ms: u64) -> bool {
        self.log
            .write(&self.storage_key, content, base_version, now_ms)
    }

    pub fn last_saved_content(&self) -> Option<&CanonicalDoc> {
        self.last_saved_content.as_ref()
    }

    pub fn set_last_saved_content(&mut self, content: Option<CanonicalDoc>) {
        self.last_saved_content = content;
    }

    /// Run the scheduled save now, regardless of its due time.
    ///
    /// `Ok(None)` if nothing was scheduled. On failure the scheduled payload
    /// is gone but its log record remains for recovery.
    pub async fn flush<R: RemoteStore + ?Sized>(
        &mut self,
        remote: &R,
        key: &DocKey,
        now_ms: u64,
    ) -> Result<Option<SavedDocument>, RemoteError> {
        let Some(save) = self.scheduled.take() else {
            return Ok(None);
        };
        self.save(remote, key, save.content, save.base_version, now_ms)
            .await
            .map(Some)
    }

    /// Two-phase save: log, then remote, then clear the log.
    pub async fn save<R: RemoteStore + ?Sized>(
        &mut self,
        remote: &R,
        key: &DocKey,
        content: CanonicalDoc,
        base_version: u64,
        now_ms: u64,
    ) -> Result<SavedDocument, RemoteError> {
        self.log
            .write(&self.storage_key, &content, base_version, now_ms);

        let result = remote
            .save_document(
                key,
                &content,
                false,
                SaveOptions {
                    skip_batching: true,
                },
            )
            .await;

        match result {
            Ok(()) => {
                let version = remote.document_version(key);
                self.log.clear(&self.storage_key);
                let hash = content.hash();
                info!(note_id = %key.note_id, panel_id = %key.panel_id, version, hash = %hash, "Saved document");
                self.last_saved_content = Some(content.clone());
                Ok(SavedDocument {
                    content,
                    hash,
                    version,
                })
            }
            Err(e) => {
                warn!(note_id = %key.note_id, panel_id = %key.panel_id, error = %e, "Save failed, keeping pending record");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemote;
    use crate::storage::InMemoryStore;
    use std::sync::Arc;

    const KEY: &str = "pending_save_n_p";

    fn doc_key() -> DocKey {
        DocKey::new("n", "p")
    }

    fn coordinator(store: Arc<InMemoryStore>) -> SaveCoordinator<Arc<InMemoryStore>> {
        SaveCoordinator::new(
            PendingSaveLog::new(store, 300_000),
            KEY.to_string(),
            300,
        )
    }

    #[test]
    fn test_schedule_writes_log_and_debounces() {
        let store = Arc::new(InMemoryStore::new());
        let mut coordinator = coordinator(Arc::clone(&store));

        coordinator.schedule(CanonicalDoc::from_paragraphs(&["H"]), 0, 1_000);
        assert!(store.get_item(KEY).unwrap().is_some());
        assert!(!coordinator.is_due(1_299));
        assert!(coordinator.is_due(1_300));

        // A newer change restarts the wait and replaces the payload
        coordinator.schedule(CanonicalDoc::from_paragraphs(&["Hello"]), 0, 1_200);
        assert!(!coordinator.is_due(1_300));
        assert!(coordinator.is_due(1_500));
        assert_eq!(
            coordinator.scheduled().unwrap().content.plain_text(),
            "Hello"
        );
    }

    #[tokio::test]
    async fn test_flush_saves_once_and_clears_log() {
        let store = Arc::new(InMemoryStore::new());
        let mut coordinator = coordinator(Arc::clone(&store));
        let remote = InMemoryRemote::new();

        coordinator.schedule(CanonicalDoc::from_paragraphs(&["Hello"]), 0, 0);
        let saved = coordinator
            .flush(&remote, &doc_key(), 300)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(saved.version, 1);
        assert_eq!(saved.hash, CanonicalDoc::from_paragraphs(&["Hello"]).hash());
        assert_eq!(remote.save_count(), 1);
        assert!(remote.saves()[0].options.skip_batching);
        assert!(!remote.saves()[0].is_batched);
        assert!(store.get_item(KEY).unwrap().is_none());
        assert!(!coordinator.has_scheduled());
        assert_eq!(
            coordinator.last_saved_content().map(|d| d.plain_text()),
            Some("Hello".to_string())
        );

        // Nothing left to flush
        assert!(coordinator.flush(&remote, &doc_key(), 400).await.unwrap().is_none());
        assert_eq!(remote.save_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_log_record() {
        let store = Arc::new(InMemoryStore::new());
        let mut coordinator = coordinator(Arc::clone(&store));
        let remote = InMemoryRemote::new();
        remote.fail_next_save("network down");

        coordinator.schedule(CanonicalDoc::from_paragraphs(&["draft"]), 0, 0);
        let err = coordinator.flush(&remote, &doc_key(), 300).await.unwrap_err();

        assert!(err.to_string().contains("network down"));
        let record = coordinator.log().read(KEY, 400).unwrap();
        assert_eq!(record.content.plain_text(), "draft");
        // No background retry
        assert!(!coordinator.has_scheduled());
    }

    #[test]
    fn test_discard_clears_schedule_and_log() {
        let store = Arc::new(InMemoryStore::new());
        let mut coordinator = coordinator(Arc::clone(&store));
        coordinator.schedule(CanonicalDoc::from_paragraphs(&["x"]), 0, 0);

        coordinator.discard();
        assert!(!coordinator.has_scheduled());
        assert!(store.get_item(KEY).unwrap().is_none());
    }
}
