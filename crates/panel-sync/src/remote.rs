//! Remote document store abstraction.
//!
//! The remote store owns document versions. A client loads a document into its
//! local cache, reads it from there, saves through it, and hears about other
//! writers through `RemoteEvent`s.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, with hooks to simulate other writers
//! - `JsRemoteBridge` (in panel-sync-wasm) - Calls into the host's store via JS callbacks
//!
//! Uses `target_arch = "wasm32"` for conditional compilation, like the other
//! platform-split traits in this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use crate::canonical::{CanonicalDoc, RawContent};
use crate::events::{EventBus, EventCallback, RemoteEvent, SharedEventBus, Subscription};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Load failed: {0}")]
    Load(String),

    #[error("Save failed: {0}")]
    Save(String),

    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Bridge error: {0}")]
    Bridge(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Address of one document: a panel within a note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocKey {
    pub note_id: String,
    pub panel_id: String,
}

impl DocKey {
    pub fn new(note_id: impl Into<String>, panel_id: impl Into<String>) -> Self {
        Self {
            note_id: note_id.into(),
            panel_id: panel_id.into(),
        }
    }

    /// Key of this document's pending save record.
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}{}_{}", prefix, self.note_id, self.panel_id)
    }

    /// Dedup key for one remote version of this document.
    pub fn version_key(&self, version: u64) -> String {
        format!("{}-{}", self.panel_id, version)
    }

    pub fn matches(&self, event: &RemoteEvent) -> bool {
        event.is_for(&self.note_id, &self.panel_id)
    }
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.note_id, self.panel_id)
    }
}

/// Per-call save options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveOptions {
    /// Send now instead of joining the store's own write batch.
    pub skip_batching: bool,
}

/// Remote document store.
///
/// On native platforms, implementations must be `Send + Sync` for use across threads.
/// On WASM (wasm32), these bounds are relaxed since WASM is single-threaded.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(not(target_arch = "wasm32"))]
pub trait RemoteStore: Send + Sync {
    /// Fetch the document from the server into the local cache.
    async fn load_document(&self, key: &DocKey) -> Result<()>;

    /// Cached content, `None` if the document has never been saved.
    fn get_document(&self, key: &DocKey) -> Option<RawContent>;

    /// Cached version, 0 for a document that does not exist yet.
    fn document_version(&self, key: &DocKey) -> u64;

    /// Persist `content`. On success the cached version is the saved version.
    async fn save_document(
        &self,
        key: &DocKey,
        content: &CanonicalDoc,
        is_batched: bool,
        options: SaveOptions,
    ) -> Result<()>;

    /// Ask the server for newer versions. Newer content arrives as a
    /// `RemoteUpdate` event and in the cache.
    async fn check_for_remote_updates(&self, key: &DocKey) -> Result<()>;

    /// Receive conflict and remote-update events until the handle is dropped.
    fn subscribe(&self, callback: EventCallback) -> Subscription;
}

/// Remote document store (WASM version without Send + Sync).
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg(target_arch = "wasm32")]
pub trait RemoteStore {
    /// Fetch the document from the server into the local cache.
    async fn load_document(&self, key: &DocKey) -> Result<()>;

    /// Cached content, `None` if the document has never been saved.
    fn get_document(&self, key: &DocKey) -> Option<RawContent>;

    /// Cached version, 0 for a document that does not exist yet.
    fn document_version(&self, key: &DocKey) -> u64;

    /// Persist `content`. On success the cached version is the saved version.
    async fn save_document(
        &self,
        key: &DocKey,
        content: &CanonicalDoc,
        is_batched: bool,
        options: SaveOptions,
    ) -> Result<()>;

    /// Ask the server for newer versions. Newer content arrives as a
    /// `RemoteUpdate` event and in the cache.
    async fn check_for_remote_updates(&self, key: &DocKey) -> Result<()>;

    /// Receive conflict and remote-update events until the handle is dropped.
    fn subscribe(&self, callback: EventCallback) -> Subscription;
}

#[derive(Debug, Clone)]
struct StoredDoc {
    content: RawContent,
    version: u64,
}

/// A recorded `save_document` call.
#[derive(Debug, Clone)]
pub struct SaveCall {
    pub key: DocKey,
    pub content: CanonicalDoc,
    pub is_batched: bool,
    pub options: SaveOptions,
}

/// In-memory remote store for testing.
///
/// Keeps a server copy and a client cache per document, so another writer can
/// be simulated with `write_remote` and picked up by `check_for_remote_updates`.
pub struct InMemoryRemote {
    server: RwLock<HashMap<DocKey, StoredDoc>>,
    cache: RwLock<HashMap<DocKey, StoredDoc>>,
    saves: Mutex<Vec<SaveCall>>,
    fail_next_save: Mutex<Option<String>>,
    fail_next_fetch: Mutex<Option<String>>,
    loads: Mutex<usize>,
    bus: SharedEventBus,
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            server: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            saves: Mutex::new(Vec::new()),
            fail_next_save: Mutex::new(None),
            fail_next_fetch: Mutex::new(None),
            loads: Mutex::new(0),
            bus: SharedEventBus::new(EventBus::new()),
        }
    }

    /// Seed the server with a document at `version`.
    pub fn insert(&self, key: &DocKey, content: RawContent, version: u64) {
        let mut server = self.server.write().unwrap_or_else(|e| e.into_inner());
        server.insert(key.clone(), StoredDoc { content, version });
    }

    /// Simulate another client saving. Returns the new server version.
    pub fn write_remote(&self, key: &DocKey, content: RawContent) -> u64 {
        let mut server = self.server.write().unwrap_or_else(|e| e.into_inner());
        let version = server.get(key).map_or(0, |doc| doc.version) + 1;
        server.insert(key.clone(), StoredDoc { content, version });
        version
    }

    /// Current server version, which may be ahead of the client cache.
    pub fn server_version(&self, key: &DocKey) -> u64 {
        let server = self.server.read().unwrap_or_else(|e| e.into_inner());
        server.get(key).map_or(0, |doc| doc.version)
    }

    pub fn server_content(&self, key: &DocKey) -> Option<RawContent> {
        let server = self.server.read().unwrap_or_else(|e| e.into_inner());
        server.get(key).map(|doc| doc.content.clone())
    }

    /// Deliver an event to subscribers as if the store raised it.
    pub fn emit(&self, event: RemoteEvent) {
        self.bus.emit(event);
    }

    /// Raise a conflict carrying the current server copy of `key`.
    pub fn emit_conflict(&self, key: &DocKey) {
        if let Some(doc) = self.server_doc(key) {
            self.emit(RemoteEvent::conflict(
                &key.note_id,
                &key.panel_id,
                doc.version,
                doc.content,
            ));
        }
    }

    /// Make the next `save_document` call fail with `message`.
    pub fn fail_next_save(&self, message: impl Into<String>) {
        *self.fail_next_save.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Make the next `check_for_remote_updates` call fail with `message`.
    pub fn fail_next_fetch(&self, message: impl Into<String>) {
        *self.fail_next_fetch.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Every successful `save_document` call so far.
    pub fn saves(&self) -> Vec<SaveCall> {
        self.saves.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn load_count(&self) -> usize {
        *self.loads.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    fn server_doc(&self, key: &DocKey) -> Option<StoredDoc> {
        let server = self.server.read().unwrap_or_else(|e| e.into_inner());
        server.get(key).cloned()
    }

    fn cached_doc(&self, key: &DocKey) -> Option<StoredDoc> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        cache.get(key).cloned()
    }

    fn cache_doc(&self, key: &DocKey, doc: StoredDoc) {
        let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
        cache.insert(key.clone(), doc);
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteStore for InMemoryRemote {
    async fn load_document(&self, key: &DocKey) -> Result<()> {
        *self.loads.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        if let Some(doc) = self.server_doc(key) {
            self.cache_doc(key, doc);
        }
        Ok(())
    }

    fn get_document(&self, key: &DocKey) -> Option<RawContent> {
        self.cached_doc(key).map(|doc| doc.content)
    }

    fn document_version(&self, key: &DocKey) -> u64 {
        self.cached_doc(key).map_or(0, |doc| doc.version)
    }

    async fn save_document(
        &self,
        key: &DocKey,
        content: &CanonicalDoc,
        is_batched: bool,
        options: SaveOptions,
    ) -> Result<()> {
        let failure = self
            .fail_next_save
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(message) = failure {
            return Err(RemoteError::Save(message));
        }

        // Last save wins, whatever the client last saw
        let doc = StoredDoc {
            content: RawContent::from(content),
            version: self.server_version(key) + 1,
        };
        debug!(%key, version = doc.version, "In-memory save");
        {
            let mut server = self.server.write().unwrap_or_else(|e| e.into_inner());
            server.insert(key.clone(), doc.clone());
        }
        self.cache_doc(key, doc);

        self.saves
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SaveCall {
                key: key.clone(),
                content: content.clone(),
                is_batched,
                options,
            });
        Ok(())
    }

    async fn check_for_remote_updates(&self, key: &DocKey) -> Result<()> {
        let failure = self
            .fail_next_fetch
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(message) = failure {
            return Err(RemoteError::Fetch(message));
        }

        let Some(server) = self.server_doc(key) else {
            return Ok(());
        };
        let cached_version = self.cached_doc(key).map_or(0, |doc| doc.version);
        if server.version > cached_version {
            self.cache_doc(key, server.clone());
            self.emit(RemoteEvent::remote_update(
                &key.note_id,
                &key.panel_id,
                server.version,
                server.content,
            ));
        }
        Ok(())
    }

    fn subscribe(&self, callback: EventCallback) -> Subscription {
        self.bus.subscribe(callback)
    }
}

// Share one store between several sessions in tests
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn load_document(&self, key: &DocKey) -> Result<()> {
        (**self).load_document(key).await
    }

    fn get_document(&self, key: &DocKey) -> Option<RawContent> {
        (**self).get_document(key)
    }

    fn document_version(&self, key: &DocKey) -> u64 {
        (**self).document_version(key)
    }

    async fn save_document(
        &self,
        key: &DocKey,
        content: &CanonicalDoc,
        is_batched: bool,
        options: SaveOptions,
    ) -> Result<()> {
        (**self)
            .save_document(key, content, is_batched, options)
            .await
    }

    async fn check_for_remote_updates(&self, key: &DocKey) -> Result<()> {
        (**self).check_for_remote_updates(key).await
    }

    fn subscribe(&self, callback: EventCallback) -> Subscription {
        (**self).subscribe(callback)
    }
}
