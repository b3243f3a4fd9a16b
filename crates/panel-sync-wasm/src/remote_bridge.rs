//! JavaScript remote store bridge for WASM.
//!
//! Implements `RemoteStore` by calling callbacks provided by the host's
//! document store. Loads, saves and update checks are async (Promises); the
//! cache reads are synchronous. The host forwards its store's conflict and
//! remote-update events through `emitConflict` / `emitRemoteUpdate`.

use std::rc::Rc;

use async_trait::async_trait;
use panel_sync::remote;
use panel_sync::{
    CanonicalDoc, DocKey, EventBus, EventCallback, RawContent, RemoteError, RemoteEvent,
    RemoteStore, SaveOptions, SharedEventBus, Subscription,
};
use tracing::warn;
use wasm_bindgen::prelude::*;

use crate::interop::{call_js_async, call_js_sync, js_error_message, to_js};

/// JavaScript remote store bridge.
///
/// # Example (TypeScript side)
///
/// ```typescript
/// const remote = new JsRemoteBridge(
///   (noteId, panelId) => store.loadDocument(noteId, panelId),
///   (noteId, panelId) => store.getDocument(noteId, panelId),
///   (noteId, panelId) => store.getDocumentVersion(noteId, panelId),
///   (noteId, panelId, content, isBatched, options) =>
///     store.saveDocument(noteId, panelId, content, isBatched, options),
///   (noteId, panelId) => store.checkForRemoteUpdates(noteId, panelId),
/// );
/// store.on("conflict", (e) => remote.emitConflict(e.noteId, e.panelId, e.version, e.content, e.reason));
/// store.on("remote-update", (e) => remote.emitRemoteUpdate(e.noteId, e.panelId, e.version, e.content, e.reason));
/// ```
#[wasm_bindgen]
#[derive(Clone)]
pub struct JsRemoteBridge {
    load_fn: js_sys::Function,
    get_fn: js_sys::Function,
    version_fn: js_sys::Function,
    save_fn: js_sys::Function,
    check_fn: js_sys::Function,
    bus: SharedEventBus,
}

#[wasm_bindgen]
impl JsRemoteBridge {
    /// Create a remote bridge. `load_fn`, `save_fn` and `check_fn` may
    /// return Promises; `get_fn` and `version_fn` must answer synchronously.
    #[wasm_bindgen(constructor)]
    pub fn new(
        load_fn: js_sys::Function,
        get_fn: js_sys::Function,
        version_fn: js_sys::Function,
        save_fn: js_sys::Function,
        check_fn: js_sys::Function,
    ) -> Self {
        Self {
            load_fn,
            get_fn,
            version_fn,
            save_fn,
            check_fn,
            bus: Rc::new(EventBus::new()),
        }
    }

    /// Forward a conflict event from the host store.
    #[wasm_bindgen(js_name = emitConflict)]
    pub fn emit_conflict(
        &self,
        note_id: String,
        panel_id: String,
        version: f64,
        content: JsValue,
        reason: Option<String>,
    ) -> Result<(), JsError> {
        let version = version_from_js(version)?;
        let content = raw_content_from_js(content)
            .ok_or_else(|| JsError::new("Conflict event without content"))?;
        let event = RemoteEvent::conflict(note_id, panel_id, version, content);
        self.emit_with_reason(event, reason);
        Ok(())
    }

    /// Forward a remote-update event from the host store.
    #[wasm_bindgen(js_name = emitRemoteUpdate)]
    pub fn emit_remote_update(
        &self,
        note_id: String,
        panel_id: String,
        version: f64,
        content: JsValue,
        reason: Option<String>,
    ) -> Result<(), JsError> {
        let version = version_from_js(version)?;
        let content = raw_content_from_js(content)
            .ok_or_else(|| JsError::new("Remote update event without content"))?;
        let event = RemoteEvent::remote_update(note_id, panel_id, version, content);
        self.emit_with_reason(event, reason);
        Ok(())
    }

    #[wasm_bindgen(js_name = subscriberCount)]
    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count()
    }
}

impl JsRemoteBridge {
    fn emit_with_reason(&self, event: RemoteEvent, reason: Option<String>) {
        let event = match reason {
            Some(reason) => event.with_reason(reason),
            None => event,
        };
        self.bus.emit(event);
    }
}

/// JS numbers are doubles. Versions must be non-negative integers that a
/// double represents exactly.
fn version_from_js(version: f64) -> Result<u64, JsError> {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if !version.is_finite() || version < 0.0 || version.fract() != 0.0 || version > MAX_SAFE_INTEGER {
        return Err(JsError::new(&format!("Invalid document version: {version}")));
    }
    Ok(version as u64)
}

/// Strings are markup, objects are structured trees, null/undefined is absent.
fn raw_content_from_js(value: JsValue) -> Option<RawContent> {
    if value.is_null() || value.is_undefined() {
        return None;
    }
    if let Some(markup) = value.as_string() {
        return Some(RawContent::Markup(markup));
    }
    match serde_wasm_bindgen::from_value::<serde_json::Value>(value) {
        Ok(tree) => Some(RawContent::Structured(tree)),
        Err(e) => {
            warn!(error = %e, "Unreadable document content from host");
            None
        }
    }
}

fn key_args(key: &DocKey) -> [JsValue; 2] {
    [key.note_id.as_str().into(), key.panel_id.as_str().into()]
}

#[async_trait(?Send)]
impl RemoteStore for JsRemoteBridge {
    async fn load_document(&self, key: &DocKey) -> remote::Result<()> {
        call_js_async(&self.load_fn, &key_args(key))
            .await
            .map_err(|e| RemoteError::Load(js_error_message(&e)))?;
        Ok(())
    }

    fn get_document(&self, key: &DocKey) -> Option<RawContent> {
        match call_js_sync(&self.get_fn, &key_args(key)) {
            Ok(value) => raw_content_from_js(value),
            Err(e) => {
                warn!(note_id = %key.note_id, panel_id = %key.panel_id, error = %js_error_message(&e), "getDocument threw");
                None
            }
        }
    }

    fn document_version(&self, key: &DocKey) -> u64 {
        match call_js_sync(&self.version_fn, &key_args(key)) {
            Ok(value) => value.as_f64().map(|v| v.max(0.0) as u64).unwrap_or(0),
            Err(e) => {
                warn!(note_id = %key.note_id, panel_id = %key.panel_id, error = %js_error_message(&e), "getDocumentVersion threw");
                0
            }
        }
    }

    async fn save_document(
        &self,
        key: &DocKey,
        content: &CanonicalDoc,
        is_batched: bool,
        options: SaveOptions,
    ) -> remote::Result<()> {
        let js_content =
            to_js(content).map_err(|e| RemoteError::Bridge(format!("Failed to convert content: {}", e)))?;
        let js_options =
            to_js(&options).map_err(|e| RemoteError::Bridge(format!("Failed to convert options: {}", e)))?;
        let [note_id, panel_id] = key_args(key);

        call_js_async(
            &self.save_fn,
            &[note_id, panel_id, js_content, is_batched.into(), js_options],
        )
        .await
        .map_err(|e| RemoteError::Save(js_error_message(&e)))?;
        Ok(())
    }

    async fn check_for_remote_updates(&self, key: &DocKey) -> remote::Result<()> {
        call_js_async(&self.check_fn, &key_args(key))
            .await
            .map_err(|e| RemoteError::Fetch(js_error_message(&e)))?;
        Ok(())
    }

    fn subscribe(&self, callback: EventCallback) -> Subscription {
        self.bus.subscribe(callback)
    }
}
