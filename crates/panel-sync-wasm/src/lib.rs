//! WASM bindings for panel-sync.
//!
//! Provides the bridge between the TypeScript canvas UI and the Rust sync core.
//!
//! # Architecture
//!
//! The host creates three bridges from callbacks: the document store
//! (`JsRemoteBridge`), the editor (`JsEditorBridge`) and `localStorage`
//! (`JsLocalStorage`). A `WasmSwitcher` opens one `WasmSession` per
//! `(noteId, panelId)` on top of them.
//!
//! ```text
//! TypeScript                    WASM (Rust)
//! ──────────                    ───────────
//! document store ──callbacks──> JsRemoteBridge  ─┐
//! editor ─────────callbacks──> JsEditorBridge  ─┼─> DocumentSession
//! localStorage ───callbacks──> JsLocalStorage  ─┘          │
//!                                                           ▼
//!                                                     WasmSession (exposed to JS)
//! ```
//!
//! The host calls `onContentChanged` for every editor update, `tick` on a
//! short interval, and `onPageHide` from `visibilitychange` / `beforeunload`.
//!
//! **Note**: This crate only compiles for `wasm32` targets. When building for native
//! targets (e.g., during `cargo check --workspace`), this crate provides no exports.

#[cfg(target_arch = "wasm32")]
mod editor_bridge;
#[cfg(target_arch = "wasm32")]
mod interop;
#[cfg(target_arch = "wasm32")]
mod remote_bridge;
#[cfg(target_arch = "wasm32")]
mod storage_bridge;

#[cfg(target_arch = "wasm32")]
pub use editor_bridge::JsEditorBridge;
#[cfg(target_arch = "wasm32")]
pub use remote_bridge::JsRemoteBridge;
#[cfg(target_arch = "wasm32")]
pub use storage_bridge::JsLocalStorage;

#[cfg(target_arch = "wasm32")]
mod wasm_impl {
    use super::*;
    use futures::lock::{Mutex, MutexGuard};
    use panel_sync::{
        CanonicalDoc, Clock, DocKey, DocumentSession, DocumentSwitcher, EditorSurface,
        PendingSaveLog, ResolverState, SessionError, SyncConfig, SyncNotification, SystemClock,
    };
    use serde::Serialize;
    use std::cell::{Cell, RefCell};
    use tracing_subscriber::layer::SubscriberExt;
    use wasm_bindgen::prelude::*;

    // ========== Callback Logger Layer ==========

    thread_local! {
        static LOGGER_CALLBACK: RefCell<Option<js_sys::Function>> = const { RefCell::new(None) };
    }

    /// Forwards each tracing event to the host's logger callback as
    /// `{ level, target, message, fields, timestamp }`.
    struct JsCallbackLayer;

    impl<S> tracing_subscriber::Layer<S> for JsCallbackLayer
    where
        S: tracing::Subscriber,
    {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            LOGGER_CALLBACK.with(|cb| {
                let Some(callback) = cb.borrow().clone() else {
                    return;
                };
                let metadata = event.metadata();

                let mut visitor = FieldVisitor::default();
                event.record(&mut visitor);

                let timestamp = SystemClock.now_ms() as f64;

                let js_event = js_sys::Object::new();
                let _ = js_sys::Reflect::set(&js_event, &"level".into(), &metadata.level().as_str().into());
                let _ = js_sys::Reflect::set(&js_event, &"target".into(), &metadata.target().into());
                let _ = js_sys::Reflect::set(&js_event, &"message".into(), &visitor.message.into());
                let _ = js_sys::Reflect::set(&js_event, &"fields".into(), &visitor.fields.into());
                let _ = js_sys::Reflect::set(&js_event, &"timestamp".into(), &timestamp.into());

                let _ = callback.call1(&JsValue::NULL, &js_event);
            });
        }
    }

    /// Splits an event into its message and its structured fields.
    struct FieldVisitor {
        message: String,
        fields: js_sys::Object,
    }

    impl Default for FieldVisitor {
        fn default() -> Self {
            Self {
                message: String::new(),
                fields: js_sys::Object::new(),
            }
        }
    }

    impl FieldVisitor {
        fn set(&self, name: &str, value: JsValue) {
            let _ = js_sys::Reflect::set(&self.fields, &name.into(), &value);
        }
    }

    impl tracing::field::Visit for FieldVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            if field.name() == "message" {
                self.message = format!("{:?}", value);
            } else {
                self.set(field.name(), format!("{:?}", value).into());
            }
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            if field.name() == "message" {
                self.message = value.to_string();
            } else {
                self.set(field.name(), value.into());
            }
        }

        fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
            self.set(field.name(), (value as f64).into());
        }

        fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
            self.set(field.name(), value.into());
        }
    }

    /// Initialize the WASM module (panic hook and tracing).
    ///
    /// - `init()` - console-only logging
    /// - `init({ logger: (event) => {...} })` - callback + console logging
    #[wasm_bindgen]
    pub fn init(config: Option<js_sys::Object>) {
        console_error_panic_hook::set_once();

        let callback = config
            .as_ref()
            .and_then(|cfg| js_sys::Reflect::get(cfg, &"logger".into()).ok())
            .and_then(|v| v.dyn_into::<js_sys::Function>().ok());

        let console_config = tracing_wasm::WASMLayerConfigBuilder::new()
            .set_max_level(tracing::Level::DEBUG)
            .build();

        match callback {
            Some(cb) => {
                LOGGER_CALLBACK.with(|cell| {
                    *cell.borrow_mut() = Some(cb);
                });
                let subscriber = tracing_subscriber::registry()
                    .with(JsCallbackLayer)
                    .with(tracing_wasm::WASMLayer::new(console_config));
                tracing::subscriber::set_global_default(subscriber).ok();
            }
            None => tracing_wasm::set_as_global_default_with_config(console_config),
        }

        tracing::debug!(version = env!("CARGO_PKG_VERSION"), "panel-sync-wasm initialized");
    }

    /// Get version string
    #[wasm_bindgen]
    pub fn version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn session_err(e: SessionError) -> JsError {
        JsError::new(&e.to_string())
    }

    fn parse_config(config: JsValue) -> Result<SyncConfig, JsError> {
        if config.is_null() || config.is_undefined() {
            return Ok(SyncConfig::default());
        }
        serde_wasm_bindgen::from_value(config)
            .map_err(|e| JsError::new(&format!("Invalid config: {}", e)))
    }

    // ========== Document Switching ==========

    /// Opens document sessions. Opening a document invalidates every open
    /// still in flight from the same switcher, so a slow load can never
    /// overwrite the editor after the user moved on.
    #[wasm_bindgen]
    #[derive(Default)]
    pub struct WasmSwitcher {
        inner: DocumentSwitcher,
    }

    #[wasm_bindgen]
    impl WasmSwitcher {
        #[wasm_bindgen(constructor)]
        pub fn new() -> Self {
            Self::default()
        }

        /// Load a document into the editor. Resolves to a `WasmSession`.
        ///
        /// `config` is an optional partial `SyncConfig` object. Rejects with a
        /// "superseded" error if another `open` started before this one finished.
        pub fn open(
            &self,
            note_id: String,
            panel_id: String,
            remote: &JsRemoteBridge,
            editor: &JsEditorBridge,
            storage: &JsLocalStorage,
            config: JsValue,
        ) -> js_sys::Promise {
            let ticket = self.inner.begin();
            let remote = remote.clone();
            let editor = editor.clone();
            let storage = storage.clone();

            wasm_bindgen_futures::future_to_promise(async move {
                let config = parse_config(config)?;
                let key = DocKey::new(note_id, panel_id);
                let storage_key = key.storage_key(&config.storage_key_prefix);
                let backstop = PendingSaveLog::new(storage.clone(), config.pending_max_age_ms);

                let session = DocumentSession::open(
                    key,
                    remote,
                    editor.clone(),
                    storage,
                    SystemClock,
                    config,
                    &ticket,
                )
                .await
                .map_err(session_err)?;

                Ok(WasmSession::new(session, editor, backstop, storage_key).into())
            })
        }
    }

    // ========== Session ==========

    type Session = DocumentSession<JsRemoteBridge, JsEditorBridge, JsLocalStorage, SystemClock>;

    /// State readable synchronously while an async operation holds the session.
    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Snapshot {
        state: ResolverState,
        last_applied_version: u64,
        dirty: bool,
        next_save_due_ms: Option<u64>,
        notification: Option<SyncNotification>,
    }

    impl Snapshot {
        fn of(session: &Session) -> Self {
            Self {
                state: session.state(),
                last_applied_version: session.last_applied_version(),
                dirty: session.is_dirty(),
                next_save_due_ms: session.next_save_due_ms(),
                notification: session.notification().cloned(),
            }
        }
    }

    /// One open document, exposed to TypeScript.
    ///
    /// Async methods run one at a time. Editor change notifications that
    /// arrive while one is in flight are queued with their timestamps and
    /// replayed as soon as the session is free again.
    #[wasm_bindgen]
    pub struct WasmSession {
        inner: Mutex<Option<Session>>,
        missed_changes: RefCell<Vec<u64>>,
        snapshot: RefCell<Snapshot>,
        disposed: Cell<bool>,
        editor: JsEditorBridge,
        backstop: PendingSaveLog<JsLocalStorage>,
        storage_key: String,
    }

    impl WasmSession {
        fn new(
            session: Session,
            editor: JsEditorBridge,
            backstop: PendingSaveLog<JsLocalStorage>,
            storage_key: String,
        ) -> Self {
            Self {
                snapshot: RefCell::new(Snapshot::of(&session)),
                inner: Mutex::new(Some(session)),
                missed_changes: RefCell::new(Vec::new()),
                disposed: Cell::new(false),
                editor,
                backstop,
                storage_key,
            }
        }

        fn take_missed(&self) -> Vec<u64> {
            std::mem::take(&mut *self.missed_changes.borrow_mut())
        }

        /// The open session with queued change notifications applied.
        fn ready<'a>(&self, guard: &'a mut Option<Session>) -> Result<&'a mut Session, JsError> {
            let session = guard
                .as_mut()
                .ok_or_else(|| JsError::new("Session is closed"))?;
            for at_ms in self.take_missed() {
                session.content_changed_at(at_ms);
            }
            Ok(session)
        }

        /// Replay changes that arrived during the operation, refresh the
        /// snapshot, and honor a `dispose` that came in meanwhile.
        fn settle(&self, guard: &mut MutexGuard<'_, Option<Session>>) {
            if let Some(session) = guard.as_mut() {
                for at_ms in self.take_missed() {
                    session.content_changed_at(at_ms);
                }
                *self.snapshot.borrow_mut() = Snapshot::of(session);
            }
            if self.disposed.get() {
                guard.take();
            }
        }
    }

    #[wasm_bindgen]
    impl WasmSession {
        /// Call on every editor update.
        #[wasm_bindgen(js_name = onContentChanged)]
        pub fn on_content_changed(&self) {
            match self.inner.try_lock() {
                Some(mut guard) => {
                    if let Ok(session) = self.ready(&mut guard) {
                        session.on_content_changed();
                    }
                    self.settle(&mut guard);
                }
                None => self.missed_changes.borrow_mut().push(SystemClock.now_ms()),
            }
        }

        /// Handle queued remote events, re-check deferred updates, and run a
        /// due save. Call every 100-250 ms.
        pub async fn tick(&self) -> Result<(), JsError> {
            let mut guard = self.inner.lock().await;
            let result = match self.ready(&mut guard) {
                Ok(session) => session.tick().await.map_err(session_err),
                Err(e) => Err(e),
            };
            self.settle(&mut guard);
            result
        }

        /// Send the scheduled save now.
        pub async fn flush(&self) -> Result<(), JsError> {
            let mut guard = self.inner.lock().await;
            let result = match self.ready(&mut guard) {
                Ok(session) => session.flush().await.map_err(session_err),
                Err(e) => Err(e),
            };
            self.settle(&mut guard);
            result
        }

        /// "Save & Sync": keep local changes.
        #[wasm_bindgen(js_name = saveAndSync)]
        pub async fn save_and_sync(&self) -> Result<(), JsError> {
            let mut guard = self.inner.lock().await;
            let result = match self.ready(&mut guard) {
                Ok(session) => session.save_and_sync().await.map_err(session_err),
                Err(e) => Err(e),
            };
            self.settle(&mut guard);
            result
        }

        /// "Discard & Sync": take the remote version.
        #[wasm_bindgen(js_name = discardAndSync)]
        pub async fn discard_and_sync(&self) -> Result<(), JsError> {
            let mut guard = self.inner.lock().await;
            let result = match self.ready(&mut guard) {
                Ok(session) => session.discard_and_sync().await.map_err(session_err),
                Err(e) => Err(e),
            };
            self.settle(&mut guard);
            result
        }

        /// Hide the notification; the update is applied after the next clean save.
        pub async fn dismiss(&self) -> Result<(), JsError> {
            let mut guard = self.inner.lock().await;
            let result = self.ready(&mut guard).map(|session| session.dismiss());
            self.settle(&mut guard);
            result
        }

        /// Synchronous backstop for `visibilitychange` / `beforeunload`.
        ///
        /// Returns whether a pending save record was written.
        #[wasm_bindgen(js_name = onPageHide)]
        pub fn on_page_hide(&self) -> bool {
            if let Some(mut guard) = self.inner.try_lock() {
                let written = self
                    .ready(&mut guard)
                    .map(|session| session.on_page_hide())
                    .unwrap_or(false);
                self.settle(&mut guard);
                return written;
            }

            // A save is in flight and has its own record. Only edits made
            // since then still need one.
            if self.missed_changes.borrow().is_empty() {
                return false;
            }
            let Some(live) = CanonicalDoc::from_node(self.editor.get_content(), self.editor.schema())
            else {
                return false;
            };
            let version = self.snapshot.borrow().last_applied_version;
            self.backstop
                .write(&self.storage_key, &live, version, SystemClock.now_ms())
        }

        /// Current notification, or `null`.
        pub fn notification(&self) -> Result<JsValue, JsError> {
            serde_wasm_bindgen::to_value(&self.snapshot.borrow().notification)
                .map_err(|e| JsError::new(&e.to_string()))
        }

        /// `{ state, lastAppliedVersion, dirty, nextSaveDueMs, notification }`
        pub fn status(&self) -> Result<JsValue, JsError> {
            serde_wasm_bindgen::to_value(&*self.snapshot.borrow())
                .map_err(|e| JsError::new(&e.to_string()))
        }

        #[wasm_bindgen(js_name = isDirty)]
        pub fn is_dirty(&self) -> bool {
            self.snapshot.borrow().dirty
        }

        /// Flush any scheduled save and close the session.
        pub async fn close(&self) -> Result<(), JsError> {
            let mut guard = self.inner.lock().await;
            let Some(mut session) = guard.take() else {
                return Ok(());
            };
            for at_ms in self.take_missed() {
                session.content_changed_at(at_ms);
            }
            session.close().await.map_err(session_err)
        }

        /// Drop the session without saving. Safe to call multiple times.
        pub fn dispose(&self) {
            self.disposed.set(true);
            if let Some(mut guard) = self.inner.try_lock() {
                guard.take();
            }
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use wasm_impl::*;
