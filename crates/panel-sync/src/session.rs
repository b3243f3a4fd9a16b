//! One open document: the editor, its remote copy, and everything between.
//!
//! A `DocumentSession` owns one instance of each sync component for a single
//! `(note_id, panel_id)`. The host drives it:
//!
//! - `on_content_changed` for every editor change notification
//! - `tick` periodically (debounced saves, queued remote events, deferred updates)
//! - `save_and_sync` / `discard_and_sync` / `dismiss` from the notification UI
//! - `on_page_hide` when the page is being hidden or unloaded
//!
//! Remote events are queued by the subscription callback and handled on the
//! next `tick`, so a callback never re-enters the session.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::canonical::{CanonicalDoc, ContentHash, canonicalize};
use crate::clock::Clock;
use crate::config::{ConfigError, SyncConfig};
use crate::coordinator::{SaveCoordinator, SavedDocument};
use crate::editor::EditorSurface;
use crate::events::{RemoteEvent, Subscription};
use crate::notification::SyncNotification;
use crate::pending::PendingSaveLog;
use crate::remote::{DocKey, RemoteError, RemoteStore};
use crate::resolver::{ConflictResolver, Decision, RemoteUpdate, ResolverState};
use crate::storage::LocalStore;
use crate::tracker::EditTracker;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Load superseded by a newer document")]
    Superseded,

    #[error("Remote content could not be read")]
    Unreadable,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Hands out load tickets. Starting a new load invalidates every older ticket.
#[derive(Debug, Clone, Default)]
pub struct DocumentSwitcher {
    generation: Arc<AtomicU64>,
}

impl DocumentSwitcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> LoadTicket {
        let id = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        LoadTicket {
            generation: Arc::clone(&self.generation),
            id,
        }
    }
}

/// Proof that a load is still the latest one requested.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    generation: Arc<AtomicU64>,
    id: u64,
}

impl LoadTicket {
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.id
    }
}

type Inbox = Arc<Mutex<VecDeque<RemoteEvent>>>;

pub struct DocumentSession<R, E, S, C> {
    key: DocKey,
    config: SyncConfig,
    remote: R,
    editor: E,
    clock: C,
    tracker: EditTracker,
    coordinator: SaveCoordinator<S>,
    resolver: ConflictResolver,
    notification: Option<SyncNotification>,
    inbox: Inbox,
    applying: bool,
    _subscription: Subscription,
}

impl<R, E, S, C> DocumentSession<R, E, S, C>
where
    R: RemoteStore,
    E: EditorSurface,
    S: LocalStore,
    C: Clock,
{
    /// Load `key`, hydrate the editor, and recover any unsent edit.
    ///
    /// Fails with `SessionError::Superseded` if `ticket` went stale while the
    /// document was loading; nothing has been written to the editor then.
    pub async fn open(
        key: DocKey,
        remote: R,
        mut editor: E,
        store: S,
        clock: C,
        config: SyncConfig,
        ticket: &LoadTicket,
    ) -> Result<Self> {
        config.validate()?;

        remote.load_document(&key).await?;
        if !ticket.is_current() {
            debug!(note_id = %key.note_id, panel_id = %key.panel_id, "Discarding superseded load");
            return Err(SessionError::Superseded);
        }

        let version = remote.document_version(&key);
        let remote_doc = match remote.get_document(&key) {
            None => Some(CanonicalDoc::empty()),
            Some(raw) => canonicalize(&raw, editor.schema()),
        };

        let now = clock.now_ms();
        let storage_key = key.storage_key(&config.storage_key_prefix);
        let log = PendingSaveLog::new(store, config.pending_max_age_ms);
        let recovered = Self::recoverable_edit(&key, &log, &storage_key, remote_doc.as_ref(), version, now);

        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let subscription = {
            let inbox = Arc::clone(&inbox);
            let key = key.clone();
            remote.subscribe(Box::new(move |event: RemoteEvent| {
                if key.matches(&event) {
                    inbox
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push_back(event);
                }
            }))
        };

        let hydrate_with = recovered.clone().or_else(|| remote_doc.clone());
        if let Some(doc) = &hydrate_with {
            editor.set_content(doc, false);
        }

        let mut session = Self {
            tracker: EditTracker::new(config.edit_decay_ms),
            coordinator: SaveCoordinator::new(log, storage_key, config.save_debounce_ms),
            resolver: ConflictResolver::new(config.processed_versions_cap, config.conflict_grace_ms),
            key,
            config,
            remote,
            editor,
            clock,
            notification: None,
            inbox,
            applying: false,
            _subscription: subscription,
        };
        session.resolver.reset(version);

        match (recovered, remote_doc) {
            (Some(edit), remote_doc) => {
                // Remote content is the baseline; the restored edit is unsaved work
                session
                    .tracker
                    .set_last_saved_hash(remote_doc.as_ref().map(CanonicalDoc::hash));
                session.coordinator.set_last_saved_content(remote_doc);
                session.tracker.finish_hydration();
                session.tracker.mark_edited(now);
                session.resolver.note_edit();
                session.coordinator.schedule(edit, version, now);
            }
            (None, Some(_)) => {
                let rendered = session.live_doc();
                session.tracker.set_last_saved_hash(Some(rendered.hash()));
                session.coordinator.set_last_saved_content(Some(rendered));
                session.tracker.finish_hydration();
            }
            (None, None) => {
                // Unreadable remote content: no baseline, so any edit is dirty
                session.tracker.finish_hydration();
            }
        }

        info!(
            note_id = %session.key.note_id,
            panel_id = %session.key.panel_id,
            version,
            recovered = session.coordinator.has_scheduled(),
            "Opened document"
        );
        Ok(session)
    }

    /// A pending record worth restoring: fresh, based on the current remote
    /// version or later, and different from the remote content.
    fn recoverable_edit(
        key: &DocKey,
        log: &PendingSaveLog<S>,
        storage_key: &str,
        remote_doc: Option<&CanonicalDoc>,
        remote_version: u64,
        now: u64,
    ) -> Option<CanonicalDoc> {
        let record = log.read(storage_key, now)?;

        if record.version < remote_version {
            warn!(
                note_id = %key.note_id,
                panel_id = %key.panel_id,
                record_version = record.version,
                remote_version,
                "Remote document is newer than pending save, discarding it"
            );
            log.clear(storage_key);
            return None;
        }

        let differs = remote_doc.is_none_or(|doc| doc.hash() != record.content.hash());
        if !differs {
            debug!(note_id = %key.note_id, panel_id = %key.panel_id, "Pending save already on remote");
            log.clear(storage_key);
            return None;
        }

        info!(
            note_id = %key.note_id,
            panel_id = %key.panel_id,
            version = record.version,
            "Recovering unsaved edit"
        );
        Some(record.content)
    }

    pub fn key(&self) -> &DocKey {
        &self.key
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    /// Mutable editor access for hosts that drive edits through the session.
    /// Follow every change with `on_content_changed`.
    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn notification(&self) -> Option<&SyncNotification> {
        self.notification.as_ref()
    }

    pub fn state(&self) -> ResolverState {
        self.resolver.state()
    }

    pub fn last_applied_version(&self) -> u64 {
        self.resolver.last_applied_version()
    }

    pub fn last_saved_hash(&self) -> Option<&ContentHash> {
        self.tracker.last_saved_hash()
    }

    pub fn last_saved_content(&self) -> Option<&CanonicalDoc> {
        self.coordinator.last_saved_content()
    }

    pub fn pending_update(&self) -> Option<&RemoteUpdate> {
        self.resolver.pending()
    }

    pub fn tracker(&self) -> &EditTracker {
        &self.tracker
    }

    pub fn has_scheduled_save(&self) -> bool {
        self.coordinator.has_scheduled()
    }

    /// When the scheduled save becomes due, for hosts that set one timer
    /// instead of ticking.
    pub fn next_save_due_ms(&self) -> Option<u64> {
        self.coordinator.scheduled().map(|save| save.due_at_ms)
    }

    /// Canonical form of what the editor shows right now.
    pub fn live_doc(&self) -> CanonicalDoc {
        let schema = self.editor.schema();
        CanonicalDoc::from_node(self.editor.get_content(), schema).unwrap_or_else(|| {
            warn!(note_id = %self.key.note_id, panel_id = %self.key.panel_id, "Editor content is not a doc, treating as empty");
            CanonicalDoc::empty()
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.tracker.is_dirty(&self.live_doc().hash())
    }

    /// The editor reported a change.
    pub fn on_content_changed(&mut self) {
        let now = self.clock.now_ms();
        self.content_changed_at(now);
    }

    /// The editor reported a change at `at_ms`. Hosts that queue change
    /// notifications while the session is busy replay them with their
    /// original time.
    pub fn content_changed_at(&mut self, at_ms: u64) {
        if !self.tracker.is_hydrated() || self.applying {
            return;
        }

        // Rendering our own apply or hydration reproduces the saved baseline
        // exactly. Anything else counts as an edit, however soon it arrives.
        let live = self.live_doc();
        if !self.tracker.has_user_edited()
            && self.tracker.last_saved_hash() == Some(&live.hash())
        {
            debug!(note_id = %self.key.note_id, panel_id = %self.key.panel_id, "Change matches saved content, not an edit");
            return;
        }

        self.tracker.mark_edited(at_ms);
        self.resolver.note_edit();
        self.coordinator
            .schedule(live, self.resolver.last_applied_version(), at_ms);
    }

    /// Run everything that is due: queued remote events, a deferred update
    /// once the user has stopped typing, and the debounced save.
    ///
    /// A failed save is also reported through the notification.
    pub async fn tick(&mut self) -> Result<()> {
        self.process_events();

        let now = self.clock.now_ms();
        if let Some(update) = self.resolver.take_ready_deferred(&self.tracker, now) {
            debug!(note_id = %self.key.note_id, panel_id = %self.key.panel_id, version = update.version, "Re-checking deferred update");
            self.handle_update(update, now);
        }

        if self.coordinator.is_due(now) {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send the scheduled save now, if there is one.
    pub async fn flush(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        match self.coordinator.flush(&self.remote, &self.key, now).await {
            Ok(Some(saved)) => {
                self.after_save(&saved, now);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                self.record_save_error(&e);
                Err(e.into())
            }
        }
    }

    /// "Save & Sync": save what the editor shows, then pull the latest
    /// version and show it if someone else wrote after us.
    pub async fn save_and_sync(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        let version_before = self.remote.document_version(&self.key);
        let live = self.live_doc();
        self.coordinator.cancel();

        let saved = match self
            .coordinator
            .save(
                &self.remote,
                &self.key,
                live,
                self.resolver.last_applied_version(),
                now,
            )
            .await
        {
            Ok(saved) => saved,
            Err(e) => {
                self.record_save_error(&e);
                return Err(e.into());
            }
        };
        self.confirm_save(&saved);

        if let Err(e) = self.remote.check_for_remote_updates(&self.key).await {
            warn!(note_id = %self.key.note_id, panel_id = %self.key.panel_id, error = %e, "Fetch after save failed");
        }

        let latest_version = self.remote.document_version(&self.key);
        let latest = self
            .remote
            .get_document(&self.key)
            .and_then(|raw| canonicalize(&raw, self.editor.schema()));

        match latest {
            Some(doc) if latest_version > version_before && doc.hash() != saved.hash => {
                // Explicit user action, so no dedup or grace checks
                self.apply_remote(RemoteUpdate::new(latest_version, doc), now);
            }
            _ => {
                let dirty = self.is_dirty();
                self.resolver.clear_pending(dirty);
                self.notification = None;
            }
        }
        Ok(())
    }

    /// "Discard & Sync": throw away local edits and show the remote version.
    pub async fn discard_and_sync(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        self.remote.load_document(&self.key).await?;

        let version = self.remote.document_version(&self.key);
        let doc = match self.remote.get_document(&self.key) {
            None => CanonicalDoc::empty(),
            Some(raw) => {
                canonicalize(&raw, self.editor.schema()).ok_or(SessionError::Unreadable)?
            }
        };

        self.apply_remote(RemoteUpdate::new(version, doc), now);
        Ok(())
    }

    /// Hide the notification but keep the pending update. It is applied
    /// after the next successful save if still newer.
    pub fn dismiss(&mut self) {
        self.resolver.acknowledge();
        self.notification = None;
    }

    /// Synchronous backstop for page hide and unload. Returns whether a
    /// record was written.
    pub fn on_page_hide(&mut self) -> bool {
        let now = self.clock.now_ms();
        let live = self.live_doc();
        if !self.tracker.is_dirty(&live.hash()) && !self.coordinator.has_scheduled() {
            return false;
        }
        self.coordinator
            .write_log(&live, self.resolver.last_applied_version(), now)
    }

    /// Flush any scheduled save and end the session. Dropping the session
    /// unsubscribes from remote events.
    pub async fn close(mut self) -> Result<()> {
        self.flush().await
    }

    fn process_events(&mut self) {
        let events: Vec<RemoteEvent> = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        for event in events {
            let now = self.clock.now_ms();
            self.handle_event(&event, now);
        }
    }

    fn handle_event(&mut self, event: &RemoteEvent, now: u64) {
        debug!(
            note_id = %event.note_id,
            panel_id = %event.panel_id,
            version = event.version,
            kind = ?event.kind,
            reason = ?event.reason,
            "Remote event"
        );
        let live = self.live_doc().hash();
        let decision = self.resolver.decide(
            &self.key,
            event.version,
            &event.content,
            self.editor.schema(),
            &live,
            &self.tracker,
            now,
        );
        self.act_on(decision, now);
    }

    fn handle_update(&mut self, update: RemoteUpdate, now: u64) {
        let live = self.live_doc().hash();
        let decision = self
            .resolver
            .evaluate(&self.key, update, &live, &self.tracker, now);
        self.act_on(decision, now);
    }

    fn act_on(&mut self, decision: Decision, now: u64) {
        match decision {
            Decision::Ignore(_) | Decision::Defer(_) => {}
            Decision::Converged(hash) => {
                self.tracker.set_last_saved_hash(Some(hash));
                self.coordinator.set_last_saved_content(Some(self.live_doc()));
            }
            Decision::AwaitUser(update) => {
                info!(
                    note_id = %self.key.note_id,
                    panel_id = %self.key.panel_id,
                    version = update.version,
                    "Remote update blocked by unsaved edits"
                );
                let save_error = self
                    .notification
                    .take()
                    .and_then(|notification| notification.save_error);
                let mut notification = SyncNotification::remote_update(update.version);
                notification.save_error = save_error;
                self.notification = Some(notification);
            }
            Decision::Apply(update) => self.apply_remote(update, now),
        }
    }

    /// Replace the editor content with a remote version.
    fn apply_remote(&mut self, update: RemoteUpdate, now: u64) {
        self.applying = true;
        self.editor.set_content(&update.content, false);
        self.applying = false;

        // Plugins may have adjusted the content; the rendered form is the baseline
        let rendered = self.live_doc();
        self.tracker.clear_edits();
        self.tracker.set_last_saved_hash(Some(rendered.hash()));
        self.coordinator.set_last_saved_content(Some(rendered));
        self.coordinator.discard();
        self.resolver.mark_applied(update.version);
        self.notification = None;

        info!(
            note_id = %self.key.note_id,
            panel_id = %self.key.panel_id,
            version = update.version,
            at_ms = now,
            "Applied remote update"
        );
    }

    fn confirm_save(&mut self, saved: &SavedDocument) -> bool {
        let live = self.live_doc().hash();
        self.tracker.confirm_saved(saved.hash.clone(), &live);
        let clean = !self.tracker.is_dirty(&live);
        self.resolver.mark_saved(saved.version, clean);

        // The error is resolved; a pending remote update stays visible
        self.notification = self
            .notification
            .take()
            .filter(|notification| notification.has_remote_update)
            .map(|notification| SyncNotification {
                save_error: None,
                ..notification
            });
        clean
    }

    fn after_save(&mut self, saved: &SavedDocument, now: u64) {
        let clean = self.confirm_save(saved);
        if !clean {
            return;
        }
        if let Some(update) = self.resolver.take_acknowledged() {
            debug!(note_id = %self.key.note_id, panel_id = %self.key.panel_id, version = update.version, "Applying dismissed update after save");
            self.apply_remote(update, now);
        }
    }

    fn record_save_error(&mut self, error: &RemoteError) {
        let message = error.to_string();
        self.notification = Some(match self.notification.take() {
            Some(notification) => notification.with_save_error(message),
            None => SyncNotification::save_failed(message),
        });
    }
}
