//! End-to-end tests for document sessions.
//!
//! Drives a `DocumentSession` against the in-memory remote store, editor and
//! local storage with a manual clock: typing, debounced saves, remote updates
//! from another writer, the notification actions, and crash recovery.

use std::sync::Arc;

use panel_sync::{
    CanonicalDoc, Clock, DocKey, DocumentSession, DocumentSwitcher, InMemoryRemote, InMemoryStore,
    LocalStore, ManualClock, MemoryEditor, PendingSaveLog, RawContent, RemoteEvent,
    ResolverState, Schema, SyncConfig, canonicalize,
};

type Session = DocumentSession<Arc<InMemoryRemote>, MemoryEditor, Arc<InMemoryStore>, ManualClock>;

/// Shared collaborators for one test.
struct Harness {
    remote: Arc<InMemoryRemote>,
    store: Arc<InMemoryStore>,
    clock: ManualClock,
    switcher: DocumentSwitcher,
}

impl Harness {
    fn new() -> Self {
        Self {
            remote: Arc::new(InMemoryRemote::new()),
            store: Arc::new(InMemoryStore::new()),
            clock: ManualClock::new(1_700_000_000_000),
            switcher: DocumentSwitcher::new(),
        }
    }

    /// Seed the remote document before opening.
    fn with_remote(self, html: &str, version: u64) -> Self {
        self.remote.insert(&key(), markup(html), version);
        self
    }

    async fn open(&self) -> Session {
        self.open_with(SyncConfig::default(), MemoryEditor::new())
            .await
    }

    async fn open_with(&self, config: SyncConfig, editor: MemoryEditor) -> Session {
        let session = DocumentSession::open(
            key(),
            Arc::clone(&self.remote),
            editor,
            Arc::clone(&self.store),
            self.clock.clone(),
            config,
            &self.switcher.begin(),
        )
        .await
        .expect("Failed to open session");
        // The user starts typing a moment after the panel opens
        self.clock.advance(1_000);
        session
    }

    /// Type and forward the change notification, as the host does.
    fn type_text(&self, session: &mut Session, text: &str) {
        session.editor_mut().type_text(text);
        session.on_content_changed();
    }

    /// Another client saves `html`; the store reports it as a conflict.
    fn remote_writes(&self, html: &str) -> u64 {
        let version = self.remote.write_remote(&key(), markup(html));
        self.remote.emit_conflict(&key());
        version
    }

    fn pending_record(&self) -> Option<panel_sync::PendingSaveRecord> {
        PendingSaveLog::new(Arc::clone(&self.store), 300_000)
            .read(&key().storage_key("pending_save_"), 0)
    }
}

fn key() -> DocKey {
    DocKey::new("note-42", "panel-7")
}

fn markup(html: &str) -> RawContent {
    RawContent::Markup(html.to_string())
}

/// A debounce long enough that no save fires during the test.
fn slow_saves() -> SyncConfig {
    SyncConfig {
        save_debounce_ms: 60_000,
        ..SyncConfig::default()
    }
}

#[tokio::test]
async fn scenario_a_typing_saves_once_after_debounce() {
    let h = Harness::new();
    let mut session = h.open().await;

    for ch in ["H", "e", "l", "l", "o"] {
        h.type_text(&mut session, ch);
        h.clock.advance(50);
        session.tick().await.unwrap();
    }
    assert_eq!(h.remote.save_count(), 0);

    h.clock.advance(249);
    session.tick().await.unwrap();
    assert_eq!(h.remote.save_count(), 0);

    h.clock.advance(1);
    session.tick().await.unwrap();
    assert_eq!(h.remote.save_count(), 1);

    let saves = h.remote.saves();
    assert!(saves[0].content.plain_text().contains("Hello"));
    assert_eq!(
        session.last_saved_hash(),
        Some(&session.live_doc().hash())
    );

    // Nothing more to send
    h.clock.advance(1_000);
    session.tick().await.unwrap();
    assert_eq!(h.remote.save_count(), 1);
}

#[tokio::test]
async fn scenario_b_dirty_editor_blocks_remote_update() {
    let h = Harness::new().with_remote("<p>shared draft</p>", 1);
    let mut session = h.open_with(slow_saves(), MemoryEditor::new()).await;

    h.type_text(&mut session, " with my edit");
    h.clock.advance(2_500);
    let version = h.remote_writes("<p>their edit</p>");
    session.tick().await.unwrap();

    assert_eq!(session.editor().text(), "shared draft with my edit");
    let notification = session.notification().expect("notification shown");
    assert_eq!(notification.version, Some(version));
    assert!(notification.has_remote_update);
    assert_eq!(session.last_applied_version(), 1);
    assert_eq!(session.state(), ResolverState::AwaitingUserDecision);
}

#[tokio::test]
async fn scenario_c_discard_and_sync_takes_remote() {
    let h = Harness::new().with_remote("<p>shared draft</p>", 1);
    let mut session = h.open_with(slow_saves(), MemoryEditor::new()).await;

    h.type_text(&mut session, " with my edit");
    h.clock.advance(2_500);
    let version = h.remote_writes("<p>their edit</p>");
    session.tick().await.unwrap();
    assert!(session.notification().is_some());

    session.discard_and_sync().await.unwrap();

    assert_eq!(session.editor().text(), "their edit");
    assert_eq!(session.last_applied_version(), version);
    assert!(session.notification().is_none());
    assert!(!session.is_dirty());
    assert!(!session.has_scheduled_save());
    assert!(h.pending_record().is_none());
    assert_eq!(h.remote.save_count(), 0);
}

#[tokio::test]
async fn scenario_d_remote_matching_last_save_is_silent() {
    let h = Harness::new().with_remote("<p>same <strong>words</strong></p>", 1);
    let mut session = h.open().await;
    let set_calls = session.editor().set_calls();

    // Same content, different markup spelling and a newer version
    h.remote.emit(RemoteEvent::remote_update(
        "note-42",
        "panel-7",
        2,
        markup("<p>same <b>words</b></p>"),
    ));
    session.tick().await.unwrap();

    assert_eq!(session.editor().set_calls(), set_calls);
    assert!(session.notification().is_none());
    assert_eq!(session.last_applied_version(), 1);
    assert_eq!(session.state(), ResolverState::Clean);
}

#[tokio::test]
async fn scenario_e_page_hide_writes_live_content() {
    let h = Harness::new().with_remote("<p>start</p>", 1);
    let mut session = h.open().await;

    h.type_text(&mut session, " and unsaved");
    assert!(session.on_page_hide());

    let record = h.pending_record().expect("pending record");
    assert_eq!(record.content, session.live_doc());
    assert_eq!(record.content.plain_text(), "start and unsaved");
    assert_eq!(record.version, 1);
}

#[tokio::test]
async fn page_hide_when_clean_writes_nothing() {
    let h = Harness::new().with_remote("<p>start</p>", 1);
    let mut session = h.open().await;

    assert!(!session.on_page_hide());
    assert!(h.store.is_empty());
}

#[tokio::test]
async fn p1_dirty_editor_is_never_silently_overwritten() {
    for delay in [0, 500, 1_999, 2_000, 2_500, 10_000] {
        let h = Harness::new().with_remote("<p>base</p>", 1);
        let mut session = h.open_with(slow_saves(), MemoryEditor::new()).await;

        h.type_text(&mut session, " local");
        h.clock.advance(delay);
        assert!(session.is_dirty());
        h.remote_writes("<p>remote</p>");
        session.tick().await.unwrap();

        assert_eq!(session.editor().text(), "base local", "delay {delay}");

        // Once the grace window is over the user is asked, never overridden
        h.clock.advance(2_000);
        session.tick().await.unwrap();
        assert_eq!(session.editor().text(), "base local", "delay {delay}");
        assert!(session.notification().is_some(), "delay {delay}");
    }
}

#[tokio::test]
async fn p2_applying_twice_is_a_noop_and_not_an_edit() {
    let h = Harness::new().with_remote("<p>v1</p>", 1);
    let mut session = h
        .open_with(SyncConfig::default(), MemoryEditor::new().with_trailing_paragraph())
        .await;

    let version = h.remote_writes("<p>v2</p>");
    session.tick().await.unwrap();
    assert_eq!(session.last_applied_version(), version);
    let set_calls = session.editor().set_calls();

    // The editor's change notification for our own apply
    session.on_content_changed();
    assert!(!session.has_scheduled_save());
    assert!(!session.is_dirty());

    // Same version and content again
    h.remote.emit_conflict(&key());
    session.tick().await.unwrap();
    assert_eq!(session.editor().set_calls(), set_calls);
    assert!(session.notification().is_none());

    h.clock.advance(1_000);
    session.tick().await.unwrap();
    assert_eq!(h.remote.save_count(), 0);
}

#[tokio::test]
async fn typing_just_after_apply_is_kept_and_scheduled() {
    let h = Harness::new().with_remote("<p>v1</p>", 1);
    let mut session = h.open_with(slow_saves(), MemoryEditor::new()).await;

    h.remote_writes("<p>remote</p>");
    session.tick().await.unwrap();
    assert_eq!(session.editor().text(), "remote");

    h.clock.advance(50);
    h.type_text(&mut session, " user");
    assert!(session.is_dirty());
    assert!(session.has_scheduled_save());
    assert_eq!(
        h.pending_record().map(|r| r.content.plain_text()),
        Some("remote user".to_string())
    );

    // The next remote change waits for the user instead of overwriting
    h.clock.advance(2_500);
    let version = h.remote_writes("<p>other</p>");
    session.tick().await.unwrap();

    assert_eq!(session.editor().text(), "remote user");
    assert_eq!(session.notification().map(|n| n.version), Some(Some(version)));
    assert_eq!(session.state(), ResolverState::AwaitingUserDecision);
}

#[test]
fn p3_structured_and_markup_hash_identically() {
    let schema = Schema::default();
    let structured: RawContent = serde_json::from_str(
        r#"{
            "type": "doc",
            "content": [
                {"type": "heading", "attrs": {"level": 1}, "content": [{"type": "text", "text": "Title"}]},
                {"type": "bullet_list", "content": [
                    {"type": "list_item", "content": [
                        {"type": "paragraph", "content": [
                            {"type": "text", "text": "see "},
                            {"type": "text", "text": "this", "marks": [
                                {"type": "annotation", "attrs": {"annotationType": "comment", "annotationId": "a1"}}
                            ]}
                        ]}
                    ]}
                ]}
            ]
        }"#,
    )
    .unwrap();
    let html = markup(
        "<h1>Title</h1>\n<ul>\n  <li><p>see <span data-annotation-type=\"comment\" data-annotation-id=\"a1\">this</span></p></li>\n</ul>",
    );

    let a = canonicalize(&structured, &schema).unwrap();
    let b = canonicalize(&html, &schema).unwrap();
    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.hash(), canonicalize(&structured, &schema).unwrap().hash());
}

#[tokio::test]
async fn p4_last_applied_version_never_decreases() {
    let h = Harness::new().with_remote("<p>v5</p>", 5);
    let mut session = h.open().await;

    let mut previous = session.last_applied_version();
    for (i, version) in [3u64, 1, 7, 6, 7, 2, 9, 8].into_iter().enumerate() {
        h.remote.emit(RemoteEvent::remote_update(
            "note-42",
            "panel-7",
            version,
            markup(&format!("<p>event {i}</p>")),
        ));
        session.tick().await.unwrap();
        let current = session.last_applied_version();
        assert!(current >= previous, "{current} < {previous}");
        previous = current;
    }
    assert_eq!(previous, 9);
    assert_eq!(session.editor().text(), "event 6");
}

#[tokio::test]
async fn p5_expired_pending_record_is_never_restored() {
    let h = Harness::new().with_remote("<p>remote</p>", 1);
    let log = PendingSaveLog::new(Arc::clone(&h.store), 300_000);
    let storage_key = key().storage_key("pending_save_");
    log.write(
        &storage_key,
        &CanonicalDoc::from_paragraphs(&["ancient draft"]),
        1,
        h.clock.now_ms() - 300_000,
    );

    let session = h.open().await;

    assert_eq!(session.editor().text(), "remote");
    assert!(!session.has_scheduled_save());
    assert!(h.store.get_item(&storage_key).unwrap().is_none());
}

#[tokio::test]
async fn p6_clean_after_save_completes() {
    let h = Harness::new().with_remote("<p>text</p>", 1);
    let mut session = h.open().await;

    h.type_text(&mut session, " more");
    assert!(session.is_dirty());
    assert_eq!(session.state(), ResolverState::Dirty);

    h.clock.advance(300);
    session.tick().await.unwrap();

    assert!(!session.is_dirty());
    assert_eq!(session.state(), ResolverState::Clean);
    assert_eq!(session.last_applied_version(), 2);
    assert!(h.pending_record().is_none());
}

#[tokio::test]
async fn plugin_noise_does_not_block_remote_update() {
    let h = Harness::new().with_remote("<p>original</p>", 1);
    let mut session = h.open().await;

    // A plugin tags the block long after hydration
    session.editor_mut().plugin_touch("blk-1");
    h.clock.advance(5_000);
    h.remote_writes("<p>updated elsewhere</p>");
    session.tick().await.unwrap();

    assert_eq!(session.editor().text(), "updated elsewhere");
    assert!(session.notification().is_none());
}

#[tokio::test]
async fn save_and_sync_keeps_local_and_clears_notification() {
    let h = Harness::new().with_remote("<p>shared</p>", 1);
    let mut session = h.open_with(slow_saves(), MemoryEditor::new()).await;

    h.type_text(&mut session, " mine");
    h.clock.advance(2_500);
    h.remote_writes("<p>theirs</p>");
    session.tick().await.unwrap();
    assert!(session.notification().is_some());

    session.save_and_sync().await.unwrap();

    assert_eq!(session.editor().text(), "shared mine");
    assert!(session.notification().is_none());
    assert!(!session.is_dirty());
    assert!(session.pending_update().is_none());
    assert_eq!(session.last_applied_version(), h.remote.server_version(&key()));
    let saves = h.remote.saves();
    assert!(saves[0].options.skip_batching);
}

#[tokio::test]
async fn dismissed_update_superseded_by_own_save_is_dropped() {
    let h = Harness::new().with_remote("<p>shared</p>", 1);
    let mut session = h.open().await;

    h.type_text(&mut session, " mine");
    h.remote_writes("<p>theirs</p>");
    h.clock.advance(100);
    session.tick().await.unwrap();

    // Deferred while typing, then blocked once the grace window is over;
    // the debounced save also goes out on this tick
    h.clock.advance(2_000);
    session.tick().await.unwrap();
    assert!(session.notification().is_some());

    session.dismiss();
    assert!(session.notification().is_none());
    assert!(session.pending_update().is_some());

    h.type_text(&mut session, "!");
    h.clock.advance(300);
    session.tick().await.unwrap();

    // Our saves are newer than the dismissed version
    assert_eq!(session.editor().text(), "shared mine!");
    assert!(session.pending_update().is_none());
    assert_eq!(session.state(), ResolverState::Clean);
}

#[tokio::test]
async fn dismissed_update_newer_than_save_is_applied_after_save() {
    let h = Harness::new().with_remote("<p>shared</p>", 1);
    let mut session = h.open_with(slow_saves(), MemoryEditor::new()).await;

    h.type_text(&mut session, " mine");
    h.clock.advance(2_500);
    h.remote.emit(RemoteEvent::conflict(
        "note-42",
        "panel-7",
        50,
        markup("<p>far ahead</p>"),
    ));
    session.tick().await.unwrap();
    session.dismiss();

    session.flush().await.unwrap();

    assert_eq!(session.editor().text(), "far ahead");
    assert_eq!(session.last_applied_version(), 50);
    assert!(session.notification().is_none());
}

#[tokio::test]
async fn file_store_backed_recovery_across_sessions() {
    let dir = tempfile::TempDir::new().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    remote.insert(&key(), markup("<p>saved</p>"), 3);
    let clock = ManualClock::new(1_700_000_000_000);
    let switcher = DocumentSwitcher::new();

    {
        let store = panel_sync::FileStore::new(dir.path()).unwrap();
        let mut session = DocumentSession::open(
            key(),
            Arc::clone(&remote),
            MemoryEditor::new(),
            store,
            clock.clone(),
            SyncConfig::default(),
            &switcher.begin(),
        )
        .await
        .unwrap();
        clock.advance(1_000);
        session.editor_mut().type_text(" then crash");
        session.on_content_changed();
        // Dropped before the debounce fires
    }

    clock.advance(10_000);
    let store = panel_sync::FileStore::new(dir.path()).unwrap();
    let mut session = DocumentSession::open(
        key(),
        Arc::clone(&remote),
        MemoryEditor::new(),
        store,
        clock.clone(),
        SyncConfig::default(),
        &switcher.begin(),
    )
    .await
    .unwrap();

    assert_eq!(session.editor().text(), "saved then crash");
    clock.advance(300);
    session.tick().await.unwrap();
    assert_eq!(remote.save_count(), 1);
    assert!(!session.is_dirty());
}
