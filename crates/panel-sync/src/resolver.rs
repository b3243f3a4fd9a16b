//! Decides what a remote change does to the open document.
//!
//! On a conflict or remote-update event, in order:
//!
//! 1. Content that cannot be canonicalized is ignored.
//! 2. Content equal to the last saved content is a no-op.
//! 3. Content equal to what the editor shows means both sides converged; the
//!    session adopts it as the saved baseline.
//! 4. A version already processed, or not newer than the last applied one,
//!    is ignored. This is the check correctness rests on.
//! 5. If the user has unsaved work and is still typing (activity has not
//!    decayed and the last edit is inside the grace window), the update is
//!    deferred. This is a timing heuristic layered on top of 4,
//!    never a substitute for it.
//! 6. Unsaved work blocks the update behind a user decision; otherwise the
//!    update is applied.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;
use tracing::debug;

use crate::canonical::{CanonicalDoc, ContentHash, RawContent, canonicalize};
use crate::markup::Schema;
use crate::remote::DocKey;
use crate::tracker::EditTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResolverState {
    /// Editor matches the last saved or applied content.
    Clean,
    /// Local edits not yet confirmed by the remote store.
    Dirty,
    /// A remote update is waiting behind the notification.
    AwaitingUserDecision,
}

/// A canonicalized remote version.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub version: u64,
    pub content: CanonicalDoc,
    pub hash: ContentHash,
}

impl RemoteUpdate {
    pub fn new(version: u64, content: CanonicalDoc) -> Self {
        let hash = content.hash();
        Self {
            version,
            content,
            hash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Unparseable,
    MatchesSaved,
    AlreadyProcessed,
    NotNewer,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ignore(IgnoreReason),
    /// The editor already shows this content.
    Converged(ContentHash),
    /// Held back while the user is typing; re-checked later.
    Defer(RemoteUpdate),
    /// Unsaved work: show the notification, leave the editor alone.
    AwaitUser(RemoteUpdate),
    /// Safe to replace the editor content.
    Apply(RemoteUpdate),
}

/// Bounded set of processed version keys. The oldest key is evicted first.
#[derive(Debug, Clone)]
pub struct VersionLedger {
    order: VecDeque<String>,
    seen: HashSet<String>,
    cap: usize,
}

impl VersionLedger {
    pub fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            seen: HashSet::with_capacity(cap),
            cap,
        }
    }

    /// Returns `false` if the key was already present.
    pub fn insert(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        while self.order.len() >= self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.seen.clear();
    }
}

pub struct ConflictResolver {
    state: ResolverState,
    processed: VersionLedger,
    last_applied_version: u64,
    pending: Option<RemoteUpdate>,
    deferred: Option<RemoteUpdate>,
    acknowledged: bool,
    grace_ms: u64,
}

impl ConflictResolver {
    pub fn new(processed_cap: usize, grace_ms: u64) -> Self {
        Self {
            state: ResolverState::Clean,
            processed: VersionLedger::new(processed_cap),
            last_applied_version: 0,
            pending: None,
            deferred: None,
            acknowledged: false,
            grace_ms,
        }
    }

    /// Start over for a freshly hydrated document at `version`.
    pub fn reset(&mut self, version: u64) {
        self.state = ResolverState::Clean;
        self.processed.clear();
        self.last_applied_version = version;
        self.pending = None;
        self.deferred = None;
        self.acknowledged = false;
    }

    pub fn state(&self) -> ResolverState {
        self.state
    }

    pub fn last_applied_version(&self) -> u64 {
        self.last_applied_version
    }

    pub fn pending(&self) -> Option<&RemoteUpdate> {
        self.pending.as_ref()
    }

    pub fn deferred(&self) -> Option<&RemoteUpdate> {
        self.deferred.as_ref()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn processed(&self) -> &VersionLedger {
        &self.processed
    }

    /// Canonicalize remote content and decide.
    #[allow(clippy::too_many_arguments)]
    pub fn decide(
        &mut self,
        key: &DocKey,
        version: u64,
        raw: &RawContent,
        schema: &Schema,
        live: &ContentHash,
        tracker: &EditTracker,
        now_ms: u64,
    ) -> Decision {
        let Some(content) = canonicalize(raw, schema) else {
            debug!(%key, version, "Ignoring remote content that failed to canonicalize");
            return Decision::Ignore(IgnoreReason::Unparseable);
        };
        self.evaluate(key, RemoteUpdate::new(version, content), live, tracker, now_ms)
    }

    /// Decide on an already canonicalized update.
    pub fn evaluate(
        &mut self,
        key: &DocKey,
        update: RemoteUpdate,
        live: &ContentHash,
        tracker: &EditTracker,
        now_ms: u64,
    ) -> Decision {
        let version = update.version;

        if tracker.last_saved_hash() == Some(&update.hash) {
            debug!(%key, version, "Remote content matches last save");
            return Decision::Ignore(IgnoreReason::MatchesSaved);
        }

        if &update.hash == live {
            debug!(%key, version, "Remote content matches editor");
            return Decision::Converged(update.hash);
        }

        if self.processed.contains(&key.version_key(version)) {
            debug!(%key, version, "Version already processed");
            return Decision::Ignore(IgnoreReason::AlreadyProcessed);
        }
        if version <= self.last_applied_version {
            debug!(%key, version, last_applied = self.last_applied_version, "Version not newer than applied");
            return Decision::Ignore(IgnoreReason::NotNewer);
        }

        let dirty = tracker.is_dirty(live);

        // Secondary filter: don't interrupt active typing
        if dirty && tracker.is_typing(now_ms, self.grace_ms) {
            debug!(%key, version, "Deferring remote update during active typing");
            self.deferred = Some(update.clone());
            return Decision::Defer(update);
        }

        self.processed.insert(key.version_key(version));
        self.deferred = None;

        if dirty {
            self.state = ResolverState::AwaitingUserDecision;
            self.pending = Some(update.clone());
            self.acknowledged = false;
            Decision::AwaitUser(update)
        } else {
            Decision::Apply(update)
        }
    }

    /// Hand back the deferred update once the user has paused typing.
    pub fn take_ready_deferred(&mut self, tracker: &EditTracker, now_ms: u64) -> Option<RemoteUpdate> {
        if tracker.is_typing(now_ms, self.grace_ms) {
            return None;
        }
        self.deferred.take()
    }

    /// A local edit happened.
    pub fn note_edit(&mut self) {
        if self.state == ResolverState::Clean {
            self.state = ResolverState::Dirty;
        }
    }

    /// The editor now shows remote `version`.
    pub fn mark_applied(&mut self, version: u64) {
        self.last_applied_version = self.last_applied_version.max(version);
        self.state = ResolverState::Clean;
        self.pending = None;
        self.deferred = None;
        self.acknowledged = false;
    }

    /// The remote store confirmed our save at `version`.
    pub fn mark_saved(&mut self, version: u64, clean: bool) {
        self.last_applied_version = self.last_applied_version.max(version);
        if clean && self.state == ResolverState::Dirty {
            self.state = ResolverState::Clean;
        }
    }

    /// The user dismissed the notification without choosing.
    pub fn acknowledge(&mut self) {
        self.acknowledged = true;
    }

    /// After a save: the dismissed pending update, if it is still newer than
    /// what the editor shows. A stale one is dropped.
    pub fn take_acknowledged(&mut self) -> Option<RemoteUpdate> {
        if !self.acknowledged {
            return None;
        }
        let update = self.pending.take()?;
        self.acknowledged = false;
        self.state = ResolverState::Clean;
        if update.version > self.last_applied_version {
            Some(update)
        } else {
            debug!(
                version = update.version,
                last_applied = self.last_applied_version,
                "Dropping pending update superseded by our save"
            );
            None
        }
    }

    /// Forget the pending update after the user chose to keep local content.
    pub fn clear_pending(&mut self, dirty: bool) {
        self.pending = None;
        self.deferred = None;
        self.acknowledged = false;
        self.state = if dirty {
            ResolverState::Dirty
        } else {
            ResolverState::Clean
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocKey {
        DocKey::new("note", "panel")
    }

    fn update(version: u64, text: &str) -> RemoteUpdate {
        RemoteUpdate::new(version, CanonicalDoc::from_paragraphs(&[text]))
    }

    fn clean_tracker(saved: &str) -> EditTracker {
        let mut tracker = EditTracker::new(3_000);
        tracker.set_last_saved_hash(Some(CanonicalDoc::from_paragraphs(&[saved]).hash()));
        tracker.finish_hydration();
        tracker
    }

    fn live(text: &str) -> ContentHash {
        CanonicalDoc::from_paragraphs(&[text]).hash()
    }

    #[test]
    fn test_ledger_evicts_oldest() {
        let mut ledger = VersionLedger::new(3);
        for v in 1..=4 {
            assert!(ledger.insert(format!("p-{v}")));
        }
        assert_eq!(ledger.len(), 3);
        assert!(!ledger.contains("p-1"));
        assert!(ledger.contains("p-4"));
        assert!(!ledger.insert("p-4".to_string()));
    }

    #[test]
    fn test_unparseable_is_ignored() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        let tracker = clean_tracker("a");
        let decision = resolver.decide(
            &key(),
            2,
            &RawContent::Markup("<p".into()),
            &Schema::default(),
            &live("a"),
            &tracker,
            0,
        );
        assert_eq!(decision, Decision::Ignore(IgnoreReason::Unparseable));
    }

    #[test]
    fn test_matches_saved_is_silent() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        let tracker = clean_tracker("a");
        let decision = resolver.evaluate(&key(), update(5, "a"), &live("a"), &tracker, 0);
        assert_eq!(decision, Decision::Ignore(IgnoreReason::MatchesSaved));
        assert!(resolver.processed().is_empty());
    }

    #[test]
    fn test_matches_live_converges() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        let mut tracker = clean_tracker("a");
        tracker.mark_edited(0);
        let decision = resolver.evaluate(&key(), update(5, "b"), &live("b"), &tracker, 10);
        assert_eq!(decision, Decision::Converged(live("b")));
    }

    #[test]
    fn test_clean_applies_and_dedups() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(1);
        let tracker = clean_tracker("a");

        let decision = resolver.evaluate(&key(), update(2, "b"), &live("a"), &tracker, 0);
        assert!(matches!(decision, Decision::Apply(ref u) if u.version == 2));
        resolver.mark_applied(2);

        let again = resolver.evaluate(&key(), update(2, "b"), &live("a"), &tracker, 0);
        assert_eq!(again, Decision::Ignore(IgnoreReason::AlreadyProcessed));
    }

    #[test]
    fn test_older_version_ignored() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(5);
        let tracker = clean_tracker("a");
        let decision = resolver.evaluate(&key(), update(4, "old"), &live("a"), &tracker, 0);
        assert_eq!(decision, Decision::Ignore(IgnoreReason::NotNewer));
    }

    #[test]
    fn test_dirty_within_grace_defers_then_awaits_user() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(1);
        let mut tracker = clean_tracker("a");
        tracker.mark_edited(1_000);
        resolver.note_edit();

        let decision = resolver.evaluate(&key(), update(2, "b"), &live("a!"), &tracker, 1_500);
        assert!(matches!(decision, Decision::Defer(_)));
        assert!(resolver.deferred().is_some());
        // Deferral does not mark the version processed
        assert!(resolver.processed().is_empty());

        assert!(resolver.take_ready_deferred(&tracker, 2_500).is_none());
        let ready = resolver.take_ready_deferred(&tracker, 3_000).unwrap();

        let decision = resolver.evaluate(&key(), ready, &live("a!"), &tracker, 3_000);
        assert!(matches!(decision, Decision::AwaitUser(_)));
        assert_eq!(resolver.state(), ResolverState::AwaitingUserDecision);
        assert_eq!(resolver.pending().map(|u| u.version), Some(2));
        assert_eq!(resolver.last_applied_version(), 1);
    }

    #[test]
    fn test_decayed_activity_does_not_defer() {
        let mut resolver = ConflictResolver::new(50, 10_000);
        resolver.reset(1);
        let mut tracker = clean_tracker("a");
        tracker.mark_edited(1_000);
        resolver.note_edit();

        // Inside the grace window, but the 3 s activity window has lapsed
        let decision = resolver.evaluate(&key(), update(2, "b"), &live("a!"), &tracker, 5_000);
        assert!(matches!(decision, Decision::AwaitUser(ref u) if u.version == 2));
        assert!(resolver.deferred().is_none());
    }

    #[test]
    fn test_plugin_noise_is_not_dirty() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(1);
        let tracker = clean_tracker("a");
        // Live differs from saved but the user never typed
        let decision = resolver.evaluate(&key(), update(2, "b"), &live("a with id"), &tracker, 0);
        assert!(matches!(decision, Decision::Apply(_)));
    }

    #[test]
    fn test_acknowledged_update_dropped_when_superseded() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(1);
        let mut tracker = clean_tracker("a");
        tracker.mark_edited(0);

        resolver.evaluate(&key(), update(2, "b"), &live("a!"), &tracker, 10_000);
        resolver.acknowledge();

        // Our save landed as version 3, after the pending update
        resolver.mark_saved(3, true);
        assert!(resolver.take_acknowledged().is_none());
        assert!(resolver.pending().is_none());
        assert_eq!(resolver.state(), ResolverState::Clean);
    }

    #[test]
    fn test_acknowledged_update_applied_when_newer() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(1);
        let mut tracker = clean_tracker("a");
        tracker.mark_edited(0);

        resolver.evaluate(&key(), update(4, "b"), &live("a!"), &tracker, 10_000);
        assert!(resolver.take_acknowledged().is_none());

        resolver.acknowledge();
        resolver.mark_saved(3, true);
        assert_eq!(resolver.take_acknowledged().map(|u| u.version), Some(4));
    }

    #[test]
    fn test_clear_pending_settles_state() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(1);
        let mut tracker = clean_tracker("a");
        tracker.mark_edited(0);
        resolver.evaluate(&key(), update(2, "b"), &live("a!"), &tracker, 10_000);
        assert_eq!(resolver.state(), ResolverState::AwaitingUserDecision);

        resolver.clear_pending(false);
        assert_eq!(resolver.state(), ResolverState::Clean);
        assert!(resolver.pending().is_none());
    }

    #[test]
    fn test_last_applied_never_regresses() {
        let mut resolver = ConflictResolver::new(50, 2_000);
        resolver.reset(5);
        resolver.mark_applied(3);
        resolver.mark_saved(2, true);
        assert_eq!(resolver.last_applied_version(), 5);
        resolver.mark_applied(8);
        assert_eq!(resolver.last_applied_version(), 8);
    }
}
