//! Genuine-edit tracking.
//!
//! Editor plugins mutate the document on their own (normalizing structure,
//! adding ids), and those mutations fire the same change notification as
//! typing. The tracker keeps two signals apart:
//!
//! - `has_user_edited`: sticky until the live content is confirmed saved.
//!   It is what lets `is_dirty` tell a real divergence from plugin noise.
//! - `last_edit_ms`: when the user last typed. Activity decays after
//!   `edit_decay_ms`. It only narrows the conflict grace window (see
//!   `is_typing`), never correctness.
//!
//! Nothing counts as an edit until hydration finishes.

use crate::canonical::ContentHash;

#[derive(Debug, Clone)]
pub struct EditTracker {
    hydrated: bool,
    has_user_edited: bool,
    last_edit_ms: Option<u64>,
    last_saved_hash: Option<ContentHash>,
    decay_ms: u64,
}

impl EditTracker {
    pub fn new(decay_ms: u64) -> Self {
        Self {
            hydrated: false,
            has_user_edited: false,
            last_edit_ms: None,
            last_saved_hash: None,
            decay_ms,
        }
    }

    /// Back to the pre-hydration state, forgetting the saved hash.
    pub fn reset(&mut self) {
        self.hydrated = false;
        self.has_user_edited = false;
        self.last_edit_ms = None;
        self.last_saved_hash = None;
    }

    /// Start counting edits. Called once the editor shows the loaded content.
    pub fn finish_hydration(&mut self) {
        self.hydrated = true;
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Record a user edit. Returns `false` if it was ignored because
    /// hydration has not finished.
    pub fn mark_edited(&mut self, now_ms: u64) -> bool {
        if !self.hydrated {
            return false;
        }
        self.has_user_edited = true;
        self.last_edit_ms = Some(now_ms);
        true
    }

    pub fn has_user_edited(&self) -> bool {
        self.has_user_edited
    }

    pub fn last_edit_ms(&self) -> Option<u64> {
        self.last_edit_ms
    }

    /// Whether the user typed within the decay window.
    pub fn is_active(&self, now_ms: u64) -> bool {
        self.edited_within(now_ms, self.decay_ms)
    }

    /// Whether the last edit happened less than `window_ms` ago.
    pub fn edited_within(&self, now_ms: u64, window_ms: u64) -> bool {
        self.last_edit_ms
            .is_some_and(|at| now_ms.saturating_sub(at) < window_ms)
    }

    /// Still typing: active, and the last edit is inside `window_ms`.
    pub fn is_typing(&self, now_ms: u64, window_ms: u64) -> bool {
        self.is_active(now_ms) && self.edited_within(now_ms, window_ms)
    }

    pub fn last_saved_hash(&self) -> Option<&ContentHash> {
        self.last_saved_hash.as_ref()
    }

    /// Adopt `hash` as the saved baseline without touching the edit flags.
    pub fn set_last_saved_hash(&mut self, hash: Option<ContentHash>) {
        self.last_saved_hash = hash;
    }

    /// Record a confirmed save of `saved`. The edit flag clears only if the
    /// editor still shows exactly what was saved.
    pub fn confirm_saved(&mut self, saved: ContentHash, live: &ContentHash) {
        if &saved == live {
            self.has_user_edited = false;
            self.last_edit_ms = None;
        }
        self.last_saved_hash = Some(saved);
    }

    /// Forget pending edits, e.g. after the editor was overwritten.
    pub fn clear_edits(&mut self) {
        self.has_user_edited = false;
        self.last_edit_ms = None;
    }

    /// Whether the live content holds unsaved user work.
    ///
    /// Without a saved baseline, any edit since hydration counts. With one,
    /// the content must differ from it *and* the user must have edited; a
    /// difference without an edit is plugin noise.
    pub fn is_dirty(&self, live: &ContentHash) -> bool {
        match &self.last_saved_hash {
            None => self.has_user_edited,
            Some(saved) if saved == live => false,
            Some(_) => self.has_user_edited,
        }
    }
}
