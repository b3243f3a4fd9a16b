//! Remote change notifications.
//!
//! Provides `RemoteEvent` for conflict and remote-update signals and `EventBus`
//! for subscriptions. Platform-specific implementations handle thread safety:
//! - Native: `Arc<EventBus>` with `RwLock` for multi-threaded runtimes
//! - WASM: `Rc<EventBus>` with `RefCell` for the single-threaded browser

use serde::{Deserialize, Serialize};

use crate::canonical::RawContent;

/// What the remote side is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemoteEventKind {
    /// The remote store saw a conflicting write.
    Conflict,
    /// A fetch found a newer version on the server.
    RemoteUpdate,
}

/// A remote change for one document, carrying the remote version and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    #[serde(rename = "type")]
    pub kind: RemoteEventKind,
    pub note_id: String,
    pub panel_id: String,
    pub version: u64,
    pub content: RawContent,
    /// Free-form explanation from the remote store, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RemoteEvent {
    pub fn conflict(
        note_id: impl Into<String>,
        panel_id: impl Into<String>,
        version: u64,
        content: RawContent,
    ) -> Self {
        Self {
            kind: RemoteEventKind::Conflict,
            note_id: note_id.into(),
            panel_id: panel_id.into(),
            version,
            content,
            reason: None,
        }
    }

    pub fn remote_update(
        note_id: impl Into<String>,
        panel_id: impl Into<String>,
        version: u64,
        content: RawContent,
    ) -> Self {
        Self {
            kind: RemoteEventKind::RemoteUpdate,
            note_id: note_id.into(),
            panel_id: panel_id.into(),
            version,
            content,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Whether this event targets the given document.
    pub fn is_for(&self, note_id: &str, panel_id: &str) -> bool {
        self.note_id == note_id && self.panel_id == panel_id
    }
}

// ============================================================================
// Native (multi-threaded) implementation
// ============================================================================

#[cfg(not(target_arch = "wasm32"))]
mod platform {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, RwLock, Weak};

    /// How an `EventBus` is shared on this platform.
    pub type SharedEventBus = Arc<EventBus>;

    /// Callback type accepted by `RemoteStore::subscribe`.
    pub type EventCallback = Box<dyn Fn(RemoteEvent) + Send + Sync>;

    /// Handle that unsubscribes when dropped.
    pub struct Subscription {
        bus: Weak<EventBus>,
        id: usize,
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unsubscribe(self.id);
            }
        }
    }

    /// Publishes remote events to subscribers. Wrap in `Arc` to subscribe.
    pub struct EventBus {
        callbacks: RwLock<Vec<(usize, Arc<dyn Fn(RemoteEvent) + Send + Sync>)>>,
        next_id: AtomicUsize,
    }

    impl Default for EventBus {
        fn default() -> Self {
            Self {
                callbacks: RwLock::new(Vec::new()),
                next_id: AtomicUsize::new(0),
            }
        }
    }

    impl EventBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn subscribe(
            self: &Arc<Self>,
            callback: impl Fn(RemoteEvent) + Send + Sync + 'static,
        ) -> Subscription {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.callbacks
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .push((id, Arc::new(callback)));
            Subscription {
                bus: Arc::downgrade(self),
                id,
            }
        }

        fn unsubscribe(&self, id: usize) {
            // try_write: Drop may run while emit holds the read lock
            if let Ok(mut guard) = self.callbacks.try_write() {
                guard.retain(|(i, _)| *i != id);
            }
        }

        pub fn subscriber_count(&self) -> usize {
            self.callbacks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len()
        }

        pub fn emit(&self, event: RemoteEvent) {
            let callbacks: Vec<_> = self
                .callbacks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();

            for callback in callbacks {
                callback(event.clone());
            }
        }
    }
}

// ============================================================================
// WASM (single-threaded) implementation
// ============================================================================

#[cfg(target_arch = "wasm32")]
mod platform {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::{Rc, Weak};

    /// How an `EventBus` is shared on this platform.
    pub type SharedEventBus = Rc<EventBus>;

    /// Callback type accepted by `RemoteStore::subscribe`.
    pub type EventCallback = Box<dyn Fn(RemoteEvent)>;

    /// Handle that unsubscribes when dropped.
    pub struct Subscription {
        bus: Weak<EventBus>,
        id: usize,
    }

    impl Drop for Subscription {
        fn drop(&mut self) {
            if let Some(bus) = self.bus.upgrade() {
                bus.unsubscribe(self.id);
            }
        }
    }

    /// Publishes remote events to subscribers. Wrap in `Rc` to subscribe.
    pub struct EventBus {
        callbacks: RefCell<Vec<(usize, Rc<dyn Fn(RemoteEvent)>)>>,
        next_id: Cell<usize>,
    }

    impl Default for EventBus {
        fn default() -> Self {
            Self {
                callbacks: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
            }
        }
    }

    impl EventBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn subscribe(
            self: &Rc<Self>,
            callback: impl Fn(RemoteEvent) + 'static,
        ) -> Subscription {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            self.callbacks.borrow_mut().push((id, Rc::new(callback)));
            Subscription {
                bus: Rc::downgrade(self),
                id,
            }
        }

        fn unsubscribe(&self, id: usize) {
            if let Ok(mut callbacks) = self.callbacks.try_borrow_mut() {
                callbacks.retain(|(i, _)| *i != id);
            }
        }

        pub fn subscriber_count(&self) -> usize {
            self.callbacks.borrow().len()
        }

        pub fn emit(&self, event: RemoteEvent) {
            // Snapshot so a callback may subscribe without a RefCell panic
            let callbacks: Vec<_> = self
                .callbacks
                .borrow()
                .iter()
                .map(|(_, cb)| Rc::clone(cb))
                .collect();

            for callback in callbacks {
                callback(event.clone());
            }
        }
    }
}

pub use platform::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalDoc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[cfg(not(target_arch = "wasm32"))]
    use std::sync::Arc;

    fn update(version: u64) -> RemoteEvent {
        let doc = CanonicalDoc::from_paragraphs(&["remote"]);
        RemoteEvent::remote_update("note-1", "panel-1", version, RawContent::from(&doc))
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |event| {
            assert_eq!(event.version, 7);
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(update(7));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[cfg(not(target_arch = "wasm32"))]
    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let sub = bus.subscribe(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });
        bus.emit(update(1));
        assert_eq!(bus.subscriber_count(), 1);

        drop(sub);
        bus.emit(update(2));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_is_for_matches_both_ids() {
        let event = update(1);
        assert!(event.is_for("note-1", "panel-1"));
        assert!(!event.is_for("note-1", "panel-2"));
        assert!(!event.is_for("note-2", "panel-1"));
    }

    #[test]
    fn test_event_serialization() {
        let event = RemoteEvent::conflict(
            "n",
            "p",
            3,
            RawContent::Markup("<p>x</p>".into()),
        )
        .with_reason("version mismatch");

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"conflict\""));
        assert!(json.contains("\"noteId\":\"n\""));
        assert!(json.contains("\"panelId\":\"p\""));
        assert!(json.contains("\"content\":\"<p>x</p>\""));
        assert!(json.contains("\"reason\":\"version mismatch\""));

        let back: RemoteEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
