//! panel-sync: local-first document sync for canvas note panels.
//!
//! This crate provides the core functionality for:
//! - Canonicalizing editor documents and hashing them for change detection
//! - A durable pending-save log that survives reloads and crashes
//! - Telling genuine user edits apart from editor plugin noise
//! - Debounced, two-phase (local then remote) saving
//! - Resolving remote updates and conflicts without silently losing edits
//!
//! `DocumentSession` ties these together for one open document. The remote
//! store, the editor, and local storage are traits so the same logic runs
//! natively and in the browser (see panel-sync-wasm).

pub mod canonical;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod editor;
pub mod events;
pub mod markup;
pub mod notification;
pub mod pending;
pub mod remote;
pub mod resolver;
pub mod session;
pub mod storage;
pub mod tracker;

pub use canonical::{CanonicalDoc, ContentHash, Mark, Node, RawContent, canonicalize};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, SyncConfig};
pub use coordinator::{SaveCoordinator, SavedDocument, ScheduledSave};
pub use editor::{EditorSurface, MemoryEditor};
pub use events::{EventBus, EventCallback, RemoteEvent, RemoteEventKind, SharedEventBus, Subscription};
pub use markup::{MarkupError, Schema};
pub use notification::SyncNotification;
pub use pending::{PendingSaveLog, PendingSaveRecord};
pub use remote::{DocKey, InMemoryRemote, RemoteError, RemoteStore, SaveOptions};
pub use resolver::{ConflictResolver, Decision, IgnoreReason, RemoteUpdate, ResolverState, VersionLedger};
pub use session::{DocumentSession, DocumentSwitcher, LoadTicket, SessionError};
pub use storage::{InMemoryStore, LocalStore, StorageError};
pub use tracker::EditTracker;

#[cfg(not(target_arch = "wasm32"))]
pub use storage::FileStore;
