//! notes-core: local synchronization engine for git-backed notes.
//!
//! This crate provides:
//! - Parsing/serializing note bodies with a metadata block (`codec`)
//! - Per-file change history from the commit graph (`history`)
//! - The in-memory working set of notes (`working_set`)
//! - Fetch/merge/push orchestration with conflict recording (`sync_engine`)
//! - Repository configuration checks (`config_guard`)
//! - FileSystem and VersionStore trait abstractions

pub mod codec;
pub mod config_guard;
pub mod error;
pub mod events;
pub mod fs;
pub mod history;
pub mod session;
pub mod store;
pub mod sync_engine;
pub mod working_set;

#[cfg(test)]
pub(crate) mod testing;

pub use codec::{FieldValue, ParsedNote};
pub use config_guard::{ConfigGuard, RepoConfig};
pub use error::{Operation, StoreError, StoreResult, SyncError};
pub use events::{EventBus, Subscription, SyncEvent, SyncPhase};
pub use fs::{FileEntry, FileStat, FileSystem, FsError, InMemoryFs};
pub use history::{HistoryEntry, HistoryIndex};
pub use session::Session;
pub use store::{
    CommitInfo, ContentHash, EntryKind, MergeOutcome, Revision, StatusRow, TreeChange,
    VersionStore,
};
pub use sync_engine::{NoteMarker, SyncEngine, SyncStatus};
pub use working_set::{DeleteOutcome, Note, NotesLayout, WorkingSet};
