//! WorkingSet: the in-memory note list mirroring the working directory.
//!
//! Owns file I/O for notes. Staging and committing belong to the sync engine.

use crate::codec::{self, ParsedNote};
use crate::error::{StoreError, StoreResult};
use crate::fs::{FileSystem, FsError};
use crate::history::HistoryIndex;
use crate::store::VersionStore;
use futures::{Stream, TryStreamExt, stream};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A persisted note.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: String,
    pub body: String,
    /// Milliseconds since epoch; from metadata, else from history.
    pub updated_at: Option<i64>,
}

impl Note {
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            updated_at: None,
        }
    }

    pub fn parsed(&self) -> ParsedNote {
        codec::parse(&self.body)
    }

    pub fn title(&self) -> String {
        codec::compose_title(&self.parsed())
    }

    pub fn tags(&self) -> Vec<String> {
        codec::extract_tags(&self.parsed())
    }
}

/// Where notes live inside the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotesLayout {
    dir: String,
    extension: String,
}

impl Default for NotesLayout {
    fn default() -> Self {
        Self::new("notes", ".md")
    }
}

impl NotesLayout {
    pub fn new(dir: impl Into<String>, extension: impl Into<String>) -> Self {
        let dir: String = dir.into();
        Self {
            dir: dir.trim_matches('/').to_string(),
            extension: extension.into(),
        }
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Repository-relative storage path for a note id.
    pub fn path_for(&self, id: &str) -> String {
        if self.dir.is_empty() {
            format!("{}{}", id, self.extension)
        } else {
            format!("{}/{}{}", self.dir, id, self.extension)
        }
    }

    /// Inverse of `path_for`; `None` for paths that are not notes.
    pub fn id_for(&self, path: &str) -> Option<String> {
        let rest = if self.dir.is_empty() {
            path
        } else {
            path.strip_prefix(&self.dir)?.strip_prefix('/')?
        };
        let id = rest.strip_suffix(&self.extension)?;
        Self::is_valid_id(id).then(|| id.to_string())
    }

    /// Ids may nest in subdirectories but never escape the notes directory.
    pub fn is_valid_id(id: &str) -> bool {
        !id.is_empty()
            && !id.starts_with('/')
            && id
                .split('/')
                .all(|part| !part.is_empty() && part != "." && part != ".." && !part.starts_with('.'))
    }
}

/// Result of `WorkingSet::delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// The file was recorded in the committed history.
    pub was_tracked: bool,
}

struct Walk {
    dirs: Vec<String>,
    files: VecDeque<String>,
}

pub struct WorkingSet<F, S: ?Sized> {
    fs: F,
    store: Arc<S>,
    history: HistoryIndex<S>,
    layout: NotesLayout,
    notes: Vec<Note>,
}

impl<F: FileSystem, S: VersionStore + ?Sized> WorkingSet<F, S> {
    pub fn new(fs: F, store: Arc<S>, layout: NotesLayout) -> Self {
        Self {
            history: HistoryIndex::new(Arc::clone(&store)),
            fs,
            store,
            layout,
            notes: Vec::new(),
        }
    }

    /// Notes sorted newest first.
    pub fn notes(&self) -> &[Note] {
        &self.notes
    }

    pub fn get(&self, id: &str) -> Option<&Note> {
        self.notes.iter().find(|n| n.id == id)
    }

    pub fn layout(&self) -> &NotesLayout {
        &self.layout
    }

    pub fn history(&self) -> &HistoryIndex<S> {
        &self.history
    }

    /// Note files under the notes directory, depth-first.
    ///
    /// Lazy and restartable; a missing notes directory yields nothing.
    pub fn note_files(&self) -> impl Stream<Item = Result<String, FsError>> + '_ {
        let walk = Walk {
            dirs: vec![self.layout.dir().to_string()],
            files: VecDeque::new(),
        };
        stream::unfold(Some(walk), move |walk| async move {
            let mut walk = walk?;
            loop {
                if let Some(file) = walk.files.pop_front() {
                    return Some((Ok(file), Some(walk)));
                }
                let dir = walk.dirs.pop()?;
                let mut entries = match self.fs.list(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Some((Err(e), None)),
                };
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                for entry in entries.into_iter().rev() {
                    if entry.name.starts_with('.') {
                        continue;
                    }
                    let path = if dir.is_empty() {
                        entry.name
                    } else {
                        format!("{}/{}", dir, entry.name)
                    };
                    if entry.is_dir {
                        walk.dirs.push(path);
                    } else if self.layout.id_for(&path).is_some() {
                        walk.files.push_front(path);
                    }
                }
            }
        })
    }

    /// Rebuild the in-memory set from disk.
    pub async fn load_all(&mut self) -> StoreResult<()> {
        let paths: Vec<String> = self.note_files().try_collect().await?;

        let mut notes = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.read_note(path).await {
                Ok(note) => notes.push(note),
                Err(StoreError::Fs(FsError::InvalidUtf8(path))) => {
                    warn!("Skipping non-UTF-8 note file {}", path);
                }
                Err(e) if e.is_not_found() => debug!("{} vanished during load", path),
                Err(e) => return Err(e),
            }
        }

        self.notes = notes;
        self.sort();
        info!("Loaded {} notes", self.notes.len());
        Ok(())
    }

    /// Read one note file and derive its timestamp.
    pub async fn read_note(&self, path: &str) -> StoreResult<Note> {
        let id = self
            .layout
            .id_for(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let body = self.fs.read_to_string(path).await?;
        let updated_at = match codec::extract_updated_at(&codec::parse(&body)) {
            Some(explicit) => Some(explicit),
            None => self.history.latest_change_timestamp(path).await,
        };
        Ok(Note {
            id,
            body,
            updated_at,
        })
    }

    /// Write a note to disk and upsert it. Returns its storage path.
    pub async fn save(&mut self, mut note: Note) -> StoreResult<String> {
        if !NotesLayout::is_valid_id(&note.id) {
            return Err(StoreError::Other(format!("invalid note id: {}", note.id)));
        }
        let path = self.layout.path_for(&note.id);
        self.fs.write(&path, note.body.as_bytes()).await?;

        note.updated_at = codec::extract_updated_at(&note.parsed())
            .or_else(|| Some(chrono::Utc::now().timestamp_millis()));

        match self.notes.iter_mut().find(|n| n.id == note.id) {
            Some(existing) => *existing = note,
            None => self.notes.push(note),
        }
        self.sort();
        debug!("Saved {}", path);
        Ok(path)
    }

    /// Remove a note from disk and from the set.
    pub async fn delete(&mut self, id: &str) -> StoreResult<DeleteOutcome> {
        let path = self.layout.path_for(id);
        let was_tracked = match self.store.status(&path).await {
            Ok(row) => row.is_tracked(),
            Err(e) if e.is_not_found() => false,
            Err(e) => return Err(e),
        };
        self.discard_path(&path).await?;
        debug!("Deleted {} (tracked: {})", path, was_tracked);
        Ok(DeleteOutcome { was_tracked })
    }

    /// Remove a file from disk, tolerating its absence, and drop the matching
    /// note if the path is one.
    pub async fn discard_path(&mut self, path: &str) -> StoreResult<()> {
        match self.fs.delete(path).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(id) = self.layout.id_for(path) {
            self.notes.retain(|n| n.id != id);
        }
        Ok(())
    }

    /// Every tag across the loaded notes, case-sensitive and sorted.
    pub fn tags_across_notes(&self) -> BTreeSet<String> {
        self.notes.iter().flat_map(|n| n.tags()).collect()
    }

    fn sort(&mut self) {
        // Newest first; unknown timestamps sort as oldest
        self.notes.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
    }
}
