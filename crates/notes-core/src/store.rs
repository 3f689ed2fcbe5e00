//! VersionStore: the seam to the versioned storage engine.
//!
//! The engine owns the object store, commit graph, merge algorithm and
//! transport. This crate only reasons about two refs: the local branch
//! (`main`) and its remote-tracking mirror (`origin/main`).

use crate::error::StoreResult;
use async_trait::async_trait;
use std::fmt;

/// Local branch ref.
pub const LOCAL_BRANCH: &str = "main";
/// Remote-tracking ref, updated only by fetch.
pub const REMOTE_BRANCH: &str = "origin/main";
/// Mirrors every remote branch head into the remote-tracking namespace.
pub const FETCH_REFSPEC: &str = "+refs/heads/*:refs/remotes/origin/*";

/// A commit identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for display.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(8)]
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier derived from file content; equal iff content is byte-identical.
pub type ContentHash = String;

/// One commit as reported by `log`.
#[derive(Debug, Clone)]
pub struct CommitInfo {
    pub revision: Revision,
    /// Parents in order; the first parent is the mainline.
    pub parents: Vec<Revision>,
    /// Author time in seconds since epoch.
    pub author_time: i64,
    pub message: String,
}

/// What a successful merge did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No remote-tracking ref to merge from.
    NoRemote,
    /// Local already contains the remote tip.
    UpToDate,
    /// Local ref moved forward to the remote tip.
    FastForward { revision: Revision },
    /// A merge commit was recorded.
    Merged { revision: Revision },
}

/// Presence of a path in the HEAD tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadState {
    Absent = 0,
    Present = 1,
}

/// Presence of a path in the working directory, relative to HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkdirState {
    Absent = 0,
    SameAsHead = 1,
    DiffersFromHead = 2,
}

/// Presence of a path in the staging area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Absent = 0,
    SameAsHead = 1,
    SameAsWorkdir = 2,
    DiffersFromBoth = 3,
}

/// Three-way status of one path (head / workdir / stage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub path: String,
    pub head: HeadState,
    pub workdir: WorkdirState,
    pub stage: StageState,
}

impl StatusRow {
    /// Classify a path from its content identity on each side.
    pub fn from_versions<T: PartialEq>(
        path: impl Into<String>,
        head: Option<&T>,
        workdir: Option<&T>,
        stage: Option<&T>,
    ) -> Self {
        let head_state = match head {
            Some(_) => HeadState::Present,
            None => HeadState::Absent,
        };
        let workdir_state = match workdir {
            None => WorkdirState::Absent,
            Some(w) if head == Some(w) => WorkdirState::SameAsHead,
            Some(_) => WorkdirState::DiffersFromHead,
        };
        let stage_state = match stage {
            None => StageState::Absent,
            Some(s) if head == Some(s) => StageState::SameAsHead,
            Some(s) if workdir == Some(s) => StageState::SameAsWorkdir,
            Some(_) => StageState::DiffersFromBoth,
        };
        Self {
            path: path.into(),
            head: head_state,
            workdir: workdir_state,
            stage: stage_state,
        }
    }

    /// The path is recorded in the committed history.
    pub fn is_tracked(&self) -> bool {
        self.head == HeadState::Present
    }

    /// Present locally (on disk or staged) but not in HEAD.
    pub fn is_local_only(&self) -> bool {
        self.head == HeadState::Absent
            && (self.workdir != WorkdirState::Absent || self.stage != StageState::Absent)
    }

    pub fn codes(&self) -> (u8, u8, u8) {
        (self.head as u8, self.workdir as u8, self.stage as u8)
    }
}

/// Whether `path` sits at or below the directory `prefix` ("" matches all).
pub fn under_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    prefix.is_empty()
        || path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Kind of entry reported by a tree diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Blob,
    Tree,
}

/// One path that differs between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub kind: EntryKind,
    /// Content hash on the left side, `None` when absent there.
    pub before: Option<ContentHash>,
    /// Content hash on the right side, `None` when absent there.
    pub after: Option<ContentHash>,
}

/// Primitives consumed from the versioned storage engine.
///
/// Absence is reported as `Ok(None)` wherever it is a valid state; hard
/// failures use the `StoreError` taxonomy.
#[async_trait]
pub trait VersionStore: Send + Sync {
    /// Update the remote-tracking ref from the remote.
    async fn fetch(&self) -> StoreResult<()>;

    /// Merge the remote-tracking ref into the local branch.
    ///
    /// With `abort_on_conflict == false` a conflicting merge leaves conflict
    /// markers in the working tree and conflicts in the index, then fails with
    /// `StoreError::MergeConflict`.
    async fn merge(&self, abort_on_conflict: bool) -> StoreResult<MergeOutcome>;

    /// Push the local branch to the remote.
    async fn push(&self) -> StoreResult<()>;

    /// Stage a path exactly as it sits on disk.
    async fn add(&self, path: &str) -> StoreResult<()>;

    /// Remove a path from the staging area (the file on disk is untouched).
    async fn remove(&self, path: &str) -> StoreResult<()>;

    /// Commit the staging area and move the local branch to the result.
    ///
    /// `parents == None` means "the current local tip, if any".
    async fn commit(&self, message: &str, parents: Option<&[Revision]>) -> StoreResult<Revision>;

    /// Status of a single path.
    async fn status(&self, path: &str) -> StoreResult<StatusRow>;

    /// Status of every path under `prefix` that is present anywhere.
    async fn status_matrix(&self, prefix: &str) -> StoreResult<Vec<StatusRow>>;

    /// Paths with unresolved conflict entries in the staging area.
    async fn conflicted_paths(&self) -> StoreResult<Vec<String>>;

    /// Resolve a ref name (`main`, `origin/main`) to a revision.
    async fn resolve_ref(&self, name: &str) -> StoreResult<Option<Revision>>;

    /// Point a ref at a revision, unconditionally.
    async fn write_ref(&self, name: &str, revision: &Revision) -> StoreResult<()>;

    /// Materialize the local tip into the working directory.
    ///
    /// `force` discards local modifications and resets the staging area.
    async fn checkout(&self, force: bool) -> StoreResult<()>;

    /// Content hash of `path` at `revision`.
    async fn blob_id(&self, revision: &Revision, path: &str) -> StoreResult<Option<ContentHash>>;

    /// Content of `path` at `revision`.
    async fn read_blob(&self, revision: &Revision, path: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Commits reachable from the local tip, newest first, optionally
    /// limited to commits that touched `path`.
    async fn log(&self, path: Option<&str>) -> StoreResult<Vec<CommitInfo>>;

    /// The first `limit` entries of [`log`](Self::log).
    ///
    /// Stores that walk history lazily should stop after `limit` matches
    /// instead of reading the whole log.
    async fn recent_log(&self, path: Option<&str>, limit: usize) -> StoreResult<Vec<CommitInfo>> {
        let mut commits = self.log(path).await?;
        commits.truncate(limit);
        Ok(commits)
    }

    /// Structural diff between two revisions restricted to `prefix`.
    async fn diff_trees(
        &self,
        from: &Revision,
        to: &Revision,
        prefix: &str,
    ) -> StoreResult<Vec<TreeChange>>;

    /// Best common ancestor of two revisions.
    async fn merge_base(&self, a: &Revision, b: &Revision) -> StoreResult<Option<Revision>>;

    async fn get_config(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set_config(&self, key: &str, value: &str) -> StoreResult<()>;
}
