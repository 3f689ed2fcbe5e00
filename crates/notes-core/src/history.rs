//! HistoryIndex: per-file change history from the commit graph.
//!
//! The storage engine's path-filtered log can include commits that touched a
//! path without changing its content (merges, tree rewrites). Each commit is
//! therefore compared against its first parent and kept only when the
//! content hash actually differs.

use crate::error::{StoreError, StoreResult};
use crate::store::{CommitInfo, ContentHash, Revision, VersionStore};
use futures::{Stream, StreamExt, stream};
use std::collections::VecDeque;
use std::pin::pin;
use std::sync::Arc;
use tracing::debug;

/// Commits read before falling back to the full log when looking for the
/// newest change.
const RECENT_WINDOW: usize = 16;

/// A commit that changed a file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub revision: Revision,
    /// Author time in seconds since epoch
    pub author_time: i64,
}

impl HistoryEntry {
    pub fn timestamp_millis(&self) -> i64 {
        self.author_time.saturating_mul(1000)
    }
}

pub struct HistoryIndex<S: ?Sized> {
    store: Arc<S>,
}

impl<S: ?Sized> Clone for HistoryIndex<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

enum Walk {
    Start,
    Pending(VecDeque<CommitInfo>),
    Done,
}

impl<S: VersionStore + ?Sized> HistoryIndex<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Commits that changed `path`, newest first.
    ///
    /// Lazy: the log is read on first poll and each commit is compared with
    /// its parent only when the consumer asks for the next entry. Every call
    /// re-queries the commit graph.
    pub fn change_history<'a>(
        &'a self,
        path: &'a str,
    ) -> impl Stream<Item = StoreResult<HistoryEntry>> + Send + 'a {
        stream::unfold(Walk::Start, move |walk| async move {
            let mut queue = match walk {
                Walk::Done => return None,
                Walk::Start => match self.store.log(Some(path)).await {
                    Ok(commits) => VecDeque::from(commits),
                    Err(e) if e.is_not_found() => return None,
                    Err(e) => return Some((Err(e), Walk::Done)),
                },
                Walk::Pending(queue) => queue,
            };

            while let Some(commit) = queue.pop_front() {
                match self.content_changed(&commit, path).await {
                    Ok(true) => {
                        let entry = HistoryEntry {
                            revision: commit.revision,
                            author_time: commit.author_time,
                        };
                        return Some((Ok(entry), Walk::Pending(queue)));
                    }
                    Ok(false) => {
                        debug!("{} unchanged in {}", path, commit.revision.short());
                    }
                    Err(e) => return Some((Err(e), Walk::Done)),
                }
            }

            None
        })
    }

    /// Millisecond timestamp of the newest content change, if any.
    ///
    /// Best-effort: history failures are logged and reported as absent.
    pub async fn latest_change_timestamp(&self, path: &str) -> Option<i64> {
        match self.latest_change(path).await {
            Ok(entry) => entry.map(|e| e.timestamp_millis()),
            Err(e) => {
                debug!("History unavailable for {}: {}", path, e);
                None
            }
        }
    }

    /// Newest commit that changed `path`.
    ///
    /// Reads only the most recent commits touching the path; the full log is
    /// walked only when all of those left its content alone.
    pub async fn latest_change(&self, path: &str) -> StoreResult<Option<HistoryEntry>> {
        let recent = match self.store.recent_log(Some(path), RECENT_WINDOW).await {
            Ok(commits) => commits,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let exhausted = recent.len() < RECENT_WINDOW;
        for commit in recent {
            if self.content_changed(&commit, path).await? {
                return Ok(Some(HistoryEntry {
                    revision: commit.revision,
                    author_time: commit.author_time,
                }));
            }
        }
        if exhausted {
            return Ok(None);
        }

        let mut history = pin!(self.change_history(path));
        history.next().await.transpose()
    }

    async fn content_changed(&self, commit: &CommitInfo, path: &str) -> StoreResult<bool> {
        let current = self.hash_at(&commit.revision, path).await?;
        let Some(parent) = commit.parents.first() else {
            // Root commit
            return Ok(true);
        };
        let previous = self.hash_at(parent, path).await?;
        Ok(current != previous)
    }

    async fn hash_at(&self, revision: &Revision, path: &str) -> StoreResult<Option<ContentHash>> {
        match self.store.blob_id(revision, path).await {
            Ok(hash) => Ok(hash),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
