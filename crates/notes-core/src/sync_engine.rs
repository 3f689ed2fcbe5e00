//! SyncEngine: reconciles the working set with the remote.
//!
//! Each cycle moves through Idle → Fetching → Merging → (Clean | Conflicted)
//! → Reconciled and always ends back at Idle. Conflicts are steady state:
//! they are recorded as commits carrying their markers, never surfaced as
//! crashes. Committed state is only mutated after the step that justifies it
//! succeeded.

use crate::config_guard::{ConfigGuard, RepoConfig};
use crate::error::{Operation, Result, StoreError, StoreResult, SyncError};
use crate::events::{EventBus, SyncEvent, SyncPhase, now_millis};
use crate::fs::FileSystem;
use crate::history::HistoryEntry;
use crate::session::Session;
use crate::store::{EntryKind, LOCAL_BRANCH, REMOTE_BRANCH, Revision, VersionStore};
use crate::working_set::{Note, NotesLayout, WorkingSet};
use futures::TryStreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Successful outcome of an engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    Synced,
    Offline,
    Pulled,
    Pushed,
    ConflictCommitted,
    /// A conflict was detected but left for the user.
    Conflict,
    /// Local divergent history was replaced by the remote tip.
    PulledDiscardingLocal,
    ResetToRemote,
    Cancelled,
    Saved,
    NoChanges,
    Removed,
    RemovedLocally,
    Created,
}

impl SyncStatus {
    pub fn label(self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Offline => "offline (local only)",
            SyncStatus::Pulled => "pulled",
            SyncStatus::Pushed => "pushed",
            SyncStatus::ConflictCommitted => "merge conflict (markers committed)",
            SyncStatus::Conflict => "merge conflict",
            SyncStatus::PulledDiscardingLocal => "pulled (local history discarded)",
            SyncStatus::ResetToRemote => "reset to remote",
            SyncStatus::Cancelled => "cancelled",
            SyncStatus::Saved => "saved",
            SyncStatus::NoChanges => "no changes",
            SyncStatus::Removed => "removed",
            SyncStatus::RemovedLocally => "removed locally",
            SyncStatus::Created => "created",
        }
    }
}

/// Divergence flags for one note between the local and remote tips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteMarker {
    /// The remote changed this note since the common ancestor.
    pub diff_from_origin: bool,
    /// Local commits changed this note since the common ancestor.
    pub locally_committed: bool,
}

/// What committing the open note's draft amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DraftCommit {
    Unchanged,
    Committed,
    /// History moved the note under the draft; both sides were committed
    /// with markers.
    Conflicted,
}

fn fail(operation: Operation) -> impl FnOnce(StoreError) -> SyncError {
    move |e| SyncError::failed(operation, e)
}

fn missing_newline(text: &str) -> &str {
    if text.is_empty() || text.ends_with('\n') { "" } else { "\n" }
}

/// Markers around a draft and the committed body it would have replaced.
fn draft_conflict_body(draft: &str, committed: &str) -> String {
    format!(
        "<<<<<<< draft\n{}{}=======\n{}{}>>>>>>> {}\n",
        draft,
        missing_newline(draft),
        committed,
        missing_newline(committed),
        REMOTE_BRANCH
    )
}

pub struct SyncEngine<F, S: ?Sized> {
    store: Arc<S>,
    notes: WorkingSet<F, S>,
    guard: ConfigGuard<S>,
    events: Arc<EventBus>,
}

impl<F: FileSystem, S: VersionStore + ?Sized> SyncEngine<F, S> {
    pub fn new(fs: F, store: Arc<S>, config: RepoConfig, layout: NotesLayout) -> Self {
        Self {
            notes: WorkingSet::new(fs, Arc::clone(&store), layout),
            guard: ConfigGuard::new(Arc::clone(&store), config),
            store,
            events: Arc::new(EventBus::new()),
        }
    }

    /// Share an existing event bus.
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn notes(&self) -> &WorkingSet<F, S> {
        &self.notes
    }

    pub fn config_guard(&self) -> &ConfigGuard<S> {
        &self.guard
    }

    /// Configure, fetch if possible, merge and load the working set.
    pub async fn bootstrap(&mut self) -> Result<SyncStatus> {
        let result = self.run_bootstrap().await;
        self.finish(Operation::Bootstrap, result)
    }

    async fn run_bootstrap(&mut self) -> Result<SyncStatus> {
        let op = Operation::Bootstrap;
        if !self.guard.is_configured().await {
            self.guard.apply_defaults().await.map_err(fail(op))?;
        }

        let online = self.fetch_or_offline(op).await;

        self.events.phase(op, SyncPhase::Merging);
        match self.store.merge(false).await {
            Ok(outcome) => {
                debug!("Bootstrap merge: {:?}", outcome);
                self.events.phase(op, SyncPhase::Clean);
                self.store.checkout(true).await.map_err(fail(op))?;
                self.reload(op).await?;
                Ok(if online {
                    SyncStatus::Synced
                } else {
                    SyncStatus::Offline
                })
            }
            Err(e) if e.is_conflict() => {
                self.events.phase(op, SyncPhase::Conflicted);
                let committed = self.commit_conflict_markers(op).await?;
                self.reload(op).await?;
                Ok(if committed {
                    SyncStatus::ConflictCommitted
                } else {
                    SyncStatus::Conflict
                })
            }
            Err(e) => Err(SyncError::failed(op, e)),
        }
    }

    /// Load the working set from disk without touching the network.
    pub async fn load_notes(&mut self) -> Result<usize> {
        self.reload(Operation::Load).await?;
        Ok(self.notes.notes().len())
    }

    /// Save pending edits, merge the remote in, then push.
    pub async fn publish(&mut self, session: &mut Session) -> Result<SyncStatus> {
        let result = self.run_publish(session).await;
        self.finish(Operation::Publish, result)
    }

    async fn run_publish(&mut self, session: &mut Session) -> Result<SyncStatus> {
        let op = Operation::Publish;
        if session.has_unsaved_edits() {
            self.commit_draft(op, session).await.map_err(fail(op))?;
        }

        self.events.phase(op, SyncPhase::Fetching);
        self.store.fetch().await.map_err(fail(op))?;

        self.events.phase(op, SyncPhase::Merging);
        match self.store.merge(false).await {
            Ok(outcome) => {
                debug!("Publish merge: {:?}", outcome);
                self.events.phase(op, SyncPhase::Clean);
                self.store.checkout(true).await.map_err(fail(op))?;
            }
            Err(e) if e.is_conflict() => {
                self.events.phase(op, SyncPhase::Conflicted);
                if !self.commit_conflict_markers(op).await? {
                    return Err(SyncError::failed(op, e));
                }
            }
            Err(e) => return Err(SyncError::failed(op, e)),
        }
        self.reload(op).await?;

        self.events.phase(op, SyncPhase::Pushing);
        match self.store.push().await {
            Ok(()) => Ok(SyncStatus::Pushed),
            Err(StoreError::PushRejected(reason)) => {
                warn!("Push rejected ({}); checking whether it already landed", reason);
                self.store.fetch().await.map_err(fail(op))?;
                let local = self.resolve(op, LOCAL_BRANCH).await?;
                let remote = self.resolve(op, REMOTE_BRANCH).await?;
                if local.is_some() && local == remote {
                    info!("Remote already at local tip");
                    Ok(SyncStatus::Pushed)
                } else {
                    Err(SyncError::failed(op, StoreError::PushRejected(reason)))
                }
            }
            Err(e) => Err(SyncError::failed(op, e)),
        }
    }

    /// Fetch and merge. Never overwrites unsaved edits.
    pub async fn pull(&mut self, session: &mut Session) -> Result<SyncStatus> {
        let result = self.run_pull(session).await;
        self.finish(Operation::Pull, result)
    }

    async fn run_pull(&mut self, session: &mut Session) -> Result<SyncStatus> {
        let op = Operation::Pull;
        self.pin_draft(session).await.map_err(fail(op))?;
        let online = self.fetch_or_offline(op).await;

        self.events.phase(op, SyncPhase::Merging);
        let conflict = match self.store.merge(false).await {
            Ok(outcome) => {
                debug!("Pull merge: {:?}", outcome);
                self.events.phase(op, SyncPhase::Clean);
                if session.has_unsaved_edits() {
                    debug!("Unsaved edits present; skipping forced checkout");
                } else {
                    self.store.checkout(true).await.map_err(fail(op))?;
                }
                self.reload(op).await?;
                // Runs even after a clean merge; a no-op without conflicts
                let marked = self.commit_conflict_markers(op).await?;
                let overtaken = self
                    .record_draft_conflict(op, session)
                    .await
                    .map_err(fail(op))?;
                if marked || overtaken {
                    self.reload(op).await?;
                    return Ok(SyncStatus::ConflictCommitted);
                }
                return Ok(if online {
                    SyncStatus::Pulled
                } else {
                    SyncStatus::Offline
                });
            }
            Err(e) if e.is_conflict() => e,
            Err(e) => return Err(SyncError::failed(op, e)),
        };

        self.events.phase(op, SyncPhase::Conflicted);
        let conflicted = self.store.conflicted_paths().await.map_err(fail(op))?;
        if !conflicted.is_empty() {
            self.commit_conflict_markers(op).await?;
            self.record_draft_conflict(op, session).await.map_err(fail(op))?;
            self.reload(op).await?;
            return Ok(SyncStatus::ConflictCommitted);
        }

        if session.has_unsaved_edits() {
            return Err(SyncError::failed(op, conflict));
        }

        // Nothing at stake locally: the remote wins
        match self.hard_reset_to_tracking(op).await {
            Ok(()) => {
                warn!("Discarded divergent local history in favour of the remote");
                self.reload(op).await?;
                Ok(SyncStatus::PulledDiscardingLocal)
            }
            Err(reset) => {
                warn!("Reset to remote failed ({}); committing markers instead", reset);
                let committed = self.commit_conflict_markers(op).await?;
                self.reload(op).await?;
                if committed {
                    Ok(SyncStatus::ConflictCommitted)
                } else {
                    Err(SyncError::failed(op, conflict))
                }
            }
        }
    }

    /// Make the working directory identical to the remote tip.
    ///
    /// `confirm` is consulted only when the session holds unsaved edits or is
    /// viewing history; answering no cancels without side effects.
    pub async fn reset_to_remote(
        &mut self,
        session: &mut Session,
        confirm: impl FnOnce(&Session) -> bool,
    ) -> Result<SyncStatus> {
        if session.has_state_at_stake() && !confirm(session) {
            return self.finish(Operation::ResetToRemote, Ok(SyncStatus::Cancelled));
        }
        let result = self.run_reset(session).await;
        self.finish(Operation::ResetToRemote, result)
    }

    async fn run_reset(&mut self, session: &mut Session) -> Result<SyncStatus> {
        let op = Operation::ResetToRemote;
        self.events.phase(op, SyncPhase::Fetching);
        self.store.fetch().await.map_err(fail(op))?;

        self.hard_reset_to_tracking(op).await?;

        let rows = self.store.status_matrix("").await.map_err(fail(op))?;
        for row in rows.iter().filter(|row| row.is_local_only()) {
            debug!("Removing local-only {}", row.path);
            self.notes.discard_path(&row.path).await.map_err(fail(op))?;
            match self.store.remove(&row.path).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(SyncError::failed(op, e)),
            }
        }

        session.close();
        self.reload(op).await?;
        Ok(SyncStatus::ResetToRemote)
    }

    /// Per-note divergence between the local and remote-tracking tips.
    ///
    /// Every loaded note gets an entry. `locally_committed` and
    /// `diff_from_origin` come from one-sided diffs against the merge base.
    pub async fn compute_note_markers(&self) -> Result<BTreeMap<String, NoteMarker>> {
        let op = Operation::Markers;
        let mut markers: BTreeMap<String, NoteMarker> = self
            .notes
            .notes()
            .iter()
            .map(|n| (n.id.clone(), NoteMarker::default()))
            .collect();

        let local = self.resolve(op, LOCAL_BRANCH).await?;
        let remote = self.resolve(op, REMOTE_BRANCH).await?;
        let (Some(local), Some(remote)) = (local, remote) else {
            return Ok(markers);
        };
        if local == remote {
            return Ok(markers);
        }

        let base = self
            .store
            .merge_base(&local, &remote)
            .await
            .map_err(fail(op))?;
        let (ahead, behind) = match base {
            Some(base) => (
                self.changed_paths(&base, &local).await?,
                self.changed_paths(&base, &remote).await?,
            ),
            None => {
                let changed = self.changed_paths(&local, &remote).await?;
                (changed.clone(), changed)
            }
        };

        let layout = self.notes.layout();
        for (id, marker) in markers.iter_mut() {
            let path = layout.path_for(id);
            marker.locally_committed = ahead.contains(&path);
            marker.diff_from_origin = behind.contains(&path);
        }
        Ok(markers)
    }

    /// Stage every conflicted path as it sits on disk and commit it.
    ///
    /// Returns `false` when nothing was conflicted.
    pub async fn commit_conflict_markers(&self, op: Operation) -> Result<bool> {
        let paths = self.store.conflicted_paths().await.map_err(fail(op))?;
        if paths.is_empty() {
            debug!("No conflicted paths, markers not committed");
            return Ok(false);
        }

        for path in &paths {
            self.store.add(path).await.map_err(fail(op))?;
        }

        let local = self.resolve(op, LOCAL_BRANCH).await?;
        let remote = self.resolve(op, REMOTE_BRANCH).await?;
        let parents = match (local, remote) {
            (Some(local), Some(remote)) if local != remote => Some(vec![local, remote]),
            (Some(local), _) => {
                warn!("Remote tip unavailable; recording conflict on {} alone", local.short());
                Some(vec![local])
            }
            (None, _) => None,
        };

        let message = format!("Merge {} with conflicts", REMOTE_BRANCH);
        let revision = self
            .store
            .commit(&message, parents.as_deref())
            .await
            .map_err(fail(op))?;

        info!("Committed conflict markers in {} file(s) as {}", paths.len(), revision.short());
        self.events.phase(op, SyncPhase::Reconciled);
        self.events.emit(SyncEvent::ConflictCommitted {
            paths,
            revision: revision.to_string(),
            timestamp: now_millis(),
        });
        Ok(true)
    }

    /// Create a new note from `body` and open it. The file is not committed.
    pub async fn create_note(&mut self, session: &mut Session, body: &str) -> Result<String> {
        let op = Operation::Create;
        let id = uuid::Uuid::new_v4().to_string();
        let result = self
            .notes
            .save(Note::new(id.as_str(), body))
            .await
            .map(|_| SyncStatus::Created)
            .map_err(fail(op));
        self.finish(op, result)?;
        session.open(id.as_str());
        Ok(id)
    }

    /// Write, stage and commit the open note's draft.
    pub async fn save_current(&mut self, session: &mut Session) -> Result<SyncStatus> {
        let op = Operation::Save;
        if session.current().is_none() {
            return Err(SyncError::NoOpenNote);
        }
        let result = self
            .commit_draft(op, session)
            .await
            .map(|outcome| match outcome {
                DraftCommit::Unchanged => SyncStatus::NoChanges,
                DraftCommit::Committed => SyncStatus::Saved,
                DraftCommit::Conflicted => SyncStatus::ConflictCommitted,
            })
            .map_err(fail(op));
        self.finish(op, result)
    }

    async fn commit_draft(
        &mut self,
        op: Operation,
        session: &mut Session,
    ) -> StoreResult<DraftCommit> {
        self.pin_draft(session).await?;
        if self.record_draft_conflict(op, session).await? {
            return Ok(DraftCommit::Conflicted);
        }

        let (Some(id), Some(body)) = (session.current(), session.draft()) else {
            return Ok(DraftCommit::Unchanged);
        };
        let (id, body) = (id.to_string(), body.to_string());

        let path = self.notes.save(Note::new(id.as_str(), body)).await?;
        self.store.add(&path).await?;

        let row = self.store.status(&path).await?;
        if row.is_tracked() && row.codes() == (1, 1, 1) {
            debug!("{} unchanged, nothing to commit", path);
            session.discard_edits();
            return Ok(DraftCommit::Unchanged);
        }

        self.store.commit(&format!("Update {}", id), None).await?;
        session.discard_edits();
        Ok(DraftCommit::Committed)
    }

    /// Remember the local tip an unpinned draft is being written against.
    async fn pin_draft(&self, session: &mut Session) -> StoreResult<()> {
        if !session.has_unsaved_edits() || session.draft_base().is_some() {
            return Ok(());
        }
        if let Some(tip) = self.local_tip().await? {
            session.pin_draft(tip);
        }
        Ok(())
    }

    /// The local tip, if it changed the open note since the draft was pinned.
    async fn tip_overtaking_draft(&self, session: &Session) -> StoreResult<Option<Revision>> {
        let (Some(id), Some(base)) = (session.current(), session.draft_base()) else {
            return Ok(None);
        };
        if !session.has_unsaved_edits() {
            return Ok(None);
        }
        let Some(tip) = self.local_tip().await? else {
            return Ok(None);
        };
        if &tip == base {
            return Ok(None);
        }
        let path = self.notes.layout().path_for(id);
        let before = self.store.blob_id(base, &path).await?;
        let after = self.store.blob_id(&tip, &path).await?;
        Ok((before != after).then_some(tip))
    }

    /// Commit the draft and the note's committed body side by side in
    /// markers when history changed the note under the draft.
    ///
    /// The session keeps the marked body as its draft, pinned to the new
    /// commit, so a later save is a no-op rather than an overwrite.
    async fn record_draft_conflict(
        &mut self,
        op: Operation,
        session: &mut Session,
    ) -> StoreResult<bool> {
        let Some(tip) = self.tip_overtaking_draft(session).await? else {
            return Ok(false);
        };
        let (Some(id), Some(draft)) = (session.current(), session.draft()) else {
            return Ok(false);
        };
        let (id, draft) = (id.to_string(), draft.to_string());
        let path = self.notes.layout().path_for(&id);

        let committed = self
            .store
            .read_blob(&tip, &path)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default();
        let marked = draft_conflict_body(&draft, &committed);

        self.notes.save(Note::new(id.as_str(), marked.as_str())).await?;
        self.store.add(&path).await?;
        let message = format!("Merge {} with conflicts", REMOTE_BRANCH);
        let revision = self.store.commit(&message, None).await?;

        warn!(
            "Draft of {} was overtaken by {}; committed both as {}",
            id,
            tip.short(),
            revision.short()
        );
        session.rebase_draft(marked, Some(revision.clone()));
        self.events.phase(op, SyncPhase::Reconciled);
        self.events.emit(SyncEvent::ConflictCommitted {
            paths: vec![path],
            revision: revision.to_string(),
            timestamp: now_millis(),
        });
        Ok(true)
    }

    async fn local_tip(&self) -> StoreResult<Option<Revision>> {
        match self.store.resolve_ref(LOCAL_BRANCH).await {
            Ok(revision) => Ok(revision),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Delete a note; commit the removal only if it was tracked.
    pub async fn delete_note(&mut self, session: &mut Session, id: &str) -> Result<SyncStatus> {
        let result = self.run_delete(session, id).await;
        self.finish(Operation::Delete, result)
    }

    async fn run_delete(&mut self, session: &mut Session, id: &str) -> Result<SyncStatus> {
        let op = Operation::Delete;
        let outcome = self.notes.delete(id).await.map_err(fail(op))?;
        if session.current() == Some(id) {
            session.close();
        }

        let path = self.notes.layout().path_for(id);
        if outcome.was_tracked {
            self.store.remove(&path).await.map_err(fail(op))?;
            self.store
                .commit(&format!("Delete {}", id), None)
                .await
                .map_err(fail(op))?;
            return Ok(SyncStatus::Removed);
        }

        if let Err(e) = self.store.remove(&path).await {
            if !e.is_not_found() {
                debug!("Unstaging {} failed: {}", path, e);
            }
        }
        Ok(SyncStatus::RemovedLocally)
    }

    /// Content history of a note, newest first.
    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.notes.layout().path_for(id);
        self.notes
            .history()
            .change_history(&path)
            .try_collect()
            .await
            .map_err(fail(Operation::History))
    }

    /// Read a note at a historical revision and enter history view.
    pub async fn view_revision(
        &self,
        session: &mut Session,
        id: &str,
        revision: &Revision,
    ) -> Result<String> {
        let op = Operation::History;
        let path = self.notes.layout().path_for(id);
        let bytes = self
            .store
            .read_blob(revision, &path)
            .await
            .map_err(fail(op))?
            .ok_or_else(|| SyncError::failed(op, StoreError::NotFound(path.clone())))?;
        let body = String::from_utf8(bytes).map_err(|_| {
            SyncError::failed(op, crate::fs::FsError::InvalidUtf8(path.clone()))
        })?;
        session.view(id, revision.clone());
        Ok(body)
    }

    async fn fetch_or_offline(&self, op: Operation) -> bool {
        self.events.phase(op, SyncPhase::Fetching);
        match self.store.fetch().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Fetch failed, continuing offline: {}", e);
                false
            }
        }
    }

    async fn hard_reset_to_tracking(&self, op: Operation) -> Result<()> {
        let remote = self
            .resolve(op, REMOTE_BRANCH)
            .await?
            .ok_or_else(|| SyncError::failed(op, StoreError::NotFound(REMOTE_BRANCH.into())))?;
        let previous = self.resolve(op, LOCAL_BRANCH).await?;
        self.store
            .write_ref(LOCAL_BRANCH, &remote)
            .await
            .map_err(fail(op))?;
        if let Err(e) = self.store.checkout(true).await {
            if let Some(previous) = previous {
                if let Err(restore) = self.store.write_ref(LOCAL_BRANCH, &previous).await {
                    warn!("Could not restore {} to {}: {}", LOCAL_BRANCH, previous.short(), restore);
                }
            }
            return Err(SyncError::failed(op, e));
        }
        info!("Local branch reset to {}", remote.short());
        Ok(())
    }

    async fn resolve(&self, op: Operation, name: &str) -> Result<Option<Revision>> {
        match self.store.resolve_ref(name).await {
            Ok(revision) => Ok(revision),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(SyncError::failed(op, e)),
        }
    }

    async fn changed_paths(&self, from: &Revision, to: &Revision) -> Result<BTreeSet<String>> {
        let changes = self
            .store
            .diff_trees(from, to, self.notes.layout().dir())
            .await
            .map_err(fail(Operation::Markers))?;
        Ok(changes
            .into_iter()
            .filter(|c| c.kind == EntryKind::Blob)
            .map(|c| c.path)
            .collect())
    }

    async fn reload(&mut self, op: Operation) -> Result<()> {
        self.notes.load_all().await.map_err(fail(op))?;
        self.events.emit(SyncEvent::NotesReloaded {
            count: self.notes.notes().len(),
            timestamp: now_millis(),
        });
        Ok(())
    }

    fn finish(&self, operation: Operation, result: Result<SyncStatus>) -> Result<SyncStatus> {
        let (label, ok) = match &result {
            Ok(status) => {
                info!("{}: {}", operation, status.label());
                (status.label().to_string(), true)
            }
            Err(e) => {
                warn!("{}: {}", operation, e);
                (e.label(), false)
            }
        };
        self.events.phase(operation, SyncPhase::Idle);
        self.events.emit(SyncEvent::StatusChanged {
            operation,
            label,
            ok,
            timestamp: now_millis(),
        });
        result
    }
}
