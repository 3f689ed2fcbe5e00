//! In-memory VersionStore for unit tests.
//!
//! Models a single local branch, its remote-tracking ref and a remote tip,
//! with a working directory backed by `InMemoryFs`. Merges are resolved per
//! path against the merge base; anything both sides changed differently is
//! a conflict.

use crate::error::{StoreError, StoreResult};
use crate::fs::InMemoryFs;
use crate::store::{
    CommitInfo, ContentHash, EntryKind, LOCAL_BRANCH, MergeOutcome, REMOTE_BRANCH, Revision,
    StatusRow, TreeChange, VersionStore, under_prefix,
};
use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushMode {
    Accept,
    /// Someone else pushed the same tip first; ours is reported as rejected.
    RaceToSameTip,
    Reject,
}

struct Commit {
    tree: Tree,
    parents: Vec<Revision>,
    time: i64,
    message: String,
}

struct State {
    commits: HashMap<Revision, Commit>,
    refs: HashMap<String, Revision>,
    remote: Option<Revision>,
    index: Tree,
    conflicts: BTreeSet<String>,
    config: BTreeMap<String, String>,
    config_writes: usize,
    unreadable_config: bool,
    offline: bool,
    push_mode: PushMode,
    fail_log: bool,
    full_log_reads: usize,
    fail_commit: bool,
    fail_checkout: bool,
    refuse_markers: bool,
    clock: i64,
    next_id: u64,
}

impl State {
    fn new_commit(&mut self, tree: Tree, parents: Vec<Revision>, time: i64, message: &str) -> Revision {
        self.next_id += 1;
        let revision = Revision::new(format!("c{:07}", self.next_id));
        self.clock = self.clock.max(time);
        self.commits.insert(
            revision.clone(),
            Commit {
                tree,
                parents,
                time,
                message: message.to_string(),
            },
        );
        revision
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn local(&self) -> Option<Revision> {
        self.refs.get(LOCAL_BRANCH).cloned()
    }

    fn tree(&self, revision: Option<&Revision>) -> Tree {
        revision
            .and_then(|r| self.commits.get(r))
            .map(|c| c.tree.clone())
            .unwrap_or_default()
    }

    fn commit(&self, revision: &Revision) -> StoreResult<&Commit> {
        self.commits
            .get(revision)
            .ok_or_else(|| StoreError::NotFound(revision.to_string()))
    }

    fn ancestors(&self, revision: &Revision) -> HashSet<Revision> {
        let mut seen = HashSet::new();
        let mut stack = vec![revision.clone()];
        while let Some(rev) = stack.pop() {
            if !seen.insert(rev.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&rev) {
                stack.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    fn is_ancestor(&self, ancestor: &Revision, of: &Revision) -> bool {
        self.ancestors(of).contains(ancestor)
    }

    fn merge_base(&self, a: &Revision, b: &Revision) -> Option<Revision> {
        let left = self.ancestors(a);
        self.ancestors(b)
            .into_iter()
            .filter(|rev| left.contains(rev))
            .max_by_key(|rev| (self.commits.get(rev).map(|c| c.time), rev.clone()))
    }
}

pub(crate) struct MemoryStore {
    fs: Arc<InMemoryFs>,
    state: Mutex<State>,
}

fn hash_of(content: &[u8]) -> ContentHash {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn with_files(mut tree: Tree, files: &[(&str, &str)]) -> Tree {
    for (path, content) in files {
        tree.insert(path.to_string(), content.as_bytes().to_vec());
    }
    tree
}

fn conflict_markers(ours: Option<&Vec<u8>>, theirs: Option<&Vec<u8>>) -> Vec<u8> {
    let side = |c: Option<&Vec<u8>>| c.map(|c| String::from_utf8_lossy(c).into_owned()).unwrap_or_default();
    format!(
        "<<<<<<< HEAD\n{}=======\n{}>>>>>>> origin/main\n",
        side(ours),
        side(theirs)
    )
    .into_bytes()
}

impl MemoryStore {
    pub(crate) fn new() -> Self {
        Self {
            fs: Arc::new(InMemoryFs::new()),
            state: Mutex::new(State {
                commits: HashMap::new(),
                refs: HashMap::new(),
                remote: None,
                index: Tree::new(),
                conflicts: BTreeSet::new(),
                config: BTreeMap::new(),
                config_writes: 0,
                unreadable_config: false,
                offline: false,
                push_mode: PushMode::Accept,
                fail_log: false,
                full_log_reads: 0,
                fail_commit: false,
                fail_checkout: false,
                refuse_markers: false,
                clock: 0,
                next_id: 0,
            }),
        }
    }

    /// The working directory.
    pub(crate) fn fs(&self) -> Arc<InMemoryFs> {
        Arc::clone(&self.fs)
    }

    /// Write, stage and commit files on the local branch.
    pub(crate) fn commit_files(&self, files: &[(&str, &str)], time: i64) -> Revision {
        for (path, content) in files {
            self.fs.put(path, content.as_bytes());
        }
        let mut st = self.state.lock().unwrap();
        let local = st.local();
        let tree = with_files(st.tree(local.as_ref()), files);
        st.index = tree.clone();
        let rev = st.new_commit(tree, local.into_iter().collect(), time, "commit");
        st.refs.insert(LOCAL_BRANCH.to_string(), rev.clone());
        rev
    }

    /// Commit on top of `base` without moving any ref.
    pub(crate) fn commit_on(&self, base: &Revision, files: &[(&str, &str)], time: i64) -> Revision {
        let mut st = self.state.lock().unwrap();
        let tree = with_files(st.tree(Some(base)), files);
        st.new_commit(tree, vec![base.clone()], time, "detached")
    }

    /// Record a merge of `other` into the local branch with explicit content.
    pub(crate) fn merge_commit_with(
        &self,
        other: &Revision,
        files: &[(&str, &str)],
        time: i64,
    ) -> Revision {
        for (path, content) in files {
            self.fs.put(path, content.as_bytes());
        }
        let mut st = self.state.lock().unwrap();
        let local = st.local().expect("merge needs a local tip");
        let tree = with_files(st.tree(Some(&local)), files);
        st.index = tree.clone();
        let rev = st.new_commit(tree, vec![local, other.clone()], time, "merge");
        st.refs.insert(LOCAL_BRANCH.to_string(), rev.clone());
        rev
    }

    /// Advance the remote by one commit; visible locally only after fetch.
    pub(crate) fn remote_commit(&self, files: &[(&str, &str)], time: i64) -> Revision {
        let mut st = self.state.lock().unwrap();
        let parent = st.remote.clone();
        let tree = with_files(st.tree(parent.as_ref()), files);
        let rev = st.new_commit(tree, parent.into_iter().collect(), time, "remote");
        st.remote = Some(rev.clone());
        rev
    }

    /// Remote and remote-tracking ref both at the local tip.
    pub(crate) fn publish_local(&self) {
        let mut st = self.state.lock().unwrap();
        let local = st.local();
        st.remote = local.clone();
        match local {
            Some(rev) => st.refs.insert(REMOTE_BRANCH.to_string(), rev),
            None => st.refs.remove(REMOTE_BRANCH),
        };
    }

    pub(crate) fn local_tip(&self) -> Option<Revision> {
        self.state.lock().unwrap().local()
    }

    pub(crate) fn tracking_tip(&self) -> Option<Revision> {
        self.state.lock().unwrap().refs.get(REMOTE_BRANCH).cloned()
    }

    pub(crate) fn remote_tip(&self) -> Option<Revision> {
        self.state.lock().unwrap().remote.clone()
    }

    pub(crate) fn parents_of(&self, revision: &Revision) -> Vec<Revision> {
        let st = self.state.lock().unwrap();
        st.commits
            .get(revision)
            .map(|c| c.parents.clone())
            .unwrap_or_default()
    }

    pub(crate) fn content_at(&self, revision: &Revision, path: &str) -> Option<String> {
        let st = self.state.lock().unwrap();
        st.commits
            .get(revision)
            .and_then(|c| c.tree.get(path))
            .map(|c| String::from_utf8_lossy(c).into_owned())
    }

    pub(crate) fn commit_count(&self) -> usize {
        self.state.lock().unwrap().commits.len()
    }

    pub(crate) fn is_staged(&self, path: &str) -> bool {
        self.state.lock().unwrap().index.contains_key(path)
    }

    /// Write and stage a file without committing.
    pub(crate) fn stage_file(&self, path: &str, content: &str) {
        self.fs.put(path, content.as_bytes());
        let mut st = self.state.lock().unwrap();
        st.index.insert(path.to_string(), content.as_bytes().to_vec());
    }

    pub(crate) fn has_conflicts(&self) -> bool {
        !self.state.lock().unwrap().conflicts.is_empty()
    }

    pub(crate) fn config_value(&self, key: &str) -> Option<String> {
        self.state.lock().unwrap().config.get(key).cloned()
    }

    pub(crate) fn set_config_value(&self, key: &str, value: &str) {
        let mut st = self.state.lock().unwrap();
        st.config.insert(key.to_string(), value.to_string());
    }

    pub(crate) fn config_writes(&self) -> usize {
        self.state.lock().unwrap().config_writes
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.state.lock().unwrap().offline = offline;
    }

    pub(crate) fn set_push_mode(&self, mode: PushMode) {
        self.state.lock().unwrap().push_mode = mode;
    }

    pub(crate) fn fail_log(&self, fail: bool) {
        self.state.lock().unwrap().fail_log = fail;
    }

    /// Calls to the unbounded `log`.
    pub(crate) fn full_log_reads(&self) -> usize {
        self.state.lock().unwrap().full_log_reads
    }

    pub(crate) fn fail_commit(&self, fail: bool) {
        self.state.lock().unwrap().fail_commit = fail;
    }

    pub(crate) fn fail_checkout(&self, fail: bool) {
        self.state.lock().unwrap().fail_checkout = fail;
    }

    /// Conflicting merges fail without writing markers or index conflicts.
    pub(crate) fn refuse_conflict_markers(&self, refuse: bool) {
        self.state.lock().unwrap().refuse_markers = refuse;
    }

    pub(crate) fn set_unreadable_config(&self, unreadable: bool) {
        self.state.lock().unwrap().unreadable_config = unreadable;
    }

    /// Ancestors of the local tip, newest first, optionally limited to
    /// commits whose `path` differs from at least one parent.
    fn walk_log(&self, path: Option<&str>) -> StoreResult<Vec<CommitInfo>> {
        let st = self.state.lock().unwrap();
        if st.fail_log {
            return Err(StoreError::Other("log failed".into()));
        }
        let Some(local) = st.local() else {
            return Ok(Vec::new());
        };

        let mut commits: Vec<(&Revision, &Commit)> = st
            .ancestors(&local)
            .into_iter()
            .filter_map(|rev| st.commits.get_key_value(&rev))
            .collect();
        commits.sort_by(|(ra, a), (rb, b)| b.time.cmp(&a.time).then_with(|| rb.cmp(ra)));

        let touches = |commit: &Commit, path: &str| {
            let here = commit.tree.get(path);
            if commit.parents.is_empty() {
                return here.is_some();
            }
            commit
                .parents
                .iter()
                .any(|p| st.commits.get(p).and_then(|c| c.tree.get(path)) != here)
        };

        Ok(commits
            .into_iter()
            .filter(|(_, commit)| path.is_none_or(|p| touches(*commit, p)))
            .map(|(rev, commit)| CommitInfo {
                revision: rev.clone(),
                parents: commit.parents.clone(),
                author_time: commit.time,
                message: commit.message.clone(),
            })
            .collect())
    }

    /// Bring the working directory from `from` to `to`, touching only paths
    /// whose committed content changed.
    fn move_workdir(&self, from: &Tree, to: &Tree) {
        for (path, content) in to {
            if from.get(path) != Some(content) {
                self.fs.put(path, content);
            }
        }
        for path in from.keys() {
            if !to.contains_key(path) {
                self.fs.remove_file(path);
            }
        }
    }
}

#[async_trait]
impl VersionStore for MemoryStore {
    async fn fetch(&self) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.offline {
            return Err(StoreError::TransientNetwork("remote unreachable".into()));
        }
        if let Some(remote) = st.remote.clone() {
            st.refs.insert(REMOTE_BRANCH.to_string(), remote);
        }
        Ok(())
    }

    async fn merge(&self, abort_on_conflict: bool) -> StoreResult<MergeOutcome> {
        let mut st = self.state.lock().unwrap();
        if !st.conflicts.is_empty() {
            return Err(StoreError::UnmergedPaths {
                paths: st.conflicts.iter().cloned().collect(),
            });
        }
        let Some(remote) = st.refs.get(REMOTE_BRANCH).cloned() else {
            return Ok(MergeOutcome::NoRemote);
        };
        let Some(local) = st.local() else {
            let tree = st.tree(Some(&remote));
            st.index = tree.clone();
            st.refs.insert(LOCAL_BRANCH.to_string(), remote.clone());
            drop(st);
            self.move_workdir(&Tree::new(), &tree);
            return Ok(MergeOutcome::FastForward { revision: remote });
        };

        if local == remote || st.is_ancestor(&remote, &local) {
            return Ok(MergeOutcome::UpToDate);
        }

        let ours = st.tree(Some(&local));
        let theirs = st.tree(Some(&remote));

        if st.is_ancestor(&local, &remote) {
            st.index = theirs.clone();
            st.refs.insert(LOCAL_BRANCH.to_string(), remote.clone());
            drop(st);
            self.move_workdir(&ours, &theirs);
            return Ok(MergeOutcome::FastForward { revision: remote });
        }

        let base = st.merge_base(&local, &remote);
        let base_tree = st.tree(base.as_ref());
        let paths: BTreeSet<&String> = ours.keys().chain(theirs.keys()).chain(base_tree.keys()).collect();

        let mut merged = Tree::new();
        let mut conflicts = Vec::new();
        for path in paths {
            let (b, o, t) = (base_tree.get(path), ours.get(path), theirs.get(path));
            let resolved = if o == t {
                o
            } else if o == b {
                t
            } else if t == b {
                o
            } else {
                conflicts.push(path.clone());
                o
            };
            if let Some(content) = resolved {
                merged.insert(path.clone(), content.clone());
            }
        }

        if conflicts.is_empty() {
            let time = st.tick();
            let rev = st.new_commit(merged.clone(), vec![local, remote], time, "Merge origin/main");
            st.index = merged.clone();
            st.refs.insert(LOCAL_BRANCH.to_string(), rev.clone());
            drop(st);
            self.move_workdir(&ours, &merged);
            return Ok(MergeOutcome::Merged { revision: rev });
        }

        if abort_on_conflict || st.refuse_markers {
            return Err(StoreError::MergeConflict { paths: conflicts });
        }

        st.index = merged.clone();
        st.conflicts = conflicts.iter().cloned().collect();
        drop(st);
        self.move_workdir(&ours, &merged);
        for path in &conflicts {
            self.fs
                .put(path, &conflict_markers(ours.get(path), theirs.get(path)));
        }
        Err(StoreError::MergeConflict { paths: conflicts })
    }

    async fn push(&self) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.offline {
            return Err(StoreError::TransientNetwork("remote unreachable".into()));
        }
        let Some(local) = st.local() else {
            return Err(StoreError::NotFound(LOCAL_BRANCH.into()));
        };
        match st.push_mode {
            PushMode::Accept => {
                let fast_forward = st
                    .remote
                    .as_ref()
                    .is_none_or(|remote| st.is_ancestor(remote, &local));
                if !fast_forward {
                    return Err(StoreError::PushRejected("non-fast-forward".into()));
                }
                st.remote = Some(local.clone());
                st.refs.insert(REMOTE_BRANCH.to_string(), local);
                Ok(())
            }
            PushMode::RaceToSameTip => {
                st.remote = Some(local);
                Err(StoreError::PushRejected("fetch first".into()))
            }
            PushMode::Reject => Err(StoreError::PushRejected("non-fast-forward".into())),
        }
    }

    async fn add(&self, path: &str) -> StoreResult<()> {
        let content = self
            .fs
            .file(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        let mut st = self.state.lock().unwrap();
        st.index.insert(path.to_string(), content);
        st.conflicts.remove(path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        st.index.remove(path);
        st.conflicts.remove(path);
        Ok(())
    }

    async fn commit(&self, message: &str, parents: Option<&[Revision]>) -> StoreResult<Revision> {
        let mut st = self.state.lock().unwrap();
        if st.fail_commit {
            return Err(StoreError::Other("commit failed".into()));
        }
        if !st.conflicts.is_empty() {
            return Err(StoreError::UnmergedPaths {
                paths: st.conflicts.iter().cloned().collect(),
            });
        }
        let parents = match parents {
            Some(parents) => parents.to_vec(),
            None => st.local().into_iter().collect(),
        };
        let tree = st.index.clone();
        let time = st.tick();
        let rev = st.new_commit(tree, parents, time, message);
        st.refs.insert(LOCAL_BRANCH.to_string(), rev.clone());
        Ok(rev)
    }

    async fn status(&self, path: &str) -> StoreResult<StatusRow> {
        let workdir = self.fs.file(path);
        let st = self.state.lock().unwrap();
        let head = st.tree(st.local().as_ref());
        Ok(StatusRow::from_versions(
            path,
            head.get(path),
            workdir.as_ref(),
            st.index.get(path),
        ))
    }

    async fn status_matrix(&self, prefix: &str) -> StoreResult<Vec<StatusRow>> {
        let on_disk = self.fs.file_paths();
        let st = self.state.lock().unwrap();
        let head = st.tree(st.local().as_ref());
        let paths: BTreeSet<&String> = head
            .keys()
            .chain(st.index.keys())
            .chain(on_disk.iter())
            .filter(|p| under_prefix(p, prefix))
            .collect();
        Ok(paths
            .into_iter()
            .map(|path| {
                let workdir = self.fs.file(path);
                StatusRow::from_versions(
                    path.clone(),
                    head.get(path),
                    workdir.as_ref(),
                    st.index.get(path),
                )
            })
            .collect())
    }

    async fn conflicted_paths(&self) -> StoreResult<Vec<String>> {
        Ok(self.state.lock().unwrap().conflicts.iter().cloned().collect())
    }

    async fn resolve_ref(&self, name: &str) -> StoreResult<Option<Revision>> {
        Ok(self.state.lock().unwrap().refs.get(name).cloned())
    }

    async fn write_ref(&self, name: &str, revision: &Revision) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        st.commit(revision)?;
        st.refs.insert(name.to_string(), revision.clone());
        Ok(())
    }

    async fn checkout(&self, force: bool) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        if st.fail_checkout {
            return Err(StoreError::Other("checkout failed".into()));
        }
        let Some(local) = st.local() else {
            return Ok(());
        };
        let target = st.tree(Some(&local));
        let previous = std::mem::replace(&mut st.index, target.clone());
        if force {
            st.conflicts.clear();
        }
        drop(st);

        for (path, content) in &target {
            let on_disk = self.fs.file(path);
            let untouched = on_disk.is_none() || on_disk.as_ref() == previous.get(path);
            if force || untouched {
                self.fs.put(path, content);
            }
        }
        for path in previous.keys() {
            if !target.contains_key(path) {
                self.fs.remove_file(path);
            }
        }
        Ok(())
    }

    async fn blob_id(&self, revision: &Revision, path: &str) -> StoreResult<Option<ContentHash>> {
        let st = self.state.lock().unwrap();
        Ok(st.commit(revision)?.tree.get(path).map(|c| hash_of(c)))
    }

    async fn read_blob(&self, revision: &Revision, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let st = self.state.lock().unwrap();
        Ok(st.commit(revision)?.tree.get(path).cloned())
    }

    async fn log(&self, path: Option<&str>) -> StoreResult<Vec<CommitInfo>> {
        self.state.lock().unwrap().full_log_reads += 1;
        self.walk_log(path)
    }

    async fn recent_log(&self, path: Option<&str>, limit: usize) -> StoreResult<Vec<CommitInfo>> {
        let mut commits = self.walk_log(path)?;
        commits.truncate(limit);
        Ok(commits)
    }

    async fn diff_trees(
        &self,
        from: &Revision,
        to: &Revision,
        prefix: &str,
    ) -> StoreResult<Vec<TreeChange>> {
        let st = self.state.lock().unwrap();
        let left = &st.commit(from)?.tree;
        let right = &st.commit(to)?.tree;
        let paths: BTreeSet<&String> = left
            .keys()
            .chain(right.keys())
            .filter(|p| under_prefix(p, prefix))
            .collect();
        Ok(paths
            .into_iter()
            .filter(|p| left.get(*p) != right.get(*p))
            .map(|p| TreeChange {
                path: p.clone(),
                kind: EntryKind::Blob,
                before: left.get(p).map(|c| hash_of(c)),
                after: right.get(p).map(|c| hash_of(c)),
            })
            .collect())
    }

    async fn merge_base(&self, a: &Revision, b: &Revision) -> StoreResult<Option<Revision>> {
        let st = self.state.lock().unwrap();
        st.commit(a)?;
        st.commit(b)?;
        Ok(st.merge_base(a, b))
    }

    async fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        let st = self.state.lock().unwrap();
        if st.unreadable_config {
            return Err(StoreError::Other("config unreadable".into()));
        }
        Ok(st.config.get(key).cloned())
    }

    async fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut st = self.state.lock().unwrap();
        st.config_writes += 1;
        st.config.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
