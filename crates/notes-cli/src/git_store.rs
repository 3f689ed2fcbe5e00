//! VersionStore backed by a git repository through libgit2.
//!
//! Every call opens the repository on a blocking thread; nothing is cached
//! between calls, so the on-disk repository is the single source of truth.

use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{
    Commit, DiffOptions, ErrorClass, ErrorCode, FetchOptions, FileMode, Index, ObjectType, Oid,
    PushOptions, RemoteCallbacks, Repository, RepositoryInitOptions, ResetType, Signature, Sort,
    Tree, TreeWalkMode, TreeWalkResult,
};
use notes_core::store::{
    CommitInfo, ContentHash, EntryKind, FETCH_REFSPEC, LOCAL_BRANCH, MergeOutcome, Revision,
    StatusRow, TreeChange, VersionStore, under_prefix,
};
use notes_core::{StoreError, StoreResult};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const REMOTE_NAME: &str = "origin";
const LOCAL_REF: &str = "refs/heads/main";
const REMOTE_REF: &str = "refs/remotes/origin/main";

/// Failures inside a blocking git task.
#[derive(Debug, Error)]
enum GitStoreError {
    #[error(transparent)]
    Git(#[from] git2::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<GitStoreError> for StoreError {
    fn from(e: GitStoreError) -> Self {
        match e {
            GitStoreError::Git(e) => classify(e),
            GitStoreError::Store(e) => e,
        }
    }
}

type GitResult<T> = Result<T, GitStoreError>;

/// Map libgit2's error identifiers onto the store taxonomy.
pub fn classify(e: git2::Error) -> StoreError {
    let message = e.message().to_string();
    match e.code() {
        ErrorCode::NotFound | ErrorCode::UnbornBranch => StoreError::NotFound(message),
        ErrorCode::NotFastForward => StoreError::PushRejected(message),
        ErrorCode::MergeConflict => StoreError::MergeConflict { paths: Vec::new() },
        ErrorCode::Unmerged => StoreError::UnmergedPaths { paths: Vec::new() },
        _ => match e.class() {
            ErrorClass::Net | ErrorClass::Http | ErrorClass::Ssh | ErrorClass::Ssl => {
                StoreError::TransientNetwork(message)
            }
            _ if message.contains("non-fast-forward") || message.contains("fetch first") => {
                StoreError::PushRejected(message)
            }
            _ => StoreError::Other(message),
        },
    }
}

/// Expand `main` / `origin/main` shorthands to full ref names.
fn full_ref(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else if name.contains('/') {
        format!("refs/remotes/{name}")
    } else {
        format!("refs/heads/{name}")
    }
}

fn ref_oid(repo: &Repository, name: &str) -> GitResult<Option<Oid>> {
    match repo.refname_to_id(name) {
        Ok(oid) => Ok(Some(oid)),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_oid(revision: &Revision) -> GitResult<Oid> {
    Ok(Oid::from_str(revision.as_str())?)
}

fn revision(oid: Oid) -> Revision {
    Revision::new(oid.to_string())
}

fn signature(repo: &Repository) -> GitResult<Signature<'static>> {
    match repo.signature() {
        Ok(sig) => Ok(sig.to_owned()),
        Err(_) => Ok(Signature::now("notes", "notes@localhost")?),
    }
}

fn remote_callbacks<'a>(repo: &Repository) -> RemoteCallbacks<'a> {
    let cfg = repo.config().ok();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_ssh_key() {
            if let Some(user) = username_from_url {
                return git2::Cred::ssh_key_from_agent(user);
            }
        }
        if allowed.is_user_pass_plaintext() {
            if let Some(cfg) = cfg.as_ref() {
                if let Ok(cred) = git2::Cred::credential_helper(cfg, url, username_from_url) {
                    return Ok(cred);
                }
            }
        }
        git2::Cred::default()
    });
    callbacks
}

fn tree_entry_id(tree: &Tree<'_>, path: &str) -> GitResult<Option<Oid>> {
    match tree.get_path(Path::new(path)) {
        Ok(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(entry.id())),
        Ok(_) => Ok(None),
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn head_tree(repo: &Repository) -> GitResult<Option<Tree<'_>>> {
    match ref_oid(repo, LOCAL_REF)? {
        Some(oid) => Ok(Some(repo.find_commit(oid)?.tree()?)),
        None => Ok(None),
    }
}

fn workdir_blob_id(repo: &Repository, path: &str) -> GitResult<Option<Oid>> {
    let Some(workdir) = repo.workdir() else {
        return Ok(None);
    };
    let full = workdir.join(path);
    if !full.is_file() {
        return Ok(None);
    }
    Ok(Some(Oid::hash_file(ObjectType::Blob, &full)?))
}

fn status_row(
    repo: &Repository,
    head: Option<&Tree<'_>>,
    index: &Index,
    path: &str,
) -> GitResult<StatusRow> {
    let head_id = match head {
        Some(tree) => tree_entry_id(tree, path)?,
        None => None,
    };
    let stage_id = index.get_path(Path::new(path), 0).map(|e| e.id);
    let work_id = workdir_blob_id(repo, path)?;
    Ok(StatusRow::from_versions(
        path,
        head_id.as_ref(),
        work_id.as_ref(),
        stage_id.as_ref(),
    ))
}

fn conflict_paths(index: &Index) -> GitResult<Vec<String>> {
    let mut paths = BTreeSet::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
        if let Some(entry) = entry {
            paths.insert(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    Ok(paths.into_iter().collect())
}

/// Files on disk below the working directory, skipping `.git`.
fn workdir_files(repo: &Repository) -> GitResult<Vec<String>> {
    let Some(root) = repo.workdir() else {
        return Ok(Vec::new());
    };
    let mut files = Vec::new();
    let mut dirs_to_visit: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = dirs_to_visit.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| StoreError::Other(format!("{}: {e}", dir.display())))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if entry.file_name() == ".git" {
                continue;
            }
            if path.is_dir() {
                dirs_to_visit.push(path);
            } else if let Ok(relative) = path.strip_prefix(root) {
                files.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
    Ok(files)
}

fn changed_against_parents(commit: &Commit<'_>, path: &str) -> GitResult<bool> {
    let here = tree_entry_id(&commit.tree()?, path)?;
    if commit.parent_count() == 0 {
        return Ok(here.is_some());
    }
    for parent in commit.parents() {
        if tree_entry_id(&parent.tree()?, path)? != here {
            return Ok(true);
        }
    }
    Ok(false)
}

fn fetch(repo: &Repository) -> GitResult<()> {
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    let mut fo = FetchOptions::new();
    fo.remote_callbacks(remote_callbacks(repo));
    remote.fetch(&[FETCH_REFSPEC], Some(&mut fo), None)?;
    debug!("Fetched {}", REMOTE_NAME);
    Ok(())
}

fn push(repo: &Repository) -> GitResult<()> {
    let mut remote = repo.find_remote(REMOTE_NAME)?;
    let rejection: RefCell<Option<String>> = RefCell::new(None);
    {
        let mut callbacks = remote_callbacks(repo);
        callbacks.push_update_reference(|_ref_name, status| {
            if let Some(msg) = status {
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_options = PushOptions::new();
        push_options.remote_callbacks(callbacks);
        let refspec = format!("{LOCAL_REF}:{LOCAL_REF}");
        remote.push(&[refspec.as_str()], Some(&mut push_options))?;
    }
    if let Some(msg) = rejection.into_inner() {
        return Err(StoreError::PushRejected(msg).into());
    }
    info!("Pushed {} to {}", LOCAL_BRANCH, REMOTE_NAME);
    Ok(())
}

fn merge(repo: &Repository, abort_on_conflict: bool) -> GitResult<MergeOutcome> {
    let index = repo.index()?;
    if index.has_conflicts() {
        let paths = conflict_paths(&index)?;
        return Err(StoreError::UnmergedPaths { paths }.into());
    }

    let Some(remote_oid) = ref_oid(repo, REMOTE_REF)? else {
        return Ok(MergeOutcome::NoRemote);
    };
    let remote_commit = repo.find_commit(remote_oid)?;

    let Some(local_oid) = ref_oid(repo, LOCAL_REF)? else {
        repo.checkout_tree(remote_commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
        repo.reference(LOCAL_REF, remote_oid, true, "notes: start main at origin/main")?;
        repo.set_head(LOCAL_REF)?;
        return Ok(MergeOutcome::FastForward {
            revision: revision(remote_oid),
        });
    };

    if local_oid == remote_oid || repo.graph_descendant_of(local_oid, remote_oid)? {
        return Ok(MergeOutcome::UpToDate);
    }

    if repo.graph_descendant_of(remote_oid, local_oid)? {
        repo.checkout_tree(remote_commit.as_object(), Some(CheckoutBuilder::new().safe()))?;
        repo.reference(LOCAL_REF, remote_oid, true, "notes: fast-forward to origin/main")?;
        return Ok(MergeOutcome::FastForward {
            revision: revision(remote_oid),
        });
    }

    let local_commit = repo.find_commit(local_oid)?;
    let mut merged = repo.merge_commits(&local_commit, &remote_commit, None)?;

    if !merged.has_conflicts() {
        let tree = repo.find_tree(merged.write_tree_to(repo)?)?;
        repo.checkout_tree(tree.as_object(), Some(CheckoutBuilder::new().safe()))?;
        let sig = signature(repo)?;
        let oid = repo.commit(
            None,
            &sig,
            &sig,
            "Merge origin/main",
            &tree,
            &[&local_commit, &remote_commit],
        )?;
        repo.reference(LOCAL_REF, oid, true, "notes: merge origin/main")?;
        return Ok(MergeOutcome::Merged {
            revision: revision(oid),
        });
    }

    let paths = conflict_paths(&merged)?;
    if abort_on_conflict {
        return Err(StoreError::MergeConflict { paths }.into());
    }

    // Write markers into the working tree and conflicts into the index
    let annotated = repo.find_annotated_commit(remote_oid)?;
    let mut checkout = CheckoutBuilder::new();
    checkout.safe().allow_conflicts(true).conflict_style_merge(true);
    repo.merge(&[&annotated], None, Some(&mut checkout))?;
    info!("Merge left {} conflicted path(s)", paths.len());
    Err(StoreError::MergeConflict { paths }.into())
}

fn commit(repo: &Repository, message: &str, parents: Option<Vec<Revision>>) -> GitResult<Revision> {
    let mut index = repo.index()?;
    if index.has_conflicts() {
        let paths = conflict_paths(&index)?;
        return Err(StoreError::UnmergedPaths { paths }.into());
    }
    let tree = repo.find_tree(index.write_tree()?)?;

    let parent_oids = match parents {
        Some(parents) => parents.iter().map(parse_oid).collect::<GitResult<Vec<_>>>()?,
        None => ref_oid(repo, LOCAL_REF)?.into_iter().collect(),
    };
    let parent_commits = parent_oids
        .into_iter()
        .map(|oid| repo.find_commit(oid))
        .collect::<Result<Vec<_>, _>>()?;
    let parent_refs: Vec<&Commit<'_>> = parent_commits.iter().collect();

    let sig = signature(repo)?;
    let oid = repo.commit(None, &sig, &sig, message, &tree, &parent_refs)?;
    repo.reference(LOCAL_REF, oid, true, "notes: commit")?;
    repo.cleanup_state()?;
    debug!("Committed {} ({} parent(s))", oid, parent_refs.len());
    Ok(revision(oid))
}

fn checkout(repo: &Repository, force: bool) -> GitResult<()> {
    let Some(oid) = ref_oid(repo, LOCAL_REF)? else {
        return Ok(());
    };
    if force {
        let commit = repo.find_commit(oid)?;
        let mut builder = CheckoutBuilder::new();
        builder.force();
        repo.reset(commit.as_object(), ResetType::Hard, Some(&mut builder))?;
        repo.cleanup_state()?;
    } else {
        repo.checkout_head(Some(CheckoutBuilder::new().safe()))?;
    }
    Ok(())
}

fn status_matrix(repo: &Repository, prefix: &str) -> GitResult<Vec<StatusRow>> {
    let head = head_tree(repo)?;
    let index = repo.index()?;

    let mut paths = BTreeSet::new();
    if let Some(tree) = &head {
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    paths.insert(format!("{root}{name}"));
                }
            }
            TreeWalkResult::Ok
        })?;
    }
    for entry in index.iter() {
        paths.insert(String::from_utf8_lossy(&entry.path).into_owned());
    }
    paths.extend(workdir_files(repo)?);

    paths
        .into_iter()
        .filter(|path| under_prefix(path, prefix))
        .map(|path| status_row(repo, head.as_ref(), &index, &path))
        .collect()
}

/// Path-filtered revwalk from the local tip; stops after `limit` matches.
fn log(
    repo: &Repository,
    path: Option<&str>,
    limit: Option<usize>,
) -> GitResult<Vec<CommitInfo>> {
    let Some(tip) = ref_oid(repo, LOCAL_REF)? else {
        return Ok(Vec::new());
    };
    let mut walk = repo.revwalk()?;
    walk.push(tip)?;
    walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;

    let mut commits = Vec::new();
    for oid in walk {
        if limit.is_some_and(|limit| commits.len() >= limit) {
            break;
        }
        let commit = repo.find_commit(oid?)?;
        if let Some(path) = path {
            if !changed_against_parents(&commit, path)? {
                continue;
            }
        }
        commits.push(CommitInfo {
            revision: revision(commit.id()),
            parents: commit.parent_ids().map(revision).collect(),
            author_time: commit.author().when().seconds(),
            message: commit.message().unwrap_or_default().to_string(),
        });
    }
    Ok(commits)
}

fn diff_trees(repo: &Repository, from: &Revision, to: &Revision, prefix: &str) -> GitResult<Vec<TreeChange>> {
    let old_tree = repo.find_commit(parse_oid(from)?)?.tree()?;
    let new_tree = repo.find_commit(parse_oid(to)?)?.tree()?;

    let mut opts = DiffOptions::new();
    if !prefix.is_empty() {
        opts.pathspec(prefix);
    }
    let diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), Some(&mut opts))?;

    let hash = |id: Oid| (!id.is_zero()).then(|| id.to_string());
    Ok(diff
        .deltas()
        .filter_map(|delta| {
            let (old, new) = (delta.old_file(), delta.new_file());
            let path = new.path().or(old.path())?.to_string_lossy().replace('\\', "/");
            if !under_prefix(&path, prefix) {
                return None;
            }
            let kind = if old.mode() == FileMode::Tree || new.mode() == FileMode::Tree {
                EntryKind::Tree
            } else {
                EntryKind::Blob
            };
            Some(TreeChange {
                path,
                kind,
                before: hash(old.id()),
                after: hash(new.id()),
            })
        })
        .collect())
}

/// Git repository implementing `VersionStore`.
#[derive(Debug, Clone)]
pub struct GitStore {
    path: PathBuf,
}

impl GitStore {
    /// Open the repository at `path`, creating it with `main` as the initial
    /// branch if it does not exist yet.
    pub fn open_or_init(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        match Repository::open(&path) {
            Ok(_) => {}
            Err(e) if e.code() == ErrorCode::NotFound => {
                let mut opts = RepositoryInitOptions::new();
                opts.initial_head(LOCAL_BRANCH);
                Repository::init_opts(&path, &opts).map_err(classify)?;
                info!("Initialized repository at {}", path.display());
            }
            Err(e) => return Err(classify(e)),
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, task: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> GitResult<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let repo = Repository::open(&path)?;
            task(&repo)
        })
        .await
        .map_err(|e| StoreError::Other(format!("git task failed: {e}")))?
        .map_err(StoreError::from)
    }
}

#[async_trait]
impl VersionStore for GitStore {
    async fn fetch(&self) -> StoreResult<()> {
        self.run(fetch).await
    }

    async fn merge(&self, abort_on_conflict: bool) -> StoreResult<MergeOutcome> {
        self.run(move |repo| merge(repo, abort_on_conflict)).await
    }

    async fn push(&self) -> StoreResult<()> {
        self.run(push).await
    }

    async fn add(&self, path: &str) -> StoreResult<()> {
        let path = path.to_string();
        self.run(move |repo| {
            let mut index = repo.index()?;
            index.add_path(Path::new(&path))?;
            index.write()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, path: &str) -> StoreResult<()> {
        let path = path.to_string();
        self.run(move |repo| {
            let mut index = repo.index()?;
            index.remove_path(Path::new(&path))?;
            index.write()?;
            Ok(())
        })
        .await
    }

    async fn commit(&self, message: &str, parents: Option<&[Revision]>) -> StoreResult<Revision> {
        let message = message.to_string();
        let parents = parents.map(<[Revision]>::to_vec);
        self.run(move |repo| commit(repo, &message, parents)).await
    }

    async fn status(&self, path: &str) -> StoreResult<StatusRow> {
        let path = path.to_string();
        self.run(move |repo| {
            let head = head_tree(repo)?;
            let index = repo.index()?;
            status_row(repo, head.as_ref(), &index, &path)
        })
        .await
    }

    async fn status_matrix(&self, prefix: &str) -> StoreResult<Vec<StatusRow>> {
        let prefix = prefix.to_string();
        self.run(move |repo| status_matrix(repo, &prefix)).await
    }

    async fn conflicted_paths(&self) -> StoreResult<Vec<String>> {
        self.run(|repo| conflict_paths(&repo.index()?)).await
    }

    async fn resolve_ref(&self, name: &str) -> StoreResult<Option<Revision>> {
        let name = full_ref(name);
        self.run(move |repo| Ok(ref_oid(repo, &name)?.map(revision)))
            .await
    }

    async fn write_ref(&self, name: &str, revision: &Revision) -> StoreResult<()> {
        let name = full_ref(name);
        let revision = revision.clone();
        self.run(move |repo| {
            let oid = parse_oid(&revision)?;
            repo.reference(&name, oid, true, "notes: write ref")?;
            Ok(())
        })
        .await
    }

    async fn checkout(&self, force: bool) -> StoreResult<()> {
        self.run(move |repo| checkout(repo, force)).await
    }

    async fn blob_id(&self, revision: &Revision, path: &str) -> StoreResult<Option<ContentHash>> {
        let (revision, path) = (revision.clone(), path.to_string());
        self.run(move |repo| {
            let tree = repo.find_commit(parse_oid(&revision)?)?.tree()?;
            Ok(tree_entry_id(&tree, &path)?.map(|oid| oid.to_string()))
        })
        .await
    }

    async fn read_blob(&self, revision: &Revision, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let (revision, path) = (revision.clone(), path.to_string());
        self.run(move |repo| {
            let tree = repo.find_commit(parse_oid(&revision)?)?.tree()?;
            match tree_entry_id(&tree, &path)? {
                Some(oid) => Ok(Some(repo.find_blob(oid)?.content().to_vec())),
                None => Ok(None),
            }
        })
        .await
    }

    async fn log(&self, path: Option<&str>) -> StoreResult<Vec<CommitInfo>> {
        let path = path.map(str::to_string);
        self.run(move |repo| log(repo, path.as_deref(), None)).await
    }

    async fn recent_log(&self, path: Option<&str>, limit: usize) -> StoreResult<Vec<CommitInfo>> {
        let path = path.map(str::to_string);
        self.run(move |repo| log(repo, path.as_deref(), Some(limit)))
            .await
    }

    async fn diff_trees(
        &self,
        from: &Revision,
        to: &Revision,
        prefix: &str,
    ) -> StoreResult<Vec<TreeChange>> {
        let (from, to, prefix) = (from.clone(), to.clone(), prefix.to_string());
        self.run(move |repo| diff_trees(repo, &from, &to, &prefix))
            .await
    }

    async fn merge_base(&self, a: &Revision, b: &Revision) -> StoreResult<Option<Revision>> {
        let (a, b) = (a.clone(), b.clone());
        self.run(move |repo| match repo.merge_base(parse_oid(&a)?, parse_oid(&b)?) {
            Ok(oid) => Ok(Some(revision(oid))),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.run(move |repo| match repo.config()?.get_string(&key) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.run(move |repo| {
            repo.config()?.set_str(&key, &value)?;
            Ok(())
        })
        .await
    }
}
