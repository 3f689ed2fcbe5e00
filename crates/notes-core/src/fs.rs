//! FileSystem trait abstraction for the repository working directory.
//!
//! Paths are relative to the repository root and use `/` separators.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in notes-cli) - Uses tokio::fs

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl FsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

/// File metadata
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Modification time in milliseconds since epoch
    pub mtime_millis: u64,
    /// File size in bytes
    pub size: u64,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Platform-independent filesystem abstraction rooted at the repository.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// List directory contents. A missing directory is `FsError::NotFound`.
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete a file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Get file metadata
    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Read a file as UTF-8 text.
    async fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|_| FsError::InvalidUtf8(path.to_string()))
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// Snapshot of every file path currently stored.
    pub fn file_paths(&self) -> Vec<String> {
        self.files.read().unwrap().keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.read().unwrap().get(&Self::normalize_path(path)).cloned()
    }

    #[cfg(test)]
    pub(crate) fn put(&self, path: &str, content: &[u8]) {
        let path = Self::normalize_path(path);
        let mut parent = Self::parent_path(&path);
        let mut dirs = self.dirs.write().unwrap();
        while let Some(dir) = parent {
            parent = Self::parent_path(&dir);
            dirs.insert(dir);
        }
        self.files.write().unwrap().insert(path, content.to_vec());
    }

    #[cfg(test)]
    pub(crate) fn remove_file(&self, path: &str) -> bool {
        self.files
            .write()
            .unwrap()
            .remove(&Self::normalize_path(path))
            .is_some()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }

    fn direct_child<'a>(prefix: &str, candidate: &'a str) -> Option<&'a str> {
        let rest = if prefix.is_empty() {
            candidate
        } else {
            candidate.strip_prefix(prefix)?.strip_prefix('/')?
        };
        if rest.is_empty() || rest.contains('/') {
            None
        } else {
            Some(rest)
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.dirs.read().unwrap().contains(&path) {
            return Err(FsError::IsDirectory(path));
        }

        if let Some(parent) = Self::parent_path(&path) {
            self.mkdir(&parent).await?;
        }

        self.files.write().unwrap().insert(path, content.to_vec());
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);

        let dirs = self.dirs.read().unwrap();
        if !dirs.contains(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries: Vec<FileEntry> = dirs
            .iter()
            .filter_map(|dir| Self::direct_child(&path, dir))
            .map(|name| FileEntry {
                name: name.to_string(),
                is_dir: true,
            })
            .collect();

        let files = self.files.read().unwrap();
        entries.extend(
            files
                .keys()
                .filter_map(|file| Self::direct_child(&path, file))
                .map(|name| FileEntry {
                    name: name.to_string(),
                    is_dir: false,
                }),
        );

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        if self.files.write().unwrap().remove(&path).is_some() {
            return Ok(());
        }

        let mut dirs = self.dirs.write().unwrap();
        if dirs.contains(&path) && !path.is_empty() {
            let has_children = dirs
                .iter()
                .any(|d| Self::direct_child(&path, d).is_some())
                || self
                    .files
                    .read()
                    .unwrap()
                    .keys()
                    .any(|f| Self::direct_child(&path, f).is_some());
            if has_children {
                return Err(FsError::Io(format!("directory not empty: {path}")));
            }
            dirs.remove(&path);
            return Ok(());
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap();
        let dirs = self.dirs.read().unwrap();
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let path = Self::normalize_path(path);

        if let Some(content) = self.files.read().unwrap().get(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: content.len() as u64,
                is_dir: false,
            });
        }

        if self.dirs.read().unwrap().contains(&path) {
            return Ok(FileStat {
                mtime_millis: 0,
                size: 0,
                is_dir: true,
            });
        }

        Err(FsError::NotFound(path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        self.dirs.write().unwrap().insert(path);
        Ok(())
    }
}

// Lets a WorkingSet and a test share the same filesystem.
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        (**self).stat(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}
