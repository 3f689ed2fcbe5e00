//! notes-cli library: the native collaborators of the sync engine.
//!
//! Exposed as a library so integration tests can drive `GitStore` and
//! `NativeFs` against real repositories.

pub mod config;
pub mod git_store;
pub mod native_fs;
pub mod upload;

pub use config::{Cli, Command};
pub use git_store::GitStore;
pub use native_fs::NativeFs;
pub use upload::{UploadClient, UploadError};
