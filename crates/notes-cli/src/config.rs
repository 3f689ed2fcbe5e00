//! Command-line configuration.

use clap::{Parser, Subcommand};
use notes_core::{NotesLayout, RepoConfig};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "notes")]
#[command(about = "Git-backed notes with offline-first sync")]
pub struct Cli {
    /// Path to the local repository
    #[arg(long, env = "NOTES_REPO", default_value = "~/notes")]
    pub repo: String,

    /// Remote repository URL
    #[arg(long, env = "NOTES_REMOTE")]
    pub remote: String,

    /// Commit author name
    #[arg(long, env = "NOTES_AUTHOR_NAME", default_value = "notes")]
    pub author_name: String,

    /// Commit author email
    #[arg(long, env = "NOTES_AUTHOR_EMAIL", default_value = "notes@localhost")]
    pub author_email: String,

    /// Directory holding note files, relative to the repository root
    #[arg(long, default_value = "notes")]
    pub notes_dir: String,

    /// Base URL of the attachment upload service
    #[arg(long, env = "NOTES_UPLOAD_URL")]
    pub upload_url: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configure the repository, fetch and load notes
    Bootstrap,
    /// Fetch and merge remote changes
    Pull,
    /// Commit pending edits, merge and push
    Push,
    /// Discard local state and match the remote
    Reset {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// List notes, newest first
    List,
    /// List every tag in use
    Tags,
    /// Show the change history of a note
    History { id: String },
    /// Create a note from stdin
    New,
    /// Replace a note's body with stdin and commit it
    Edit { id: String },
    /// Delete a note
    Delete { id: String },
    /// Upload an attachment for a note
    Upload { id: String, file: PathBuf },
}

impl Cli {
    pub fn repo_path(&self) -> PathBuf {
        expand_home(&self.repo)
    }

    pub fn repo_config(&self) -> RepoConfig {
        RepoConfig::new(self.remote.as_str())
            .with_author(self.author_name.as_str(), self.author_email.as_str())
    }

    pub fn layout(&self) -> NotesLayout {
        NotesLayout::new(self.notes_dir.as_str(), ".md")
    }

    pub fn log_filter(&self) -> &'static str {
        if self.verbose { "debug" } else { "info" }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    let home = dirs::home_dir();
    match (path.strip_prefix('~'), home) {
        (Some(""), Some(home)) => home,
        (Some(rest), Some(home)) if rest.starts_with('/') => {
            home.join(Path::new(rest.trim_start_matches('/')))
        }
        _ => PathBuf::from(path),
    }
}
