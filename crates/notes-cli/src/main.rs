//! notes: command-line shell over the notes sync engine.
//!
//! Each invocation opens the repository, runs one operation and prints the
//! resulting status line.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use notes_cli::{Cli, Command, GitStore, NativeFs, UploadClient};
use notes_core::{Session, SyncEngine, SyncEvent};

type Engine = SyncEngine<NativeFs, GitStore>;

async fn read_stdin() -> Result<String> {
    let mut body = String::new();
    tokio::io::stdin()
        .read_to_string(&mut body)
        .await
        .context("Failed to read note body from stdin")?;
    Ok(body)
}

fn confirm_reset() -> Result<bool> {
    print!("Discard all local changes and match the remote? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn format_time(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

async fn run(cli: &Cli, engine: &mut Engine, session: &mut Session) -> Result<()> {
    match &cli.command {
        Command::Bootstrap => {
            engine.bootstrap().await?;
        }
        Command::Pull => {
            engine.load_notes().await?;
            engine.pull(session).await?;
        }
        Command::Push => {
            engine.load_notes().await?;
            engine.publish(session).await?;
        }
        Command::Reset { yes } => {
            if !yes && !confirm_reset()? {
                println!("cancelled");
                return Ok(());
            }
            engine.reset_to_remote(session, |_| true).await?;
        }
        Command::List => {
            engine.load_notes().await?;
            let markers = engine.compute_note_markers().await?;
            for note in engine.notes().notes() {
                let marker = markers.get(&note.id).copied().unwrap_or_default();
                let flags = format!(
                    "{}{}",
                    if marker.locally_committed { "↑" } else { " " },
                    if marker.diff_from_origin { "↓" } else { " " },
                );
                let when = note.updated_at.map(format_time).unwrap_or_default();
                println!("{} {}  {:<19}  {}", flags, note.id, when, note.title());
            }
        }
        Command::Tags => {
            engine.load_notes().await?;
            for tag in engine.notes().tags_across_notes() {
                println!("{tag}");
            }
        }
        Command::History { id } => {
            for entry in engine.history(id).await? {
                println!(
                    "{}  {}",
                    entry.revision.short(),
                    format_time(entry.timestamp_millis())
                );
            }
        }
        Command::New => {
            let body = read_stdin().await?;
            engine.load_notes().await?;
            let id = engine.create_note(session, &body).await?;
            session.edit(body);
            engine.save_current(session).await?;
            println!("{id}");
        }
        Command::Edit { id } => {
            let body = read_stdin().await?;
            engine.load_notes().await?;
            if engine.notes().get(id).is_none() {
                bail!("No note with id {id}");
            }
            session.open(id.as_str());
            session.edit(body);
            engine.save_current(session).await?;
        }
        Command::Delete { id } => {
            engine.load_notes().await?;
            engine.delete_note(session, id).await?;
        }
        Command::Upload { id, file } => {
            let Some(base) = &cli.upload_url else {
                bail!("No upload URL configured (set --upload-url or NOTES_UPLOAD_URL)");
            };
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .context("Upload path has no file name")?;
            let bytes = tokio::fs::read(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let url = UploadClient::new(base.as_str())
                .upload(id, &filename, bytes)
                .await?;
            println!("{url}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let repo_path = cli.repo_path();
    let store = Arc::new(GitStore::open_or_init(&repo_path)?);
    info!("Repository: {}", store.path().display());

    let fs = NativeFs::new(repo_path);
    let mut engine = SyncEngine::new(fs, store, cli.repo_config(), cli.layout());

    let _status = engine.events().subscribe(|event| match event {
        SyncEvent::StatusChanged { label, .. } => println!("{label}"),
        SyncEvent::ConflictCommitted { paths, .. } => {
            for path in paths {
                println!("conflict: {path}");
            }
        }
        other => debug!("{:?}", other),
    });

    let mut session = Session::new();
    run(&cli, &mut engine, &mut session).await
}
