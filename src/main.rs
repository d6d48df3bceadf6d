// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dlsync::download::removal::{find_stranded_temps, restore_stranded, StdFileOps};
use dlsync::download::{
    BatchReport, DownloadId, DownloadQueue, DownloadStatus, EnqueueRequest, JsonQueue,
    QueuePoller, RemovalError, RemovalOutcome, SessionController,
};
use dlsync::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const ERROR: i32 = 1;
    /// Permission denied on a file
    pub const NO_PERM: i32 = 77;
}

#[derive(Parser)]
#[command(name = "dlsync")]
#[command(version = VERSION)]
#[command(about = "Keep a download list in sync with its queue, and remove entries safely.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.dlsync/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show all downloads
    List,
    /// Follow the download list as it changes (Ctrl+C to stop)
    Watch,
    /// Queue a new download
    Add {
        url: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Mark a download as finished with the given file
    Complete { id: DownloadId, path: PathBuf },
    /// Remove a download from the list (deletes its file unless --keep-file)
    Remove {
        id: DownloadId,
        #[arg(long)]
        keep_file: bool,
    },
    /// Delete a download's file but keep it in the list
    DeleteFile { id: DownloadId },
    /// Remove failed and orphaned downloads
    Clean,
    /// Remove every download (deletes files unless --keep-files)
    RemoveAll {
        #[arg(long)]
        keep_files: bool,
    },
    /// Remove finished downloads from the list, keeping their files
    Clear,
    /// Download a failed or orphaned entry again
    Redownload { id: DownloadId },
    /// Restore files left under temporary names by an interrupted removal
    Recover,
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "dlsync=debug" } else { "dlsync=info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env("DLSYNC_LOG")
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct App {
    config: Config,
    queue: Arc<JsonQueue>,
}

impl App {
    fn open(config: Config) -> Result<Self> {
        let queue = JsonQueue::open(config.queue_path()?, config.downloads_dir()?);
        Ok(Self {
            config,
            queue: Arc::new(queue),
        })
    }

    /// A long-running session that follows the queue.
    fn session(&self) -> Result<SessionController> {
        let poller = QueuePoller::new(self.queue.clone(), self.config.poll_interval());
        Ok(
            SessionController::new(self.queue.clone(), self.config.session_config()?)
                .with_channel(Arc::new(self.queue.changes().clone()))
                .with_channel(Arc::new(poller)),
        )
    }

    /// A session with its records loaded, for one-shot commands.
    async fn loaded_session(&self) -> Result<SessionController> {
        let config = self.config.one_shot_session_config()?;
        let session = SessionController::new(self.queue.clone(), config);
        session.engine().full_reload().await;
        Ok(session)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<RemovalError>() {
            Some(removal) => {
                eprintln!("{}", removal.user_message());
                let code = if removal.is_permission_denied() {
                    exit_codes::NO_PERM
                } else {
                    exit_codes::ERROR
                };
                std::process::exit(code);
            }
            None => {
                eprintln!("{} {:#}", "[✗]".red(), e);
                std::process::exit(exit_codes::ERROR);
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let app = App::open(config)?;

    match cli.command {
        Commands::List => {
            let session = app.loaded_session().await?;
            print_list(&session);
        }
        Commands::Watch => watch(&app).await?,
        Commands::Add { url, title } => {
            let id = app
                .queue
                .enqueue(EnqueueRequest {
                    uri: url,
                    title,
                    destination_hint: None,
                })
                .context("Failed to queue download")?;
            println!("{} Queued download {}", "[OK]".green(), id);
        }
        Commands::Complete { id, path } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("No such file: {}", path.display()))?;
            if app.queue.mark_complete(id, &path)? {
                println!("{} Download {} complete: {}", "[OK]".green(), id, path.display());
            } else {
                println!("{} No download with id {}", "[!]".yellow(), id);
            }
        }
        Commands::Remove { id, keep_file } => {
            let session = app.loaded_session().await?;
            let outcome = if keep_file {
                session.request_remove_and_keep(id).await?
            } else {
                session.request_remove_and_delete(id).await?
            };
            print_outcome(id, outcome);
        }
        Commands::DeleteFile { id } => {
            let session = app.loaded_session().await?;
            let outcome = session.request_delete_file_only(id).await?;
            print_outcome(id, outcome);
        }
        Commands::Clean => {
            let session = app.loaded_session().await?;
            if !session.current_flags().has_failed_or_orphaned {
                println!("No failed or orphaned downloads to clean");
                return Ok(());
            }
            print_batch("Clean", &session.request_clean().await?);
        }
        Commands::RemoveAll { keep_files } => {
            let session = app.loaded_session().await?;
            print_batch("Remove all", &session.request_remove_all(keep_files).await?);
        }
        Commands::Clear => {
            let session = app.loaded_session().await?;
            print_batch("Clear", &session.request_clear().await?);
        }
        Commands::Redownload { id } => {
            let session = app.loaded_session().await?;
            let new_id = session.redownload(id).await?;
            println!("{} Download {} queued again as {}", "[OK]".green(), id, new_id);
        }
        Commands::Recover => recover(&app)?,
    }
    Ok(())
}

fn print_list(session: &SessionController) {
    let records = session.current_records();
    if records.is_empty() {
        println!("{}", "No downloads".dimmed());
        return;
    }
    for record in &records {
        let title = match record.status {
            DownloadStatus::Failed => record.title.red(),
            DownloadStatus::Running => record.title.cyan(),
            _ if record.is_orphaned() => record.title.yellow(),
            _ => record.title.normal(),
        };
        println!("{:>5}  {}", record.id.to_string().bold(), title);
        for line in session.status_line(record).lines() {
            println!("       {}", line.dimmed());
        }
    }
    let flags = session.current_flags();
    if flags.has_failed_or_orphaned {
        println!();
        println!("{} Run `dlsync clean` to remove failed and orphaned entries", "[!]".yellow());
    }
}

async fn watch(app: &App) -> Result<()> {
    let session = app.session()?;
    let mut snapshots = session.subscribe();
    session.start();
    println!("Watching {} (Ctrl+C to stop)", app.queue.path().display());

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                match snapshot.progress {
                    Some((done, total)) => println!("{} {}/{}", "Loading".dimmed(), done, total),
                    None => {
                        println!("{}", format!("-- {} downloads --", snapshot.records.len()).bold());
                        print_list(&session);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.stop().await;
    Ok(())
}

fn recover(app: &App) -> Result<()> {
    let dir = app.config.downloads_dir()?;
    let stranded = find_stranded_temps(&dir)
        .with_context(|| format!("Failed to scan {}", dir.display()))?;
    if stranded.is_empty() {
        println!("Nothing to recover in {}", dir.display());
        return Ok(());
    }
    for entry in &stranded {
        match restore_stranded(&StdFileOps, entry) {
            Ok(true) => println!("{} Restored {}", "[OK]".green(), entry.original_path.display()),
            Ok(false) => println!(
                "{} {} already exists; left {}",
                "[!]".yellow(),
                entry.original_path.display(),
                entry.temp_path.display()
            ),
            Err(e) => println!("{} {}: {}", "[✗]".red(), entry.temp_path.display(), e),
        }
    }
    Ok(())
}

fn print_outcome(id: DownloadId, outcome: RemovalOutcome) {
    let message = match outcome {
        RemovalOutcome::Removed => format!("Removed download {} and its file", id),
        RemovalOutcome::RemovedKeptFile { .. } => {
            format!("Removed download {} from the list, file kept", id)
        }
        RemovalOutcome::FileDeleted => format!("Deleted file of download {}", id),
        RemovalOutcome::AlreadyGone => {
            println!("{} Download {} was already gone", "[!]".yellow(), id);
            return;
        }
    };
    println!("{} {}", "[OK]".green(), message);
}

fn print_batch(label: &str, report: &BatchReport) {
    let s = report.summary;
    let tag = if s.failed == 0 { "[OK]".green() } else { "[!]".yellow() };
    println!(
        "{} {}: {} succeeded, {} failed, {} skipped",
        tag, label, s.succeeded, s.failed, s.skipped
    );
    if let Some(message) = report.failure_message(label) {
        eprintln!("\n{}", message);
    }
}
