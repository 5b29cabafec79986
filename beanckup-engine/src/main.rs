//! Beanckup - Main entry point
//!
//! Prepares and runs incremental backups of episode directories.

use anyhow::Result;
use beanckup_engine::config::{DiffMode, EngineConfig};
use beanckup_engine::transfer::progress::{format_bytes, format_duration, format_speed};
use beanckup_engine::{utils, JsonManifestStore, PrepareRequest, TaskDriver, TaskStatus, TreeNode};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan an episode and show what changed since its last backup
    Prepare {
        #[command(flatten)]
        episode: EpisodeArgs,

        /// Print the preparation result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Back up the changes of an episode
    Run {
        #[command(flatten)]
        episode: EpisodeArgs,

        /// Destination directory
        #[arg(short, long, value_name = "DIR")]
        destination: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
struct EpisodeArgs {
    /// Episode root directory
    root: PathBuf,

    /// Series the episode belongs to
    #[arg(short, long)]
    series: String,

    /// Episode identifier
    #[arg(short, long)]
    episode: String,

    /// Re-hash every previously backed-up file instead of trusting size and mtime
    #[arg(long)]
    verify: bool,
}

impl EpisodeArgs {
    fn request(&self) -> PrepareRequest {
        PrepareRequest::new(&self.root, &self.series, &self.episode)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        EngineConfig::from_file(config_path)?
    } else {
        EngineConfig::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let episode = match &args.command {
        Command::Prepare { episode, .. } | Command::Run { episode, .. } => episode,
    };
    if episode.verify {
        config.diff.mode = DiffMode::Verify;
    }
    config.validate()?;

    tracing::info!("Starting beanckup v{}", env!("CARGO_PKG_VERSION"));

    let manifest_dir = resolve_manifest_dir(&config.store.manifest_dir, &episode.root);
    info!("Manifests are kept in {}", manifest_dir.display());
    let driver = TaskDriver::new(config, Arc::new(JsonManifestStore::new(manifest_dir)));

    match &args.command {
        Command::Prepare { episode, json } => {
            let prepared = driver.prepare_backup(episode.request()).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&prepared)?);
            } else {
                print_tree(&prepared.file_tree, 0);
                let c = prepared.change_info;
                println!(
                    "\n{} new, {} modified, {} deleted; {} in the episode",
                    c.new_count,
                    c.modified_count,
                    c.deleted_count,
                    format_bytes(c.total_size)
                );
                for warning in &prepared.warnings {
                    println!("warning: {}: {}", warning.path, warning.message);
                }
            }
        }
        Command::Run {
            episode,
            destination,
        } => {
            let task = driver
                .start_backup(episode.request().into_run(destination))
                .await?;

            let printer = tokio::spawn(print_status(driver.subscribe()));

            let interrupt_driver = driver.clone();
            let interrupt = tokio::spawn(async move {
                wait_for_signal().await;
                interrupt_driver.cancel_task().await;
            });

            let result = task.wait().await;
            interrupt.abort();
            printer.abort();
            eprintln!();

            let result = result?;
            let stats = result.stats;
            println!(
                "Backed up {} file(s) ({}), {} deduplicated, {} unchanged, {} deleted",
                stats.copied_files,
                format_bytes(stats.copied_bytes),
                stats.deduplicated_files,
                stats.unchanged_files,
                stats.deleted_files
            );
            for warning in &result.warnings {
                println!("warning: {}: {}", warning.path, warning.message);
            }
        }
    }

    Ok(())
}

/// Relative manifest directories live inside the episode root, where the
/// scanner's default exclusion keeps them out of the backup.
fn resolve_manifest_dir(configured: &Path, root: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), cancelling after the current files...");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling after the current files...");
        }
    }
}

async fn print_status(mut rx: tokio::sync::watch::Receiver<TaskStatus>) {
    while rx.changed().await.is_ok() {
        let status = rx.borrow_and_update().clone();
        let eta = status
            .estimated_time
            .map(format_duration)
            .unwrap_or_else(|| "--".to_string());
        eprint!(
            "\r{:<10} {:>5.1}%  {}/{} files  {}/{}  {}  ETA {}   ",
            status.current_phase,
            status.progress * 100.0,
            status.processed_files,
            status.total_files,
            format_bytes(status.processed_size),
            format_bytes(status.total_size),
            format_speed(status.speed),
            eta
        );
        let _ = std::io::stderr().flush();
    }
}

fn print_tree(nodes: &[TreeNode], depth: usize) {
    for node in nodes {
        let indent = "  ".repeat(depth);
        if node.is_dir {
            println!("{}{}/", indent, node.name);
            print_tree(&node.children, depth + 1);
        } else {
            let status = node.status.map(|s| s.to_string()).unwrap_or_default();
            match &node.error {
                Some(error) => println!("{}{} [{}] ({})", indent, node.name, status, error),
                None => println!("{}{} [{}]", indent, node.name, status),
            }
        }
    }
}
