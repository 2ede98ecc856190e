//! Keepsake CLI - run backups and restores of a drive fixture.
//!
//! The drive is described by a JSON fixture and served from memory, so a run
//! exercises the collection, URL cache and restore paths end to end.

mod fixture;
mod run;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use keepsake_engine::Options;
use keepsake_remote::CollisionPolicy;

use crate::fixture::Fixture;
use crate::run::{run_backup, run_restore, Report};

#[derive(Parser)]
#[command(name = "keepsake")]
#[command(about = "Keepsake - backup and restore runs over drive fixtures")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Options file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a drive fixture and print the report.
    Backup {
        /// Fixture describing the drive.
        #[arg(short, long)]
        fixture: PathBuf,

        /// Stop at the first item error.
        #[arg(long)]
        fail_fast: bool,

        /// Concurrent item fetches per collection.
        #[arg(short, long)]
        parallelism: Option<usize>,
    },

    /// Back up a drive fixture, restore it and print the report.
    Restore {
        /// Fixture describing the drive.
        #[arg(short, long)]
        fixture: PathBuf,

        /// What to do with names already taken: "copy", "replace" or "skip".
        #[arg(long)]
        on_collision: Option<CollisionPolicy>,

        /// Restore into the drive that was backed up instead of a fresh one.
        #[arg(long)]
        in_place: bool,

        /// Stop at the first item error.
        #[arg(long)]
        fail_fast: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut options = load_options(cli.config.as_deref())?;

    match cli.command {
        Commands::Backup {
            fixture,
            fail_fast,
            parallelism,
        } => {
            options.fail_fast |= fail_fast;
            if let Some(n) = parallelism {
                options.parallelism.item_fetch = n;
            }
            cmd_backup(&fixture, &options).await
        }

        Commands::Restore {
            fixture,
            on_collision,
            in_place,
            fail_fast,
        } => {
            options.fail_fast |= fail_fast;
            if let Some(policy) = on_collision {
                options.restore.on_collision = policy;
            }
            cmd_restore(&fixture, &options, in_place).await
        }
    }
}

/// Read options from a file, or use the defaults.
fn load_options(path: Option<&Path>) -> Result<Options> {
    let Some(path) = path else {
        return Ok(Options::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read options {}", path.display()))?;
    Options::from_json(&raw).context("Invalid options")
}

/// Back up a fixture.
async fn cmd_backup(fixture: &Path, options: &Options) -> Result<()> {
    options.validate().context("Invalid options")?;
    let fixture = Fixture::from_file(fixture)?;
    info!("Backing up drive {} of {}", fixture.drive, fixture.owner);

    let backup = run_backup(&fixture, options).await?;
    print_report(&backup.report)
}

/// Back up and restore a fixture.
async fn cmd_restore(fixture: &Path, options: &Options, in_place: bool) -> Result<()> {
    options.validate().context("Invalid options")?;
    let fixture = Fixture::from_file(fixture)?;
    info!(
        "Restoring drive {} of {} ({})",
        fixture.drive,
        fixture.owner,
        if in_place { "in place" } else { "fresh destination" }
    );

    let report = run_restore(&fixture, options, in_place).await?;
    print_report(&report)
}

fn print_report(report: &Report) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(report)?);

    if let Some(failure) = &report.errors.failure {
        anyhow::bail!("Operation failed: {}", failure);
    }
    if !report.errors.items.is_empty() {
        println!(
            "\nCompleted with {} item errors.",
            report.errors.items.len()
        );
    }
    Ok(())
}
