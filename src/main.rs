//! store-backup - backup tree maintenance
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use store_backup::config::{parse_date, CliArgs, Command};
use store_backup::progress::{
    print_generations, print_header, print_merge_summary, print_purge_summary, print_tree_stats,
    ProgressReporter,
};
use store_backup::{list_generations, merge_generations, run_merge, run_purge, tree_stats};
use std::path::Path;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();
    setup_logging(args.verbose)?;
    let show = !args.quiet;

    match args.command {
        Command::Merge { path, generations } => {
            if show {
                print_header("merge", &display(&path));
            }
            let progress = show.then(ProgressReporter::new);
            if let Some(p) = &progress {
                p.set_status("Merging generations...");
            }

            let report = if generations.is_empty() {
                run_merge(&path)
            } else {
                merge_generations(&path, &generations)
            }
            .with_context(|| format!("Merge into '{}' failed", path.display()))?;

            if let Some(p) = &progress {
                p.finish_and_clear();
            }
            if show {
                print_merge_summary(&report);
            }
        }

        Command::Purge { path, days, as_of } => {
            let now = match as_of {
                Some(value) => parse_date(&value).context("Invalid --as-of date")?,
                None => Utc::now(),
            };
            if show {
                print_header("purge", &display(&path));
            }
            let progress = show.then(ProgressReporter::new);
            if let Some(p) = &progress {
                p.set_status("Purging deleted folders and items...");
            }

            let stats = run_purge(&path, days, now)
                .with_context(|| format!("Purge of '{}' failed", path.display()))?;

            if let Some(p) = &progress {
                p.finish_and_clear();
            }
            if show {
                print_purge_summary(&stats, days);
            }
        }

        Command::Stats { path, filter } => {
            let mut folders = tree_stats(&path)
                .with_context(|| format!("Failed to read '{}'", path.display()))?;
            if let Some(text) = filter {
                folders.retain(|f| f.path.contains(&text));
            }
            print_tree_stats(&folders);
        }

        Command::Generations { path } => {
            let generations = list_generations(&path)
                .with_context(|| format!("Failed to read chain of '{}'", path.display()))?;
            print_generations(&generations);
        }
    }

    Ok(())
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("store_backup=debug,warn")
    } else {
        EnvFilter::new("store_backup=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}
