//! Console output for the store-backup CLI
//!
//! A spinner for long-running tree operations and the summaries printed
//! when they finish.

use crate::chain::GenerationStatus;
use crate::merge::MergeReport;
use crate::stats::{FolderSummary, PurgeStats};
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner shown while an operation runs
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        let spinner = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        bar.set_style(spinner);
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

fn rule() -> String {
    style("─".repeat(50)).dim().to_string()
}

/// Print a header before an operation starts
pub fn print_header(operation: &str, path: &str) {
    println!();
    println!(
        "{} {}",
        style("store-backup").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", rule());
    println!("  {} {}", style("Operation:").bold(), operation);
    println!("  {} {}", style("Tree:").bold(), path);
    println!();
}

pub fn print_merge_summary(report: &MergeReport) {
    println!();
    if report.generations.is_empty() {
        println!("{}", style("Nothing to merge").green().bold());
        println!();
        return;
    }
    let generations: Vec<String> = report.generations.iter().map(|g| g.to_string()).collect();

    println!("{}", style("Merge Complete").green().bold());
    println!("{}", rule());
    println!("  {} {}", style("Generations:").bold(), generations.join(", "));
    println!("  {} {}", style("Folders added:").bold(), report.folders_added);
    println!("  {} {}", style("Folders updated:").bold(), report.folders_updated);
    println!("  {} {}", style("Folders deleted:").bold(), report.folders_removed);
    println!(
        "  {} {}",
        style("Records merged:").bold(),
        format_number(report.records_merged)
    );
    println!();
}

pub fn print_purge_summary(stats: &PurgeStats, age_days: u32) {
    println!();
    println!("{}", style("Purge Complete").green().bold());
    println!("{}", rule());
    println!("  {} {} days", style("Older than:").bold(), age_days);
    println!(
        "  {} {}",
        style("Folders removed:").bold(),
        format_number(stats.folders_removed)
    );
    println!(
        "  {} {}",
        style("Items removed:").bold(),
        format_number(stats.items_removed)
    );
    println!();
}

/// Print one line per folder plus totals
pub fn print_tree_stats(folders: &[FolderSummary]) {
    println!();
    println!(
        "{:<40} {:>10} {:>10} {:>10}",
        style("Folder").bold(),
        style("Items").bold(),
        style("Deleted").bold(),
        style("Size").bold()
    );
    println!("{}", rule());

    let (mut items, mut tombstones, mut bytes) = (0u64, 0u64, 0u64);
    for folder in folders {
        let name = if folder.folder_deleted {
            style(format!("{} (deleted)", folder.path)).dim().to_string()
        } else {
            folder.path.clone()
        };
        println!(
            "{:<40} {:>10} {:>10} {:>10}",
            name,
            format_number(folder.items),
            format_number(folder.tombstones),
            format_size(folder.disk_bytes, BINARY)
        );
        items += folder.items;
        tombstones += folder.tombstones;
        bytes += folder.disk_bytes;
    }

    println!("{}", rule());
    println!(
        "{:<40} {:>10} {:>10} {:>10}",
        format!("{} folders", folders.len()),
        format_number(items),
        format_number(tombstones),
        format_size(bytes, BINARY)
    );
    println!();
}

pub fn print_generations(generations: &[GenerationStatus]) {
    println!();
    if generations.is_empty() {
        println!("{}", style("No differential generations").dim());
        println!();
        return;
    }
    for status in generations {
        let state = if status.merged {
            style("merged").green()
        } else {
            style("pending").yellow()
        };
        let scope = if status.info.folder_scoped {
            " (folders only)"
        } else {
            ""
        };
        println!(
            "  {:>4}  {}  from {}  {} folders  {}{}",
            status.info.generation,
            status.info.timestamp,
            status.info.from_generation,
            status.folders,
            state,
            scope
        );
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
        assert_eq!(format_number(1234567890), "1,234,567,890");
    }
}
