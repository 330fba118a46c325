//! End-of-run presentation
//!
//! A styled header before dispatch and a summary block after it, printed to
//! stderr so line-mode output on stdout stays clean.

use crate::dispatch::DispatchResult;
use chrono::Utc;
use console::style;
use humansize::{format_size, BINARY};
use std::time::Duration;

/// Print a header at the start of a dispatch
pub fn print_header(mode: &str, workers: usize, task: &str, output: &str) {
    eprintln!();
    eprintln!(
        "{} {}",
        style("kssh").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!(
        "  {} {}",
        style("Started:").bold(),
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    eprintln!("  {} {}", style("Mode:").bold(), mode);
    eprintln!("  {} {}", style("Workers:").bold(), workers);
    eprintln!("  {} {}", style("Task:").bold(), task);
    eprintln!("  {} {}", style("Output:").bold(), output);
    eprintln!();
}

/// Print a summary of the dispatch results
pub fn print_summary(result: &DispatchResult) {
    let duration_secs = result.duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        result.completed as f64 / duration_secs
    } else {
        0.0
    };

    eprintln!();
    eprintln!("{}", style("Dispatch Complete").green().bold());
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Blocks:").bold(), result.completed);
    if result.lost > 0 {
        eprintln!("  {} {}", style("Lost:").yellow().bold(), result.lost);
    }
    eprintln!(
        "  {} {}",
        style("Fetched:").bold(),
        format_size(result.bytes_fetched, BINARY)
    );
    eprintln!(
        "  {} {} ({:.2} blocks/sec)",
        style("Duration:").bold(),
        format_elapsed(result.duration),
        rate
    );
    if result.excluded > 0 {
        eprintln!(
            "  {} {}",
            style("Excluded workers:").yellow().bold(),
            result.excluded
        );
    }
    for worker in &result.workers {
        let flag = if worker.excluded { " [excluded]" } else { "" };
        eprintln!(
            "    {:<24} {:>6} blocks  {:>3} errors{}",
            worker.hostname, worker.completed, worker.errors, flag
        );
    }
    eprintln!();
}

/// Format a duration as `NhMMmSSs`, dropping leading zero units
pub fn format_elapsed(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{hours}h{minutes:02}m{seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(5)), "5s");
        assert_eq!(format_elapsed(Duration::from_secs(65)), "1m05s");
        assert_eq!(format_elapsed(Duration::from_secs(3725)), "1h02m05s");
    }
}
