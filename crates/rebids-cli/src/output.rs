//! Terminal summaries printed at the end of a workflow

use rebids_core::bidsmap::{RunCounts, SanityReport};
use std::fmt;

/// Per-workflow series counters
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkflowSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl WorkflowSummary {
    pub fn print(&self, workflow: &str) {
        println!("{workflow}: {self}");
    }
}

impl fmt::Display for WorkflowSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} series processed, {} skipped, {} failed",
            self.processed, self.skipped, self.failed
        )
    }
}

/// Print the map command's closing report: run counters plus the
/// sanity findings the user should act on before bidsifying
pub fn print_map_summary(counts: &RunCounts, report: &SanityReport) {
    println!(
        "bidsmap: {} runs ({} from templates, {} unchecked)",
        counts.total, counts.template, counts.unchecked
    );
    for (path, n) in &report.provenance_duplicates {
        println!("  ! {} validates {} runs", path.display(), n);
    }
    for (example, n) in &report.example_duplicates {
        println!("  ! example '{example}' produced by {n} runs");
    }
}
