//! Registry status overview.
//!
//! Per-state document counts plus the most recent failures, used by
//! `docflow status` to show where documents are stuck.

use std::fmt::Write;

use crate::documents::{DocumentRegistry, StateCount};
use crate::error::Result;

/// Number of failures shown by default.
pub const DEFAULT_FAILURE_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct FailureSummary {
    pub document_id: String,
    pub raw_file_name: String,
    pub state: String,
    pub stage: String,
    pub message: String,
    pub failed_at: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub counts: Vec<StateCount>,
    pub failures: Vec<FailureSummary>,
}

impl StatusReport {
    pub fn total(&self) -> i64 {
        self.counts.iter().map(|c| c.total).sum()
    }

    pub fn failed(&self) -> i64 {
        self.counts.iter().map(|c| c.failed).sum()
    }

    /// Plain-text rendering printed by the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "documents: {}", self.total());
        for count in &self.counts {
            let _ = writeln!(
                out,
                "  {:<20} {:>6}  (failed: {})",
                count.state.as_str(),
                count.total,
                count.failed
            );
        }

        if self.failures.is_empty() {
            let _ = writeln!(out, "recent failures: none");
        } else {
            let _ = writeln!(out, "recent failures:");
            for f in &self.failures {
                let _ = writeln!(
                    out,
                    "  {}  {}  [{} @ {}] {}: {}",
                    f.failed_at,
                    f.document_id,
                    f.stage,
                    f.state,
                    f.raw_file_name,
                    truncate(&f.message, 120)
                );
            }
        }
        out
    }
}

pub async fn collect(registry: &DocumentRegistry, failure_limit: i64) -> Result<StatusReport> {
    let counts = registry.state_counts().await?;
    let failures = registry
        .recent_failures(failure_limit)
        .await?
        .into_iter()
        .filter_map(|doc| {
            let failure = doc.failure?;
            Some(FailureSummary {
                document_id: doc.id,
                raw_file_name: doc.raw_file_name,
                state: doc.processing_state.to_string(),
                stage: failure.stage,
                message: failure.message,
                failed_at: failure.failed_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            })
        })
        .collect();

    Ok(StatusReport { counts, failures })
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
