//! Failure summaries and exported reports.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{FailFastMode, FailFastStrategy, FailureEvent, SkipDecision, ThresholdConfig};
use crate::error::Result;
use crate::persist::write_json_atomic;

/// Per-category failure breakdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryFailureSummary {
    pub executed: u32,
    pub failures: usize,
    pub critical_failures: usize,
    pub failure_rate: f64,
    pub failed_tests: BTreeSet<String>,
}

/// Aggregate view of the run so far.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub mode: FailFastMode,
    pub total_failures: usize,
    pub critical_failures: usize,
    pub consecutive_failures: u32,
    /// Failure counts keyed by impact level.
    pub impact_breakdown: BTreeMap<String, usize>,
    pub categories: BTreeMap<String, CategoryFailureSummary>,
    pub decisions: usize,
    pub skipped_tests: BTreeSet<String>,
    pub skipped_categories: BTreeSet<String>,
    pub flaky_tests: Vec<String>,
}

/// Everything recorded during a run, for post-run analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub generated_at: DateTime<Utc>,
    pub summary: FailureSummary,
    pub thresholds: ThresholdConfig,
    pub failures: Vec<FailureEvent>,
    pub decisions: Vec<SkipDecision>,
}

impl FailFastStrategy {
    pub fn get_failure_summary(&self) -> FailureSummary {
        let mut impact_breakdown = BTreeMap::new();
        for event in &self.failures {
            *impact_breakdown
                .entry(event.impact_level.to_string())
                .or_insert(0) += 1;
        }

        let mut categories: BTreeMap<String, CategoryFailureSummary> = self
            .category_counts()
            .into_iter()
            .map(|(name, (executed, failed))| {
                let summary = CategoryFailureSummary {
                    executed,
                    failure_rate: if executed == 0 {
                        0.0
                    } else {
                        f64::from(failed) / f64::from(executed)
                    },
                    ..Default::default()
                };
                (name.to_string(), summary)
            })
            .collect();
        for event in &self.failures {
            let entry = categories.entry(event.category.clone()).or_default();
            entry.failures += 1;
            if event.is_critical() {
                entry.critical_failures += 1;
            }
            entry.failed_tests.insert(event.test_name.clone());
        }

        FailureSummary {
            mode: self.mode,
            total_failures: self.failures.len(),
            critical_failures: self.critical_failure_count(),
            consecutive_failures: self.consecutive_failures,
            impact_breakdown,
            categories,
            decisions: self.decisions.len(),
            skipped_tests: self
                .decisions
                .iter()
                .flat_map(|d| d.skipped_tests.iter().cloned())
                .collect(),
            skipped_categories: self
                .decisions
                .iter()
                .flat_map(|d| d.skipped_categories.iter().cloned())
                .collect(),
            flaky_tests: self
                .history
                .flaky_tests()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn failure_report(&self) -> FailureReport {
        FailureReport {
            generated_at: Utc::now(),
            summary: self.get_failure_summary(),
            thresholds: self.thresholds.clone(),
            failures: self.failures.clone(),
            decisions: self.decisions.clone(),
        }
    }

    /// Write the failure report to `path` as JSON.
    pub fn export_failure_report(&self, path: &Path) -> Result<()> {
        let report = self.failure_report();
        write_json_atomic(path, &report)?;
        info!(
            path = %path.display(),
            failures = report.failures.len(),
            decisions = report.decisions.len(),
            "exported failure report"
        );
        Ok(())
    }
}
