//! Persisted per-test failure history.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persist::{load_json_or_default, write_json_atomic};

/// Minimum runs before a test can be flagged flaky.
pub const FLAKY_MIN_RUNS: u32 = 5;
/// Failure rate band in which a test with varied errors counts as flaky.
pub const FLAKY_RATE_RANGE: (f64, f64) = (0.2, 0.8);

/// Failure history of one test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFailureRecord {
    pub total_runs: u32,
    pub failure_count: u32,
    /// Error type histogram.
    #[serde(default)]
    pub failure_types: BTreeMap<String, u32>,
    pub avg_failure_duration: f64,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
    pub flaky: bool,
}

impl TestFailureRecord {
    pub fn failure_rate(&self) -> f64 {
        if self.total_runs == 0 {
            0.0
        } else {
            f64::from(self.failure_count) / f64::from(self.total_runs)
        }
    }

    fn record_failure(&mut self, error_type: &str, duration: Option<f64>, at: DateTime<Utc>) {
        self.total_runs += 1;
        self.failure_count += 1;
        *self.failure_types.entry(error_type.to_string()).or_insert(0) += 1;
        if let Some(duration) = duration {
            let n = f64::from(self.failure_count);
            self.avg_failure_duration += (duration - self.avg_failure_duration) / n;
        }
        self.last_failure = Some(at);
        self.update_flaky();
    }

    fn record_success(&mut self) {
        self.total_runs += 1;
        self.update_flaky();
    }

    fn update_flaky(&mut self) {
        let rate = self.failure_rate();
        self.flaky = self.total_runs >= FLAKY_MIN_RUNS
            && (FLAKY_RATE_RANGE.0..=FLAKY_RATE_RANGE.1).contains(&rate)
            && self.failure_types.len() >= 2;
    }
}

/// Failure history store keyed by test name.
#[derive(Debug, Clone, Default)]
pub struct FailureHistory {
    path: Option<PathBuf>,
    records: BTreeMap<String, TestFailureRecord>,
}

impl FailureHistory {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; missing or corrupt files give an empty history.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = load_json_or_default(&path);
        Self {
            path: Some(path),
            records,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, test_name: &str) -> Option<&TestFailureRecord> {
        self.records.get(test_name)
    }

    pub fn flaky_tests(&self) -> Vec<&str> {
        self.records
            .iter()
            .filter(|(_, r)| r.flaky)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn record_failure(
        &mut self,
        test_name: &str,
        error_type: &str,
        duration: Option<f64>,
        at: DateTime<Utc>,
    ) {
        self.records
            .entry(test_name.to_string())
            .or_default()
            .record_failure(error_type, duration, at);
        self.save();
    }

    pub fn record_success(&mut self, test_name: &str) {
        self.records
            .entry(test_name.to_string())
            .or_default()
            .record_success();
        self.save();
    }

    fn save(&self) {
        if let Some(path) = &self.path {
            if let Err(err) = write_json_atomic(path, &self.records) {
                warn!(path = %path.display(), error = %err, "failed to persist failure history");
            }
        }
    }
}
