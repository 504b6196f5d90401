//! Per-test timing history.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::SLOW_TEST_SECONDS;
use crate::persist::{load_json_or_default, write_json_atomic};

/// Number of recent durations kept per test.
pub const DURATION_WINDOW: usize = 10;

/// Timing and outcome history for one test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestHistoryEntry {
    pub run_count: u32,
    pub total_duration: f64,
    pub success_count: u32,
    pub failure_count: u32,
    /// Most recent durations, oldest first.
    pub durations: Vec<f64>,
    pub avg_duration: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub flaky: bool,
    pub slow: bool,
}

impl TestHistoryEntry {
    fn record(&mut self, duration: f64, success: bool) {
        self.run_count += 1;
        self.total_duration += duration;
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }

        self.durations.push(duration);
        if self.durations.len() > DURATION_WINDOW {
            let excess = self.durations.len() - DURATION_WINDOW;
            self.durations.drain(..excess);
        }

        let n = self.durations.len() as f64;
        self.avg_duration = self.durations.iter().sum::<f64>() / n;
        let variance = self
            .durations
            .iter()
            .map(|d| (d - self.avg_duration).powi(2))
            .sum::<f64>()
            / n;

        self.success_rate = f64::from(self.success_count) / f64::from(self.run_count);
        self.failure_rate = f64::from(self.failure_count) / f64::from(self.run_count);
        self.flaky = variance > (0.5 * self.avg_duration).powi(2);
        self.slow = self.avg_duration > SLOW_TEST_SECONDS;
    }
}

/// History store keyed by `file::function`.
#[derive(Debug, Clone, Default)]
pub struct TestHistory {
    path: Option<PathBuf>,
    entries: BTreeMap<String, TestHistoryEntry>,
}

impl TestHistory {
    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load the store at `path`. A missing or corrupt file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = load_json_or_default(&path);
        Self {
            path: Some(path),
            entries,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&TestHistoryEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &TestHistoryEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Record a run and persist the store. Write failures are logged.
    pub fn record(&mut self, key: &str, duration: f64, success: bool) -> &TestHistoryEntry {
        self.entries
            .entry(key.to_string())
            .or_default()
            .record(duration.max(0.0), success);
        self.save();

        debug!(test = key, duration, success, "recorded test history");
        &self.entries[key]
    }

    fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(err) = write_json_atomic(path, &self.entries) {
            warn!(path = %path.display(), error = %err, "failed to persist test history");
        }
    }
}
