//! Test splitting into execution windows.
//!
//! The splitter discovers individual tests, scores them with historical
//! timing data, and bins them into [`TestExecutionWindow`]s sized to a target
//! duration using one of several [`SplittingStrategy`] variants.

pub mod discovery;
pub mod history;
pub mod rebalance;
pub mod strategies;

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ParseEnumError;

pub use history::{TestHistory, TestHistoryEntry};
pub use rebalance::{rebalance_windows, split_statistics, SplitStatistics};

/// Tests slower than this (seconds) get their own windows in hybrid splitting.
pub const SLOW_TEST_SECONDS: f64 = 300.0;

/// Ratio between a window's admission ceiling and the target duration.
pub const MAX_DURATION_FACTOR: f64 = 1.5;

/// A resource a test needs while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Database,
    Network,
    Memory,
    Cpu,
    FileSystem,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::Network => "network",
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::FileSystem => "file_system",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single discovered test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    pub name: String,
    pub category: String,
    pub file_path: PathBuf,
    /// Heuristic duration estimate in seconds.
    pub estimated_duration: f64,
    #[serde(default)]
    pub average_duration: Option<f64>,
    #[serde(default)]
    pub last_run_duration: Option<f64>,
    /// Complexity heuristic, always at least 1.
    pub complexity_score: f64,
    pub success_rate: f64,
    pub failure_rate: f64,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub resource_requirements: BTreeSet<ResourceKind>,
    /// Markers such as `critical`, `smoke`, `sequential` or `isolation`.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub flaky: bool,
    #[serde(default)]
    pub slow: bool,
}

impl TestItem {
    pub fn new(
        name: impl Into<String>,
        category: impl Into<String>,
        estimated_duration: f64,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            file_path: PathBuf::new(),
            estimated_duration: estimated_duration.max(0.0),
            average_duration: None,
            last_run_duration: None,
            complexity_score: 1.0,
            success_rate: 1.0,
            failure_rate: 0.0,
            dependencies: BTreeSet::new(),
            resource_requirements: BTreeSet::new(),
            tags: BTreeSet::new(),
            flaky: false,
            slow: false,
        }
    }

    pub fn with_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = path.into();
        self
    }

    pub fn with_complexity(mut self, score: f64) -> Self {
        self.complexity_score = score.max(1.0);
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_resources<I>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = ResourceKind>,
    {
        self.resource_requirements.extend(resources);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_flaky(mut self, flaky: bool) -> Self {
        self.flaky = flaky;
        self
    }

    pub fn with_success_rate(mut self, success_rate: f64, failure_rate: f64) -> Self {
        self.success_rate = success_rate.clamp(0.0, 1.0);
        self.failure_rate = failure_rate.clamp(0.0, 1.0);
        self
    }

    /// Key under which timing history is stored: `file::function`.
    pub fn history_key(&self) -> String {
        format!("{}::{}", self.file_path.display(), self.name)
    }

    /// Average duration, else last observed duration, else the estimate.
    pub fn effective_duration(&self) -> f64 {
        self.average_duration
            .or(self.last_run_duration)
            .unwrap_or(self.estimated_duration)
    }

    pub fn reliability_score(&self) -> f64 {
        if self.flaky {
            0.3
        } else {
            (self.success_rate - 0.5 * self.failure_rate).max(0.1)
        }
    }

    pub fn is_critical(&self) -> bool {
        self.tags.contains("critical") || self.tags.contains("smoke")
    }

    pub fn needs_isolation(&self) -> bool {
        self.tags.contains("isolation")
            || self.resource_requirements.contains(&ResourceKind::Database)
    }

    pub fn forbids_parallel(&self) -> bool {
        self.tags.contains("sequential") || self.tags.contains("not_parallel")
    }

    /// Fold persisted history into this item.
    pub fn apply_history(&mut self, entry: &TestHistoryEntry) {
        if entry.run_count == 0 {
            return;
        }
        self.average_duration = Some(entry.avg_duration);
        self.last_run_duration = entry.durations.last().copied();
        self.success_rate = entry.success_rate;
        self.failure_rate = entry.failure_rate;
        self.flaky |= entry.flaky;
        self.slow |= entry.slow;
    }
}

/// Window priority. Lower values run earlier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum WindowPriority {
    Critical = 1,
    High = 2,
    #[default]
    Normal = 3,
    Low = 4,
    Background = 5,
}

impl fmt::Display for WindowPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WindowPriority::Critical => "critical",
            WindowPriority::High => "high",
            WindowPriority::Normal => "normal",
            WindowPriority::Low => "low",
            WindowPriority::Background => "background",
        };
        f.write_str(label)
    }
}

/// A bin of tests sized to fit a duration budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecutionWindow {
    pub id: usize,
    pub tests: Vec<TestItem>,
    pub priority: WindowPriority,
    /// Sum of member effective durations in seconds.
    pub estimated_duration: f64,
    /// Admission ceiling in seconds.
    pub max_duration: f64,
    pub resource_requirements: BTreeSet<ResourceKind>,
    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub parallel_safe: bool,
    pub requires_isolation: bool,
    /// Members always run one after another.
    pub sequential: bool,
    /// Isolation forced regardless of members.
    pub isolated: bool,
    pub balancing_score: f64,
}

impl TestExecutionWindow {
    pub fn new(id: usize, priority: WindowPriority, max_duration: f64) -> Self {
        Self {
            id,
            tests: Vec::new(),
            priority,
            estimated_duration: 0.0,
            max_duration,
            resource_requirements: BTreeSet::new(),
            categories: BTreeSet::new(),
            tags: BTreeSet::new(),
            parallel_safe: true,
            requires_isolation: false,
            sequential: false,
            isolated: false,
            balancing_score: 0.0,
        }
    }

    /// A window whose members run one after another.
    pub fn sequential(id: usize, priority: WindowPriority, max_duration: f64) -> Self {
        let mut window = Self::new(id, priority, max_duration);
        window.sequential = true;
        window.parallel_safe = false;
        window
    }

    pub fn with_isolation(mut self) -> Self {
        self.isolated = true;
        self.requires_isolation = true;
        self
    }

    /// A window holding exactly `test`, with the ceiling raised to fit it.
    pub fn dedicated(test: TestItem, priority: WindowPriority, max_duration: f64) -> Self {
        let ceiling = max_duration.max(test.effective_duration());
        let mut window = Self::new(0, priority, ceiling);
        window.push_unchecked(test);
        window
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn remaining_capacity(&self) -> f64 {
        self.max_duration - self.estimated_duration
    }

    pub fn average_complexity(&self) -> f64 {
        if self.tests.is_empty() {
            return 0.0;
        }
        self.tests.iter().map(|t| t.complexity_score).sum::<f64>() / self.tests.len() as f64
    }

    /// Load metric used by complexity-based splitting.
    pub fn complexity_load(&self) -> f64 {
        self.average_complexity() * self.tests.len() as f64
    }

    /// Category with the most members.
    pub fn dominant_category(&self) -> Option<&str> {
        let mut counts: std::collections::BTreeMap<&str, usize> = Default::default();
        for test in &self.tests {
            *counts.entry(test.category.as_str()).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(category, _)| category)
    }

    /// Whether `test` may be admitted without breaking the window invariants.
    pub fn can_fit(&self, test: &TestItem) -> bool {
        if self.estimated_duration + test.effective_duration() > self.max_duration {
            return false;
        }
        if self.sequential || self.tests.is_empty() {
            return true;
        }
        let isolation = self.requires_isolation || test.needs_isolation();
        !(isolation
            && test
                .resource_requirements
                .iter()
                .any(|resource| self.resource_requirements.contains(resource)))
    }

    /// Admit `test`, or hand it back if it does not fit.
    pub fn add_test(&mut self, test: TestItem) -> Result<(), TestItem> {
        if !self.can_fit(&test) {
            return Err(test);
        }
        self.push_unchecked(test);
        Ok(())
    }

    /// Remove and return the test at `index`.
    pub fn take_test(&mut self, index: usize) -> TestItem {
        let test = self.tests.remove(index);
        self.recompute();
        test
    }

    pub(crate) fn push_unchecked(&mut self, test: TestItem) {
        self.tests.push(test);
        self.recompute();
    }

    fn recompute(&mut self) {
        self.estimated_duration = self.tests.iter().map(TestItem::effective_duration).sum();
        self.resource_requirements = self
            .tests
            .iter()
            .flat_map(|t| t.resource_requirements.iter().copied())
            .collect();
        self.categories = self.tests.iter().map(|t| t.category.clone()).collect();
        self.tags = self
            .tests
            .iter()
            .flat_map(|t| t.tags.iter().cloned())
            .collect();
        self.parallel_safe = !self.sequential && !self.tests.iter().any(TestItem::forbids_parallel);
        self.requires_isolation = self.isolated || self.tests.iter().any(TestItem::needs_isolation);
        self.balancing_score = self.compute_balancing_score();
    }

    fn compute_balancing_score(&self) -> f64 {
        if self.tests.is_empty() {
            return 0.0;
        }
        let durations: Vec<f64> = self.tests.iter().map(TestItem::effective_duration).collect();
        let complexities: Vec<f64> = self.tests.iter().map(|t| t.complexity_score).collect();
        let reliability = self.tests.iter().map(TestItem::reliability_score).sum::<f64>()
            / self.tests.len() as f64;
        let resource_component = if self.resource_requirements.len() > 2 {
            0.0
        } else {
            1.0
        };

        let score = 0.3 * inverse_variation(&durations)
            + 0.2 * inverse_variation(&complexities)
            + 0.3 * reliability.min(1.0)
            + 0.2 * resource_component;
        score.clamp(0.0, 1.0)
    }
}

/// `1 - CV`, clamped to `[0, 1]`. Uniform samples score 1.
fn inverse_variation(values: &[f64]) -> f64 {
    let cv = coefficient_of_variation(values);
    (1.0 - cv).clamp(0.0, 1.0)
}

pub(crate) fn coefficient_of_variation(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

/// How tests are binned into windows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplittingStrategy {
    TimeBased,
    CountBased,
    CategoryBased,
    ComplexityBased,
    DependencyAware,
    #[default]
    Hybrid,
}

impl SplittingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            SplittingStrategy::TimeBased => "time_based",
            SplittingStrategy::CountBased => "count_based",
            SplittingStrategy::CategoryBased => "category_based",
            SplittingStrategy::ComplexityBased => "complexity_based",
            SplittingStrategy::DependencyAware => "dependency_aware",
            SplittingStrategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SplittingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplittingStrategy {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "time_based" => Ok(SplittingStrategy::TimeBased),
            "count_based" => Ok(SplittingStrategy::CountBased),
            "category_based" => Ok(SplittingStrategy::CategoryBased),
            "complexity_based" => Ok(SplittingStrategy::ComplexityBased),
            "dependency_aware" => Ok(SplittingStrategy::DependencyAware),
            "hybrid" => Ok(SplittingStrategy::Hybrid),
            _ => Err(ParseEnumError::new(
                "splitting strategy",
                s,
                "time_based, count_based, category_based, complexity_based, dependency_aware, hybrid",
            )),
        }
    }
}

/// Discovers tests and splits them into execution windows.
#[derive(Debug, Clone)]
pub struct TestSplitter {
    project_root: PathBuf,
    history: TestHistory,
}

impl TestSplitter {
    /// Create a splitter with in-memory history only.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            history: TestHistory::in_memory(),
        }
    }

    /// Create a splitter backed by a persisted history file.
    pub fn with_history_file(project_root: impl Into<PathBuf>, path: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            history: TestHistory::load(path),
        }
    }

    pub fn project_root(&self) -> &std::path::Path {
        &self.project_root
    }

    pub fn history(&self) -> &TestHistory {
        &self.history
    }

    /// Record one run of a test; the history file is rewritten immediately.
    pub fn update_test_history(&mut self, key: &str, duration: f64, success: bool) {
        self.history.record(key, duration, success);
    }

    /// Split `tests` into windows targeting `target_window_duration` seconds.
    ///
    /// Window ids are assigned in output order.
    pub fn create_windows(
        &self,
        tests: Vec<TestItem>,
        strategy: SplittingStrategy,
        target_window_duration: f64,
        max_windows: Option<usize>,
        max_parallel: usize,
    ) -> Vec<TestExecutionWindow> {
        let params = strategies::SplitParams::new(target_window_duration, max_windows, max_parallel);
        let test_count = tests.len();
        let mut windows = strategies::split(tests, strategy, &params);
        for (id, window) in windows.iter_mut().enumerate() {
            window.id = id;
        }

        info!(
            strategy = %strategy,
            tests = test_count,
            windows = windows.len(),
            "created execution windows"
        );
        windows
    }

    /// Move tests out of overloaded windows. See [`rebalance_windows`].
    pub fn rebalance_windows(&self, windows: Vec<TestExecutionWindow>) -> Vec<TestExecutionWindow> {
        rebalance_windows(windows)
    }
}
