//! Adaptive fail-fast decisions.
//!
//! [`FailFastStrategy`] accumulates [`FailureEvent`]s during a run and, when
//! asked between phases, decides whether the run should stop and which tests
//! or categories should be skipped. Decisions are advisory; the orchestrator
//! applies them.
//!
//! The strategy is not synchronised. Record outcomes from the single task that
//! coordinates execution.

pub mod classify;
pub mod history;
pub mod report;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::ParseEnumError;

use classify::{blast_radius, classify_impact, transitive_dependents, ImpactInputs};
pub use history::{FailureHistory, TestFailureRecord};
pub use report::{CategoryFailureSummary, FailureReport, FailureSummary};

/// Window within which repeated failures block a retry.
pub const RETRY_LOOKBACK_SECONDS: i64 = 300;
/// Upper bound on recommended retries.
pub const MAX_RETRIES: u32 = 3;

/// Policy used by [`FailFastStrategy::should_fail_fast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailFastMode {
    Disabled,
    FirstFailure,
    CategoryFailure,
    CriticalFailure,
    ThresholdBased,
    #[default]
    SmartAdaptive,
    DependencyAware,
}

impl FailFastMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailFastMode::Disabled => "disabled",
            FailFastMode::FirstFailure => "first_failure",
            FailFastMode::CategoryFailure => "category_failure",
            FailFastMode::CriticalFailure => "critical_failure",
            FailFastMode::ThresholdBased => "threshold_based",
            FailFastMode::SmartAdaptive => "smart_adaptive",
            FailFastMode::DependencyAware => "dependency_aware",
        }
    }
}

impl fmt::Display for FailFastMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailFastMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(FailFastMode::Disabled),
            "first_failure" => Ok(FailFastMode::FirstFailure),
            "category_failure" => Ok(FailFastMode::CategoryFailure),
            "critical_failure" => Ok(FailFastMode::CriticalFailure),
            "threshold_based" => Ok(FailFastMode::ThresholdBased),
            "smart_adaptive" => Ok(FailFastMode::SmartAdaptive),
            "dependency_aware" => Ok(FailFastMode::DependencyAware),
            _ => Err(ParseEnumError::new(
                "fail-fast mode",
                s,
                "disabled, first_failure, category_failure, critical_failure, threshold_based, smart_adaptive, dependency_aware",
            )),
        }
    }
}

/// Impact of a failure, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ImpactLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImpactLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            ImpactLevel::Low => "low",
            ImpactLevel::Medium => "medium",
            ImpactLevel::High => "high",
            ImpactLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for ImpactLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    FirstFailure,
    CategoryFailure,
    CriticalFailure,
    ThresholdExceeded,
    ConsecutiveFailures,
    DependencyFailure,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SkipReason::FirstFailure => "first_failure",
            SkipReason::CategoryFailure => "category_failure",
            SkipReason::CriticalFailure => "critical_failure",
            SkipReason::ThresholdExceeded => "threshold_exceeded",
            SkipReason::ConsecutiveFailures => "consecutive_failures",
            SkipReason::DependencyFailure => "dependency_failure",
        };
        f.write_str(label)
    }
}

/// A recorded test failure with its derived impact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEvent {
    pub test_name: String,
    pub category: String,
    pub timestamp: DateTime<Utc>,
    pub error_message: String,
    pub error_type: String,
    pub impact_level: ImpactLevel,
    /// The failing category plus categories implicated by the error text.
    pub affects_categories: BTreeSet<String>,
    /// Everything that transitively depends on the failed test or category.
    pub affects_dependencies: BTreeSet<String>,
    pub markers: BTreeSet<String>,
    pub duration: Option<f64>,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl FailureEvent {
    pub fn is_critical(&self) -> bool {
        self.impact_level == ImpactLevel::Critical
            || self.markers.contains("critical")
            || self.markers.contains("smoke")
    }

    pub fn is_retriable(&self) -> bool {
        self.impact_level <= ImpactLevel::Medium
            && self.markers.contains("flaky")
            && self.retry_count < self.max_retries
    }
}

/// Input to [`FailFastStrategy::record_failure`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestFailure {
    pub test_name: String,
    pub category: String,
    pub error_message: String,
    pub error_type: String,
    pub markers: BTreeSet<String>,
    pub duration: Option<f64>,
    pub retry_count: u32,
}

impl TestFailure {
    pub fn new(test_name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error_type: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self.error_message = message.into();
        self
    }

    pub fn with_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.markers.extend(markers.into_iter().map(Into::into));
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// An advisory decision naming what to skip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipDecision {
    pub reason: SkipReason,
    pub skipped_tests: BTreeSet<String>,
    pub skipped_categories: BTreeSet<String>,
    pub reasoning: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Tests whose failures led to this decision.
    pub triggered_by: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl SkipDecision {
    fn new(reason: SkipReason, reasoning: impl Into<String>, confidence: f64) -> Self {
        Self {
            reason,
            skipped_tests: BTreeSet::new(),
            skipped_categories: BTreeSet::new(),
            reasoning: reasoning.into(),
            confidence: confidence.clamp(0.0, 1.0),
            triggered_by: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn triggered_by<'a>(mut self, events: impl IntoIterator<Item = &'a FailureEvent>) -> Self {
        self.triggered_by = events.into_iter().map(|e| e.test_name.clone()).collect();
        self
    }

    fn skipping_categories(mut self, categories: impl IntoIterator<Item = String>) -> Self {
        self.skipped_categories.extend(categories);
        self
    }
}

/// Thresholds for the threshold and critical checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThresholdConfig {
    /// Failure rate above which the run stops.
    pub failure_rate_threshold: f64,
    /// Critical failures that stop the run.
    pub critical_failure_count: u32,
    /// Consecutive failures that stop the run.
    pub consecutive_failure_count: u32,
    /// Only failures this recent count towards the rate check.
    pub time_window_seconds: u64,
    /// Recent failures required before the rate check applies.
    ///
    /// Also gates impact classification: a category's failure rate only
    /// raises a failure to high impact once the category has recorded this
    /// many executions.
    pub min_sample_size: u32,
    /// Per-category failure rate overrides.
    pub category_thresholds: BTreeMap<String, f64>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.3,
            critical_failure_count: 1,
            consecutive_failure_count: 3,
            time_window_seconds: 300,
            min_sample_size: 5,
            category_thresholds: BTreeMap::new(),
        }
    }
}

impl ThresholdConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rate_in_range = |key: &str, rate: f64| {
            if (0.0..=1.0).contains(&rate) {
                Ok(())
            } else {
                Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{rate} is outside [0, 1]"),
                })
            }
        };

        rate_in_range("fail_fast.failure_rate_threshold", self.failure_rate_threshold)?;
        for (category, rate) in &self.category_thresholds {
            rate_in_range(&format!("fail_fast.category_thresholds.{category}"), *rate)?;
        }
        for (key, value) in [
            ("fail_fast.critical_failure_count", self.critical_failure_count),
            ("fail_fast.consecutive_failure_count", self.consecutive_failure_count),
            ("fail_fast.min_sample_size", self.min_sample_size),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
        }
        if self.time_window_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "fail_fast.time_window_seconds".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Run-level counts supplied by the caller of [`FailFastStrategy::should_fail_fast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub executed: usize,
    pub passed: usize,
    pub failed: usize,
}

/// Error returned by a callback.
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;
pub type FailureCallback = Box<dyn Fn(&FailureEvent) -> Result<(), CallbackError> + Send + Sync>;
pub type SkipCallback = Box<dyn Fn(&SkipDecision) -> Result<(), CallbackError> + Send + Sync>;

#[derive(Debug, Clone, Copy, Default)]
struct CategoryCounter {
    executed: u32,
    failed: u32,
}

/// Fail-fast state for one run.
pub struct FailFastStrategy {
    mode: FailFastMode,
    thresholds: ThresholdConfig,
    history: FailureHistory,
    dependency_graph: BTreeMap<String, BTreeSet<String>>,
    test_dependencies: BTreeMap<String, BTreeSet<String>>,
    failures: Vec<FailureEvent>,
    category_failures: BTreeMap<String, Vec<usize>>,
    /// Timestamps of recorded passes.
    successes: Vec<DateTime<Utc>>,
    category_counters: BTreeMap<String, CategoryCounter>,
    consecutive_failures: u32,
    decisions: Vec<SkipDecision>,
    failure_callbacks: Vec<FailureCallback>,
    skip_callbacks: Vec<SkipCallback>,
}

impl fmt::Debug for FailFastStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailFastStrategy")
            .field("mode", &self.mode)
            .field("thresholds", &self.thresholds)
            .field("failures", &self.failures.len())
            .field("decisions", &self.decisions.len())
            .field("consecutive_failures", &self.consecutive_failures)
            .finish()
    }
}

impl FailFastStrategy {
    /// Create a strategy with in-memory failure history.
    pub fn new(mode: FailFastMode, thresholds: ThresholdConfig) -> Self {
        Self {
            mode,
            thresholds,
            history: FailureHistory::in_memory(),
            dependency_graph: BTreeMap::new(),
            test_dependencies: BTreeMap::new(),
            failures: Vec::new(),
            category_failures: BTreeMap::new(),
            successes: Vec::new(),
            category_counters: BTreeMap::new(),
            consecutive_failures: 0,
            decisions: Vec::new(),
            failure_callbacks: Vec::new(),
            skip_callbacks: Vec::new(),
        }
    }

    /// Back the failure history with a file.
    pub fn with_history_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.history = FailureHistory::load(path);
        self
    }

    pub fn mode(&self) -> FailFastMode {
        self.mode
    }

    pub fn thresholds(&self) -> &ThresholdConfig {
        &self.thresholds
    }

    pub fn history(&self) -> &FailureHistory {
        &self.history
    }

    pub fn failures(&self) -> &[FailureEvent] {
        &self.failures
    }

    pub fn decisions(&self) -> &[SkipDecision] {
        &self.decisions
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn critical_failure_count(&self) -> usize {
        self.failures.iter().filter(|f| f.is_critical()).count()
    }

    /// Failures recorded for `category`, oldest first.
    pub fn category_failures(&self, category: &str) -> Vec<&FailureEvent> {
        self.category_failures
            .get(category)
            .map(|indices| indices.iter().map(|&i| &self.failures[i]).collect())
            .unwrap_or_default()
    }

    /// Category dependency graph: name to the categories it depends on.
    pub fn set_dependency_graph(&mut self, graph: BTreeMap<String, BTreeSet<String>>) {
        self.dependency_graph = graph;
    }

    /// Test dependency graph: test name to the tests it depends on.
    pub fn set_test_dependencies(&mut self, graph: BTreeMap<String, BTreeSet<String>>) {
        self.test_dependencies = graph;
    }

    pub fn add_failure_callback<F>(&mut self, callback: F)
    where
        F: Fn(&FailureEvent) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.failure_callbacks.push(Box::new(callback));
    }

    pub fn add_skip_callback<F>(&mut self, callback: F)
    where
        F: Fn(&SkipDecision) -> Result<(), CallbackError> + Send + Sync + 'static,
    {
        self.skip_callbacks.push(Box::new(callback));
    }

    /// Classify and record a failure, update history, and notify callbacks.
    pub fn record_failure(&mut self, failure: TestFailure) -> FailureEvent {
        let now = Utc::now();
        let counter = self
            .category_counters
            .entry(failure.category.clone())
            .or_default();
        counter.executed += 1;
        counter.failed += 1;
        let category_failure_rate = (counter.executed >= self.thresholds.min_sample_size)
            .then(|| f64::from(counter.failed) / f64::from(counter.executed));

        let impact_level = classify_impact(&ImpactInputs {
            markers: &failure.markers,
            error_type: &failure.error_type,
            history: self.history.get(&failure.test_name),
            category_failure_rate,
        });
        let affects_categories =
            blast_radius(&failure.category, &failure.error_type, &failure.error_message);
        let mut affects_dependencies =
            transitive_dependents(&self.dependency_graph, [failure.category.as_str()]);
        affects_dependencies.extend(transitive_dependents(
            &self.test_dependencies,
            [failure.test_name.as_str()],
        ));

        let max_retries = self.get_recommended_retries(&failure.test_name);
        let event = FailureEvent {
            test_name: failure.test_name,
            category: failure.category,
            timestamp: now,
            error_message: failure.error_message,
            error_type: failure.error_type,
            impact_level,
            affects_categories,
            affects_dependencies,
            markers: failure.markers,
            duration: failure.duration,
            retry_count: failure.retry_count,
            max_retries,
        };

        self.history
            .record_failure(&event.test_name, &event.error_type, event.duration, now);
        self.consecutive_failures += 1;
        self.category_failures
            .entry(event.category.clone())
            .or_default()
            .push(self.failures.len());
        self.failures.push(event.clone());

        debug!(
            test = %event.test_name,
            category = %event.category,
            impact = %event.impact_level,
            "recorded failure"
        );
        self.notify_failure(&event);
        event
    }

    /// Record a passing test. Resets the consecutive failure counter.
    pub fn record_success(&mut self, test_name: &str, category: &str) {
        self.consecutive_failures = 0;
        self.category_counters
            .entry(category.to_string())
            .or_default()
            .executed += 1;
        self.successes.push(Utc::now());
        self.history.record_success(test_name);
    }

    /// Decide whether the run should stop, and what to skip.
    ///
    /// Any decision returned is also stored and sent to skip callbacks.
    pub fn should_fail_fast(&mut self, current_stats: Option<&RunStats>) -> (bool, Option<SkipDecision>) {
        let (stop, decision) = self.evaluate(current_stats);
        if let Some(decision) = &decision {
            info!(
                mode = %self.mode,
                stop,
                reason = %decision.reason,
                confidence = decision.confidence,
                "fail-fast decision: {}",
                decision.reasoning
            );
            self.decisions.push(decision.clone());
            self.notify_skip(decision);
        }
        (stop, decision)
    }

    /// The verdict of the configured mode, without side effects.
    pub fn evaluate(&self, current_stats: Option<&RunStats>) -> (bool, Option<SkipDecision>) {
        match self.mode {
            FailFastMode::Disabled => (false, None),
            FailFastMode::FirstFailure => self.check_first_failure(),
            FailFastMode::CategoryFailure => self.check_category_failure(),
            FailFastMode::CriticalFailure => self.check_critical_failure(),
            FailFastMode::ThresholdBased => self.check_threshold(current_stats),
            FailFastMode::DependencyAware => (false, self.check_dependencies()),
            FailFastMode::SmartAdaptive => self.check_smart_adaptive(current_stats),
        }
    }

    fn check_first_failure(&self) -> (bool, Option<SkipDecision>) {
        let Some(first) = self.failures.first() else {
            return (false, None);
        };
        let decision = SkipDecision::new(
            SkipReason::FirstFailure,
            format!("First failure: {} in {}", first.test_name, first.category),
            1.0,
        )
        .triggered_by([first]);
        (true, Some(decision))
    }

    fn check_category_failure(&self) -> (bool, Option<SkipDecision>) {
        let Some(last) = self.failures.last() else {
            return (false, None);
        };
        let decision = SkipDecision::new(
            SkipReason::CategoryFailure,
            format!("Category {} failed at {}", last.category, last.test_name),
            0.9,
        )
        .skipping_categories([last.category.clone()])
        .triggered_by(self.category_failures(&last.category));
        (true, Some(decision))
    }

    fn check_critical_failure(&self) -> (bool, Option<SkipDecision>) {
        let critical: Vec<&FailureEvent> = self.failures.iter().filter(|f| f.is_critical()).collect();
        if critical.is_empty() || (critical.len() as u64) < u64::from(self.thresholds.critical_failure_count) {
            return (false, None);
        }
        let decision = SkipDecision::new(
            SkipReason::CriticalFailure,
            format!(
                "{} critical failure(s), threshold {}",
                critical.len(),
                self.thresholds.critical_failure_count
            ),
            1.0,
        )
        .skipping_categories(critical.iter().flat_map(|f| f.affects_categories.iter().cloned()))
        .triggered_by(critical.iter().copied());
        (true, Some(decision))
    }

    fn recent_cutoff(&self) -> DateTime<Utc> {
        let window = i64::try_from(self.thresholds.time_window_seconds).unwrap_or(i64::MAX);
        Utc::now() - ChronoDuration::seconds(window)
    }

    /// Failure rate over the recent window.
    ///
    /// Uses caller-supplied run counts when present, then recorded successes,
    /// and only falls back to the 50% proxy when neither is available.
    fn estimated_failure_rate(&self, recent_failures: usize, stats: Option<&RunStats>) -> f64 {
        if let Some(stats) = stats.filter(|s| s.executed > 0) {
            return stats.failed as f64 / stats.executed as f64;
        }
        let cutoff = self.recent_cutoff();
        let recent_successes = self.successes.iter().filter(|&&at| at >= cutoff).count();
        if recent_successes > 0 {
            return recent_failures as f64 / (recent_failures + recent_successes) as f64;
        }
        if recent_failures > 0 {
            recent_failures as f64 / (2 * recent_failures) as f64
        } else {
            0.0
        }
    }

    fn check_threshold(&self, stats: Option<&RunStats>) -> (bool, Option<SkipDecision>) {
        let cutoff = self.recent_cutoff();
        let recent: Vec<&FailureEvent> = self.failures.iter().filter(|f| f.timestamp >= cutoff).collect();
        let min_sample = self.thresholds.min_sample_size as usize;

        if recent.len() >= min_sample {
            let rate = self.estimated_failure_rate(recent.len(), stats);
            if rate > self.thresholds.failure_rate_threshold {
                let decision = SkipDecision::new(
                    SkipReason::ThresholdExceeded,
                    format!(
                        "Failure rate {:.0}% exceeds {:.0}% over {} recent failures",
                        rate * 100.0,
                        self.thresholds.failure_rate_threshold * 100.0,
                        recent.len()
                    ),
                    (0.6 + 0.4 * rate).min(1.0),
                )
                .triggered_by(recent.iter().copied());
                return (true, Some(decision));
            }

            let over: Vec<String> = self
                .thresholds
                .category_thresholds
                .iter()
                .filter(|(category, threshold)| {
                    self.category_counters.get(*category).is_some_and(|c| {
                        c.executed as usize >= min_sample
                            && f64::from(c.failed) / f64::from(c.executed) > **threshold
                    })
                })
                .map(|(category, _)| category.clone())
                .collect();
            if !over.is_empty() {
                let decision = SkipDecision::new(
                    SkipReason::ThresholdExceeded,
                    format!("Category threshold exceeded: {}", over.join(", ")),
                    0.7,
                )
                .skipping_categories(over.iter().cloned())
                .triggered_by(recent.iter().copied().filter(|f| over.contains(&f.category)));
                return (false, Some(decision));
            }
        }

        if self.consecutive_failures >= self.thresholds.consecutive_failure_count {
            let tail = self.failures.len().saturating_sub(self.consecutive_failures as usize);
            let decision = SkipDecision::new(
                SkipReason::ConsecutiveFailures,
                format!("{} consecutive failures", self.consecutive_failures),
                0.8,
            )
            .triggered_by(&self.failures[tail..]);
            return (true, Some(decision));
        }

        self.check_critical_failure()
    }

    /// Skip recommendations only; never stops the run.
    fn check_dependencies(&self) -> Option<SkipDecision> {
        if self.failures.is_empty() {
            return None;
        }

        let mut skipped_categories = BTreeSet::new();
        let mut skipped_tests = BTreeSet::new();
        for event in &self.failures {
            skipped_tests.extend(transitive_dependents(
                &self.test_dependencies,
                [event.test_name.as_str()],
            ));
            skipped_categories.extend(transitive_dependents(
                &self.dependency_graph,
                [event.category.as_str()],
            ));
            if event.impact_level >= ImpactLevel::High {
                skipped_categories.insert(event.category.clone());
            }
        }

        let mut decision = SkipDecision::new(
            SkipReason::DependencyFailure,
            format!(
                "{} test(s) and {} categor(ies) depend on failed work",
                skipped_tests.len(),
                skipped_categories.len()
            ),
            0.7,
        )
        .triggered_by(&self.failures);
        decision.skipped_tests = skipped_tests;
        decision.skipped_categories = skipped_categories;
        Some(decision)
    }

    fn check_smart_adaptive(&self, stats: Option<&RunStats>) -> (bool, Option<SkipDecision>) {
        let (critical_stop, critical) = self.check_critical_failure();
        if critical_stop {
            return (true, critical.map(relabel));
        }

        let dependency = self.check_dependencies();
        let verdicts = [self.check_threshold(stats), (false, dependency.clone())];

        let votes: Vec<SkipDecision> = verdicts
            .into_iter()
            .filter_map(|(stop, decision)| decision.filter(|_| stop))
            .collect();
        let best = votes
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .cloned();

        let stop = votes.len() >= 2
            || (votes.len() == 1 && best.as_ref().is_some_and(|d| d.confidence > 0.8));
        if stop {
            return (true, best.map(relabel));
        }
        (false, dependency)
    }

    /// Retries worth attempting for `test_name`.
    pub fn get_recommended_retries(&self, test_name: &str) -> u32 {
        match self.history.get(test_name) {
            Some(record) if record.flaky => {
                let retries = ((1.0 - record.failure_rate()) * f64::from(MAX_RETRIES)).ceil() as u32;
                retries.clamp(1, MAX_RETRIES)
            }
            Some(record) if record.failure_rate() > classify::HIGH_FAILURE_RATE => 0,
            _ => 1,
        }
    }

    /// Whether another attempt at `test_name` is worthwhile.
    pub fn should_retry_test(&self, test_name: &str, attempts_so_far: u32) -> bool {
        let budget = self.get_recommended_retries(test_name);
        if attempts_so_far >= budget {
            return false;
        }
        let own: Vec<&FailureEvent> = self.failures.iter().filter(|f| f.test_name == test_name).collect();
        if own.iter().any(|f| f.is_critical()) {
            return false;
        }
        let cutoff = Utc::now() - ChronoDuration::seconds(RETRY_LOOKBACK_SECONDS);
        let recent = own.iter().filter(|f| f.timestamp >= cutoff).count();
        recent as u64 <= u64::from(budget)
    }

    /// Clear run state. History, callbacks and dependency graphs are kept.
    pub fn reset(&mut self) {
        self.failures.clear();
        self.category_failures.clear();
        self.successes.clear();
        self.category_counters.clear();
        self.consecutive_failures = 0;
        self.decisions.clear();
    }

    fn notify_failure(&self, event: &FailureEvent) {
        for (index, callback) in self.failure_callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(callback = index, error = %err, "failure callback returned an error"),
                Err(_) => warn!(callback = index, "failure callback panicked"),
            }
        }
    }

    fn notify_skip(&self, decision: &SkipDecision) {
        for (index, callback) in self.skip_callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| callback(decision))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(callback = index, error = %err, "skip callback returned an error"),
                Err(_) => warn!(callback = index, "skip callback panicked"),
            }
        }
    }

    fn category_counts(&self) -> BTreeMap<&str, (u32, u32)> {
        self.category_counters
            .iter()
            .map(|(name, c)| (name.as_str(), (c.executed, c.failed)))
            .collect()
    }
}

fn relabel(mut decision: SkipDecision) -> SkipDecision {
    decision.reasoning = format!("Smart adaptive: {}", decision.reasoning);
    decision
}
