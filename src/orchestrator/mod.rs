//! Phase-by-phase execution of a category plan.
//!
//! The [`Orchestrator`] plans the requested categories, runs each phase with
//! at most `max_parallel` categories in flight, waits for the whole phase,
//! feeds every outcome into category history and the fail-fast strategy, and
//! consults fail-fast before starting the next phase. In-flight categories
//! are never cancelled; a stop verdict only prevents later phases from
//! starting.

pub mod executor;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::category::{CategorySystem, ExecutionPlan, TestCategory};
use crate::config::{ExecutionConfig, OrchestratorConfig, SplittingConfig};
use crate::error::{ParseEnumError, Result};
use crate::fail_fast::{
    FailFastMode, FailFastStrategy, FailureSummary, RunStats, SkipDecision, TestFailure,
    ThresholdConfig,
};
use crate::metrics::{RunMetrics, RunMetricsCollector, RunMetricsStore, StepStatus};
use crate::splitter::{TestExecutionWindow, TestItem, TestSplitter};

pub use executor::{CategoryExecutor, CategoryOutcome, CommandExecutor, TestResult};

/// Group of categories run together for a given feedback speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestLayer {
    FastFeedback,
    CoreIntegration,
    ServiceIntegration,
    E2eBackground,
}

impl TestLayer {
    pub const ALL: [TestLayer; 4] = [
        TestLayer::FastFeedback,
        TestLayer::CoreIntegration,
        TestLayer::ServiceIntegration,
        TestLayer::E2eBackground,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestLayer::FastFeedback => "fast_feedback",
            TestLayer::CoreIntegration => "core_integration",
            TestLayer::ServiceIntegration => "service_integration",
            TestLayer::E2eBackground => "e2e_background",
        }
    }

    pub fn categories(self) -> &'static [&'static str] {
        match self {
            TestLayer::FastFeedback => &["smoke", "unit"],
            TestLayer::CoreIntegration => &["database", "api", "integration"],
            TestLayer::ServiceIntegration => &["agent", "websocket", "security", "frontend"],
            TestLayer::E2eBackground => &["e2e", "performance"],
        }
    }
}

impl fmt::Display for TestLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layers a run covers when no categories are named.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Smoke and unit only.
    FastFeedback,
    /// Everything except the end-to-end layer.
    #[default]
    Hybrid,
    Nightly,
    /// End-to-end and performance only.
    Background,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::FastFeedback => "fast_feedback",
            ExecutionMode::Hybrid => "hybrid",
            ExecutionMode::Nightly => "nightly",
            ExecutionMode::Background => "background",
        }
    }

    pub fn layers(self) -> &'static [TestLayer] {
        match self {
            ExecutionMode::FastFeedback => &[TestLayer::FastFeedback],
            ExecutionMode::Hybrid => &[
                TestLayer::FastFeedback,
                TestLayer::CoreIntegration,
                TestLayer::ServiceIntegration,
            ],
            ExecutionMode::Nightly => &TestLayer::ALL,
            ExecutionMode::Background => &[TestLayer::E2eBackground],
        }
    }

    /// Category names covered by this mode, in layer order.
    pub fn categories(self) -> Vec<&'static str> {
        self.layers()
            .iter()
            .flat_map(|layer| layer.categories().iter().copied())
            .collect()
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "fast_feedback" | "fast" => Ok(ExecutionMode::FastFeedback),
            "hybrid" => Ok(ExecutionMode::Hybrid),
            "nightly" | "full" => Ok(ExecutionMode::Nightly),
            "background" => Ok(ExecutionMode::Background),
            _ => Err(ParseEnumError::new(
                "execution mode",
                s,
                "fast_feedback, hybrid, nightly, background",
            )),
        }
    }
}

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Explicit categories; when empty the mode's categories are used.
    pub categories: Vec<String>,
    /// Overrides the configured execution mode.
    pub mode: Option<ExecutionMode>,
    /// Individual tests, split into windows per category when present.
    pub tests: Vec<TestItem>,
}

impl RunRequest {
    pub fn for_categories<I, S>(categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            categories: categories.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn for_mode(mode: ExecutionMode) -> Self {
        Self {
            mode: Some(mode),
            ..Default::default()
        }
    }

    pub fn with_tests(mut self, tests: Vec<TestItem>) -> Self {
        self.tests = tests;
        self
    }

    fn selected_categories(&self, default_mode: ExecutionMode) -> Vec<String> {
        if !self.categories.is_empty() {
            return self.categories.clone();
        }
        self.mode
            .unwrap_or(default_mode)
            .categories()
            .into_iter()
            .map(str::to_string)
            .collect()
    }
}

/// How a category ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

impl From<CategoryStatus> for StepStatus {
    fn from(status: CategoryStatus) -> Self {
        match status {
            CategoryStatus::Passed => StepStatus::Passed,
            CategoryStatus::Failed => StepStatus::Failed,
            CategoryStatus::TimedOut => StepStatus::TimedOut,
            CategoryStatus::Skipped => StepStatus::Skipped,
        }
    }
}

/// Result of one category in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category: String,
    pub phase: usize,
    pub status: CategoryStatus,
    /// Seconds spent executing.
    pub duration: f64,
    pub windows: usize,
    pub exit_code: Option<i32>,
    pub error_type: Option<String>,
    pub message: Option<String>,
    pub tests: Vec<TestResult>,
}

impl CategoryResult {
    fn skipped(category: &str, phase: usize) -> Self {
        Self {
            category: category.to_string(),
            phase,
            status: CategoryStatus::Skipped,
            duration: 0.0,
            windows: 0,
            exit_code: None,
            error_type: None,
            message: None,
            tests: Vec::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CategoryStatus::Passed
    }

    pub fn failed(&self) -> bool {
        matches!(self.status, CategoryStatus::Failed | CategoryStatus::TimedOut)
    }
}

/// Live view of a run, shared with the per-category tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionState {
    pub in_flight: BTreeSet<String>,
    pub completed: BTreeSet<String>,
    /// Failed categories with their error description.
    pub failed: BTreeMap<String, String>,
    pub skipped: BTreeSet<String>,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    /// Every requested category passed.
    pub success: bool,
    pub plan: ExecutionPlan,
    /// Results in plan order, skipped categories included.
    pub results: Vec<CategoryResult>,
    pub skipped_categories: BTreeSet<String>,
    pub skipped_tests: BTreeSet<String>,
    /// The decision that stopped the run, if one did.
    pub stop_decision: Option<SkipDecision>,
    pub failure_summary: FailureSummary,
    pub metrics: RunMetrics,
}

impl RunReport {
    pub fn result(&self, category: &str) -> Option<&CategoryResult> {
        self.results.iter().find(|r| r.category == category)
    }

    pub fn stopped_early(&self) -> bool {
        self.stop_decision.is_some()
    }

    pub fn failed_categories(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| r.failed())
            .map(|r| r.category.as_str())
            .collect()
    }
}

/// Runs execution plans against a [`CategoryExecutor`].
pub struct Orchestrator {
    categories: CategorySystem,
    fail_fast: FailFastStrategy,
    splitter: TestSplitter,
    executor: Arc<dyn CategoryExecutor>,
    execution: ExecutionConfig,
    splitting: SplittingConfig,
    state: Arc<RwLock<ExecutionState>>,
    metrics_dir: Option<PathBuf>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("categories", &self.categories.len())
            .field("fail_fast", &self.fail_fast)
            .field("execution", &self.execution)
            .field("splitting", &self.splitting)
            .finish()
    }
}

impl Orchestrator {
    /// Orchestrator with default settings and smart adaptive fail-fast.
    pub fn new(categories: CategorySystem, executor: Arc<dyn CategoryExecutor>) -> Self {
        Self {
            categories,
            fail_fast: FailFastStrategy::new(FailFastMode::default(), ThresholdConfig::default()),
            splitter: TestSplitter::new("."),
            executor,
            execution: ExecutionConfig::default(),
            splitting: SplittingConfig::default(),
            state: Arc::new(RwLock::new(ExecutionState::default())),
            metrics_dir: None,
        }
    }

    /// Build from configuration. History and metrics paths are resolved
    /// against `project_root` and commands run there.
    pub fn from_config(config: &OrchestratorConfig, project_root: &Path) -> Result<Self> {
        let categories = config.build_category_system()?;
        let executor = Arc::new(CommandExecutor::new(
            config.execution.command_template.clone(),
            project_root,
        ));
        let fail_fast = FailFastStrategy::new(config.fail_fast.mode, config.fail_fast.thresholds())
            .with_history_file(project_root.join(&config.history.failure_history_path));
        let splitter = TestSplitter::with_history_file(
            project_root,
            project_root.join(&config.history.test_history_path),
        );

        Ok(Self::new(categories, executor)
            .with_fail_fast(fail_fast)
            .with_splitter(splitter)
            .with_execution_config(config.execution.clone())
            .with_splitting_config(config.splitting.clone())
            .with_metrics_dir(project_root.join(&config.history.metrics_dir)))
    }

    pub fn with_fail_fast(mut self, fail_fast: FailFastStrategy) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_splitter(mut self, splitter: TestSplitter) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn with_execution_config(mut self, execution: ExecutionConfig) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_splitting_config(mut self, splitting: SplittingConfig) -> Self {
        self.splitting = splitting;
        self
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.execution.max_parallel = max_parallel.max(1);
        self
    }

    /// Save run metrics under `dir` after each run.
    pub fn with_metrics_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.metrics_dir = Some(dir.into());
        self
    }

    pub fn categories(&self) -> &CategorySystem {
        &self.categories
    }

    pub fn fail_fast(&self) -> &FailFastStrategy {
        &self.fail_fast
    }

    pub fn fail_fast_mut(&mut self) -> &mut FailFastStrategy {
        &mut self.fail_fast
    }

    pub fn splitter(&self) -> &TestSplitter {
        &self.splitter
    }

    /// Snapshot of the current execution state.
    pub async fn execution_state(&self) -> ExecutionState {
        self.state.read().await.clone()
    }

    /// Plan a request without running it.
    pub fn plan(&self, request: &RunRequest) -> Result<ExecutionPlan> {
        let selected = request.selected_categories(self.execution.mode);
        self.categories.create_execution_plan(
            &selected,
            self.execution.max_parallel,
            self.execution.skip_dependencies,
        )
    }

    /// Plan and execute a request.
    ///
    /// Errors only for planning failures; test failures are reported in the
    /// returned [`RunReport`].
    pub async fn run(&mut self, request: RunRequest) -> Result<RunReport> {
        let plan = self.plan(&request)?;
        self.fail_fast.reset();
        self.fail_fast.set_dependency_graph(plan.dependency_graph.clone());
        let test_graph: BTreeMap<String, BTreeSet<String>> = request
            .tests
            .iter()
            .filter(|t| !t.dependencies.is_empty())
            .map(|t| (t.name.clone(), t.dependencies.clone()))
            .collect();
        self.fail_fast.set_test_dependencies(test_graph);
        *self.state.write().await = ExecutionState::default();

        let markers_by_test: BTreeMap<String, BTreeSet<String>> = request
            .tests
            .iter()
            .flat_map(|t| {
                [
                    (t.name.clone(), t.tags.clone()),
                    (t.history_key(), t.tags.clone()),
                ]
            })
            .collect();
        let mut tests_by_category: BTreeMap<String, Vec<TestItem>> = BTreeMap::new();
        for test in request.tests {
            tests_by_category
                .entry(test.category.clone())
                .or_default()
                .push(test);
        }

        let run_id = RunMetricsCollector::generate_run_id();
        let metrics = RunMetricsCollector::new(run_id.clone(), plan.category_count());
        let semaphore = Arc::new(Semaphore::new(self.execution.max_parallel.max(1)));

        info!(
            run_id = %run_id,
            phases = plan.phases.len(),
            categories = plan.category_count(),
            "starting run"
        );

        let mut results: BTreeMap<String, CategoryResult> = BTreeMap::new();
        let mut skipped_categories: BTreeSet<String> = BTreeSet::new();
        let mut skipped_tests: BTreeSet<String> = BTreeSet::new();
        let mut stop_decision: Option<SkipDecision> = None;
        let mut stats = RunStats::default();

        for (index, phase) in plan.phases.iter().enumerate() {
            if stop_decision.is_some() {
                skipped_categories.extend(phase.iter().cloned());
                continue;
            }

            let mut runnable = Vec::new();
            for name in phase {
                if skipped_categories.contains(name) {
                    continue;
                }
                let Some(category) = self.categories.get(name).cloned() else {
                    continue;
                };
                let windows = match tests_by_category.remove(name) {
                    Some(tests) => {
                        let tests: Vec<TestItem> = tests
                            .into_iter()
                            .filter(|t| {
                                !skipped_tests.contains(&t.name)
                                    && !skipped_tests.contains(&t.history_key())
                            })
                            .collect();
                        if tests.is_empty() {
                            debug!(category = %name, "every test skipped, skipping category");
                            skipped_categories.insert(name.clone());
                            continue;
                        }
                        self.split(tests)
                    }
                    None => Vec::new(),
                };
                runnable.push((category, windows));
            }

            info!(phase = index, categories = runnable.len(), "starting phase");
            let phase_results = self
                .execute_phase(index, runnable, &semaphore, &metrics)
                .await;

            for result in phase_results {
                self.record_result(&result, &markers_by_test, &mut stats);
                results.insert(result.category.clone(), result);
            }

            let (stop, decision) = self.fail_fast.should_fail_fast(Some(&stats));
            if let Some(decision) = decision {
                skipped_categories.extend(
                    decision
                        .skipped_categories
                        .iter()
                        .filter(|c| !results.contains_key(*c))
                        .cloned(),
                );
                skipped_tests.extend(decision.skipped_tests.iter().cloned());
                if stop {
                    warn!(
                        phase = index,
                        reason = %decision.reason,
                        "fail-fast stop, remaining phases will not start"
                    );
                    stop_decision = Some(decision);
                }
            }
        }

        let mut ordered = Vec::with_capacity(plan.execution_order.len());
        {
            let mut state = self.state.write().await;
            for name in &plan.execution_order {
                match results.remove(name) {
                    Some(result) => ordered.push(result),
                    None => {
                        metrics.skip_step(name.clone());
                        state.skipped.insert(name.clone());
                        skipped_categories.insert(name.clone());
                        let phase = plan.phase_of(name).unwrap_or_default();
                        ordered.push(CategoryResult::skipped(name, phase));
                    }
                }
            }
        }

        // A failed dependency fails the run even when its dependents passed.
        let success = !ordered.iter().any(CategoryResult::failed)
            && plan
                .requested_categories
                .iter()
                .all(|name| ordered.iter().any(|r| &r.category == name && r.passed()));
        let run_metrics = metrics.finish();
        self.save_metrics(&run_metrics);

        info!(
            run_id = %run_id,
            success,
            failed = stats.failed,
            skipped = skipped_categories.len(),
            "run complete"
        );

        Ok(RunReport {
            run_id,
            success,
            plan,
            results: ordered,
            skipped_categories,
            skipped_tests,
            stop_decision,
            failure_summary: self.fail_fast.get_failure_summary(),
            metrics: run_metrics,
        })
    }

    fn split(&self, tests: Vec<TestItem>) -> Vec<TestExecutionWindow> {
        let windows = self.splitter.create_windows(
            tests,
            self.splitting.strategy,
            self.splitting.target_window_seconds(),
            self.splitting.max_windows,
            self.execution.max_parallel,
        );
        if self.splitting.rebalance {
            self.splitter.rebalance_windows(windows)
        } else {
            windows
        }
    }

    /// Run one phase and wait for every category in it.
    async fn execute_phase(
        &self,
        phase: usize,
        runnable: Vec<(TestCategory, Vec<TestExecutionWindow>)>,
        semaphore: &Arc<Semaphore>,
        metrics: &RunMetricsCollector,
    ) -> Vec<CategoryResult> {
        let mut names = Vec::with_capacity(runnable.len());
        let mut handles = Vec::with_capacity(runnable.len());

        for (category, windows) in runnable {
            names.push(category.name.clone());
            let semaphore = semaphore.clone();
            let executor = self.executor.clone();
            let state = self.state.clone();
            let metrics = metrics.clone();

            handles.push(tokio::spawn(async move {
                // Hold the permit until the category completes
                let _permit = semaphore.acquire_owned().await.ok();
                state.write().await.in_flight.insert(category.name.clone());
                metrics.start_step(category.name.clone(), phase);
                debug!(category = %category.name, phase, windows = windows.len(), "category started");

                let start = Instant::now();
                let outcome =
                    tokio::time::timeout(category.timeout(), executor.execute(&category, &windows))
                        .await;
                let duration = start.elapsed();

                let result = match outcome {
                    Ok(outcome) => CategoryResult {
                        category: category.name.clone(),
                        phase,
                        status: if outcome.success {
                            CategoryStatus::Passed
                        } else {
                            CategoryStatus::Failed
                        },
                        duration: duration.as_secs_f64(),
                        windows: windows.len(),
                        exit_code: outcome.exit_code,
                        error_type: outcome.error_type,
                        message: outcome.message,
                        tests: outcome.tests,
                    },
                    Err(_) => CategoryResult {
                        category: category.name.clone(),
                        phase,
                        status: CategoryStatus::TimedOut,
                        duration: duration.as_secs_f64(),
                        windows: windows.len(),
                        exit_code: None,
                        error_type: Some("TimeoutError".to_string()),
                        message: Some(format!(
                            "timeout after {}s",
                            category.timeout_seconds
                        )),
                        tests: Vec::new(),
                    },
                };

                {
                    let mut state = state.write().await;
                    state.in_flight.remove(&category.name);
                    if result.passed() {
                        state.completed.insert(category.name.clone());
                    } else {
                        state.failed.insert(
                            category.name.clone(),
                            result.message.clone().unwrap_or_default(),
                        );
                    }
                }
                metrics.complete_step(
                    &category.name,
                    result.status.into(),
                    result.windows,
                    duration,
                    result.message.clone(),
                );
                result
            }));
        }

        let joined = futures::future::join_all(handles).await;
        names
            .into_iter()
            .zip(joined)
            .map(|(name, joined)| match joined {
                Ok(result) => result,
                Err(err) => {
                    warn!(category = %name, error = %err, "category task aborted");
                    CategoryResult {
                        status: CategoryStatus::Failed,
                        error_type: Some("TaskAborted".to_string()),
                        message: Some(err.to_string()),
                        ..CategoryResult::skipped(&name, phase)
                    }
                }
            })
            .collect()
    }

    /// Feed a category result into history and fail-fast.
    fn record_result(
        &mut self,
        result: &CategoryResult,
        markers_by_test: &BTreeMap<String, BTreeSet<String>>,
        stats: &mut RunStats,
    ) {
        let category = result.category.as_str();
        self.categories
            .update_category_history(category, result.duration, result.passed());

        for test in &result.tests {
            stats.executed += 1;
            if let Some(duration) = test.duration {
                self.splitter
                    .update_test_history(&test.name, duration, test.passed);
            }
            if test.passed {
                stats.passed += 1;
                self.fail_fast.record_success(&test.name, category);
                continue;
            }
            stats.failed += 1;
            let mut failure = TestFailure::new(&test.name, category)
                .with_error(
                    test.error_type.as_deref().unwrap_or("TestFailure"),
                    test.error_message.as_deref().unwrap_or_default(),
                )
                .with_markers(test.markers.iter().cloned());
            if let Some(markers) = markers_by_test.get(&test.name) {
                failure = failure.with_markers(markers.iter().cloned());
            }
            if let Some(duration) = test.duration {
                failure = failure.with_duration(duration);
            }
            self.fail_fast.record_failure(failure);
        }

        // Category-level outcome when no test-level failure explains it
        let explained = result.tests.iter().any(|t| !t.passed);
        if result.tests.is_empty() || (result.failed() && !explained) {
            stats.executed += 1;
            if result.passed() {
                stats.passed += 1;
                self.fail_fast.record_success(category, category);
            } else {
                stats.failed += 1;
                self.fail_fast.record_failure(
                    TestFailure::new(category, category)
                        .with_error(
                            result.error_type.as_deref().unwrap_or("CategoryFailure"),
                            result.message.as_deref().unwrap_or_default(),
                        )
                        .with_duration(result.duration),
                );
            }
        }
    }

    fn save_metrics(&self, metrics: &RunMetrics) {
        let Some(dir) = &self.metrics_dir else {
            return;
        };
        match RunMetricsStore::new(dir).and_then(|store| store.save(metrics)) {
            Ok(path) => debug!(path = %path.display(), "saved run metrics"),
            Err(err) => warn!(dir = %dir.display(), error = %err, "failed to save run metrics"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategoryPriority;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct ScriptedExecutor {
        outcomes: BTreeMap<String, CategoryOutcome>,
        delay: Duration,
        calls: Mutex<Vec<(String, usize)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedExecutor {
        fn failing(mut self, category: &str) -> Self {
            self.outcomes.insert(
                category.to_string(),
                CategoryOutcome::failed("AssertionError", "boom"),
            );
            self
        }

        fn with_outcome(mut self, category: &str, outcome: CategoryOutcome) -> Self {
            self.outcomes.insert(category.to_string(), outcome);
            self
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn called(&self) -> Vec<String> {
            self.calls
                .lock()
                .map(|calls| calls.iter().map(|(name, _)| name.clone()).collect())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl CategoryExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            category: &TestCategory,
            windows: &[TestExecutionWindow],
        ) -> CategoryOutcome {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((category.name.clone(), windows.len()));
            }
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.outcomes
                .get(&category.name)
                .cloned()
                .unwrap_or_else(CategoryOutcome::passed)
        }
    }

    fn chain_system() -> CategorySystem {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("unit", CategoryPriority::High));
        system.add_category(
            TestCategory::new("integration", CategoryPriority::Medium).with_dependencies(["unit"]),
        );
        system.add_category(
            TestCategory::new("e2e", CategoryPriority::Low).with_dependencies(["integration"]),
        );
        system
    }

    fn orchestrator(
        system: CategorySystem,
        executor: Arc<ScriptedExecutor>,
        mode: FailFastMode,
    ) -> Orchestrator {
        Orchestrator::new(system, executor)
            .with_fail_fast(FailFastStrategy::new(mode, ThresholdConfig::default()))
    }

    #[test]
    fn test_execution_mode_categories() {
        assert_eq!(ExecutionMode::FastFeedback.categories(), vec!["smoke", "unit"]);
        assert!(ExecutionMode::Hybrid.categories().contains(&"api"));
        assert!(!ExecutionMode::Hybrid.categories().contains(&"e2e"));
        assert_eq!(ExecutionMode::Nightly.categories().len(), 11);
        assert_eq!(ExecutionMode::Background.categories(), vec!["e2e", "performance"]);
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!("fast-feedback".parse::<ExecutionMode>(), Ok(ExecutionMode::FastFeedback));
        assert_eq!("NIGHTLY".parse::<ExecutionMode>(), Ok(ExecutionMode::Nightly));
        assert!("weekly".parse::<ExecutionMode>().is_err());
        assert_eq!(ExecutionMode::Background.to_string(), "background");
    }

    #[test]
    fn test_layers_cover_default_categories() {
        let system = CategorySystem::with_defaults();
        for layer in TestLayer::ALL {
            for name in layer.categories() {
                assert!(system.contains(name), "{layer} lists unknown category {name}");
            }
        }
    }

    #[tokio::test]
    async fn test_run_all_pass_in_dependency_order() {
        let executor = Arc::new(ScriptedExecutor::default());
        let mut orch = orchestrator(chain_system(), executor.clone(), FailFastMode::FirstFailure);

        let report = orch
            .run(RunRequest::for_categories(["e2e"]))
            .await
            .expect("run");

        assert!(report.success);
        assert_eq!(executor.called(), vec!["unit", "integration", "e2e"]);
        assert_eq!(report.results.len(), 3);
        assert!(report.results.iter().all(|r| r.passed()));
        assert_eq!(report.metrics.steps_passed, 3);
        assert!(!report.stopped_early());

        let state = orch.execution_state().await;
        assert_eq!(state.completed.len(), 3);
        assert!(state.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_stops_later_phases() {
        let executor = Arc::new(ScriptedExecutor::default().failing("unit"));
        let mut orch = orchestrator(chain_system(), executor.clone(), FailFastMode::FirstFailure);

        let report = orch
            .run(RunRequest::for_categories(["e2e"]))
            .await
            .expect("run");

        assert!(!report.success);
        assert!(report.stopped_early());
        assert_eq!(executor.called(), vec!["unit"]);
        assert_eq!(report.failed_categories(), vec!["unit"]);
        assert_eq!(
            report.result("integration").map(|r| r.status),
            Some(CategoryStatus::Skipped)
        );
        assert!(report.skipped_categories.contains("e2e"));
        assert_eq!(report.failure_summary.total_failures, 1);
        assert_eq!(report.metrics.skipped, 2);
    }

    #[tokio::test]
    async fn test_dependency_aware_skips_dependents_without_stopping() {
        let mut system = chain_system();
        system.add_category(TestCategory::new("lint", CategoryPriority::Low));
        let executor = Arc::new(ScriptedExecutor::default().failing("unit"));
        let mut orch = orchestrator(system, executor.clone(), FailFastMode::DependencyAware);

        let report = orch
            .run(RunRequest::for_categories(["e2e", "lint"]))
            .await
            .expect("run");

        assert!(!report.stopped_early());
        let called = executor.called();
        assert!(called.contains(&"lint".to_string()));
        assert!(!called.contains(&"integration".to_string()));
        assert!(!called.contains(&"e2e".to_string()));
        assert!(report.skipped_categories.contains("integration"));
        assert!(report.skipped_categories.contains("e2e"));
    }

    #[tokio::test]
    async fn test_disabled_mode_runs_everything() {
        let executor = Arc::new(ScriptedExecutor::default().failing("unit"));
        let mut orch = orchestrator(chain_system(), executor.clone(), FailFastMode::Disabled);

        let report = orch
            .run(RunRequest::for_categories(["e2e"]))
            .await
            .expect("run");

        assert_eq!(executor.called().len(), 3);
        assert!(report.result("e2e").is_some_and(CategoryResult::passed));
        assert!(!report.success);
        assert_eq!(report.failed_categories(), vec!["unit"]);
    }

    #[tokio::test]
    async fn test_category_timeout() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("slow", CategoryPriority::Medium).with_timeout(1));
        let executor = Arc::new(ScriptedExecutor::default().with_delay(Duration::from_secs(3)));
        let mut orch = orchestrator(system, executor, FailFastMode::Disabled);

        let report = orch
            .run(RunRequest::for_categories(["slow"]))
            .await
            .expect("run");

        let result = report.result("slow").expect("result");
        assert_eq!(result.status, CategoryStatus::TimedOut);
        assert_eq!(result.error_type.as_deref(), Some("TimeoutError"));
        assert!(result.duration < 3.0);
        assert_eq!(report.metrics.timeouts, 1);
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_concurrency() {
        let mut system = CategorySystem::new();
        for name in ["a", "b", "c", "d"] {
            system.add_category(TestCategory::new(name, CategoryPriority::Medium));
        }
        let executor = Arc::new(ScriptedExecutor::default().with_delay(Duration::from_millis(50)));
        let mut orch =
            orchestrator(system, executor.clone(), FailFastMode::Disabled).with_max_parallel(2);

        let report = orch
            .run(RunRequest::for_categories(["a", "b", "c", "d"]))
            .await
            .expect("run");

        assert!(report.success);
        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(executor.called().len(), 4);
    }

    #[tokio::test]
    async fn test_tests_are_split_and_history_recorded() {
        let executor = Arc::new(ScriptedExecutor::default().with_outcome(
            "unit",
            CategoryOutcome::passed().with_tests(vec![
                TestResult::passed("tests/test_a.py::test_a").with_duration(2.0)
            ]),
        ));
        let mut orch = orchestrator(chain_system(), executor.clone(), FailFastMode::Disabled);
        let tests = vec![
            TestItem::new("test_a", "unit", 2.0).with_file_path("tests/test_a.py"),
            TestItem::new("test_b", "unit", 3.0).with_file_path("tests/test_b.py"),
        ];

        let report = orch
            .run(RunRequest::for_categories(["unit"]).with_tests(tests))
            .await
            .expect("run");

        assert!(report.success);
        let windows = executor
            .calls
            .lock()
            .map(|calls| calls[0].1)
            .unwrap_or_default();
        assert!(windows >= 1);
        assert_eq!(report.result("unit").map(|r| r.windows), Some(windows));
        assert_eq!(
            orch.splitter()
                .history()
                .get("tests/test_a.py::test_a")
                .map(|e| e.run_count),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_mode_request_and_metrics_saved() {
        let temp_dir = TempDir::new().expect("temp dir");
        let executor = Arc::new(ScriptedExecutor::default());
        let mut orch = orchestrator(
            CategorySystem::with_defaults(),
            executor.clone(),
            FailFastMode::Disabled,
        )
        .with_metrics_dir(temp_dir.path().join("runs"));

        let report = orch
            .run(RunRequest::for_mode(ExecutionMode::FastFeedback))
            .await
            .expect("run");

        let mut called = executor.called();
        called.sort();
        assert_eq!(called, vec!["smoke", "unit"]);
        assert!(report.success);
        let saved = temp_dir
            .path()
            .join("runs")
            .join(format!("{}.json", report.run_id));
        assert!(saved.exists());
    }

    #[tokio::test]
    async fn test_unknown_categories_are_ignored() {
        let executor = Arc::new(ScriptedExecutor::default());
        let mut orch = orchestrator(chain_system(), executor, FailFastMode::Disabled);

        let report = orch
            .run(RunRequest::for_categories(["unit", "nope"]))
            .await
            .expect("run");

        assert!(report.success);
        assert_eq!(report.plan.ignored_categories, vec!["nope"]);
    }
}
