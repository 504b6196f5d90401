//! End-to-end runs through the orchestrator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;
use testorch::config::ConfigFormat;
use testorch::orchestrator::{CategoryStatus, TestResult};
use testorch::{
    CategoryExecutor, CategoryOutcome, CategoryPriority, CategorySystem, ExecutionMode,
    FailFastMode, FailFastStrategy, Orchestrator, OrchestratorConfig, RunRequest, TestCategory,
    TestExecutionWindow, TestItem, ThresholdConfig,
};

/// Records the tests it was handed and replays canned outcomes.
#[derive(Default)]
struct RecordingExecutor {
    outcomes: BTreeMap<String, CategoryOutcome>,
    seen: Mutex<BTreeMap<String, Vec<String>>>,
}

#[async_trait]
impl CategoryExecutor for RecordingExecutor {
    async fn execute(
        &self,
        category: &TestCategory,
        windows: &[TestExecutionWindow],
    ) -> CategoryOutcome {
        let names: Vec<String> = windows
            .iter()
            .flat_map(|w| w.tests.iter().map(|t| t.name.clone()))
            .collect();
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(category.name.clone(), names);
        }
        self.outcomes
            .get(&category.name)
            .cloned()
            .unwrap_or_else(CategoryOutcome::passed)
    }
}

#[tokio::test]
async fn test_config_driven_run_with_environment_block() {
    let temp_dir = TempDir::new().expect("temp dir");
    let yaml = r#"
execution:
  command_template: "exit 1"
  max_parallel: 2
fail_fast:
  mode: first_failure
history:
  metrics_dir: runs
environments:
  ci:
    execution:
      command_template: "echo checking {category}"
"#;
    let config = OrchestratorConfig::from_sources(
        Some((yaml, ConfigFormat::Yaml)),
        Some("ci"),
        Vec::<(String, String)>::new(),
    )
    .expect("config");
    assert_eq!(config.execution.max_parallel, 2);

    let mut orchestrator = Orchestrator::from_config(&config, temp_dir.path()).expect("orchestrator");
    let report = orchestrator
        .run(RunRequest::for_mode(ExecutionMode::FastFeedback))
        .await
        .expect("run");

    assert!(report.success, "{:?}", report.results);
    assert_eq!(report.results.len(), 2);
    assert!(temp_dir.path().join(".testorch").join("failure_history.json").exists());
    assert_eq!(
        std::fs::read_dir(temp_dir.path().join("runs")).expect("runs").count(),
        1
    );
}

#[tokio::test]
async fn test_failed_test_skips_its_dependent_tests() {
    let mut system = CategorySystem::new();
    system.add_category(TestCategory::new("api", CategoryPriority::High));
    system.add_category(TestCategory::new("setup", CategoryPriority::High));
    system.add_category(
        TestCategory::new("checkout", CategoryPriority::Low).with_dependencies(["setup"]),
    );

    let mut outcomes = BTreeMap::new();
    outcomes.insert(
        "api".to_string(),
        CategoryOutcome::failed("CommandFailed", "1 failed").with_tests(vec![TestResult::failed(
            "test_login",
            "AssertionError",
            "401",
        )]),
    );
    let executor = Arc::new(RecordingExecutor {
        outcomes,
        ..Default::default()
    });

    let mut orchestrator = Orchestrator::new(system, executor.clone()).with_fail_fast(
        FailFastStrategy::new(FailFastMode::DependencyAware, ThresholdConfig::default()),
    );
    let tests = vec![
        TestItem::new("test_login", "api", 2.0),
        TestItem::new("test_cart", "checkout", 5.0).with_dependencies(["test_login"]),
        TestItem::new("test_browse", "checkout", 3.0),
    ];

    let report = orchestrator
        .run(RunRequest::for_categories(["api", "checkout"]).with_tests(tests))
        .await
        .expect("run");

    assert!(!report.success);
    assert!(!report.stopped_early());
    assert!(report.skipped_tests.contains("test_cart"));
    assert_eq!(
        report.result("checkout").map(|r| r.status),
        Some(CategoryStatus::Passed)
    );

    let seen = executor.seen.lock().expect("lock").clone();
    assert_eq!(seen.get("checkout"), Some(&vec!["test_browse".to_string()]));
    assert_eq!(report.failure_summary.total_failures, 1);
    assert_eq!(
        report.failure_summary.categories["api"].failed_tests.len(),
        1
    );
}
