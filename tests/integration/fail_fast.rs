//! Fail-fast decision scenarios.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use tempfile::TempDir;
use testorch::fail_fast::FailureHistory;
use testorch::{FailFastMode, FailFastStrategy, SkipReason, TestFailure, ThresholdConfig};

#[test]
fn test_critical_failures_stop_the_run() {
    let thresholds = ThresholdConfig {
        critical_failure_count: 1,
        ..Default::default()
    };
    let mut strategy = FailFastStrategy::new(FailFastMode::CriticalFailure, thresholds);
    strategy.record_failure(
        TestFailure::new("test_health", "smoke")
            .with_error("AssertionError", "service down")
            .with_markers(["critical"]),
    );
    strategy.record_failure(
        TestFailure::new("test_boot", "smoke")
            .with_error("AssertionError", "no boot")
            .with_markers(["smoke"]),
    );

    let (stop, decision) = strategy.should_fail_fast(None);
    assert!(stop);
    let decision = decision.expect("decision");
    assert_eq!(decision.reason, SkipReason::CriticalFailure);
    assert_eq!(decision.triggered_by.len(), 2);
    assert!(decision.skipped_categories.contains("smoke"));
}

#[test]
fn test_rate_check_waits_for_minimum_sample() {
    let thresholds = ThresholdConfig {
        min_sample_size: 10,
        consecutive_failure_count: 100,
        critical_failure_count: 100,
        ..Default::default()
    };
    let mut strategy = FailFastStrategy::new(FailFastMode::ThresholdBased, thresholds);
    for i in 0..9 {
        strategy.record_failure(
            TestFailure::new(format!("test_{i}"), "api").with_error("AssertionError", "bad"),
        );
    }

    let (stop, _) = strategy.should_fail_fast(None);
    assert!(!stop);

    strategy.record_failure(TestFailure::new("test_9", "api").with_error("AssertionError", "bad"));
    let (stop, decision) = strategy.should_fail_fast(None);
    assert!(stop);
    assert_eq!(decision.map(|d| d.reason), Some(SkipReason::ThresholdExceeded));
}

#[test]
fn test_dependency_aware_only_recommends_skips() {
    let mut strategy =
        FailFastStrategy::new(FailFastMode::DependencyAware, ThresholdConfig::default());
    strategy.set_dependency_graph(BTreeMap::from([
        ("integration".to_string(), BTreeSet::from(["unit".to_string()])),
        ("e2e".to_string(), BTreeSet::from(["integration".to_string()])),
    ]));
    for _ in 0..5 {
        strategy.record_failure(
            TestFailure::new("test_import", "unit")
                .with_error("ImportError", "no module named app")
                .with_markers(["critical"]),
        );
    }

    let (stop, decision) = strategy.should_fail_fast(None);
    assert!(!stop);
    let decision = decision.expect("decision");
    assert_eq!(decision.reason, SkipReason::DependencyFailure);
    assert!(decision.skipped_categories.contains("integration"));
    assert!(decision.skipped_categories.contains("e2e"));
}

#[test]
fn test_flaky_detection_from_persisted_history() {
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("failures.json");
    let mut history = FailureHistory::load(&path);
    let now = Utc::now();

    history.record_failure("test_sync", "TimeoutError", Some(3.0), now);
    history.record_success("test_sync");
    history.record_failure("test_sync", "ConnectionError", Some(1.0), now);
    history.record_success("test_sync");
    history.record_failure("test_sync", "TimeoutError", None, now);

    let reloaded = FailureHistory::load(&path);
    let record = reloaded.get("test_sync").expect("record");
    assert_eq!(record.total_runs, 5);
    assert!(record.flaky);
    assert_eq!(reloaded.flaky_tests(), vec!["test_sync"]);
}

#[test]
fn test_summary_is_stable_between_calls() {
    let mut strategy = FailFastStrategy::new(FailFastMode::Disabled, ThresholdConfig::default());
    strategy.record_success("test_ok", "unit");
    strategy.record_failure(TestFailure::new("test_bad", "unit").with_error("AssertionError", "x"));

    let first = strategy.get_failure_summary();
    let second = strategy.get_failure_summary();
    assert_eq!(first, second);
    assert_eq!(first.total_failures, 1);
    assert_eq!(strategy.should_fail_fast(None), (false, None));
}

#[test]
fn test_export_failure_report() {
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("out").join("report.json");
    let mut strategy = FailFastStrategy::new(FailFastMode::FirstFailure, ThresholdConfig::default());
    strategy.record_failure(TestFailure::new("test_db", "database").with_error(
        "OperationalError",
        "database connection refused",
    ));
    strategy.should_fail_fast(None);

    strategy.export_failure_report(&path).expect("export");

    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
    assert_eq!(report["failures"][0]["impact_level"], "high");
    assert_eq!(report["decisions"][0]["reason"], "first_failure");
    let affected = report["failures"][0]["affects_categories"]
        .as_array()
        .expect("categories");
    assert!(affected.iter().any(|c| c == "integration"));
}
