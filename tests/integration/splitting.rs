//! Window splitting scenarios.

use std::fs;

use tempfile::TempDir;
use testorch::splitter::{rebalance_windows, split_statistics};
use testorch::{SplittingStrategy, TestExecutionWindow, TestItem, TestSplitter, WindowPriority};

const ALL_STRATEGIES: [SplittingStrategy; 6] = [
    SplittingStrategy::TimeBased,
    SplittingStrategy::CountBased,
    SplittingStrategy::CategoryBased,
    SplittingStrategy::ComplexityBased,
    SplittingStrategy::DependencyAware,
    SplittingStrategy::Hybrid,
];

fn mixed_tests() -> Vec<TestItem> {
    vec![
        TestItem::new("test_login", "api", 40.0).with_tags(["smoke"]),
        TestItem::new("test_query", "database", 120.0).with_resources([
            testorch::splitter::ResourceKind::Database,
        ]),
        TestItem::new("test_parse", "unit", 5.0),
        TestItem::new("test_render", "unit", 8.0).with_complexity(6.0),
        TestItem::new("test_checkout", "e2e", 500.0).with_dependencies(["test_login"]),
        TestItem::new("test_retry", "integration", 30.0).with_flaky(true),
        TestItem::new("test_load", "performance", 250.0),
        TestItem::new("test_socket", "websocket", 60.0).with_tags(["sequential"]),
    ]
}

#[test]
fn test_oversized_test_gets_a_dedicated_window() {
    let splitter = TestSplitter::new(".");
    let tests = vec![
        TestItem::new("test_big", "integration", 600.0),
        TestItem::new("test_medium", "integration", 300.0),
        TestItem::new("test_small", "integration", 100.0),
    ];

    let windows = splitter.create_windows(tests, SplittingStrategy::TimeBased, 300.0, None, 4);

    let big = windows
        .iter()
        .find(|w| w.tests.iter().any(|t| t.name == "test_big"))
        .expect("big test placed");
    assert_eq!(big.len(), 1);
    for window in &windows {
        assert!(window.estimated_duration <= window.max_duration + 1e-9);
    }
    assert_eq!(windows.iter().map(|w| w.len()).sum::<usize>(), 3);
}

#[test]
fn test_every_strategy_respects_window_ceilings() {
    let splitter = TestSplitter::new(".");
    for strategy in ALL_STRATEGIES {
        let windows = splitter.create_windows(mixed_tests(), strategy, 180.0, None, 4);

        assert_eq!(
            windows.iter().map(|w| w.len()).sum::<usize>(),
            mixed_tests().len(),
            "{strategy} lost tests"
        );
        for (index, window) in windows.iter().enumerate() {
            assert_eq!(window.id, index);
            assert!(!window.is_empty());
            assert!(
                window.estimated_duration <= window.max_duration + 1e-9,
                "{strategy} overfilled window {index}"
            );
        }
    }
}

#[test]
fn test_rebalance_is_idempotent_once_balanced() {
    let window = |id: usize, durations: &[f64]| {
        let mut window = TestExecutionWindow::new(id, WindowPriority::Normal, 200.0);
        for (index, duration) in durations.iter().enumerate() {
            window
                .add_test(TestItem::new(format!("test_{id}_{index}"), "unit", *duration))
                .expect("fits");
        }
        window
    };
    let windows = vec![
        window(0, &[60.0, 20.0, 20.0, 20.0, 20.0]),
        window(1, &[20.0]),
        window(2, &[20.0]),
    ];
    assert!(split_statistics(&windows).coefficient_of_variation >= 0.3);

    let once = rebalance_windows(windows);
    let stats = split_statistics(&once);
    assert!(stats.coefficient_of_variation < 0.3, "cv {}", stats.coefficient_of_variation);
    assert_eq!(stats.test_count, 7);

    let twice = rebalance_windows(once.clone());
    assert_eq!(once, twice);
}

#[test]
fn test_discovery_feeds_history_into_items() {
    let temp_dir = TempDir::new().expect("temp dir");
    let tests_dir = temp_dir.path().join("tests").join("api");
    fs::create_dir_all(&tests_dir).expect("mkdir");
    fs::write(
        tests_dir.join("test_users.py"),
        "import pytest\n\n\
         @pytest.mark.smoke\n\
         def test_list_users(client):\n    assert client.get('/users').ok\n\n\
         def test_create_user(client):\n    if client:\n        assert client.post('/users').ok\n",
    )
    .expect("write");

    let history_path = temp_dir.path().join("history.json");
    let mut splitter = TestSplitter::with_history_file(temp_dir.path(), &history_path);
    splitter.update_test_history("tests/api/test_users.py::test_list_users", 12.0, true);

    let reloaded = TestSplitter::with_history_file(temp_dir.path(), &history_path);
    let items = reloaded.discover_tests(&[], None);

    assert_eq!(items.len(), 2);
    let listed = items
        .iter()
        .find(|t| t.name == "test_list_users")
        .expect("discovered");
    assert!(listed.tags.contains("smoke"));
    assert_eq!(listed.effective_duration(), 12.0);
    assert!(items.iter().all(|t| t.category == "api"));
}
