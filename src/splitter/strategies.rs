//! Window construction for each splitting strategy.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::{
    SplittingStrategy, TestExecutionWindow, TestItem, WindowPriority, MAX_DURATION_FACTOR,
    SLOW_TEST_SECONDS,
};

/// Sizing inputs shared by all strategies.
#[derive(Debug, Clone, Copy)]
pub struct SplitParams {
    pub target: f64,
    pub max_duration: f64,
    pub max_windows: Option<usize>,
    pub max_parallel: usize,
}

impl SplitParams {
    pub fn new(target: f64, max_windows: Option<usize>, max_parallel: usize) -> Self {
        let target = if target > 0.0 { target } else { 1.0 };
        Self {
            target,
            max_duration: target * MAX_DURATION_FACTOR,
            max_windows,
            max_parallel: max_parallel.max(1),
        }
    }

    fn unbounded(self) -> Self {
        Self {
            max_windows: None,
            ..self
        }
    }
}

/// Dispatch to the strategy. Ids are left for the caller to assign.
pub fn split(
    tests: Vec<TestItem>,
    strategy: SplittingStrategy,
    params: &SplitParams,
) -> Vec<TestExecutionWindow> {
    if tests.is_empty() {
        return Vec::new();
    }
    match strategy {
        SplittingStrategy::TimeBased => time_based(tests, params, WindowPriority::Normal),
        SplittingStrategy::CountBased => count_based(tests, params),
        SplittingStrategy::CategoryBased => {
            category_based(tests, params, |_| WindowPriority::Normal)
        }
        SplittingStrategy::ComplexityBased => complexity_based(tests, params),
        SplittingStrategy::DependencyAware => dependency_aware(tests, params),
        SplittingStrategy::Hybrid => hybrid(tests, params),
    }
}

fn total_duration(tests: &[TestItem]) -> f64 {
    tests.iter().map(TestItem::effective_duration).sum()
}

fn sort_longest_first(tests: &mut [TestItem]) {
    tests.sort_by(|a, b| b.effective_duration().total_cmp(&a.effective_duration()));
}

/// Place `test` in the window with the least leftover capacity that still
/// admits it, or open a dedicated window.
fn place_best_fit(
    windows: &mut Vec<TestExecutionWindow>,
    test: TestItem,
    priority: WindowPriority,
    max_duration: f64,
) {
    let duration = test.effective_duration();
    let best = windows
        .iter()
        .enumerate()
        .filter(|(_, w)| w.can_fit(&test))
        .min_by(|(_, a), (_, b)| {
            (a.remaining_capacity() - duration).total_cmp(&(b.remaining_capacity() - duration))
        })
        .map(|(index, _)| index);

    let rejected = match best {
        Some(index) => windows[index].add_test(test).err(),
        None => Some(test),
    };
    if let Some(test) = rejected {
        if duration > max_duration {
            debug!(test = %test.name, duration, "test exceeds window ceiling, using dedicated window");
        }
        windows.push(TestExecutionWindow::dedicated(test, priority, max_duration));
    }
}

/// Longest tests first into a pool sized from total duration, best fit.
pub fn time_based(
    mut tests: Vec<TestItem>,
    params: &SplitParams,
    priority: WindowPriority,
) -> Vec<TestExecutionWindow> {
    if tests.is_empty() {
        return Vec::new();
    }
    sort_longest_first(&mut tests);

    let mut pool_size = ((total_duration(&tests) / params.target).ceil() as usize).max(1);
    if let Some(max) = params.max_windows {
        pool_size = pool_size.min(max.max(1));
    }

    let mut windows: Vec<TestExecutionWindow> = (0..pool_size)
        .map(|_| TestExecutionWindow::new(0, priority, params.max_duration))
        .collect();
    for test in tests {
        place_best_fit(&mut windows, test, priority, params.max_duration);
    }

    windows.retain(|w| !w.is_empty());
    windows
}

/// Contiguous chunks of `ceil(n / k)` tests.
pub fn count_based(tests: Vec<TestItem>, params: &SplitParams) -> Vec<TestExecutionWindow> {
    let k = params.max_windows.unwrap_or(params.max_parallel).max(1);
    let chunk_size = tests.len().div_ceil(k).max(1);

    let mut windows = Vec::new();
    let mut rejected = Vec::new();
    let mut current = TestExecutionWindow::new(0, WindowPriority::Normal, params.max_duration);
    let mut admitted = 0;

    for test in tests {
        if admitted == chunk_size {
            windows.push(std::mem::replace(
                &mut current,
                TestExecutionWindow::new(0, WindowPriority::Normal, params.max_duration),
            ));
            admitted = 0;
        }
        match current.add_test(test) {
            Ok(()) => admitted += 1,
            Err(test) => rejected.push(test),
        }
    }
    if !current.is_empty() {
        windows.push(current);
    }

    for test in rejected {
        place_best_fit(&mut windows, test, WindowPriority::Normal, params.max_duration);
    }
    windows
}

/// One window per category; over-long categories fall back to time-based.
pub fn category_based<F>(
    tests: Vec<TestItem>,
    params: &SplitParams,
    priority_for: F,
) -> Vec<TestExecutionWindow>
where
    F: Fn(&str) -> WindowPriority,
{
    let mut groups: BTreeMap<String, Vec<TestItem>> = BTreeMap::new();
    for test in tests {
        groups.entry(test.category.clone()).or_default().push(test);
    }

    let mut windows = Vec::new();
    for (category, group) in groups {
        let priority = priority_for(&category);
        if total_duration(&group) > params.max_duration {
            windows.extend(time_based(group, &params.unbounded(), priority));
            continue;
        }

        let mut window = TestExecutionWindow::new(0, priority, params.max_duration);
        let mut rejected = Vec::new();
        for test in group {
            if let Err(test) = window.add_test(test) {
                rejected.push(test);
            }
        }
        windows.push(window);
        if !rejected.is_empty() {
            windows.extend(time_based(rejected, &params.unbounded(), priority));
        }
    }
    windows
}

/// Most complex tests first, each into the least loaded window that admits it.
pub fn complexity_based(mut tests: Vec<TestItem>, params: &SplitParams) -> Vec<TestExecutionWindow> {
    tests.sort_by(|a, b| b.complexity_score.total_cmp(&a.complexity_score));
    let k = params
        .max_windows
        .unwrap_or_else(|| (total_duration(&tests) / params.target).ceil() as usize)
        .max(1);

    let mut windows: Vec<TestExecutionWindow> = (0..k)
        .map(|_| TestExecutionWindow::new(0, WindowPriority::Normal, params.max_duration))
        .collect();

    for test in tests {
        let target = windows
            .iter()
            .enumerate()
            .filter(|(_, w)| w.can_fit(&test))
            .min_by(|(_, a), (_, b)| a.complexity_load().total_cmp(&b.complexity_load()))
            .map(|(index, _)| index);

        let rejected = match target {
            Some(index) => windows[index].add_test(test).err(),
            None => Some(test),
        };
        if let Some(test) = rejected {
            windows.push(TestExecutionWindow::dedicated(
                test,
                WindowPriority::Normal,
                params.max_duration,
            ));
        }
    }

    windows.retain(|w| !w.is_empty());
    windows
}

/// Independent tests run in parallel windows; tests with dependencies share
/// one sequential window.
pub fn dependency_aware(tests: Vec<TestItem>, params: &SplitParams) -> Vec<TestExecutionWindow> {
    let (independent, dependent): (Vec<_>, Vec<_>) =
        tests.into_iter().partition(|t| t.dependencies.is_empty());

    let mut windows = time_based(independent, params, WindowPriority::High);
    if !dependent.is_empty() {
        let ceiling = params.max_duration.max(total_duration(&dependent));
        windows.extend(sequential_windows(dependent, WindowPriority::Normal, ceiling, false));
    }
    windows
}

/// Fill sequential windows in input order, opening a new one on overflow.
fn sequential_windows(
    tests: Vec<TestItem>,
    priority: WindowPriority,
    max_duration: f64,
    isolated: bool,
) -> Vec<TestExecutionWindow> {
    let fresh = || {
        let window = TestExecutionWindow::sequential(0, priority, max_duration);
        if isolated {
            window.with_isolation()
        } else {
            window
        }
    };

    let mut windows = Vec::new();
    let mut current = fresh();
    for test in tests {
        if let Err(test) = current.add_test(test) {
            if !current.is_empty() {
                windows.push(std::mem::replace(&mut current, fresh()));
            }
            if let Err(test) = current.add_test(test) {
                let mut dedicated = TestExecutionWindow::dedicated(test, priority, max_duration);
                dedicated.sequential = true;
                dedicated.parallel_safe = false;
                dedicated.isolated = isolated;
                dedicated.requires_isolation |= isolated;
                windows.push(dedicated);
            }
        }
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

fn hybrid_category_priority(category: &str) -> WindowPriority {
    match category {
        "unit" | "smoke" => WindowPriority::High,
        "integration" | "api" => WindowPriority::Normal,
        _ => WindowPriority::Low,
    }
}

/// Critical, flaky, slow and regular tests are split separately, then
/// consolidated when the result exceeds `max_windows`.
pub fn hybrid(tests: Vec<TestItem>, params: &SplitParams) -> Vec<TestExecutionWindow> {
    let mut critical = Vec::new();
    let mut flaky = Vec::new();
    let mut slow = Vec::new();
    let mut regular = Vec::new();
    for test in tests {
        if test.is_critical() {
            critical.push(test);
        } else if test.flaky {
            flaky.push(test);
        } else if test.slow || test.effective_duration() > SLOW_TEST_SECONDS {
            slow.push(test);
        } else {
            regular.push(test);
        }
    }

    let unbounded = params.unbounded();
    let mut windows = time_based(critical, &unbounded, WindowPriority::Critical);
    windows.extend(sequential_windows(flaky, WindowPriority::Low, params.max_duration, true));
    windows.extend(time_based(slow, &unbounded, WindowPriority::Normal));
    windows.extend(category_based(regular, &unbounded, hybrid_category_priority));

    match params.max_windows {
        Some(max) if windows.len() > max => consolidate(windows, params, max),
        _ => windows,
    }
}

/// Merge non-critical windows holding the same category at the same
/// priority. A group only spills into another window when the ceiling
/// would be exceeded.
fn consolidate(
    windows: Vec<TestExecutionWindow>,
    params: &SplitParams,
    max_windows: usize,
) -> Vec<TestExecutionWindow> {
    let before = windows.len();
    let (mut merged, rest): (Vec<_>, Vec<_>) = windows
        .into_iter()
        .partition(|w| w.priority == WindowPriority::Critical);

    // (category, priority, sequential, isolated)
    let mut groups: BTreeMap<(String, WindowPriority, bool, bool), Vec<TestItem>> = BTreeMap::new();
    for window in rest {
        let (priority, sequential, isolated) = (window.priority, window.sequential, window.isolated);
        for test in window.tests {
            groups
                .entry((test.category.clone(), priority, sequential, isolated))
                .or_default()
                .push(test);
        }
    }

    for ((_, priority, sequential, isolated), tests) in groups {
        if sequential {
            merged.extend(sequential_windows(tests, priority, params.max_duration, isolated));
            continue;
        }
        let fresh = || {
            let window = TestExecutionWindow::new(0, priority, params.max_duration);
            if isolated {
                window.with_isolation()
            } else {
                window
            }
        };

        let mut current = fresh();
        for test in tests {
            let Err(test) = current.add_test(test) else {
                continue;
            };
            if !current.is_empty() {
                merged.push(std::mem::replace(&mut current, fresh()));
            }
            if let Err(test) = current.add_test(test) {
                merged.push(TestExecutionWindow::dedicated(test, priority, params.max_duration));
            }
        }
        if !current.is_empty() {
            merged.push(current);
        }
    }

    if merged.len() > max_windows {
        info!(
            windows = merged.len(),
            max_windows, "could not consolidate below the window limit"
        );
    } else {
        debug!(before, after = merged.len(), "consolidated windows");
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::ResourceKind;

    fn params(target: f64) -> SplitParams {
        SplitParams::new(target, None, 4)
    }

    fn item(name: &str, category: &str, duration: f64) -> TestItem {
        TestItem::new(name, category, duration)
    }

    fn all_names(windows: &[TestExecutionWindow]) -> Vec<String> {
        let mut names: Vec<String> = windows
            .iter()
            .flat_map(|w| w.tests.iter().map(|t| t.name.clone()))
            .collect();
        names.sort();
        names
    }

    fn assert_within_ceiling(windows: &[TestExecutionWindow]) {
        for window in windows {
            assert!(
                window.estimated_duration <= window.max_duration + 1e-9,
                "window {} over ceiling",
                window.id
            );
        }
    }

    #[test]
    fn test_time_based_packs_within_ceiling() {
        let tests = vec![
            item("a", "unit", 50.0),
            item("b", "unit", 40.0),
            item("c", "unit", 30.0),
            item("d", "unit", 20.0),
            item("e", "unit", 10.0),
        ];
        let windows = time_based(tests, &params(60.0), WindowPriority::Normal);

        assert_eq!(windows.len(), 2);
        assert_within_ceiling(&windows);
        assert_eq!(all_names(&windows), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_oversize_test_gets_dedicated_window() {
        let tests = vec![item("huge", "e2e", 500.0), item("small", "unit", 5.0)];
        let windows = time_based(tests, &params(60.0), WindowPriority::Normal);

        let huge = windows
            .iter()
            .find(|w| w.tests.iter().any(|t| t.name == "huge"))
            .expect("huge placed");
        assert_eq!(huge.len(), 1);
        assert_eq!(huge.max_duration, 500.0);
        assert_within_ceiling(&windows);
    }

    #[test]
    fn test_count_based_chunks() {
        let tests: Vec<TestItem> = (0..10).map(|i| item(&format!("t{i}"), "unit", 1.0)).collect();
        let windows = count_based(tests, &SplitParams::new(60.0, Some(3), 8));

        let sizes: Vec<usize> = windows.iter().map(TestExecutionWindow::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
    }

    #[test]
    fn test_count_based_spills_rejected_tests() {
        let tests = vec![item("a", "unit", 50.0), item("b", "unit", 50.0)];
        let windows = count_based(tests, &SplitParams::new(60.0, Some(1), 1));

        assert_eq!(windows.len(), 2);
        assert_within_ceiling(&windows);
    }

    #[test]
    fn test_category_based_groups() {
        let tests = vec![
            item("u1", "unit", 1.0),
            item("a1", "api", 1.0),
            item("u2", "unit", 1.0),
        ];
        let windows = category_based(tests, &params(60.0), |_| WindowPriority::Normal);

        assert_eq!(windows.len(), 2);
        for window in &windows {
            assert_eq!(window.categories.len(), 1);
        }
    }

    #[test]
    fn test_category_based_long_group_splits() {
        let tests: Vec<TestItem> = (0..5).map(|i| item(&format!("t{i}"), "unit", 40.0)).collect();
        let windows = category_based(tests, &params(60.0), |_| WindowPriority::Normal);

        assert!(windows.len() > 1);
        assert_within_ceiling(&windows);
    }

    #[test]
    fn test_complexity_based_balances_load() {
        let tests = vec![
            item("a", "unit", 1.0).with_complexity(9.0),
            item("b", "unit", 1.0).with_complexity(8.0),
            item("c", "unit", 1.0).with_complexity(2.0),
            item("d", "unit", 1.0).with_complexity(1.0),
        ];
        let windows = complexity_based(tests, &SplitParams::new(60.0, Some(2), 2));

        assert_eq!(windows.len(), 2);
        let loads: Vec<f64> = windows.iter().map(|w| w.tests.iter().map(|t| t.complexity_score).sum()).collect();
        assert_eq!(loads, vec![10.0, 10.0]);
    }

    #[test]
    fn test_dependency_aware_sequential_pool() {
        let tests = vec![
            item("a", "unit", 10.0),
            item("b", "unit", 50.0).with_dependencies(["a"]),
            item("c", "unit", 50.0).with_dependencies(["a"]),
        ];
        let windows = dependency_aware(tests, &params(60.0));

        let independent: Vec<_> = windows.iter().filter(|w| !w.sequential).collect();
        assert!(independent.iter().all(|w| w.priority == WindowPriority::High));

        let sequential: Vec<_> = windows.iter().filter(|w| w.sequential).collect();
        assert_eq!(sequential.len(), 1);
        assert_eq!(sequential[0].len(), 2);
        assert!(!sequential[0].parallel_safe);
        assert_within_ceiling(&windows);
    }

    #[test]
    fn test_hybrid_buckets() {
        let tests = vec![
            item("smoke", "unit", 1.0).with_tags(["smoke"]),
            item("wobbly", "api", 5.0).with_flaky(true),
            item("glacial", "e2e", 400.0),
            item("plain_unit", "unit", 2.0),
            item("plain_api", "api", 2.0),
            item("plain_agent", "agent", 2.0),
        ];
        let windows = hybrid(tests, &params(120.0));

        let window_of = |name: &str| {
            windows
                .iter()
                .find(|w| w.tests.iter().any(|t| t.name == name))
                .expect("placed")
        };
        assert_eq!(window_of("smoke").priority, WindowPriority::Critical);

        let flaky = window_of("wobbly");
        assert!(flaky.sequential);
        assert!(flaky.requires_isolation);
        assert_eq!(flaky.priority, WindowPriority::Low);

        assert_eq!(window_of("glacial").len(), 1);
        assert_eq!(window_of("plain_unit").priority, WindowPriority::High);
        assert_eq!(window_of("plain_api").priority, WindowPriority::Normal);
        assert_eq!(window_of("plain_agent").priority, WindowPriority::Low);
    }

    #[test]
    fn test_hybrid_consolidates_to_limit() {
        let slow = |mut test: TestItem| {
            test.slow = true;
            test
        };
        let tests = vec![
            item("smoke", "unit", 1.0).with_tags(["smoke"]),
            slow(item("slow_api", "api", 3.0)),
            slow(item("slow_integration", "integration", 3.0)),
            item("plain_api", "api", 2.0),
            item("plain_integration", "integration", 2.0),
        ];
        let unlimited = hybrid(tests.clone(), &params(120.0));
        assert_eq!(unlimited.len(), 4);

        let limited = hybrid(tests, &SplitParams::new(120.0, Some(3), 4));
        assert_eq!(limited.len(), 3);
        assert!(limited.iter().any(|w| w.priority == WindowPriority::Critical));
        for window in &limited {
            assert_eq!(window.categories.len(), 1, "mixed window {:?}", window.categories);
        }
        let api = limited
            .iter()
            .find(|w| w.categories.contains("api"))
            .expect("api window");
        assert_eq!(api.len(), 2);
        assert_eq!(all_names(&limited).len(), 5);
        assert_within_ceiling(&limited);
    }

    #[test]
    fn test_consolidation_keeps_categories_apart() {
        let tests = ["agent", "frontend", "misc", "unit"]
            .into_iter()
            .map(|category| item(&format!("{category}_1"), category, 10.0))
            .collect();
        let windows = hybrid(tests, &SplitParams::new(300.0, Some(2), 4));

        assert!(windows.iter().all(|w| w.categories.len() <= 1));
        assert_eq!(all_names(&windows).len(), 4);
    }

    #[test]
    fn test_isolation_splits_shared_database() {
        let tests = vec![
            item("a", "database", 5.0).with_resources([ResourceKind::Database]),
            item("b", "database", 5.0).with_resources([ResourceKind::Database]),
        ];
        let windows = time_based(tests, &params(60.0), WindowPriority::Normal);
        assert_eq!(windows.len(), 2);
    }

    #[test]
    fn test_split_empty() {
        assert!(split(Vec::new(), SplittingStrategy::Hybrid, &params(60.0)).is_empty());
    }
}
