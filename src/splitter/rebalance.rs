//! Post-split rebalancing and window statistics.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{coefficient_of_variation, TestExecutionWindow};

/// Rebalancing is skipped below this coefficient of variation.
pub const REBALANCE_CV_THRESHOLD: f64 = 0.3;

const OVERLOADED_FACTOR: f64 = 1.3;
const UNDERLOADED_FACTOR: f64 = 1.2;
const DONOR_FLOOR_FACTOR: f64 = 0.7;
const SETTLED_FACTOR: f64 = 1.1;

/// Summary of a set of windows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitStatistics {
    pub window_count: usize,
    pub test_count: usize,
    pub total_duration: f64,
    pub mean_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub std_deviation: f64,
    pub coefficient_of_variation: f64,
    pub mean_balancing_score: f64,
    pub sequential_windows: usize,
    pub isolated_windows: usize,
}

pub fn split_statistics(windows: &[TestExecutionWindow]) -> SplitStatistics {
    if windows.is_empty() {
        return SplitStatistics::default();
    }
    let durations: Vec<f64> = windows.iter().map(|w| w.estimated_duration).collect();
    let n = durations.len() as f64;
    let total: f64 = durations.iter().sum();
    let mean = total / n;
    let variance = durations.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;

    SplitStatistics {
        window_count: windows.len(),
        test_count: windows.iter().map(TestExecutionWindow::len).sum(),
        total_duration: total,
        mean_duration: mean,
        min_duration: durations.iter().copied().fold(f64::INFINITY, f64::min),
        max_duration: durations.iter().copied().fold(0.0, f64::max),
        std_deviation: variance.sqrt(),
        coefficient_of_variation: coefficient_of_variation(&durations),
        mean_balancing_score: windows.iter().map(|w| w.balancing_score).sum::<f64>() / n,
        sequential_windows: windows.iter().filter(|w| w.sequential).count(),
        isolated_windows: windows.iter().filter(|w| w.requires_isolation).count(),
    }
}

/// Move small tests out of windows far above the mean duration into windows
/// well below it.
///
/// Does nothing when the durations are already even (CV below
/// [`REBALANCE_CV_THRESHOLD`]). Never empties a window and never breaks a
/// window's admission rules.
pub fn rebalance_windows(mut windows: Vec<TestExecutionWindow>) -> Vec<TestExecutionWindow> {
    let stats = split_statistics(&windows);
    if windows.len() < 2
        || stats.mean_duration <= 0.0
        || stats.coefficient_of_variation < REBALANCE_CV_THRESHOLD
    {
        return windows;
    }

    let mean = stats.mean_duration;
    let overloaded: Vec<usize> = windows
        .iter()
        .enumerate()
        .filter(|(_, w)| w.estimated_duration > OVERLOADED_FACTOR * mean)
        .map(|(index, _)| index)
        .collect();

    let mut moved = 0usize;
    for from in overloaded {
        while windows[from].estimated_duration > SETTLED_FACTOR * mean && windows[from].len() > 1 {
            let Some((test_index, to)) = find_move(&windows, from, mean) else {
                break;
            };
            let test = windows[from].take_test(test_index);
            match windows[to].add_test(test) {
                Ok(()) => moved += 1,
                Err(test) => {
                    windows[from].push_unchecked(test);
                    break;
                }
            }
        }
    }

    if moved > 0 {
        let after = split_statistics(&windows);
        info!(
            moved,
            cv_before = stats.coefficient_of_variation,
            cv_after = after.coefficient_of_variation,
            "rebalanced windows"
        );
    } else {
        debug!("no rebalancing moves available");
    }
    windows
}

/// Smallest test in `from` that some underloaded window can take. Receivers
/// sharing the test's category are preferred, then the least loaded.
fn find_move(windows: &[TestExecutionWindow], from: usize, mean: f64) -> Option<(usize, usize)> {
    let donor = &windows[from];
    let mut candidates: Vec<usize> = (0..donor.len()).collect();
    candidates.sort_by(|&a, &b| {
        donor.tests[a]
            .effective_duration()
            .total_cmp(&donor.tests[b].effective_duration())
    });

    candidates.into_iter().find_map(|test_index| {
        let test = &donor.tests[test_index];
        let duration = test.effective_duration();
        windows
            .iter()
            .enumerate()
            .filter(|&(to, w)| {
                to != from
                    && w.estimated_duration < DONOR_FLOOR_FACTOR * mean
                    && w.estimated_duration + duration < UNDERLOADED_FACTOR * mean
                    && w.can_fit(test)
            })
            .min_by(|(_, a), (_, b)| {
                let a_mismatch = !a.categories.contains(&test.category);
                let b_mismatch = !b.categories.contains(&test.category);
                a_mismatch
                    .cmp(&b_mismatch)
                    .then_with(|| a.estimated_duration.total_cmp(&b.estimated_duration))
            })
            .map(|(to, _)| (test_index, to))
    })
}
