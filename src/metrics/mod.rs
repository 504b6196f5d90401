//! Run metrics collection.
//!
//! Each category execution is a step. The collector is shared across the
//! tasks of a phase; a snapshot is taken when the run finishes and can be
//! persisted with [`RunMetricsStore`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::persist::write_json_atomic;

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// Metrics for a single category execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Category name
    pub step_id: String,
    /// Phase index the step belongs to
    pub phase: usize,
    pub status: StepStatus,
    /// Windows the category was split into, if any
    pub windows: usize,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl StepMetrics {
    fn new(step_id: impl Into<String>, phase: usize) -> Self {
        let now = Utc::now();
        Self {
            step_id: step_id.into(),
            phase,
            status: StepStatus::Running,
            windows: 0,
            duration: Duration::ZERO,
            started_at: now,
            completed_at: now,
            error: None,
        }
    }
}

/// Aggregated metrics for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Wall-clock run duration
    pub run_duration: Duration,
    /// Categories in the plan
    pub expected_steps: u32,
    pub steps_attempted: u32,
    pub steps_passed: u32,
    pub failures: u32,
    pub timeouts: u32,
    pub skipped: u32,
    /// Sum of step durations over wall-clock duration
    pub parallelism_efficiency: f64,
    pub step_durations: BTreeMap<String, Duration>,
    /// Steps ordered by phase, then name
    pub steps: Vec<StepMetrics>,
}

impl RunMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.steps_attempted == 0 {
            return 0.0;
        }
        f64::from(self.steps_passed) / f64::from(self.steps_attempted)
    }

    /// The longest step.
    pub fn slowest_step(&self) -> Option<&StepMetrics> {
        self.steps.iter().max_by_key(|step| step.duration)
    }
}

#[derive(Debug)]
struct RunMetricsState {
    run_id: String,
    started_at: DateTime<Utc>,
    started_instant: Instant,
    expected_steps: usize,
    steps: BTreeMap<String, StepMetrics>,
    skipped: BTreeSet<String>,
}

/// Thread-safe run metrics collector.
#[derive(Debug, Clone)]
pub struct RunMetricsCollector {
    inner: Arc<Mutex<RunMetricsState>>,
}

impl RunMetricsCollector {
    pub fn new(run_id: impl Into<String>, expected_steps: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunMetricsState {
                run_id: run_id.into(),
                started_at: Utc::now(),
                started_instant: Instant::now(),
                expected_steps,
                steps: BTreeMap::new(),
                skipped: BTreeSet::new(),
            })),
        }
    }

    /// Generate a run ID using timestamp and process ID.
    pub fn generate_run_id() -> String {
        format!(
            "run-{}-{}",
            Utc::now().timestamp_millis(),
            std::process::id()
        )
    }

    pub fn start_step(&self, step_id: impl Into<String>, phase: usize) {
        if let Ok(mut state) = self.inner.lock() {
            let step_id = step_id.into();
            state
                .steps
                .entry(step_id.clone())
                .or_insert_with(|| StepMetrics::new(step_id, phase));
        }
    }

    pub fn complete_step(
        &self,
        step_id: &str,
        status: StepStatus,
        windows: usize,
        duration: Duration,
        error: Option<String>,
    ) {
        if let Ok(mut state) = self.inner.lock() {
            let entry = state
                .steps
                .entry(step_id.to_string())
                .or_insert_with(|| StepMetrics::new(step_id, 0));
            entry.status = status;
            entry.windows = windows;
            entry.duration = duration;
            entry.completed_at = Utc::now();
            entry.error = error;
        }
    }

    /// Record a category that was never started.
    pub fn skip_step(&self, step_id: impl Into<String>) {
        if let Ok(mut state) = self.inner.lock() {
            state.skipped.insert(step_id.into());
        }
    }

    /// Build a run metrics snapshot.
    pub fn finish(&self) -> RunMetrics {
        let Ok(state) = self.inner.lock() else {
            let now = Utc::now();
            return RunMetrics {
                run_id: "run-unknown".to_string(),
                started_at: now,
                completed_at: now,
                run_duration: Duration::ZERO,
                expected_steps: 0,
                steps_attempted: 0,
                steps_passed: 0,
                failures: 0,
                timeouts: 0,
                skipped: 0,
                parallelism_efficiency: 0.0,
                step_durations: BTreeMap::new(),
                steps: Vec::new(),
            };
        };

        let run_duration = state.started_instant.elapsed();
        let count = |status: StepStatus| {
            state.steps.values().filter(|s| s.status == status).count() as u32
        };
        let busy: Duration = state.steps.values().map(|s| s.duration).sum();
        let parallelism_efficiency = if run_duration.is_zero() {
            0.0
        } else {
            busy.as_secs_f64() / run_duration.as_secs_f64()
        };

        let mut steps: Vec<StepMetrics> = state.steps.values().cloned().collect();
        steps.sort_by(|a, b| a.phase.cmp(&b.phase).then_with(|| a.step_id.cmp(&b.step_id)));

        RunMetrics {
            run_id: state.run_id.clone(),
            started_at: state.started_at,
            completed_at: Utc::now(),
            run_duration,
            expected_steps: state.expected_steps as u32,
            steps_attempted: state.steps.len() as u32,
            steps_passed: count(StepStatus::Passed),
            failures: count(StepStatus::Failed) + count(StepStatus::TimedOut),
            timeouts: count(StepStatus::TimedOut),
            skipped: state.skipped.len() as u32,
            parallelism_efficiency,
            step_durations: state
                .steps
                .iter()
                .map(|(id, step)| (id.clone(), step.duration))
                .collect(),
            steps,
        }
    }
}

/// Store run metrics snapshots on disk.
#[derive(Debug, Clone)]
pub struct RunMetricsStore {
    runs_dir: PathBuf,
}

impl RunMetricsStore {
    /// Create a store writing into `runs_dir`.
    pub fn new(runs_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let runs_dir = runs_dir.into();
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self { runs_dir })
    }

    pub fn save(&self, metrics: &RunMetrics) -> io::Result<PathBuf> {
        let path = self.runs_dir.join(format!("{}.json", metrics.run_id));
        write_json_atomic(&path, metrics)?;
        Ok(path)
    }

    pub fn load(&self, run_id: &str) -> io::Result<Option<RunMetrics>> {
        let path = self.runs_dir.join(format!("{}.json", run_id));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let metrics = serde_json::from_str(&contents).map_err(io::Error::other)?;
                Ok(Some(metrics))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Format run metrics for display.
pub fn format_run_metrics(metrics: &RunMetrics) -> String {
    let mut output = String::from("## Run Metrics\n\n");

    output.push_str("### Summary\n");
    output.push_str(&format!(
        "- **Categories**: {} run ({} passed, {} failed, {} timed out, {} skipped)\n",
        metrics.steps_attempted, metrics.steps_passed, metrics.failures, metrics.timeouts, metrics.skipped
    ));
    output.push_str(&format!(
        "- **Success Rate**: {:.1}%\n",
        metrics.success_rate() * 100.0
    ));
    output.push_str(&format!(
        "- **Parallelism Efficiency**: {:.2}x\n",
        metrics.parallelism_efficiency
    ));
    output.push_str(&format!(
        "- **Total Execution Time**: {:.1}s\n",
        metrics.run_duration.as_secs_f64()
    ));

    if !metrics.steps.is_empty() {
        output.push_str("\n### Categories\n");
        for step in &metrics.steps {
            output.push_str(&format!(
                "- **{}** (phase {}): {:?} in {:.2}s\n",
                step.step_id,
                step.phase,
                step.status,
                step.duration.as_secs_f64()
            ));
        }
    }

    output
}
