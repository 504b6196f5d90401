//! Category executors.
//!
//! The orchestrator hands each admitted category, together with the windows
//! its tests were split into, to a [`CategoryExecutor`]. [`CommandExecutor`]
//! runs a shell command per category (or per window) and scrapes per-test
//! results from its output.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::category::TestCategory;
use crate::splitter::TestExecutionWindow;

/// Maximum number of output lines kept in an outcome message.
const MESSAGE_TAIL_LINES: usize = 20;

/// Result of one test as reported by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    /// Test identifier, `file::name` where the runner reports one.
    pub name: String,
    pub passed: bool,
    pub duration: Option<f64>,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub markers: Vec<String>,
}

impl TestResult {
    pub fn passed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            duration: None,
            error_type: None,
            error_message: None,
            markers: Vec::new(),
        }
    }

    pub fn failed(
        name: impl Into<String>,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            duration: None,
            error_type: Some(error_type.into()),
            error_message: Some(message.into()),
            markers: Vec::new(),
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration = Some(seconds);
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
}

/// What executing one category produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Error type when the category failed as a whole.
    pub error_type: Option<String>,
    /// Tail of the runner output, or an error description.
    pub message: Option<String>,
    /// Per-test results, empty when the runner reports none.
    pub tests: Vec<TestResult>,
}

impl CategoryOutcome {
    pub fn passed() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_type: Some(error_type.into()),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_tests(mut self, tests: Vec<TestResult>) -> Self {
        self.tests = tests;
        self
    }
}

/// Executes a single category.
///
/// Implementations must not panic on test failures; failures are reported
/// through [`CategoryOutcome`]. Timeouts are enforced by the caller.
#[async_trait]
pub trait CategoryExecutor: Send + Sync {
    async fn execute(
        &self,
        category: &TestCategory,
        windows: &[TestExecutionWindow],
    ) -> CategoryOutcome;
}

/// Runs a shell command for each category.
///
/// `{category}` in the template is replaced with the category name and
/// `{tests}` with the space separated test identifiers of a window. When a
/// category has windows the command runs once per window, in order.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    template: String,
    working_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new(template: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            working_dir: working_dir.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render the command line for a category and optional window.
    pub fn render(&self, category: &str, window: Option<&TestExecutionWindow>) -> String {
        let tests = window
            .map(|w| {
                w.tests
                    .iter()
                    .map(|t| t.history_key())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        self.template
            .replace("{category}", category)
            .replace("{tests}", &tests)
            .trim_end()
            .to_string()
    }

    async fn run_command(&self, command_line: &str) -> CategoryOutcome {
        debug!(command = command_line, "running category command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command_line)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                warn!(command = command_line, error = %err, "failed to spawn category command");
                return CategoryOutcome::failed("SpawnError", err.to_string());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tests = parse_test_results(&stdout);
        let success = output.status.success();

        CategoryOutcome {
            success,
            exit_code: output.status.code(),
            error_type: (!success).then(|| "CommandFailed".to_string()),
            message: output_tail(&stdout, &stderr),
            tests,
        }
    }
}

#[async_trait]
impl CategoryExecutor for CommandExecutor {
    async fn execute(
        &self,
        category: &TestCategory,
        windows: &[TestExecutionWindow],
    ) -> CategoryOutcome {
        if windows.is_empty() {
            return self.run_command(&self.render(&category.name, None)).await;
        }

        let mut combined = CategoryOutcome::passed();
        for window in windows {
            let outcome = self
                .run_command(&self.render(&category.name, Some(window)))
                .await;
            combined.tests.extend(outcome.tests);
            if !outcome.success {
                combined.success = false;
                combined.exit_code = outcome.exit_code;
                combined.error_type = outcome.error_type;
                combined.message = outcome.message;
            }
        }
        combined
    }
}

fn output_tail(stdout: &str, stderr: &str) -> Option<String> {
    let lines: Vec<&str> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|line| !line.trim().is_empty())
        .collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(MESSAGE_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

/// Scrape per-test results from runner output.
///
/// Understands pytest verbose lines (`path::name PASSED`), the pytest short
/// summary (`FAILED path::name - Error: message`) and libtest lines
/// (`test name ... ok`).
pub fn parse_test_results(output: &str) -> Vec<TestResult> {
    let (Ok(verbose), Ok(summary), Ok(libtest)) = (
        Regex::new(r"^(\S+::\S+)\s+(PASSED|FAILED|ERROR)\b"),
        Regex::new(r"^(?:FAILED|ERROR) (\S+::\S+)(?: - (.*))?$"),
        Regex::new(r"^test (\S+) \.\.\. (ok|FAILED)\s*$"),
    ) else {
        return Vec::new();
    };

    let mut results: Vec<TestResult> = Vec::new();
    let mut upsert = |result: TestResult| {
        match results.iter_mut().find(|r| r.name == result.name) {
            Some(existing) => {
                existing.passed = result.passed;
                if result.error_type.is_some() {
                    existing.error_type = result.error_type;
                    existing.error_message = result.error_message;
                }
            }
            None => results.push(result),
        }
    };

    for line in output.lines().map(str::trim_end) {
        if let Some(caps) = summary.captures(line) {
            let name = caps[1].to_string();
            let detail = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            let (error_type, message) = split_error(detail);
            upsert(TestResult::failed(name, error_type, message));
        } else if let Some(caps) = verbose.captures(line) {
            let name = caps[1].to_string();
            if &caps[2] == "PASSED" {
                upsert(TestResult::passed(name));
            } else {
                upsert(TestResult::failed(name, "TestFailure", ""));
            }
        } else if let Some(caps) = libtest.captures(line) {
            let name = caps[1].to_string();
            if &caps[2] == "ok" {
                upsert(TestResult::passed(name));
            } else {
                upsert(TestResult::failed(name, "TestFailure", ""));
            }
        }
    }

    results
}

/// Split `AssertionError: expected 1` into its error type and message.
fn split_error(detail: &str) -> (String, String) {
    match detail.split_once(':') {
        Some((kind, message))
            if !kind.is_empty()
                && kind
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') =>
        {
            (kind.to_string(), message.trim().to_string())
        }
        _ => ("TestFailure".to_string(), detail.trim().to_string()),
    }
}
