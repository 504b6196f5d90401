//! Test discovery by scanning source files.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use glob::Pattern;
use ignore::WalkBuilder;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{ResourceKind, TestItem, TestSplitter, SLOW_TEST_SECONDS};

/// File name patterns that identify test files.
pub const TEST_FILE_PATTERNS: &[&str] = &["test_*.py", "*_test.py", "*_test.rs", "*_tests.rs"];

/// Keywords checked in order against the path and test name. First match wins.
const CATEGORY_KEYWORDS: &[(&str, &[&str])] = &[
    ("unit", &["unit"]),
    ("integration", &["integration"]),
    ("e2e", &["e2e", "end_to_end"]),
    ("performance", &["performance", "perf", "benchmark", "load"]),
    ("security", &["security", "auth"]),
    ("database", &["database", "db", "migration"]),
    ("websocket", &["websocket", "ws"]),
    ("api", &["api", "endpoint"]),
    ("agent", &["agent"]),
    ("frontend", &["frontend", "ui"]),
];

/// Keywords in a test body that imply a resource requirement.
const RESOURCE_KEYWORDS: &[(ResourceKind, &[&str])] = &[
    (
        ResourceKind::Database,
        &["database", "db_session", "db.", "postgres", "sqlalchemy", "sqlite"],
    ),
    (
        ResourceKind::Network,
        &["http", "client.", "requests.", "websocket", "aiohttp"],
    ),
    (ResourceKind::Memory, &["large_", "bulk", "memory"]),
    (ResourceKind::Cpu, &["benchmark", "cpu", "multiprocessing"]),
    (ResourceKind::FileSystem, &["tmp_path", "tempfile", "open("]),
];

fn base_estimate(category: &str) -> f64 {
    match category {
        "unit" => 0.5,
        "security" | "api" | "frontend" => 2.0,
        "database" => 3.0,
        "integration" | "websocket" => 5.0,
        "agent" => 10.0,
        "e2e" => 30.0,
        "performance" => 60.0,
        _ => 1.0,
    }
}

/// Name of the category a test belongs to, from its path and name.
pub fn categorize(path: &Path, name: &str) -> &'static str {
    let haystack = format!("{} {}", path.to_string_lossy(), name).to_ascii_lowercase();
    let words: Vec<&str> = haystack
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    CATEGORY_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|keyword| {
                if keyword.contains('_') {
                    haystack.contains(keyword)
                } else {
                    words.iter().any(|w| w == keyword)
                }
            })
        })
        .map(|(category, _)| *category)
        .unwrap_or("other")
}

/// Regexes used to pull tests out of a source file.
#[derive(Debug, Clone)]
pub struct TestFileParser {
    test_def: Regex,
    marker: Regex,
    module_marks: Regex,
    depends: Regex,
    quoted: Regex,
    branch: Regex,
    asynchrony: Regex,
    mocking: Regex,
}

impl TestFileParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            test_def: Regex::new(r"^(\s*)(?:async\s+)?(?:def|fn)\s+(test_\w+)\s*\(")?,
            marker: Regex::new(r"^\s*@pytest\.mark\.(\w+)")?,
            module_marks: Regex::new(r"mark\.(\w+)")?,
            depends: Regex::new(r"depends\s*=\s*\[([^\]]*)\]")?,
            quoted: Regex::new(r#"["']([^"']+)["']"#)?,
            branch: Regex::new(r"\b(if|elif|else|for|while|match|try|except|catch)\b")?,
            asynchrony: Regex::new(r"\b(async|await)\b")?,
            mocking: Regex::new(r"(?i)\b(mock|magicmock|asyncmock|patch|monkeypatch)\w*")?,
        })
    }

    /// Extract tests from the content of one file.
    pub fn parse(&self, path: &Path, content: &str) -> Vec<TestItem> {
        let lines: Vec<&str> = content.lines().collect();
        let module_tags: BTreeSet<String> = lines
            .iter()
            .filter(|line| line.trim_start().starts_with("pytestmark"))
            .flat_map(|line| {
                self.module_marks
                    .captures_iter(line)
                    .map(|c| c[1].to_string())
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut items = Vec::new();
        let mut pending_tags = BTreeSet::new();
        let mut pending_deps = BTreeSet::new();

        for (index, line) in lines.iter().enumerate() {
            if let Some(caps) = self.marker.captures(line) {
                pending_tags.insert(caps[1].to_string());
                if let Some(deps) = self.depends.captures(line) {
                    pending_deps.extend(
                        self.quoted
                            .captures_iter(&deps[1])
                            .map(|c| c[1].to_string()),
                    );
                }
                continue;
            }

            let Some(caps) = self.test_def.captures(line) else {
                let trimmed = line.trim_start();
                if !(trimmed.is_empty() || trimmed.starts_with('@') || trimmed.starts_with("#[")) {
                    pending_tags.clear();
                    pending_deps.clear();
                }
                continue;
            };

            let indent = caps[1].len();
            let name = caps[2].to_string();
            let body = function_body(&lines, index, indent);

            let mut tags = module_tags.clone();
            tags.append(&mut pending_tags);
            let dependencies = std::mem::take(&mut pending_deps);

            items.push(self.build_item(path, name, body, tags, dependencies));
        }

        items
    }

    fn build_item(
        &self,
        path: &Path,
        name: String,
        body: &[&str],
        tags: BTreeSet<String>,
        dependencies: BTreeSet<String>,
    ) -> TestItem {
        let category = categorize(path, &name);
        let complexity = self.complexity_score(body);
        let text = body.join("\n").to_ascii_lowercase();

        let resources = RESOURCE_KEYWORDS
            .iter()
            .filter(|(_, keywords)| keywords.iter().any(|k| text.contains(k)))
            .map(|(kind, _)| *kind);

        let estimate = base_estimate(category) * (1.0 + (complexity - 1.0) / 4.0);
        let flaky = tags.contains("flaky");
        let slow = tags.contains("slow") || estimate > SLOW_TEST_SECONDS;

        let mut item = TestItem::new(name, category, estimate)
            .with_file_path(path)
            .with_complexity(complexity)
            .with_resources(resources)
            .with_tags(tags)
            .with_dependencies(dependencies)
            .with_flaky(flaky);
        item.slow = slow;
        item
    }

    /// `1 + lines/20` plus density terms for branching, async and mocking,
    /// capped at 10.
    pub fn complexity_score(&self, body: &[&str]) -> f64 {
        let code: Vec<&str> = body
            .iter()
            .copied()
            .filter(|line| {
                let trimmed = line.trim();
                !trimmed.is_empty() && !trimmed.starts_with('#') && !trimmed.starts_with("//")
            })
            .collect();
        let line_count = code.len().max(1) as f64;

        let count = |re: &Regex| code.iter().map(|line| re.find_iter(line).count()).sum::<usize>() as f64;
        let branches = count(&self.branch);
        let asyncs = count(&self.asynchrony);
        let mocks = count(&self.mocking);

        let score = 1.0
            + line_count / 20.0
            + 5.0 * branches / line_count
            + 3.0 * asyncs / line_count
            + 4.0 * mocks / line_count;
        score.clamp(1.0, 10.0)
    }
}

/// Lines from the definition at `start` up to the next line at or above its indentation.
fn function_body<'a>(lines: &'a [&'a str], start: usize, indent: usize) -> &'a [&'a str] {
    let end = lines
        .iter()
        .enumerate()
        .skip(start + 1)
        .find(|(_, line)| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && line.len() - trimmed.len() <= indent && !trimmed.starts_with(')')
        })
        .map(|(i, _)| i)
        .unwrap_or(lines.len());
    &lines[start..end]
}

impl TestSplitter {
    /// Walk `paths` (relative to the project root) and collect tests.
    ///
    /// When `categories` is given, only tests in those categories are kept.
    /// Persisted history is folded into each item.
    pub fn discover_tests(&self, paths: &[PathBuf], categories: Option<&[String]>) -> Vec<TestItem> {
        let parser = match TestFileParser::new() {
            Ok(parser) => parser,
            Err(err) => {
                warn!(error = %err, "failed to build test parser");
                return Vec::new();
            }
        };
        let patterns: Vec<Pattern> = TEST_FILE_PATTERNS
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();

        let roots: Vec<PathBuf> = if paths.is_empty() {
            vec![self.project_root().to_path_buf()]
        } else {
            paths.iter().map(|p| self.project_root().join(p)).collect()
        };

        let mut items = Vec::new();
        for root in roots {
            for entry in WalkBuilder::new(&root).build().filter_map(|e| e.ok()) {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let is_test_file = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|name| patterns.iter().any(|p| p.matches(name)));
                if !is_test_file {
                    continue;
                }

                let content = match fs::read_to_string(path) {
                    Ok(content) => content,
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "skipping unreadable test file");
                        continue;
                    }
                };

                let relative = path.strip_prefix(self.project_root()).unwrap_or(path);
                let found = parser.parse(relative, &content);
                debug!(path = %relative.display(), tests = found.len(), "parsed test file");
                items.extend(found);
            }
        }

        if let Some(wanted) = categories {
            items.retain(|item| wanted.iter().any(|c| c == &item.category));
        }
        for item in &mut items {
            if let Some(entry) = self.history().get(&item.history_key()) {
                item.apply_history(entry);
            }
        }

        info!(tests = items.len(), "discovered tests");
        items
    }
}
