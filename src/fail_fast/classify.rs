//! Failure impact classification and blast radius.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::history::TestFailureRecord;
use super::ImpactLevel;

/// Error type substrings that make a failure high impact.
pub const CRITICAL_ERROR_PATTERNS: &[&str] = &[
    "ImportError",
    "ModuleNotFoundError",
    "SyntaxError",
    "ConnectionRefused",
    "DatabaseError",
    "OperationalError",
    "AuthenticationError",
    "PermissionError",
    "MemoryError",
    "ConfigurationError",
    "Segmentation fault",
    "panicked",
];

/// Infrastructure keywords in error text and the categories they take down.
pub const INFRASTRUCTURE_KEYWORDS: &[(&str, &[&str])] = &[
    ("database", &["database", "integration", "api", "e2e"]),
    ("postgres", &["database", "integration", "e2e"]),
    ("redis", &["integration", "api", "websocket", "e2e"]),
    ("connection refused", &["integration", "api", "e2e"]),
    ("websocket", &["websocket", "e2e"]),
    ("auth", &["security", "api", "e2e"]),
    ("timeout", &["integration", "e2e", "performance"]),
    ("import", &["unit", "integration", "api", "e2e"]),
    ("docker", &["integration", "e2e", "performance"]),
    ("network", &["api", "websocket", "e2e"]),
];

/// Historical failure rate above which a test is treated as reliably broken.
pub const HIGH_FAILURE_RATE: f64 = 0.8;

/// Category failure rate above which new failures in it are high impact.
pub const CATEGORY_FAILURE_RATE: f64 = 0.5;

/// Inputs to [`classify_impact`].
pub struct ImpactInputs<'a> {
    pub markers: &'a BTreeSet<String>,
    pub error_type: &'a str,
    pub history: Option<&'a TestFailureRecord>,
    /// Failure rate of the category so far, when enough runs were seen.
    pub category_failure_rate: Option<f64>,
}

/// First matching rule wins: critical markers, critical error types,
/// historical failure rate, historical flakiness, category failure rate.
pub fn classify_impact(inputs: &ImpactInputs<'_>) -> ImpactLevel {
    if inputs.markers.contains("critical") || inputs.markers.contains("smoke") {
        return ImpactLevel::Critical;
    }
    if CRITICAL_ERROR_PATTERNS
        .iter()
        .any(|pattern| inputs.error_type.contains(pattern))
    {
        return ImpactLevel::High;
    }
    if let Some(record) = inputs.history {
        if record.failure_rate() > HIGH_FAILURE_RATE {
            return ImpactLevel::High;
        }
        if record.flaky {
            return ImpactLevel::Low;
        }
    }
    if inputs
        .category_failure_rate
        .is_some_and(|rate| rate > CATEGORY_FAILURE_RATE)
    {
        return ImpactLevel::High;
    }
    ImpactLevel::Medium
}

/// The failing category plus every category implicated by infrastructure
/// keywords in the error text.
pub fn blast_radius(category: &str, error_type: &str, error_message: &str) -> BTreeSet<String> {
    let text = format!("{error_type} {error_message}").to_ascii_lowercase();
    let mut affected: BTreeSet<String> = INFRASTRUCTURE_KEYWORDS
        .iter()
        .filter(|(keyword, _)| text.contains(keyword))
        .flat_map(|(_, categories)| categories.iter().map(|c| c.to_string()))
        .collect();
    affected.insert(category.to_string());
    affected
}

/// Everything that transitively depends on any of `roots`.
///
/// `graph` maps a name to the names it depends on. The roots themselves are
/// not included.
pub fn transitive_dependents<'a, I>(
    graph: &BTreeMap<String, BTreeSet<String>>,
    roots: I,
) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut reverse: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (name, dependencies) in graph {
        for dependency in dependencies {
            reverse
                .entry(dependency.as_str())
                .or_default()
                .push(name.as_str());
        }
    }

    let roots: BTreeSet<&str> = roots.into_iter().collect();
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut queue: VecDeque<&str> = roots.iter().copied().collect();
    while let Some(current) = queue.pop_front() {
        for &dependent in reverse.get(current).into_iter().flatten() {
            if !roots.contains(dependent) && seen.insert(dependent.to_string()) {
                queue.push_back(dependent);
            }
        }
    }
    seen
}
