//! Test categories and the category registry.
//!
//! A category groups tests that share execution semantics: a priority,
//! the categories that must finish first, the categories it may never share
//! a phase with, and the resources it contends for. The [`CategorySystem`]
//! owns the registry and turns a request into an [`ExecutionPlan`].

pub mod plan;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ParseEnumError;

pub use plan::ExecutionPlan;

/// Smoothing factor for the rolling duration/success averages.
const HISTORY_ALPHA: f64 = 0.3;

/// Category priority. Lower values run earlier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CategoryPriority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
    Optional = 5,
}

impl CategoryPriority {
    /// Numeric priority value (1 = critical, 5 = optional).
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CategoryPriority::Critical => "critical",
            CategoryPriority::High => "high",
            CategoryPriority::Medium => "medium",
            CategoryPriority::Low => "low",
            CategoryPriority::Optional => "optional",
        }
    }
}

impl fmt::Display for CategoryPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryPriority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(CategoryPriority::Critical),
            "high" => Ok(CategoryPriority::High),
            "medium" => Ok(CategoryPriority::Medium),
            "low" => Ok(CategoryPriority::Low),
            "optional" => Ok(CategoryPriority::Optional),
            _ => Err(ParseEnumError::new(
                "category priority",
                s,
                "critical, high, medium, low, optional",
            )),
        }
    }
}

/// Definition of a single test category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCategory {
    /// Unique category name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: CategoryPriority,
    /// Per-category execution timeout in seconds.
    pub timeout_seconds: u64,
    /// Categories that must complete before this one starts.
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    /// Categories that may never run in the same phase as this one.
    #[serde(default)]
    pub conflicts: BTreeSet<String>,
    pub parallel_safe: bool,
    #[serde(default)]
    pub memory_intensive: bool,
    #[serde(default)]
    pub cpu_intensive: bool,
    #[serde(default)]
    pub database_dependent: bool,
    #[serde(default)]
    pub network_dependent: bool,
    /// Execution environment; `None` is the shared default environment.
    #[serde(default)]
    pub environment: Option<String>,
    /// Estimated wall-clock duration in seconds.
    pub estimated_duration: f64,
    /// Rolling average of observed durations in seconds.
    #[serde(default)]
    pub average_duration: Option<f64>,
    /// Rolling success rate in `[0, 1]`.
    #[serde(default)]
    pub success_rate: Option<f64>,
    #[serde(default)]
    pub run_count: u32,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl TestCategory {
    /// Create a parallel-safe category with a 5 minute timeout and a 1 minute estimate.
    pub fn new(name: impl Into<String>, priority: CategoryPriority) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            priority,
            timeout_seconds: 300,
            dependencies: BTreeSet::new(),
            conflicts: BTreeSet::new(),
            parallel_safe: true,
            memory_intensive: false,
            cpu_intensive: false,
            database_dependent: false,
            network_dependent: false,
            environment: None,
            estimated_duration: 60.0,
            average_duration: None,
            success_rate: None,
            run_count: 0,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_conflicts<I, S>(mut self, conflicts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.conflicts.extend(conflicts.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_estimated_duration(mut self, seconds: f64) -> Self {
        self.estimated_duration = seconds.max(0.0);
        self
    }

    pub fn with_parallel_safe(mut self, parallel_safe: bool) -> Self {
        self.parallel_safe = parallel_safe;
        self
    }

    pub fn with_memory_intensive(mut self, value: bool) -> Self {
        self.memory_intensive = value;
        self
    }

    pub fn with_cpu_intensive(mut self, value: bool) -> Self {
        self.cpu_intensive = value;
        self
    }

    pub fn with_database_dependent(mut self, value: bool) -> Self {
        self.database_dependent = value;
        self
    }

    pub fn with_network_dependent(mut self, value: bool) -> Self {
        self.network_dependent = value;
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Observed average duration if any, otherwise the estimate.
    pub fn effective_duration(&self) -> f64 {
        self.average_duration.unwrap_or(self.estimated_duration)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Whether either category lists the other as a conflict.
    pub fn conflicts_with(&self, other: &TestCategory) -> bool {
        self.conflicts.contains(&other.name) || other.conflicts.contains(&self.name)
    }

    /// Whether this category can share a phase with `other`.
    ///
    /// Both must be parallel safe and free of mutual conflicts. Within the
    /// same environment they may not both be memory intensive, CPU intensive
    /// or database dependent.
    pub fn can_run_with(&self, other: &TestCategory) -> bool {
        if !self.parallel_safe || !other.parallel_safe {
            return false;
        }
        if self.conflicts_with(other) {
            return false;
        }
        if self.environment != other.environment {
            return true;
        }
        !(self.memory_intensive && other.memory_intensive
            || self.cpu_intensive && other.cpu_intensive
            || self.database_dependent && other.database_dependent)
    }

    fn record_run(&mut self, duration: f64, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.average_duration = Some(match self.average_duration {
            Some(avg) => avg * (1.0 - HISTORY_ALPHA) + duration * HISTORY_ALPHA,
            None => duration,
        });
        self.success_rate = Some(match self.success_rate {
            Some(rate) => rate * (1.0 - HISTORY_ALPHA) + outcome * HISTORY_ALPHA,
            None => outcome,
        });
        self.run_count += 1;
    }
}

/// Kind of cross-category reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Dependency,
    Conflict,
}

impl fmt::Display for ReferenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferenceKind::Dependency => f.write_str("dependency"),
            ReferenceKind::Conflict => f.write_str("conflict"),
        }
    }
}

/// A dependency or conflict that names an unregistered category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DanglingReference {
    pub category: String,
    pub reference: String,
    pub kind: ReferenceKind,
}

impl fmt::Display for DanglingReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "category '{}' has {} on unknown category '{}'",
            self.category, self.kind, self.reference
        )
    }
}

/// Registry of test categories.
#[derive(Debug, Clone, Default)]
pub struct CategorySystem {
    categories: BTreeMap<String, TestCategory>,
}

impl CategorySystem {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry pre-populated with the default catalogue.
    pub fn with_defaults() -> Self {
        let mut system = Self::new();
        for category in default_categories() {
            system.add_category(category);
        }
        system
    }

    /// Register a category, returning the definition it replaced.
    pub fn add_category(&mut self, category: TestCategory) -> Option<TestCategory> {
        debug!(category = %category.name, priority = %category.priority, "registering category");
        self.categories.insert(category.name.clone(), category)
    }

    /// Remove a category and prune every reference to it.
    pub fn remove_category(&mut self, name: &str) -> Option<TestCategory> {
        let removed = self.categories.remove(name)?;
        for category in self.categories.values_mut() {
            category.dependencies.remove(name);
            category.conflicts.remove(name);
        }
        Some(removed)
    }

    pub fn get(&self, name: &str) -> Option<&TestCategory> {
        self.categories.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut TestCategory> {
        self.categories.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.categories.contains_key(name)
    }

    /// Category names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn categories(&self) -> impl Iterator<Item = &TestCategory> {
        self.categories.values()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Category names grouped by priority.
    pub fn categories_by_priority(&self) -> BTreeMap<CategoryPriority, Vec<&str>> {
        let mut grouped: BTreeMap<CategoryPriority, Vec<&str>> = BTreeMap::new();
        for category in self.categories.values() {
            grouped
                .entry(category.priority)
                .or_default()
                .push(category.name.as_str());
        }
        grouped
    }

    /// Every dependency or conflict that names an unregistered category.
    pub fn validate_references(&self) -> Vec<DanglingReference> {
        let mut dangling = Vec::new();
        for category in self.categories.values() {
            for dependency in &category.dependencies {
                if !self.categories.contains_key(dependency) {
                    dangling.push(DanglingReference {
                        category: category.name.clone(),
                        reference: dependency.clone(),
                        kind: ReferenceKind::Dependency,
                    });
                }
            }
            for conflict in &category.conflicts {
                if !self.categories.contains_key(conflict) {
                    dangling.push(DanglingReference {
                        category: category.name.clone(),
                        reference: conflict.clone(),
                        kind: ReferenceKind::Conflict,
                    });
                }
            }
        }
        dangling
    }

    /// Fold a completed run into the category's rolling averages.
    ///
    /// Returns `false` if the category is unknown.
    pub fn update_category_history(&mut self, name: &str, duration: f64, success: bool) -> bool {
        match self.categories.get_mut(name) {
            Some(category) => {
                category.record_run(duration, success);
                true
            }
            None => false,
        }
    }
}

/// Default category catalogue.
pub fn default_categories() -> Vec<TestCategory> {
    use CategoryPriority::*;

    vec![
        TestCategory::new("smoke", Critical)
            .with_description("Fast sanity checks run before everything else")
            .with_timeout(120)
            .with_estimated_duration(30.0),
        TestCategory::new("unit", High)
            .with_description("Isolated unit tests")
            .with_timeout(300)
            .with_estimated_duration(120.0),
        TestCategory::new("database", High)
            .with_description("Persistence layer tests against a real database")
            .with_dependencies(["unit"])
            .with_database_dependent(true)
            .with_timeout(600)
            .with_estimated_duration(180.0),
        TestCategory::new("api", Medium)
            .with_description("HTTP endpoint tests")
            .with_dependencies(["unit"])
            .with_network_dependent(true)
            .with_timeout(600)
            .with_estimated_duration(240.0),
        TestCategory::new("integration", Medium)
            .with_description("Cross-service integration tests")
            .with_dependencies(["unit"])
            .with_database_dependent(true)
            .with_timeout(900)
            .with_estimated_duration(300.0),
        TestCategory::new("websocket", Medium)
            .with_description("Realtime channel tests")
            .with_dependencies(["api"])
            .with_network_dependent(true)
            .with_timeout(600)
            .with_estimated_duration(180.0),
        TestCategory::new("agent", Medium)
            .with_description("Agent workflow tests")
            .with_dependencies(["integration"])
            .with_cpu_intensive(true)
            .with_timeout(1200)
            .with_estimated_duration(420.0),
        TestCategory::new("security", Medium)
            .with_description("Authentication and authorization tests")
            .with_dependencies(["unit"])
            .with_timeout(600)
            .with_estimated_duration(200.0),
        TestCategory::new("frontend", Medium)
            .with_description("Frontend component tests")
            .with_memory_intensive(true)
            .with_timeout(600)
            .with_estimated_duration(240.0),
        TestCategory::new("e2e", Low)
            .with_description("End-to-end user journeys")
            .with_dependencies(["integration"])
            .with_conflicts(["performance"])
            .with_memory_intensive(true)
            .with_database_dependent(true)
            .with_timeout(1800)
            .with_estimated_duration(900.0),
        TestCategory::new("performance", Low)
            .with_description("Load and latency benchmarks")
            .with_dependencies(["integration"])
            .with_conflicts(["e2e"])
            .with_cpu_intensive(true)
            .with_parallel_safe(false)
            .with_timeout(1800)
            .with_estimated_duration(600.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(CategoryPriority::Critical < CategoryPriority::High);
        assert!(CategoryPriority::Low < CategoryPriority::Optional);
        assert_eq!(CategoryPriority::Critical.value(), 1);
        assert_eq!(CategoryPriority::Optional.value(), 5);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("HIGH".parse::<CategoryPriority>(), Ok(CategoryPriority::High));
        assert!("urgent".parse::<CategoryPriority>().is_err());
    }

    #[test]
    fn test_defaults_have_no_dangling_references() {
        let system = CategorySystem::with_defaults();
        assert!(system.validate_references().is_empty());
        assert!(system.contains("unit"));
        assert!(system.contains("e2e"));
    }

    #[test]
    fn test_can_run_with_conflict() {
        let a = TestCategory::new("a", CategoryPriority::Medium).with_conflicts(["b"]);
        let b = TestCategory::new("b", CategoryPriority::Medium);
        assert!(!a.can_run_with(&b));
        assert!(!b.can_run_with(&a));
    }

    #[test]
    fn test_can_run_with_not_parallel_safe() {
        let a = TestCategory::new("a", CategoryPriority::Medium).with_parallel_safe(false);
        let b = TestCategory::new("b", CategoryPriority::Medium);
        assert!(!a.can_run_with(&b));
    }

    #[test]
    fn test_can_run_with_resource_contention_same_environment() {
        let a = TestCategory::new("a", CategoryPriority::Medium).with_database_dependent(true);
        let b = TestCategory::new("b", CategoryPriority::Medium).with_database_dependent(true);
        assert!(!a.can_run_with(&b));

        let c = TestCategory::new("c", CategoryPriority::Medium).with_cpu_intensive(true);
        assert!(a.can_run_with(&c));
    }

    #[test]
    fn test_can_run_with_resource_contention_different_environment() {
        let a = TestCategory::new("a", CategoryPriority::Medium)
            .with_memory_intensive(true)
            .with_environment("staging");
        let b = TestCategory::new("b", CategoryPriority::Medium).with_memory_intensive(true);
        assert!(a.can_run_with(&b));
    }

    #[test]
    fn test_remove_category_prunes_references() {
        let mut system = CategorySystem::with_defaults();
        assert!(system.remove_category("performance").is_some());

        let e2e = system.get("e2e").expect("e2e");
        assert!(!e2e.conflicts.contains("performance"));

        system.remove_category("unit");
        assert!(system
            .categories()
            .all(|category| !category.dependencies.contains("unit")));
        assert!(system.validate_references().is_empty());
    }

    #[test]
    fn test_remove_unknown_category() {
        let mut system = CategorySystem::new();
        assert!(system.remove_category("missing").is_none());
    }

    #[test]
    fn test_validate_references_reports_unknown() {
        let mut system = CategorySystem::new();
        system.add_category(
            TestCategory::new("a", CategoryPriority::High)
                .with_dependencies(["ghost"])
                .with_conflicts(["phantom"]),
        );

        let dangling = system.validate_references();
        assert_eq!(dangling.len(), 2);
        assert!(dangling
            .iter()
            .any(|d| d.reference == "ghost" && d.kind == ReferenceKind::Dependency));
        assert!(dangling
            .iter()
            .any(|d| d.reference == "phantom" && d.kind == ReferenceKind::Conflict));
    }

    #[test]
    fn test_update_category_history_moving_average() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("unit", CategoryPriority::High));

        assert!(system.update_category_history("unit", 100.0, true));
        let unit = system.get("unit").expect("unit");
        assert_eq!(unit.average_duration, Some(100.0));
        assert_eq!(unit.success_rate, Some(1.0));

        system.update_category_history("unit", 200.0, false);
        let unit = system.get("unit").expect("unit");
        assert!((unit.average_duration.unwrap_or_default() - 130.0).abs() < 1e-9);
        assert!((unit.success_rate.unwrap_or_default() - 0.7).abs() < 1e-9);
        assert_eq!(unit.run_count, 2);
        assert!((unit.effective_duration() - 130.0).abs() < 1e-9);

        assert!(!system.update_category_history("missing", 1.0, true));
    }

    #[test]
    fn test_categories_by_priority() {
        let system = CategorySystem::with_defaults();
        let grouped = system.categories_by_priority();
        assert_eq!(grouped[&CategoryPriority::Critical], vec!["smoke"]);
        assert!(grouped[&CategoryPriority::Low].contains(&"e2e"));
    }
}
