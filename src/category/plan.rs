//! Execution planning over the category registry.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{CategoryPriority, CategorySystem};
use crate::error::{OrchestratorError, Result};

/// Ordered phases of categories produced by [`CategorySystem::create_execution_plan`].
///
/// Phases run in sequence; the categories inside one phase are mutually
/// compatible and may run concurrently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub phases: Vec<Vec<String>>,
    /// Flat topological order of every planned category.
    pub execution_order: Vec<String>,
    /// Dependencies of each planned category, restricted to the planned set.
    pub dependency_graph: BTreeMap<String, BTreeSet<String>>,
    /// Known categories that were explicitly requested, in request order.
    pub requested_categories: Vec<String>,
    /// Requested names that are not registered.
    pub ignored_categories: Vec<String>,
    /// Wall-clock estimate per phase in seconds.
    pub phase_durations: Vec<f64>,
    pub total_estimated_duration: f64,
}

impl ExecutionPlan {
    pub fn is_requested(&self, name: &str) -> bool {
        self.requested_categories.iter().any(|r| r == name)
    }

    /// Categories pulled in only to satisfy dependencies.
    pub fn auto_added_categories(&self) -> Vec<&str> {
        self.execution_order
            .iter()
            .filter(|name| !self.is_requested(name))
            .map(String::as_str)
            .collect()
    }

    /// Index of the phase containing `name`.
    pub fn phase_of(&self, name: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.iter().any(|c| c == name))
    }

    pub fn category_count(&self) -> usize {
        self.execution_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.execution_order.is_empty()
    }
}

impl CategorySystem {
    /// Build a phased execution plan for the selected categories.
    ///
    /// Unknown names are dropped (and reported in `ignored_categories`).
    /// Unless `skip_dependencies` is set the selection is expanded to its
    /// transitive dependency closure. A dependency cycle is an error.
    pub fn create_execution_plan<S: AsRef<str>>(
        &self,
        selected: &[S],
        max_parallel: usize,
        skip_dependencies: bool,
    ) -> Result<ExecutionPlan> {
        let mut requested_categories = Vec::new();
        let mut ignored_categories = Vec::new();
        for name in selected {
            let name = name.as_ref();
            if self.contains(name) {
                if !requested_categories.iter().any(|r| r == name) {
                    requested_categories.push(name.to_string());
                }
            } else {
                warn!(category = name, "ignoring unknown category");
                if !ignored_categories.iter().any(|r| r == name) {
                    ignored_categories.push(name.to_string());
                }
            }
        }

        let selected: BTreeSet<String> = requested_categories.iter().cloned().collect();
        let resolved = if skip_dependencies {
            selected
        } else {
            self.resolve_dependencies(&selected)
        };

        let execution_order = self.topological_order(&resolved)?;
        let phases = self.pack_phases(&execution_order, &resolved, max_parallel.max(1));
        let phase_durations: Vec<f64> = phases
            .iter()
            .map(|phase| self.phase_duration(phase))
            .collect();
        let total_estimated_duration = phase_durations.iter().sum();

        let dependency_graph = resolved
            .iter()
            .map(|name| (name.clone(), self.dependencies_within(name, &resolved)))
            .collect();

        debug!(
            phases = phases.len(),
            categories = execution_order.len(),
            total_estimated_duration,
            "created execution plan"
        );

        Ok(ExecutionPlan {
            phases,
            execution_order,
            dependency_graph,
            requested_categories,
            ignored_categories,
            phase_durations,
            total_estimated_duration,
        })
    }

    /// Expand a selection to its transitive dependency closure.
    pub fn resolve_dependencies(&self, selected: &BTreeSet<String>) -> BTreeSet<String> {
        let mut resolved = selected.clone();
        let mut frontier: Vec<String> = selected.iter().cloned().collect();

        while let Some(name) = frontier.pop() {
            let Some(category) = self.get(&name) else {
                continue;
            };
            for dependency in &category.dependencies {
                if !self.contains(dependency) {
                    warn!(
                        category = %name,
                        dependency = %dependency,
                        "skipping unknown dependency"
                    );
                    continue;
                }
                if resolved.insert(dependency.clone()) {
                    frontier.push(dependency.clone());
                }
            }
        }

        resolved
    }

    /// Wall-clock estimate of a phase: its slowest member.
    pub fn phase_duration(&self, phase: &[String]) -> f64 {
        phase
            .iter()
            .filter_map(|name| self.get(name))
            .map(|category| category.effective_duration())
            .fold(0.0, f64::max)
    }

    fn dependencies_within(&self, name: &str, resolved: &BTreeSet<String>) -> BTreeSet<String> {
        self.get(name)
            .map(|category| {
                category
                    .dependencies
                    .iter()
                    .filter(|dependency| resolved.contains(*dependency))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Kahn's algorithm with a ready queue keyed by (priority, insertion order).
    fn topological_order(&self, resolved: &BTreeSet<String>) -> Result<Vec<String>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in resolved {
            let degree = in_degree.entry(name.as_str()).or_insert(0);
            if let Some(category) = self.get(name) {
                for dependency in &category.dependencies {
                    if resolved.contains(dependency) {
                        *degree += 1;
                        dependents
                            .entry(dependency.as_str())
                            .or_default()
                            .push(name.as_str());
                    }
                }
            }
        }

        let priority_of = |name: &str| {
            self.get(name)
                .map(|category| category.priority)
                .unwrap_or(CategoryPriority::Optional)
        };

        let mut sequence = 0u64;
        let mut ready: BinaryHeap<Reverse<(CategoryPriority, u64, &str)>> = BinaryHeap::new();
        for (&name, &degree) in &in_degree {
            if degree == 0 {
                ready.push(Reverse((priority_of(name), sequence, name)));
                sequence += 1;
            }
        }

        let mut order = Vec::with_capacity(resolved.len());
        while let Some(Reverse((_, _, name))) = ready.pop() {
            order.push(name.to_string());
            for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or_default() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((priority_of(dependent), sequence, dependent)));
                        sequence += 1;
                    }
                }
            }
        }

        if order.len() < resolved.len() {
            let residual: BTreeSet<&str> = in_degree
                .iter()
                .filter(|(_, &degree)| degree > 0)
                .map(|(&name, _)| name)
                .collect();
            return Err(OrchestratorError::CircularDependency(
                self.cycle_members(&residual),
            ));
        }

        Ok(order)
    }

    /// Names of the categories that actually form cycles within `residual`.
    fn cycle_members(&self, residual: &BTreeSet<&str>) -> Vec<String> {
        let mut graph = DiGraph::<&str, ()>::new();
        let indices: HashMap<&str, _> = residual
            .iter()
            .map(|&name| (name, graph.add_node(name)))
            .collect();

        for &name in residual {
            if let Some(category) = self.get(name) {
                for dependency in &category.dependencies {
                    if let Some(&from) = indices.get(dependency.as_str()) {
                        graph.add_edge(from, indices[name], ());
                    }
                }
            }
        }

        let mut members: Vec<String> = tarjan_scc(&graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1 || graph.contains_edge(component[0], component[0])
            })
            .flatten()
            .map(|index| graph[index].to_string())
            .collect();

        if members.is_empty() {
            members = residual.iter().map(|name| name.to_string()).collect();
        }
        members.sort();
        members
    }

    /// Greedily pack a topological order into parallel-safe phases.
    fn pack_phases(
        &self,
        order: &[String],
        resolved: &BTreeSet<String>,
        max_parallel: usize,
    ) -> Vec<Vec<String>> {
        let mut remaining: Vec<&str> = order.iter().map(String::as_str).collect();
        let mut completed: HashSet<&str> = HashSet::new();
        let mut phases = Vec::new();

        while !remaining.is_empty() {
            let mut phase: Vec<&str> = Vec::new();

            for &name in &remaining {
                if phase.len() >= max_parallel {
                    break;
                }
                let Some(category) = self.get(name) else {
                    continue;
                };

                let dependencies_done = category
                    .dependencies
                    .iter()
                    .filter(|dependency| resolved.contains(*dependency))
                    .all(|dependency| completed.contains(dependency.as_str()));
                if !dependencies_done {
                    continue;
                }

                let compatible = phase.iter().all(|&member| {
                    self.get(member)
                        .map(|other| category.can_run_with(other))
                        .unwrap_or(true)
                });
                if compatible {
                    phase.push(name);
                }
            }

            if phase.is_empty() {
                warn!(
                    category = remaining[0],
                    "no category admissible; forcing a dedicated phase"
                );
                phase.push(remaining[0]);
            }

            remaining.retain(|name| !phase.contains(name));
            completed.extend(phase.iter().copied());
            debug!(phase = phases.len(), members = ?phase, "packed phase");
            phases.push(phase.into_iter().map(str::to_string).collect());
        }

        phases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::{CategoryPriority, TestCategory};

    fn scenario_system() -> CategorySystem {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("unit", CategoryPriority::High));
        system.add_category(
            TestCategory::new("integration", CategoryPriority::Medium).with_dependencies(["unit"]),
        );
        system.add_category(
            TestCategory::new("e2e", CategoryPriority::Medium)
                .with_dependencies(["integration"])
                .with_conflicts(["performance"]),
        );
        system.add_category(
            TestCategory::new("performance", CategoryPriority::Medium)
                .with_dependencies(["integration"]),
        );
        system
    }

    fn assert_topological(system: &CategorySystem, plan: &ExecutionPlan) {
        let flattened: Vec<&String> = plan.phases.iter().flatten().collect();
        for (index, name) in flattened.iter().enumerate() {
            let category = system.get(name).expect("planned category");
            for dependency in &category.dependencies {
                if let Some(position) = flattened.iter().position(|n| *n == dependency) {
                    assert!(position < index, "{} planned before {}", name, dependency);
                }
            }
        }
    }

    #[test]
    fn test_conflicting_categories_get_separate_phases() {
        let system = scenario_system();
        let plan = system
            .create_execution_plan(&["e2e", "performance"], 4, false)
            .expect("plan");

        assert_eq!(plan.phases[0], vec!["unit"]);
        assert_eq!(plan.phases[1], vec!["integration"]);
        assert_ne!(plan.phase_of("e2e"), plan.phase_of("performance"));
        assert_eq!(plan.phases.len(), 4);
        assert_topological(&system, &plan);
    }

    #[test]
    fn test_requested_distinct_from_auto_added() {
        let system = scenario_system();
        let plan = system
            .create_execution_plan(&["e2e"], 4, false)
            .expect("plan");

        assert_eq!(plan.requested_categories, vec!["e2e"]);
        assert!(plan.is_requested("e2e"));
        assert!(!plan.is_requested("unit"));
        assert_eq!(plan.auto_added_categories(), vec!["unit", "integration"]);
    }

    #[test]
    fn test_unknown_categories_are_ignored() {
        let system = scenario_system();
        let plan = system
            .create_execution_plan(&["unit", "ghost"], 2, false)
            .expect("plan");

        assert_eq!(plan.execution_order, vec!["unit"]);
        assert_eq!(plan.ignored_categories, vec!["ghost"]);
    }

    #[test]
    fn test_cycle_is_an_error() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("a", CategoryPriority::High).with_dependencies(["b"]));
        system.add_category(TestCategory::new("b", CategoryPriority::High).with_dependencies(["a"]));
        system.add_category(TestCategory::new("c", CategoryPriority::High).with_dependencies(["a"]));

        let err = system
            .create_execution_plan(&["c"], 2, false)
            .expect_err("cycle must fail");
        match err {
            OrchestratorError::CircularDependency(members) => {
                assert_eq!(members, vec!["a", "b"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("a", CategoryPriority::High).with_dependencies(["a"]));
        assert!(matches!(
            system.create_execution_plan(&["a"], 1, false),
            Err(OrchestratorError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_priority_breaks_ties() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("alpha", CategoryPriority::Low));
        system.add_category(TestCategory::new("beta", CategoryPriority::Critical));
        system.add_category(TestCategory::new("gamma", CategoryPriority::Medium));

        let plan = system
            .create_execution_plan(&["alpha", "beta", "gamma"], 1, false)
            .expect("plan");
        assert_eq!(plan.execution_order, vec!["beta", "gamma", "alpha"]);
        assert_eq!(plan.phases, vec![vec!["beta"], vec!["gamma"], vec!["alpha"]]);
    }

    #[test]
    fn test_priority_only_among_unblocked() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("base", CategoryPriority::Low));
        system.add_category(
            TestCategory::new("urgent", CategoryPriority::Critical).with_dependencies(["base"]),
        );
        system.add_category(TestCategory::new("other", CategoryPriority::Medium));

        let plan = system
            .create_execution_plan(&["urgent", "other"], 4, false)
            .expect("plan");
        assert_eq!(plan.execution_order, vec!["other", "base", "urgent"]);
    }

    #[test]
    fn test_max_parallel_bounds_phase_size() {
        let mut system = CategorySystem::new();
        for name in ["a", "b", "c", "d", "e"] {
            system.add_category(TestCategory::new(name, CategoryPriority::Medium));
        }

        let plan = system
            .create_execution_plan(&["a", "b", "c", "d", "e"], 2, false)
            .expect("plan");
        assert!(plan.phases.iter().all(|phase| phase.len() <= 2));
        assert_eq!(plan.phases.len(), 3);

        let plan = system
            .create_execution_plan(&["a", "b"], 0, false)
            .expect("plan");
        assert_eq!(plan.phases.len(), 2);
    }

    #[test]
    fn test_sequential_category_runs_alone() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("a", CategoryPriority::High));
        system.add_category(TestCategory::new("b", CategoryPriority::High).with_parallel_safe(false));
        system.add_category(TestCategory::new("c", CategoryPriority::High));

        let plan = system
            .create_execution_plan(&["a", "b", "c"], 4, false)
            .expect("plan");
        let phase_with_b = &plan.phases[plan.phase_of("b").expect("b planned")];
        assert_eq!(phase_with_b, &vec!["b".to_string()]);
    }

    #[test]
    fn test_skip_dependencies() {
        let system = scenario_system();
        let plan = system
            .create_execution_plan(&["e2e", "performance"], 4, true)
            .expect("plan");

        assert_eq!(plan.category_count(), 2);
        assert!(plan.dependency_graph["e2e"].is_empty());
        assert_ne!(plan.phase_of("e2e"), plan.phase_of("performance"));
    }

    #[test]
    fn test_total_duration_sums_phase_maxima() {
        let mut system = CategorySystem::new();
        system.add_category(TestCategory::new("a", CategoryPriority::High).with_estimated_duration(100.0));
        system.add_category(TestCategory::new("b", CategoryPriority::High).with_estimated_duration(40.0));
        system.add_category(
            TestCategory::new("c", CategoryPriority::High)
                .with_estimated_duration(30.0)
                .with_dependencies(["a"]),
        );

        let plan = system
            .create_execution_plan(&["a", "b", "c"], 4, false)
            .expect("plan");
        assert_eq!(plan.phase_durations, vec![100.0, 30.0]);
        assert!((plan.total_estimated_duration - 130.0).abs() < 1e-9);
    }

    #[test]
    fn test_default_catalogue_plans_cleanly() {
        let system = CategorySystem::with_defaults();
        let names: Vec<&str> = system.names().collect();
        let plan = system.create_execution_plan(&names, 3, false).expect("plan");

        assert_eq!(plan.category_count(), system.len());
        assert_topological(&system, &plan);
        for phase in &plan.phases {
            for a in phase {
                for b in phase {
                    if a != b {
                        let (ca, cb) = (system.get(a).expect("a"), system.get(b).expect("b"));
                        assert!(ca.can_run_with(cb), "{a} and {b} share a phase");
                        assert!(!plan.dependency_graph[a].contains(b));
                    }
                }
            }
        }
    }

    #[test]
    fn test_dependency_graph_restricted_to_plan() {
        let system = CategorySystem::with_defaults();
        let plan = system
            .create_execution_plan(&["websocket"], 2, false)
            .expect("plan");

        assert_eq!(plan.execution_order, vec!["unit", "api", "websocket"]);
        assert_eq!(
            plan.dependency_graph["websocket"],
            BTreeSet::from(["api".to_string()])
        );
    }
}
