//! Planning scenarios over small category graphs.

use testorch::{CategoryPriority, CategorySystem, OrchestratorError, TestCategory};

fn pipeline() -> CategorySystem {
    let mut system = CategorySystem::new();
    system.add_category(TestCategory::new("unit", CategoryPriority::High));
    system.add_category(
        TestCategory::new("integration", CategoryPriority::Medium).with_dependencies(["unit"]),
    );
    system.add_category(
        TestCategory::new("e2e", CategoryPriority::Low)
            .with_dependencies(["integration"])
            .with_conflicts(["performance"]),
    );
    system.add_category(
        TestCategory::new("performance", CategoryPriority::Low).with_dependencies(["integration"]),
    );
    system
}

#[test]
fn test_conflicting_categories_never_share_a_phase() {
    let plan = pipeline()
        .create_execution_plan(&["e2e", "performance"], 4, false)
        .expect("plan");

    let unit = plan.phase_of("unit").expect("unit");
    let integration = plan.phase_of("integration").expect("integration");
    let e2e = plan.phase_of("e2e").expect("e2e");
    let performance = plan.phase_of("performance").expect("performance");

    assert!(unit < integration);
    assert!(integration < e2e.min(performance));
    assert_ne!(e2e, performance);
    assert_eq!(plan.phases[unit], vec!["unit"]);
    assert_eq!(plan.phases[integration], vec!["integration"]);

    let mut auto = plan.auto_added_categories();
    auto.sort();
    assert_eq!(auto, vec!["integration", "unit"]);
}

#[test]
fn test_phases_form_a_topological_order() {
    let system = CategorySystem::with_defaults();
    let all: Vec<String> = system.names().map(str::to_string).collect();
    let plan = system.create_execution_plan(&all, 3, false).expect("plan");

    assert_eq!(plan.category_count(), system.len());
    for (index, phase) in plan.phases.iter().enumerate() {
        assert!(phase.len() <= 3);
        for name in phase {
            let category = system.get(name).expect("known category");
            for dependency in &category.dependencies {
                let dep_phase = plan.phase_of(dependency).expect("dependency planned");
                assert!(dep_phase < index, "{name} runs before its dependency {dependency}");
            }
            for other in phase.iter().filter(|o| *o != name) {
                assert!(!category.conflicts.contains(other));
            }
        }
    }

    let flat: Vec<String> = plan.phases.concat();
    assert_eq!(flat.len(), plan.execution_order.len());
}

#[test]
fn test_cycle_is_an_error() {
    let mut system = pipeline();
    system.add_category(TestCategory::new("a", CategoryPriority::Medium).with_dependencies(["b"]));
    system.add_category(TestCategory::new("b", CategoryPriority::Medium).with_dependencies(["a"]));

    match system.create_execution_plan(&["a", "unit"], 4, false) {
        Err(OrchestratorError::CircularDependency(members)) => {
            assert!(members.contains(&"a".to_string()));
            assert!(members.contains(&"b".to_string()));
            assert!(!members.contains(&"unit".to_string()));
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn test_skip_dependencies_plans_only_the_selection() {
    let plan = pipeline()
        .create_execution_plan(&["e2e"], 4, true)
        .expect("plan");
    assert_eq!(plan.execution_order, vec!["e2e"]);
    assert!(plan.auto_added_categories().is_empty());
}
