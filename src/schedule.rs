//! Scheduling classifier: decides, before execution, whether each unit of
//! work runs alone on a private loop or joins a concurrent batch.
//!
//! The driving rule is loop-scope widening: an async fixture memoized at a
//! wide scope must be created, used, and torn down on a single loop, so any
//! unit that (transitively) touches one is pushed onto the loop owned by
//! that fixture's scope instance. Units landing on the same loop instance
//! form one batch and run concurrently.

use indexmap::IndexMap;

use crate::model::{FixtureScope, TestCase, CONTEXT_PARAM};
use crate::registry::FixtureRegistry;
use crate::store::ScopeId;

/// Identity of one batch: every unit sharing this key shares one loop.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub scope: FixtureScope,
    pub instance: ScopeId,
}

/// Where the classifier placed a unit.
#[derive(Debug, PartialEq, Eq)]
pub enum Placement {
    /// Runs alone; gets a fresh loop if it needs one at all.
    Isolated,
    /// Runs concurrently with every other unit holding the same key.
    Batched(BatchKey),
}

/// Classifier output for a slice of units: indices into the input slice,
/// partitioned by placement with batch membership in input order.
#[derive(Default)]
pub struct Classification {
    pub isolated: Vec<usize>,
    pub batches: IndexMap<BatchKey, Vec<usize>>,
}

/// Widest scope among async fixtures in the unit's transitive fixture
/// closure, or `None` when the closure holds no async fixture.
pub fn required_loop_scope(registry: &FixtureRegistry, unit: &TestCase) -> Option<FixtureScope> {
    let mut widest: Option<FixtureScope> = None;
    let mut visited: Vec<String> = Vec::new();
    for name in root_fixture_names(registry, unit) {
        visit(registry, unit, &name, &mut visited, &mut widest);
    }
    widest
}

/// True when at least one fixture in the unit's closure is async.
pub fn has_async_dependency(registry: &FixtureRegistry, unit: &TestCase) -> bool {
    required_loop_scope(registry, unit).is_some()
}

/// The loop scope a unit actually runs under: an explicit marker override
/// when present, otherwise the widened requirement, otherwise `Function`.
pub fn effective_loop_scope(registry: &FixtureRegistry, unit: &TestCase) -> FixtureScope {
    unit.loop_scope
        .or_else(|| required_loop_scope(registry, unit))
        .unwrap_or(FixtureScope::Function)
}

/// Check an explicit loop-scope marker against the widened requirement.
///
/// Returns a diagnostic naming the offending fixtures when the marker asks
/// for a narrower loop than some async fixture needs.
pub fn validate_loop_scope(registry: &FixtureRegistry, unit: &TestCase) -> Option<String> {
    let declared = unit.loop_scope?;
    let required = required_loop_scope(registry, unit)?;
    if !required.is_wider_than(declared) {
        return None;
    }
    let mut offending: Vec<String> = Vec::new();
    let mut visited: Vec<String> = Vec::new();
    for name in root_fixture_names(registry, unit) {
        collect_wider_async(registry, unit, &name, declared, &mut visited, &mut offending);
    }
    Some(format!(
        "unit '{}' declares {} loop scope but async fixture(s) [{}] require {} scope",
        unit.id,
        declared,
        offending.join(", "),
        required
    ))
}

/// Place one unit. Isolation wins over batching: an explicit isolate
/// marker, a sync body, or a function-width loop all keep the unit alone.
pub fn classify_unit(registry: &FixtureRegistry, unit: &TestCase) -> Placement {
    if unit.isolate || !unit.is_async() {
        return Placement::Isolated;
    }
    let scope = effective_loop_scope(registry, unit);
    if scope == FixtureScope::Function {
        return Placement::Isolated;
    }
    Placement::Batched(BatchKey {
        scope,
        instance: ScopeId::for_unit(scope, unit),
    })
}

/// Classify a slice of units, preserving input order within each batch.
pub fn classify(registry: &FixtureRegistry, units: &[&TestCase]) -> Classification {
    let mut classification = Classification::default();
    for (index, unit) in units.iter().enumerate() {
        match classify_unit(registry, unit) {
            Placement::Isolated => classification.isolated.push(index),
            Placement::Batched(key) => {
                classification.batches.entry(key).or_default().push(index)
            }
        }
    }
    classification
}

fn root_fixture_names(registry: &FixtureRegistry, unit: &TestCase) -> Vec<String> {
    let mut names: Vec<String> = registry
        .autouse_for(&unit.location())
        .into_iter()
        .map(str::to_string)
        .collect();
    for name in unit.extra_fixtures.iter().chain(unit.dependencies.iter()) {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }
    names
}

fn visit(
    registry: &FixtureRegistry,
    unit: &TestCase,
    name: &str,
    visited: &mut Vec<String>,
    widest: &mut Option<FixtureScope>,
) {
    if name == CONTEXT_PARAM
        || unit.params.contains_key(name)
        || visited.iter().any(|v| v == name)
    {
        return;
    }
    visited.push(name.to_string());
    let Some(def) = registry.get_visible(name, &unit.location()) else {
        // Unknown names surface as NotFound during resolution.
        return;
    };
    if def.is_async() && widest.map_or(true, |w| def.scope.is_wider_than(w)) {
        *widest = Some(def.scope);
    }
    for dep in &def.dependencies {
        visit(registry, unit, dep, visited, widest);
    }
}

fn collect_wider_async(
    registry: &FixtureRegistry,
    unit: &TestCase,
    name: &str,
    declared: FixtureScope,
    visited: &mut Vec<String>,
    offending: &mut Vec<String>,
) {
    if name == CONTEXT_PARAM
        || unit.params.contains_key(name)
        || visited.iter().any(|v| v == name)
    {
        return;
    }
    visited.push(name.to_string());
    let Some(def) = registry.get_visible(name, &unit.location()) else {
        return;
    };
    if def.is_async() && def.scope.is_wider_than(declared) {
        offending.push(def.name.clone());
    }
    for dep in &def.dependencies {
        collect_wider_async(registry, unit, dep, declared, visited, offending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TestError;
    use crate::model::{FixtureDef, FixtureFactory, FixtureOutput, TestBody};
    use futures::FutureExt;

    fn async_fixture(name: &str, scope: FixtureScope, deps: &[&str]) -> FixtureDef {
        FixtureDef::new(
            name,
            scope,
            FixtureFactory::asynchronous(|_args| {
                async { Ok(FixtureOutput::of(0u8)) }.boxed_local()
            }),
        )
        .with_dependencies(deps)
    }

    fn sync_fixture(name: &str, scope: FixtureScope, deps: &[&str]) -> FixtureDef {
        FixtureDef::new(name, scope, FixtureFactory::from_value(0u8)).with_dependencies(deps)
    }

    fn async_unit(name: &str, deps: &[&str]) -> TestCase {
        TestCase::new(
            name,
            "tests/test_sched.rs",
            TestBody::asynchronous(|_| async { Ok::<(), TestError>(()) }.boxed_local()),
        )
        .with_dependencies(deps)
    }

    #[test]
    fn widening_picks_the_widest_async_fixture_in_the_closure() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![
            async_fixture("session_conn", FixtureScope::Session, &[]),
            // Sync fixture hiding an async one behind it.
            sync_fixture("wrapper", FixtureScope::Function, &["session_conn"]),
            async_fixture("module_conn", FixtureScope::Module, &[]),
        ]);

        let unit = async_unit("test_wide", &["wrapper", "module_conn"]);
        assert_eq!(
            required_loop_scope(&registry, &unit),
            Some(FixtureScope::Session)
        );
        assert_eq!(
            effective_loop_scope(&registry, &unit),
            FixtureScope::Session
        );
    }

    #[test]
    fn sync_only_closure_defaults_to_function_loop() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![sync_fixture("cfg", FixtureScope::Session, &[])]);

        let unit = async_unit("test_narrow", &["cfg"]);
        assert_eq!(required_loop_scope(&registry, &unit), None);
        assert_eq!(
            effective_loop_scope(&registry, &unit),
            FixtureScope::Function
        );
        assert_eq!(classify_unit(&registry, &unit), Placement::Isolated);
    }

    #[test]
    fn autouse_fixtures_participate_in_widening() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![
            async_fixture("tracer", FixtureScope::Module, &[]).with_autouse()
        ]);

        let unit = async_unit("test_autouse", &[]);
        assert_eq!(
            required_loop_scope(&registry, &unit),
            Some(FixtureScope::Module)
        );
    }

    #[test]
    fn explicit_override_narrower_than_required_is_rejected_with_names() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![async_fixture("broker", FixtureScope::Session, &[])]);

        let unit =
            async_unit("test_override", &["broker"]).with_loop_scope(FixtureScope::Function);
        let diagnostic = validate_loop_scope(&registry, &unit).unwrap();
        assert!(diagnostic.contains("broker"));
        assert!(diagnostic.contains("session"));

        let fine = async_unit("test_fine", &["broker"]).with_loop_scope(FixtureScope::Session);
        assert!(validate_loop_scope(&registry, &fine).is_none());
    }

    #[test]
    fn classification_partitions_by_scope_instance() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![async_fixture("conn", FixtureScope::Module, &[])]);

        let a = async_unit("test_a", &["conn"]);
        let b = async_unit("test_b", &["conn"]);
        let mut other = async_unit("test_c", &["conn"]);
        other.module = "tests/test_other.rs".into();
        other.id = "tests/test_other.rs::test_c".into();
        let lone = async_unit("test_lone", &[]);
        let pinned = async_unit("test_pinned", &["conn"]).isolated();

        let units = [&a, &b, &other, &lone, &pinned];
        let classification = classify(&registry, &units);

        assert_eq!(classification.isolated, vec![3, 4]);
        assert_eq!(classification.batches.len(), 2);
        let first = &classification.batches[&BatchKey {
            scope: FixtureScope::Module,
            instance: ScopeId::Module("tests/test_sched.rs".into()),
        }];
        assert_eq!(*first, vec![0, 1]);
        let second = &classification.batches[&BatchKey {
            scope: FixtureScope::Module,
            instance: ScopeId::Module("tests/test_other.rs".into()),
        }];
        assert_eq!(*second, vec![2]);
    }

    #[test]
    fn sync_bodies_never_batch_even_with_async_fixtures() {
        let mut registry = FixtureRegistry::new();
        registry.register(vec![async_fixture("conn", FixtureScope::Session, &[])]);

        let unit = TestCase::new(
            "test_sync_body",
            "tests/test_sched.rs",
            TestBody::sync(|_| Ok(())),
        )
        .with_dependencies(&["conn"]);
        assert_eq!(classify_unit(&registry, &unit), Placement::Isolated);
    }
}
