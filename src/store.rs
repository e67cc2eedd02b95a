//! Scope store: memoized fixture values and teardown ordering per scope
//! instance.
//!
//! A given (fixture key, scope instance) pair is resolved at most once;
//! later requests get the memoized value back. This is the core
//! correctness guarantee that makes session/module/class fixtures execute
//! once per scope lifetime rather than once per test.

use indexmap::IndexMap;

use crate::error::TeardownWarning;
use crate::model::{FixtureScope, FixtureValue, Teardown, TestCase};

/// One concrete lifetime bucket owning materialized fixture values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScopeId {
    Session,
    Module(String),
    Class { module: String, class: String },
    Function(String),
}

impl ScopeId {
    /// The scope instance a fixture of `scope` binds to when resolved for
    /// `unit`. A class-scoped fixture requested by a classless unit falls
    /// back to the unit's function instance, so nothing leaks across
    /// unrelated plain tests.
    pub fn for_unit(scope: FixtureScope, unit: &TestCase) -> ScopeId {
        match scope {
            FixtureScope::Session => ScopeId::Session,
            FixtureScope::Module => ScopeId::Module(unit.module.clone()),
            FixtureScope::Class => match &unit.class {
                Some(class) => ScopeId::Class {
                    module: unit.module.clone(),
                    class: class.clone(),
                },
                None => ScopeId::Function(unit.id.clone()),
            },
            FixtureScope::Function => ScopeId::Function(unit.id.clone()),
        }
    }

    pub fn level(&self) -> FixtureScope {
        match self {
            ScopeId::Session => FixtureScope::Session,
            ScopeId::Module(_) => FixtureScope::Module,
            ScopeId::Class { .. } => FixtureScope::Class,
            ScopeId::Function(_) => FixtureScope::Function,
        }
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScopeId::Session => write!(f, "session scope"),
            ScopeId::Module(module) => write!(f, "module scope '{}'", module),
            ScopeId::Class { module, class } => {
                write!(f, "class scope '{}::{}'", module, class)
            }
            ScopeId::Function(id) => write!(f, "function scope '{}'", id),
        }
    }
}

#[derive(Default)]
struct ScopeState {
    values: IndexMap<String, FixtureValue>,
    /// (fixture name, continuation) in acquisition order.
    teardowns: Vec<(String, Teardown)>,
}

/// Memoized fixture values keyed by (key, scope instance), with per-instance
/// teardown stacks. Created at run start, discarded at run end.
#[derive(Default)]
pub struct ScopeStore {
    instances: IndexMap<ScopeId, ScopeState>,
}

impl ScopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look `key` up in a single instance.
    pub fn get(&self, scope: &ScopeId, key: &str) -> Option<FixtureValue> {
        self.instances
            .get(scope)
            .and_then(|state| state.values.get(key).cloned())
    }

    /// Look `key` up across a unit's instance chain (function outwards).
    pub fn lookup_chain(&self, chain: &[ScopeId], key: &str) -> Option<FixtureValue> {
        chain.iter().find_map(|scope| self.get(scope, key))
    }

    pub fn insert(&mut self, scope: ScopeId, key: String, value: FixtureValue) {
        self.instances
            .entry(scope)
            .or_default()
            .values
            .insert(key, value);
    }

    /// Register a teardown continuation against `scope`; continuations run
    /// in reverse registration order at teardown.
    pub fn push_teardown(&mut self, scope: ScopeId, fixture: String, teardown: Teardown) {
        self.instances
            .entry(scope)
            .or_default()
            .teardowns
            .push((fixture, teardown));
    }

    /// Tear an instance down: run its continuations last-acquired-first via
    /// `drive`, then discard its stored values. Failures become warnings;
    /// they never interrupt the remaining continuations.
    pub fn teardown(
        &mut self,
        scope: &ScopeId,
        drive: &mut dyn FnMut(Teardown) -> Result<(), String>,
    ) -> Vec<TeardownWarning> {
        let mut warnings = Vec::new();
        let Some(mut state) = self.instances.shift_remove(scope) else {
            return warnings;
        };
        for (fixture, teardown) in state.teardowns.drain(..).rev() {
            if let Err(message) = drive(teardown) {
                warnings.push(TeardownWarning {
                    scope: scope.to_string(),
                    fixture,
                    message,
                });
            }
        }
        warnings
    }

    /// Scope instances that still hold state, innermost first. Used at run
    /// end to make sure nothing is left owing a teardown.
    pub fn live_instances(&self) -> Vec<ScopeId> {
        let mut live: Vec<ScopeId> = self.instances.keys().cloned().collect();
        live.sort_by_key(|scope| scope.level());
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{value, TestBody};
    use std::sync::{Arc, Mutex};

    fn unit(module: &str, class: Option<&str>, name: &str) -> TestCase {
        let case = TestCase::new(name, module, TestBody::sync(|_| Ok(())));
        match class {
            Some(c) => case.in_class(c),
            None => case,
        }
    }

    fn run_inline(teardown: Teardown) -> Result<(), String> {
        match teardown {
            Teardown::Sync(f) => {
                f();
                Ok(())
            }
            Teardown::Async(fut) => {
                futures::executor::block_on(fut);
                Ok(())
            }
        }
    }

    #[test]
    fn memoizes_per_scope_instance() {
        let mut store = ScopeStore::new();
        let scope = ScopeId::Module("tests/test_a.rs".into());
        store.insert(scope.clone(), "db".into(), value(1u32));
        assert_eq!(
            *store.get(&scope, "db").unwrap().downcast::<u32>().unwrap(),
            1
        );
        assert!(store
            .get(&ScopeId::Module("tests/test_b.rs".into()), "db")
            .is_none());
    }

    #[test]
    fn chain_lookup_checks_function_scope_first() {
        let mut store = ScopeStore::new();
        let case = unit("tests/test_a.rs", None, "test_x");
        let function = ScopeId::for_unit(FixtureScope::Function, &case);
        let module = ScopeId::for_unit(FixtureScope::Module, &case);
        store.insert(module.clone(), "cfg".into(), value("module".to_string()));
        store.insert(function.clone(), "cfg".into(), value("function".to_string()));

        let chain = vec![function, module, ScopeId::Session];
        let found = store.lookup_chain(&chain, "cfg").unwrap();
        assert_eq!(*found.downcast::<String>().unwrap(), "function");
    }

    #[test]
    fn teardown_runs_in_reverse_acquisition_order() {
        let mut store = ScopeStore::new();
        let scope = ScopeId::Session;
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = log.clone();
            store.push_teardown(
                scope.clone(),
                name.to_string(),
                Teardown::sync(move || log.lock().unwrap().push(name)),
            );
        }
        let warnings = store.teardown(&scope, &mut run_inline);
        assert!(warnings.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["c", "b", "a"]);
        // The instance is gone afterwards.
        assert!(store.get(&scope, "a").is_none());
    }

    #[test]
    fn teardown_failure_becomes_a_warning_and_does_not_stop_the_rest() {
        let mut store = ScopeStore::new();
        let scope = ScopeId::Module("m.rs".into());
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let log = log.clone();
            store.push_teardown(
                scope.clone(),
                "quiet".into(),
                Teardown::sync(move || log.lock().unwrap().push("quiet")),
            );
        }
        store.push_teardown(
            scope.clone(),
            "noisy".into(),
            Teardown::sync(|| {}),
        );

        let mut drive = |teardown: Teardown| match teardown {
            // Simulate the noisy teardown failing; "noisy" runs first (LIFO).
            Teardown::Sync(f) => {
                f();
                if log.lock().unwrap().is_empty() {
                    Err("boom".to_string())
                } else {
                    Ok(())
                }
            }
            Teardown::Async(_) => Ok(()),
        };
        let warnings = store.teardown(&scope, &mut drive);
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].fixture, "noisy");
        assert_eq!(*log.lock().unwrap(), vec!["quiet"]);
    }

    #[test]
    fn class_scope_falls_back_to_function_for_classless_units() {
        let classless = unit("tests/test_a.rs", None, "test_plain");
        let scoped = ScopeId::for_unit(FixtureScope::Class, &classless);
        assert_eq!(scoped, ScopeId::Function(classless.id.clone()));

        let in_class = unit("tests/test_a.rs", Some("TestX"), "test_method");
        let scoped = ScopeId::for_unit(FixtureScope::Class, &in_class);
        assert_eq!(
            scoped,
            ScopeId::Class {
                module: "tests/test_a.rs".into(),
                class: "TestX".into()
            }
        );
    }
}
