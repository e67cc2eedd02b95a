//! Core data model: fixture definitions, units of work, and run reports.
//!
//! Fixture values are reference-counted `Any` objects so that a single
//! materialized value can be handed to every unit sharing its scope
//! instance. Mutation happens through interior mutability supplied by the
//! fixture author (`Mutex<T>` inside the value); units sharing an instance
//! never run in parallel, so this is shared state by design, not a race.

use std::any::Any;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{FixtureError, TeardownWarning, TestError};

/// Reserved dependency name resolved to a [`TestContext`] instead of a
/// registered fixture.
pub const CONTEXT_PARAM: &str = "context";

/// A materialized fixture value, shared by reference across all units of
/// the owning scope instance.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// Wrap a plain value as a [`FixtureValue`].
pub fn value<T: Any + Send + Sync>(v: T) -> FixtureValue {
    Arc::new(v)
}

/// Lifetime bucket controlling how long a resolved fixture is memoized.
///
/// The derived ordering makes `Session` the widest scope, which is what the
/// scope-dependency and loop-widening rules compare against.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum FixtureScope {
    #[default]
    Function,
    Class,
    Module,
    Session,
}

impl FixtureScope {
    pub fn as_str(self) -> &'static str {
        match self {
            FixtureScope::Function => "function",
            FixtureScope::Class => "class",
            FixtureScope::Module => "module",
            FixtureScope::Session => "session",
        }
    }

    /// True when `self` outlives `other`.
    pub fn is_wider_than(self, other: FixtureScope) -> bool {
        self > other
    }
}

impl std::fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The flat name→value argument set handed to fixture factories and test
/// bodies after resolution.
#[derive(Default, Clone)]
pub struct FixtureArgs {
    values: IndexMap<String, FixtureValue>,
}

impl std::fmt::Debug for FixtureArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

impl FixtureArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FixtureValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&FixtureValue> {
        self.values.get(name)
    }

    /// Fetch an argument and downcast it to a concrete type.
    pub fn typed<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, FixtureError> {
        let raw = self
            .get(name)
            .ok_or_else(|| FixtureError::NotFound(name.to_string()))?;
        raw.clone()
            .downcast::<T>()
            .map_err(|_| FixtureError::WrongType {
                name: name.to_string(),
            })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The deferred cleanup half of a two-phase fixture.
///
/// Registered during setup, invoked exactly once during the owning scope
/// instance's teardown, in strict reverse order of acquisition.
pub enum Teardown {
    Sync(Box<dyn FnOnce()>),
    Async(LocalBoxFuture<'static, ()>),
}

impl Teardown {
    pub fn sync<F: FnOnce() + 'static>(f: F) -> Self {
        Teardown::Sync(Box::new(f))
    }

    pub fn asynchronous(fut: LocalBoxFuture<'static, ()>) -> Self {
        Teardown::Async(fut)
    }
}

/// What a fixture factory produces: the value plus an optional teardown
/// continuation.
pub struct FixtureOutput {
    pub value: FixtureValue,
    pub teardown: Option<Teardown>,
}

impl FixtureOutput {
    /// A plain value with no teardown.
    pub fn of<T: Any + Send + Sync>(v: T) -> Self {
        Self {
            value: Arc::new(v),
            teardown: None,
        }
    }

    /// Reuse an already-shared value.
    pub fn shared(value: FixtureValue) -> Self {
        Self {
            value,
            teardown: None,
        }
    }

    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = Some(teardown);
        self
    }
}

/// The callable side of a fixture definition.
pub enum FixtureFactory {
    Sync(Box<dyn Fn(FixtureArgs) -> Result<FixtureOutput, FixtureError>>),
    Async(Box<dyn Fn(FixtureArgs) -> LocalBoxFuture<'static, Result<FixtureOutput, FixtureError>>>),
}

impl FixtureFactory {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> Result<FixtureOutput, FixtureError> + 'static,
    {
        FixtureFactory::Sync(Box::new(f))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> LocalBoxFuture<'static, Result<FixtureOutput, FixtureError>> + 'static,
    {
        FixtureFactory::Async(Box::new(f))
    }

    /// A factory that clones a fixed value on every invocation.
    pub fn from_value<T: Any + Send + Sync + Clone>(v: T) -> Self {
        FixtureFactory::sync(move |_args| Ok(FixtureOutput::of(v.clone())))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, FixtureFactory::Async(_))
    }
}

/// Where a fixture definition is visible from, used for name shadowing.
///
/// A definition closer to the requesting unit overrides one defined at an
/// ancestor level, matched by name only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FixtureVisibility {
    /// Shared configuration scope rooted at a directory; the empty string
    /// is the repository root and is visible everywhere.
    Directory(String),
    /// Defined inside one test module.
    Module(String),
    /// Defined inside one class of one test module.
    Class { module: String, class: String },
}

impl Default for FixtureVisibility {
    fn default() -> Self {
        FixtureVisibility::Directory(String::new())
    }
}

impl FixtureVisibility {
    /// Shadowing rank of this definition for a unit at `at`, or `None` when
    /// the definition is not visible from there. Higher wins.
    pub fn specificity(&self, at: &UnitLocation<'_>) -> Option<u32> {
        match self {
            FixtureVisibility::Class { module, class } => {
                if module == at.module && Some(class.as_str()) == at.class {
                    Some(3000)
                } else {
                    None
                }
            }
            FixtureVisibility::Module(module) => {
                if module == at.module {
                    Some(2000)
                } else {
                    None
                }
            }
            FixtureVisibility::Directory(dir) => {
                if dir.is_empty() {
                    Some(0)
                } else if at.module.starts_with(&format!("{}/", dir)) {
                    Some(dir.split('/').count() as u32)
                } else {
                    None
                }
            }
        }
    }
}

/// A named, scoped, possibly parametrized value provider.
///
/// The dependency list is fixed at registration time; resolution never
/// inspects the callable.
pub struct FixtureDef {
    pub name: String,
    pub scope: FixtureScope,
    pub dependencies: Vec<String>,
    pub autouse: bool,
    pub factory: FixtureFactory,
    /// Parametrization cases; each case gets its own memoization key.
    pub params: Option<Vec<FixtureValue>>,
    pub visibility: FixtureVisibility,
}

impl FixtureDef {
    pub fn new(name: impl Into<String>, scope: FixtureScope, factory: FixtureFactory) -> Self {
        Self {
            name: name.into(),
            scope,
            dependencies: Vec::new(),
            autouse: false,
            factory,
            params: None,
            visibility: FixtureVisibility::default(),
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_autouse(mut self) -> Self {
        self.autouse = true;
        self
    }

    pub fn with_params(mut self, params: Vec<FixtureValue>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn visible_in(mut self, visibility: FixtureVisibility) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn is_async(&self) -> bool {
        self.factory.is_async()
    }
}

/// The body of a unit of work.
pub enum TestBody {
    Sync(Box<dyn Fn(FixtureArgs) -> Result<(), TestError>>),
    Async(Box<dyn Fn(FixtureArgs) -> LocalBoxFuture<'static, Result<(), TestError>>>),
}

impl TestBody {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> Result<(), TestError> + 'static,
    {
        TestBody::Sync(Box::new(f))
    }

    pub fn asynchronous<F>(f: F) -> Self
    where
        F: Fn(FixtureArgs) -> LocalBoxFuture<'static, Result<(), TestError>> + 'static,
    {
        TestBody::Async(Box::new(f))
    }
}

/// One schedulable test invocation bound to a specific argument set.
pub struct TestCase {
    /// Unique identifier, e.g. `tests/test_api.rs::test_login[case2]`.
    pub id: String,
    pub name: String,
    pub module: String,
    pub class: Option<String>,
    /// Fixture names passed as call arguments, in declaration order.
    pub dependencies: Vec<String>,
    /// Fixture names resolved for their side effects but not passed.
    pub extra_fixtures: Vec<String>,
    /// Direct parametrization values, consulted before the registry.
    pub params: IndexMap<String, FixtureValue>,
    /// Selected case index per parametrized fixture.
    pub fixture_param_indices: IndexMap<String, usize>,
    /// Statically-known skip; the body never runs.
    pub skip_reason: Option<String>,
    /// Explicit loop-scope override from a marker.
    pub loop_scope: Option<FixtureScope>,
    /// Explicit isolation override: never batched.
    pub isolate: bool,
    pub body: TestBody,
}

impl TestCase {
    pub fn new(name: impl Into<String>, module: impl Into<String>, body: TestBody) -> Self {
        let name = name.into();
        let module = module.into();
        let id = format!("{}::{}", module, name);
        Self {
            id,
            name,
            module,
            class: None,
            dependencies: Vec::new(),
            extra_fixtures: Vec::new(),
            params: IndexMap::new(),
            fixture_param_indices: IndexMap::new(),
            skip_reason: None,
            loop_scope: None,
            isolate: false,
            body,
        }
    }

    pub fn in_class(mut self, class: impl Into<String>) -> Self {
        let class = class.into();
        self.id = format!("{}::{}::{}", self.module, class, self.name);
        self.class = Some(class);
        self
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_extra_fixtures(mut self, names: &[&str]) -> Self {
        self.extra_fixtures = names.iter().map(|n| n.to_string()).collect();
        self
    }

    /// Bind a direct parametrization value, suffixing the identifier with
    /// the case id so expanded cases stay distinguishable.
    pub fn with_param(
        mut self,
        case_id: &str,
        name: impl Into<String>,
        value: FixtureValue,
    ) -> Self {
        if !case_id.is_empty() && !self.id.ends_with(']') {
            self.id = format!("{}[{}]", self.id, case_id);
            self.name = format!("{}[{}]", self.name, case_id);
        }
        self.params.insert(name.into(), value);
        self
    }

    /// Select which case of a parametrized fixture this unit uses.
    pub fn with_fixture_case(mut self, fixture: impl Into<String>, index: usize) -> Self {
        self.fixture_param_indices.insert(fixture.into(), index);
        self
    }

    pub fn skipped(mut self, reason: impl Into<String>) -> Self {
        self.skip_reason = Some(reason.into());
        self
    }

    pub fn with_loop_scope(mut self, scope: FixtureScope) -> Self {
        self.loop_scope = Some(scope);
        self
    }

    pub fn isolated(mut self) -> Self {
        self.isolate = true;
        self
    }

    pub fn is_async(&self) -> bool {
        matches!(self.body, TestBody::Async(_))
    }

    pub fn location(&self) -> UnitLocation<'_> {
        UnitLocation {
            module: &self.module,
            class: self.class.as_deref(),
        }
    }
}

/// Where a unit lives, for visibility and autouse decisions.
#[derive(Clone, Copy, Debug)]
pub struct UnitLocation<'a> {
    pub module: &'a str,
    pub class: Option<&'a str>,
}

/// The reserved `context` dependency: per-resolution metadata handed to
/// fixtures and bodies that declare it.
pub struct TestContext {
    pub unit_id: String,
    /// Current case value when resolving a parametrized fixture.
    pub param: Option<FixtureValue>,
}

impl TestContext {
    pub fn param_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.param.clone().and_then(|p| p.downcast::<T>().ok())
    }
}

/// Terminal status of a unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

/// The outcome of one unit of work. Produced exactly once, immutable.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub name: String,
    pub module: String,
    pub status: TestStatus,
    pub duration: f64,
    pub message: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

impl TestResult {
    pub fn passed(
        case: &TestCase,
        duration: f64,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        Self {
            id: case.id.clone(),
            name: case.name.clone(),
            module: case.module.clone(),
            status: TestStatus::Passed,
            duration,
            message: None,
            stdout,
            stderr,
        }
    }

    pub fn failed(
        case: &TestCase,
        duration: f64,
        message: String,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> Self {
        Self {
            id: case.id.clone(),
            name: case.name.clone(),
            module: case.module.clone(),
            status: TestStatus::Failed,
            duration,
            message: Some(message),
            stdout,
            stderr,
        }
    }

    pub fn skipped(case: &TestCase, duration: f64, reason: String) -> Self {
        Self {
            id: case.id.clone(),
            name: case.name.clone(),
            module: case.module.clone(),
            status: TestStatus::Skipped,
            duration,
            message: Some(reason),
            stdout: None,
            stderr: None,
        }
    }
}

/// High-level summary of a run, one result per executed unit in discovery
/// order.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunReport {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: f64,
    pub results: Vec<TestResult>,
    /// Non-fatal teardown failures; never flip a primary outcome.
    pub warnings: Vec<TeardownWarning>,
}

impl RunReport {
    pub fn new(results: Vec<TestResult>, duration: f64, warnings: Vec<TeardownWarning>) -> Self {
        let passed = results
            .iter()
            .filter(|r| r.status == TestStatus::Passed)
            .count();
        let failed = results
            .iter()
            .filter(|r| r.status == TestStatus::Failed)
            .count();
        let skipped = results
            .iter()
            .filter(|r| r.status == TestStatus::Skipped)
            .count();
        Self {
            total: results.len(),
            passed,
            failed,
            skipped,
            duration,
            results,
            warnings,
        }
    }

    /// Serialize the report for external consumers (JSON export, IDEs).
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Run-wide options supplied by the caller.
#[derive(Clone, Debug)]
pub struct RunConfiguration {
    /// Start/stop output capture around each unit.
    pub capture_output: bool,
    /// Stop after the first failure; owed teardowns still run.
    pub fail_fast: bool,
}

impl RunConfiguration {
    pub fn new(capture_output: bool, fail_fast: bool) -> Self {
        Self {
            capture_output,
            fail_fast,
        }
    }
}

impl Default for RunConfiguration {
    fn default() -> Self {
        Self {
            capture_output: true,
            fail_fast: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_ordering_makes_session_widest() {
        assert!(FixtureScope::Session.is_wider_than(FixtureScope::Module));
        assert!(FixtureScope::Module.is_wider_than(FixtureScope::Class));
        assert!(FixtureScope::Class.is_wider_than(FixtureScope::Function));
        assert!(!FixtureScope::Function.is_wider_than(FixtureScope::Function));
    }

    #[test]
    fn args_downcast_to_concrete_types() {
        let mut args = FixtureArgs::new();
        args.insert("port", value(8080u16));
        assert_eq!(*args.typed::<u16>("port").unwrap(), 8080);
        assert!(matches!(
            args.typed::<String>("port"),
            Err(FixtureError::WrongType { .. })
        ));
        assert!(matches!(
            args.typed::<u16>("missing"),
            Err(FixtureError::NotFound(_))
        ));
    }

    #[test]
    fn visibility_specificity_prefers_nearer_definitions() {
        let at = UnitLocation {
            module: "tests/api/test_login.rs",
            class: Some("TestLogin"),
        };
        let class = FixtureVisibility::Class {
            module: "tests/api/test_login.rs".into(),
            class: "TestLogin".into(),
        };
        let module = FixtureVisibility::Module("tests/api/test_login.rs".into());
        let near_dir = FixtureVisibility::Directory("tests/api".into());
        let root = FixtureVisibility::Directory(String::new());

        let rank = |v: &FixtureVisibility| v.specificity(&at).unwrap();
        assert!(rank(&class) > rank(&module));
        assert!(rank(&module) > rank(&near_dir));
        assert!(rank(&near_dir) > rank(&root));

        let other = FixtureVisibility::Module("tests/api/test_other.rs".into());
        assert!(other.specificity(&at).is_none());
        let unrelated = FixtureVisibility::Directory("tests/db".into());
        assert!(unrelated.specificity(&at).is_none());
    }

    #[test]
    fn parametrized_case_ids_suffix_the_identifier() {
        let case = TestCase::new(
            "test_power",
            "tests/test_math.rs",
            TestBody::sync(|_| Ok(())),
        )
        .with_param("double", "factor", value(2i64));
        assert_eq!(case.id, "tests/test_math.rs::test_power[double]");
        assert_eq!(case.name, "test_power[double]");
    }

    #[test]
    fn report_counts_derive_from_results() {
        let case = TestCase::new("t", "m.rs", TestBody::sync(|_| Ok(())));
        let results = vec![
            TestResult::passed(&case, 0.1, None, None),
            TestResult::failed(&case, 0.2, "boom".into(), None, None),
            TestResult::skipped(&case, 0.0, "later".into()),
        ];
        let report = RunReport::new(results, 0.3, Vec::new());
        assert_eq!(report.total, 3);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 1);
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"failed\""));
    }
}
