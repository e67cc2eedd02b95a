//! The run pipeline: classification, batch execution, scope lifecycle.
//!
//! Units are executed module by module in input order. Within each module
//! (and class) group the scheduling classifier splits units into concurrent
//! batches and isolated stragglers; batches run first, gathered on the loop
//! owned by their scope instance, then the isolated units run one at a
//! time. Scope instances are torn down at their natural boundaries: each
//! unit's function instance right after the unit, class instances after the
//! class group, module instances after the module, and everything still
//! live at run end.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Instant;

use futures::executor::LocalPool;
use futures::future::{join_all, Future, LocalBoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use tracing::{debug, warn};

use crate::capture::{CapturedOutput, NullCapture, OutputCapture};
use crate::error::{panic_message, FixtureError, TestError};
use crate::error::TeardownWarning;
use crate::model::{
    FixtureArgs, FixtureScope, RunConfiguration, RunReport, Teardown, TestBody, TestCase,
    TestResult, TestStatus,
};
use crate::output::{
    current_timestamp, BatchCompletedEvent, BatchStartedEvent, NullListener, ProgressListener,
    SuiteCompletedEvent, SuiteStartedEvent, UnitCompletedEvent, UnitStartedEvent,
};
use crate::registry::FixtureRegistry;
use crate::resolve::FixtureResolver;
use crate::schedule::{self, BatchKey};
use crate::store::{ScopeId, ScopeStore};

/// A single-threaded cooperative loop driving one scope instance's futures.
///
/// Wraps [`LocalPool`] behind interior mutability so batch execution,
/// fixture resolution, and teardown can all share one handle. Nothing here
/// spawns threads; concurrency within a batch is interleaving at await
/// points on this loop.
pub struct Scheduler {
    pool: RefCell<LocalPool>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            pool: RefCell::new(LocalPool::new()),
        }
    }

    /// Drive `fut` to completion on this loop.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.pool.borrow_mut().run_until(fut)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Lazily-created loops, one live instance per wide scope level.
///
/// Function-width requests always get a fresh loop that is dropped with the
/// unit; wider loops live until their scope boundary so that fixtures
/// created on them are torn down on the same loop.
#[derive(Default)]
struct LoopStore {
    session: Option<Rc<Scheduler>>,
    module: Option<Rc<Scheduler>>,
    class: Option<Rc<Scheduler>>,
}

impl LoopStore {
    fn get_or_create(&mut self, scope: FixtureScope) -> Rc<Scheduler> {
        let slot = match scope {
            FixtureScope::Session => &mut self.session,
            FixtureScope::Module => &mut self.module,
            FixtureScope::Class => &mut self.class,
            FixtureScope::Function => return Rc::new(Scheduler::new()),
        };
        slot.get_or_insert_with(|| Rc::new(Scheduler::new())).clone()
    }

    /// Best loop for tearing down an instance at `level`: the instance's
    /// own loop when it exists, else the nearest wider one.
    fn for_teardown(&self, level: FixtureScope) -> Option<Rc<Scheduler>> {
        match level {
            FixtureScope::Session => self.session.clone(),
            FixtureScope::Module => self.module.clone().or_else(|| self.session.clone()),
            FixtureScope::Class => self
                .class
                .clone()
                .or_else(|| self.module.clone())
                .or_else(|| self.session.clone()),
            FixtureScope::Function => None,
        }
    }

    fn drop_class(&mut self) {
        self.class = None;
    }

    fn drop_module(&mut self) {
        self.module = None;
        self.class = None;
    }
}

/// Execute `units` against `registry` with default (silent) progress and
/// capture backends.
pub fn run_units(
    registry: &FixtureRegistry,
    units: &[TestCase],
    config: &RunConfiguration,
) -> RunReport {
    let mut listener = NullListener;
    run_units_with(registry, units, config, &mut listener, &NullCapture)
}

/// Execute `units` against `registry`, reporting progress to `listener`
/// and collecting per-unit output through `capture`.
///
/// Results come back in input order regardless of batch interleaving, one
/// per unit actually reached before any fail-fast stop.
pub fn run_units_with(
    registry: &FixtureRegistry,
    units: &[TestCase],
    config: &RunConfiguration,
    listener: &mut dyn ProgressListener,
    capture: &dyn OutputCapture,
) -> RunReport {
    let started = Instant::now();
    listener.suite_started(SuiteStartedEvent {
        total_tests: units.len(),
        timestamp: current_timestamp(),
    });

    let null_capture = NullCapture;
    let capture: &dyn OutputCapture = if config.capture_output {
        capture
    } else {
        &null_capture
    };

    let mut runner = Runner {
        registry,
        store: ScopeStore::new(),
        loops: LoopStore::default(),
        warnings: Vec::new(),
    };
    let mut slots: Vec<Option<TestResult>> = (0..units.len()).map(|_| None).collect();
    let mut halted = false;

    let mut by_module: IndexMap<&str, Vec<usize>> = IndexMap::new();
    for (index, unit) in units.iter().enumerate() {
        by_module.entry(unit.module.as_str()).or_default().push(index);
    }

    'modules: for (module, module_indices) in &by_module {
        let mut by_class: IndexMap<Option<&str>, Vec<usize>> = IndexMap::new();
        for &index in module_indices {
            by_class
                .entry(units[index].class.as_deref())
                .or_default()
                .push(index);
        }

        for (class, class_indices) in &by_class {
            let refs: Vec<&TestCase> = class_indices.iter().map(|&i| &units[i]).collect();
            let classification = schedule::classify(registry, &refs);

            for (key, members) in &classification.batches {
                let produced = runner.run_batch(&refs, members, key, listener, capture);
                for (local, result) in produced {
                    if config.fail_fast && result.status == TestStatus::Failed {
                        halted = true;
                    }
                    slots[class_indices[local]] = Some(result);
                }
                if halted {
                    break 'modules;
                }
            }

            for &local in &classification.isolated {
                let result = runner.run_isolated(refs[local], listener, capture);
                if config.fail_fast && result.status == TestStatus::Failed {
                    halted = true;
                }
                slots[class_indices[local]] = Some(result);
                if halted {
                    break 'modules;
                }
            }

            if let Some(class) = class {
                runner.teardown_instance(&ScopeId::Class {
                    module: module.to_string(),
                    class: class.to_string(),
                });
                runner.loops.drop_class();
            }
        }

        runner.teardown_instance(&ScopeId::Module(module.to_string()));
        runner.loops.drop_module();
    }

    // Session teardown, plus anything a fail-fast stop left owing.
    runner.finalize();

    let results: Vec<TestResult> = slots.into_iter().flatten().collect();
    let duration = started.elapsed().as_secs_f64();
    let report = RunReport::new(results, duration, runner.warnings);
    listener.suite_completed(SuiteCompletedEvent {
        total: report.total,
        passed: report.passed,
        failed: report.failed,
        skipped: report.skipped,
        duration,
        timestamp: current_timestamp(),
    });
    report
}

struct Runner<'a> {
    registry: &'a FixtureRegistry,
    store: ScopeStore,
    loops: LoopStore,
    warnings: Vec<TeardownWarning>,
}

impl Runner<'_> {
    /// Run one batch: sequential preparation (skip checks, loop-scope
    /// validation, fixture resolution), then a single gather of every
    /// prepared body on the shared loop. A unit failing preparation gets a
    /// terminal result without disturbing its batch mates.
    fn run_batch(
        &mut self,
        units: &[&TestCase],
        members: &[usize],
        key: &BatchKey,
        listener: &mut dyn ProgressListener,
        capture: &dyn OutputCapture,
    ) -> Vec<(usize, TestResult)> {
        let scheduler = self.loops.get_or_create(key.scope);
        let batch_started = Instant::now();
        listener.batch_started(BatchStartedEvent {
            scope: key.scope,
            instance: key.instance.to_string(),
            size: members.len(),
            timestamp: current_timestamp(),
        });
        debug!(scope = %key.scope, instance = %key.instance, size = members.len(), "starting batch");

        let mut results: Vec<(usize, TestResult)> = Vec::new();
        let mut gathered: Vec<usize> = Vec::new();
        let mut wrappers: Vec<LocalBoxFuture<'_, TestResult>> = Vec::new();

        for &local in members {
            let unit = units[local];
            listener.unit_started(UnitStartedEvent {
                test_id: unit.id.clone(),
                timestamp: current_timestamp(),
            });

            if let Some(reason) = &unit.skip_reason {
                let result = TestResult::skipped(unit, 0.0, reason.clone());
                emit_completed(listener, &result);
                results.push((local, result));
                continue;
            }
            if let Some(diagnostic) = schedule::validate_loop_scope(self.registry, unit) {
                let result = TestResult::failed(unit, 0.0, diagnostic, None, None);
                emit_completed(listener, &result);
                results.push((local, result));
                continue;
            }

            let mut resolver = FixtureResolver::new(self.registry, &mut self.store, unit);
            let resolved = scheduler.block_on(resolver.resolve_all_async());
            match resolved {
                Ok(args) => match &unit.body {
                    TestBody::Async(body) => {
                        gathered.push(local);
                        wrappers.push(unit_future(unit, body(args), capture));
                    }
                    TestBody::Sync(_) => {
                        // The classifier keeps sync bodies out of batches.
                        let result = TestResult::failed(
                            unit,
                            0.0,
                            "synchronous body cannot join a concurrent batch".into(),
                            None,
                            None,
                        );
                        emit_completed(listener, &result);
                        results.push((local, result));
                    }
                },
                Err(err) => {
                    let result = fixture_error_result(unit, err);
                    emit_completed(listener, &result);
                    results.push((local, result));
                }
            }
        }

        // One cooperative gather; outcomes come back in submission order.
        let outcomes = scheduler.block_on(join_all(wrappers));
        for (local, result) in gathered.into_iter().zip(outcomes) {
            emit_completed(listener, &result);
            results.push((local, result));
        }

        for &local in members {
            self.teardown_on(&ScopeId::Function(units[local].id.clone()), Some(scheduler.as_ref()));
        }

        listener.batch_completed(BatchCompletedEvent {
            scope: key.scope,
            instance: key.instance.to_string(),
            size: members.len(),
            duration: batch_started.elapsed().as_secs_f64(),
            timestamp: current_timestamp(),
        });
        results
    }

    /// Run one unit alone: skip check, loop-scope validation, resolution
    /// on a private (or inherited wide) loop, body, function teardown.
    fn run_isolated(
        &mut self,
        unit: &TestCase,
        listener: &mut dyn ProgressListener,
        capture: &dyn OutputCapture,
    ) -> TestResult {
        listener.unit_started(UnitStartedEvent {
            test_id: unit.id.clone(),
            timestamp: current_timestamp(),
        });

        let result = self.run_isolated_inner(unit, capture);
        emit_completed(listener, &result);
        result
    }

    fn run_isolated_inner(&mut self, unit: &TestCase, capture: &dyn OutputCapture) -> TestResult {
        if let Some(reason) = &unit.skip_reason {
            return TestResult::skipped(unit, 0.0, reason.clone());
        }
        if let Some(diagnostic) = schedule::validate_loop_scope(self.registry, unit) {
            return TestResult::failed(unit, 0.0, diagnostic, None, None);
        }

        let needs_loop = unit.is_async() || schedule::has_async_dependency(self.registry, unit);
        if !needs_loop {
            let mut resolver = FixtureResolver::new(self.registry, &mut self.store, unit);
            let result = match resolver.resolve_all_sync() {
                Ok(args) => run_sync_body(unit, args, capture),
                Err(err) => fixture_error_result(unit, err),
            };
            self.teardown_on(&ScopeId::Function(unit.id.clone()), None);
            return result;
        }

        let scope = schedule::effective_loop_scope(self.registry, unit);
        let scheduler = self.loops.get_or_create(scope);
        let mut resolver = FixtureResolver::new(self.registry, &mut self.store, unit);
        let resolved = scheduler.block_on(resolver.resolve_all_async());
        let result = match resolved {
            Ok(args) => match &unit.body {
                TestBody::Async(body) => scheduler.block_on(unit_future(unit, body(args), capture)),
                TestBody::Sync(_) => run_sync_body(unit, args, capture),
            },
            Err(err) => fixture_error_result(unit, err),
        };
        self.teardown_on(&ScopeId::Function(unit.id.clone()), Some(scheduler.as_ref()));
        result
    }

    /// Tear one instance down on the loop owed to its level.
    fn teardown_instance(&mut self, scope: &ScopeId) {
        let scheduler = self.loops.for_teardown(scope.level());
        self.teardown_on(scope, scheduler.as_deref());
    }

    fn teardown_on(&mut self, scope: &ScopeId, scheduler: Option<&Scheduler>) {
        let warnings = self
            .store
            .teardown(scope, &mut |teardown| run_teardown(teardown, scheduler));
        for warning in &warnings {
            warn!(%warning, "fixture teardown failed");
        }
        self.warnings.extend(warnings);
    }

    /// Tear down every instance still holding state, innermost first.
    fn finalize(&mut self) {
        for scope in self.store.live_instances() {
            self.teardown_instance(&scope);
        }
        self.loops = LoopStore::default();
    }
}

fn emit_completed(listener: &mut dyn ProgressListener, result: &TestResult) {
    listener.unit_completed(UnitCompletedEvent {
        test_id: result.id.clone(),
        status: result.status,
        duration: result.duration,
        timestamp: current_timestamp(),
    });
}

/// Wrap a prepared async body with timing, capture, and panic isolation.
/// The wrapper always yields a terminal result; a panicking unit never
/// takes its batch mates down with it.
fn unit_future<'a>(
    unit: &'a TestCase,
    body: LocalBoxFuture<'static, Result<(), TestError>>,
    capture: &'a dyn OutputCapture,
) -> LocalBoxFuture<'a, TestResult> {
    async move {
        capture.begin(&unit.id);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        let duration = started.elapsed().as_secs_f64();
        let (stdout, stderr) = split_output(capture.end(&unit.id));
        match outcome {
            Ok(Ok(())) => TestResult::passed(unit, duration, stdout, stderr),
            Ok(Err(TestError::Skipped(reason))) => TestResult::skipped(unit, duration, reason),
            Ok(Err(TestError::Failed(message))) => {
                TestResult::failed(unit, duration, message, stdout, stderr)
            }
            Err(payload) => {
                TestResult::failed(unit, duration, panic_message(payload), stdout, stderr)
            }
        }
    }
    .boxed_local()
}

fn run_sync_body(unit: &TestCase, args: FixtureArgs, capture: &dyn OutputCapture) -> TestResult {
    let TestBody::Sync(body) = &unit.body else {
        return TestResult::failed(
            unit,
            0.0,
            "async body reached the synchronous execution path".into(),
            None,
            None,
        );
    };
    capture.begin(&unit.id);
    let started = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(|| body(args)));
    let duration = started.elapsed().as_secs_f64();
    let (stdout, stderr) = split_output(capture.end(&unit.id));
    match outcome {
        Ok(Ok(())) => TestResult::passed(unit, duration, stdout, stderr),
        Ok(Err(TestError::Skipped(reason))) => TestResult::skipped(unit, duration, reason),
        Ok(Err(TestError::Failed(message))) => {
            TestResult::failed(unit, duration, message, stdout, stderr)
        }
        Err(payload) => TestResult::failed(unit, duration, panic_message(payload), stdout, stderr),
    }
}

/// Map a resolution error onto a terminal result: a fixture-requested skip
/// becomes a skip, everything else fails the unit before its body runs.
fn fixture_error_result(unit: &TestCase, err: FixtureError) -> TestResult {
    match err {
        FixtureError::Skipped(reason) => TestResult::skipped(unit, 0.0, reason),
        other => TestResult::failed(unit, 0.0, other.to_string(), None, None),
    }
}

fn split_output(collected: CapturedOutput) -> (Option<String>, Option<String>) {
    let stdout = (!collected.stdout.is_empty()).then_some(collected.stdout);
    let stderr = (!collected.stderr.is_empty()).then_some(collected.stderr);
    (stdout, stderr)
}

/// Drive one teardown continuation, catching panics so the remaining
/// continuations still run.
fn run_teardown(teardown: Teardown, scheduler: Option<&Scheduler>) -> Result<(), String> {
    match teardown {
        Teardown::Sync(f) => catch_unwind(AssertUnwindSafe(f)).map_err(panic_message),
        Teardown::Async(fut) => catch_unwind(AssertUnwindSafe(|| match scheduler {
            Some(scheduler) => scheduler.block_on(fut),
            None => futures::executor::block_on(fut),
        }))
        .map_err(panic_message),
    }
}
