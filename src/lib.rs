//! A fixture-driven test execution engine.
//!
//! The library is organised in a handful of small modules so that users who
//! are new to the codebase can quickly orient themselves.  Each module
//! focuses on a specific concern (the data model, fixture resolution, scope
//! storage, scheduling, execution, …) and exposes a clean, well documented
//! API.
//!
//! The lifecycle of a run:
//!
//! 1. The caller registers fixture definitions in a [`FixtureRegistry`] and
//!    hands a slice of [`TestCase`]s to [`run_units`].
//! 2. The scheduling classifier splits units into concurrent batches (async
//!    bodies sharing a wide loop scope) and isolated units.
//! 3. Each unit's fixtures are resolved through the scope store, memoized
//!    per scope instance, and torn down in reverse acquisition order when
//!    the owning instance ends.

mod capture;
mod error;
mod execution;
mod model;
mod output;
mod registry;
mod resolve;
mod schedule;
mod store;

pub use capture::{CapturedOutput, MemoryCapture, NullCapture, OutputCapture};
pub use error::{FixtureError, TeardownWarning, TestError};
pub use execution::{run_units, run_units_with, Scheduler};
pub use model::{
    value, FixtureArgs, FixtureDef, FixtureFactory, FixtureOutput, FixtureScope, FixtureValue,
    FixtureVisibility, RunConfiguration, RunReport, Teardown, TestBody, TestCase, TestContext,
    TestResult, TestStatus, UnitLocation, CONTEXT_PARAM,
};
pub use output::{
    BatchCompletedEvent, BatchStartedEvent, NullListener, ProgressListener, RecordingListener,
    SuiteCompletedEvent, SuiteStartedEvent, UnitCompletedEvent, UnitStartedEvent,
};
pub use registry::FixtureRegistry;
pub use resolve::FixtureResolver;
pub use schedule::{
    classify, classify_unit, effective_loop_scope, has_async_dependency, required_loop_scope,
    validate_loop_scope, BatchKey, Classification, Placement,
};
pub use store::{ScopeId, ScopeStore};
