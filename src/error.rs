//! Error taxonomy for fixture resolution and test execution.
//!
//! Every error defined here is caught at the unit-of-work boundary and
//! converted into a terminal [`crate::model::TestResult`]; nothing escapes
//! the run entry point.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::FixtureScope;

/// Errors raised while resolving a unit's fixture dependency graph.
#[derive(Debug, Error)]
pub enum FixtureError {
    /// The requested fixture name has no visible definition.
    #[error("fixture '{0}' not found")]
    NotFound(String),

    /// The fixture graph contains a cycle. Detected before any fixture in
    /// the cycle is invoked.
    #[error("cyclic fixture dependency: {cycle}")]
    Cycle { cycle: String },

    /// A fixture's setup code failed.
    #[error("fixture '{name}' failed during setup: {message}")]
    Setup { name: String, message: String },

    /// A fixture requested that the depending unit be skipped.
    #[error("skipped: {0}")]
    Skipped(String),

    /// A fixture depends on another fixture with a narrower scope.
    #[error(
        "fixture '{fixture}' ({fixture_scope} scope) cannot depend on \
         '{dependency}' ({dependency_scope} scope); a fixture may only \
         depend on fixtures with equal or wider scope"
    )]
    ScopeMismatch {
        fixture: String,
        fixture_scope: FixtureScope,
        dependency: String,
        dependency_scope: FixtureScope,
    },

    /// A resolved value did not hold the type the caller asked for.
    #[error("fixture '{name}' does not hold a value of the requested type")]
    WrongType { name: String },

    /// An async fixture was reached from a purely synchronous unit.
    #[error("async fixture '{0}' cannot be resolved without an event loop")]
    AsyncInSyncContext(String),

    /// A parametrized fixture was requested with an out-of-range case index.
    #[error("parametrized fixture '{name}' has no case at index {index}")]
    MissingParamCase { name: String, index: usize },
}

/// Errors produced by a test body itself.
#[derive(Debug, Error)]
pub enum TestError {
    /// The body raised an assertion or other failure.
    #[error("{0}")]
    Failed(String),

    /// The body requested a skip at runtime.
    #[error("skipped: {0}")]
    Skipped(String),
}

impl TestError {
    /// Convenience constructor for assertion-style failures.
    pub fn failed(message: impl Into<String>) -> Self {
        TestError::Failed(message.into())
    }

    /// Convenience constructor for runtime skips.
    pub fn skipped(reason: impl Into<String>) -> Self {
        TestError::Skipped(reason.into())
    }
}

/// A teardown continuation failed.
///
/// Teardown errors are recorded on the run report but never flip an
/// already-produced outcome; a passed test stays passed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeardownWarning {
    /// Scope instance the teardown belonged to (for display).
    pub scope: String,
    /// Name of the fixture whose teardown failed.
    pub fixture: String,
    /// Rendered failure message.
    pub message: String,
}

impl std::fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "teardown of fixture '{}' in {} failed: {}",
            self.fixture, self.scope, self.message
        )
    }
}

/// Render a panic payload into a displayable message.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
