//! Event types for streaming execution updates to progress consumers.
//!
//! These events are emitted during a run and can be consumed by multiple
//! renderers (terminal, JSON export, IDE integrations).

use serde::Serialize;

use crate::model::{FixtureScope, TestStatus};

/// Event emitted when a run starts.
#[derive(Clone, Debug, Serialize)]
pub struct SuiteStartedEvent {
    /// Total number of units to execute.
    pub total_tests: usize,

    /// Unix timestamp when the run started.
    pub timestamp: f64,
}

/// Event emitted when an individual unit starts.
#[derive(Clone, Debug, Serialize)]
pub struct UnitStartedEvent {
    /// Unique test identifier (e.g., "tests/test_foo.rs::test_bar").
    pub test_id: String,

    /// Unix timestamp when the unit started.
    pub timestamp: f64,
}

/// Event emitted when an individual unit completes.
#[derive(Clone, Debug, Serialize)]
pub struct UnitCompletedEvent {
    /// Unique test identifier.
    pub test_id: String,

    /// Terminal outcome of the unit.
    pub status: TestStatus,

    /// Unit duration in seconds.
    pub duration: f64,

    /// Unix timestamp when the unit completed.
    pub timestamp: f64,
}

/// Event emitted when a concurrent batch starts.
#[derive(Clone, Debug, Serialize)]
pub struct BatchStartedEvent {
    /// Loop scope shared by the batch.
    pub scope: FixtureScope,

    /// Rendered scope instance (e.g., "module scope 'tests/test_api.rs'").
    pub instance: String,

    /// Number of units in the batch.
    pub size: usize,

    /// Unix timestamp when the batch started.
    pub timestamp: f64,
}

/// Event emitted when a concurrent batch completes.
#[derive(Clone, Debug, Serialize)]
pub struct BatchCompletedEvent {
    /// Loop scope shared by the batch.
    pub scope: FixtureScope,

    /// Rendered scope instance.
    pub instance: String,

    /// Number of units in the batch.
    pub size: usize,

    /// Wall-clock duration of the whole batch in seconds.
    pub duration: f64,

    /// Unix timestamp when the batch completed.
    pub timestamp: f64,
}

/// Event emitted when the run completes.
#[derive(Clone, Debug, Serialize)]
pub struct SuiteCompletedEvent {
    /// Total number of units executed.
    pub total: usize,

    /// Number of units that passed.
    pub passed: usize,

    /// Number of units that failed.
    pub failed: usize,

    /// Number of units that were skipped.
    pub skipped: usize,

    /// Total duration in seconds.
    pub duration: f64,

    /// Unix timestamp when the run completed.
    pub timestamp: f64,
}

/// Helper to get the current Unix timestamp.
pub fn current_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
