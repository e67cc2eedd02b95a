//! Progress reporting: the listener seam between the engine and renderers.

pub mod events;

pub use events::{
    current_timestamp, BatchCompletedEvent, BatchStartedEvent, SuiteCompletedEvent,
    SuiteStartedEvent, UnitCompletedEvent, UnitStartedEvent,
};

/// Receiver for execution progress. All callbacks default to no-ops so a
/// renderer only implements what it displays.
///
/// Callbacks fire from the engine thread in a well-defined order: units in
/// a batch report started events during sequential preparation and
/// completed events after the batch's gather finishes.
pub trait ProgressListener {
    fn suite_started(&mut self, _event: SuiteStartedEvent) {}
    fn unit_started(&mut self, _event: UnitStartedEvent) {}
    fn unit_completed(&mut self, _event: UnitCompletedEvent) {}
    fn batch_started(&mut self, _event: BatchStartedEvent) {}
    fn batch_completed(&mut self, _event: BatchCompletedEvent) {}
    fn suite_completed(&mut self, _event: SuiteCompletedEvent) {}
}

/// Listener that discards everything.
#[derive(Default)]
pub struct NullListener;

impl ProgressListener for NullListener {}

/// Listener that records event names and unit identifiers in arrival
/// order. Useful for asserting on emission order.
#[derive(Default)]
pub struct RecordingListener {
    pub entries: Vec<String>,
}

impl ProgressListener for RecordingListener {
    fn suite_started(&mut self, event: SuiteStartedEvent) {
        self.entries.push(format!("suite_started({})", event.total_tests));
    }

    fn unit_started(&mut self, event: UnitStartedEvent) {
        self.entries.push(format!("unit_started({})", event.test_id));
    }

    fn unit_completed(&mut self, event: UnitCompletedEvent) {
        self.entries.push(format!("unit_completed({})", event.test_id));
    }

    fn batch_started(&mut self, event: BatchStartedEvent) {
        self.entries
            .push(format!("batch_started({}, {})", event.instance, event.size));
    }

    fn batch_completed(&mut self, event: BatchCompletedEvent) {
        self.entries
            .push(format!("batch_completed({}, {})", event.instance, event.size));
    }

    fn suite_completed(&mut self, event: SuiteCompletedEvent) {
        self.entries.push(format!(
            "suite_completed({}/{})",
            event.passed, event.total
        ));
    }
}
