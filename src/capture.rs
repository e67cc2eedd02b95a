//! Output capture around units of work.
//!
//! Capture is a seam rather than a mechanism: the engine tells the capture
//! backend when a unit becomes active and collects whatever was written in
//! between. Units in one batch interleave on a single thread; a batched
//! unit becomes active when first polled, so writes after a suspension
//! point attribute to the most recently activated unit.

use std::sync::{Arc, Mutex};

/// Text collected while one unit was active.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

/// Backend collecting output per unit of work.
pub trait OutputCapture {
    /// A unit became the active writer.
    fn begin(&self, unit_id: &str);

    /// The unit finished; return what it wrote and deactivate it.
    fn end(&self, unit_id: &str) -> CapturedOutput;
}

/// Capture backend that records nothing. Used when capture is disabled.
#[derive(Default)]
pub struct NullCapture;

impl OutputCapture for NullCapture {
    fn begin(&self, _unit_id: &str) {}

    fn end(&self, _unit_id: &str) -> CapturedOutput {
        CapturedOutput::default()
    }
}

#[derive(Default)]
struct MemoryState {
    active: Option<String>,
    current: CapturedOutput,
}

/// In-memory capture backend. Cloneable so fixtures and bodies can hold a
/// writer handle while the engine holds the collector side.
#[derive(Clone, Default)]
pub struct MemoryCapture {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a line of standard output, attributed to the active unit.
    /// Writes outside any active window are dropped.
    pub fn write_stdout(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        if state.active.is_some() {
            state.current.stdout.push_str(text);
        }
    }

    /// Record a line of standard error, attributed to the active unit.
    pub fn write_stderr(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        if state.active.is_some() {
            state.current.stderr.push_str(text);
        }
    }
}

impl OutputCapture for MemoryCapture {
    fn begin(&self, unit_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.active = Some(unit_id.to_string());
        state.current = CapturedOutput::default();
    }

    fn end(&self, unit_id: &str) -> CapturedOutput {
        let mut state = self.state.lock().unwrap();
        if state.active.as_deref() == Some(unit_id) {
            state.active = None;
            std::mem::take(&mut state.current)
        } else {
            CapturedOutput::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_attribute_to_the_active_unit_only() {
        let capture = MemoryCapture::new();
        capture.write_stdout("before any unit\n");

        capture.begin("m.rs::test_a");
        capture.write_stdout("hello\n");
        capture.write_stderr("warn\n");
        let collected = capture.end("m.rs::test_a");
        assert_eq!(collected.stdout, "hello\n");
        assert_eq!(collected.stderr, "warn\n");

        capture.write_stdout("after\n");
        capture.begin("m.rs::test_b");
        let collected = capture.end("m.rs::test_b");
        assert!(collected.is_empty());
    }

    #[test]
    fn ending_a_non_active_unit_yields_nothing() {
        let capture = MemoryCapture::new();
        capture.begin("m.rs::test_a");
        capture.write_stdout("a\n");
        assert!(capture.end("m.rs::test_b").is_empty());
        // The active unit still gets its output.
        assert_eq!(capture.end("m.rs::test_a").stdout, "a\n");
    }
}
