//! Passive capture sink.

use crate::pipeline::{Record, Sink};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Captured {
    output: Vec<Record>,
    errors: Vec<Record>,
}

/// Captures the records reaching it, plus every error record of the run.
///
/// Clones share the same buffers, so a test keeps one handle and gives the
/// other to the pipeline.
#[derive(Debug, Clone, Default)]
pub struct Wiretap {
    captured: Arc<Mutex<Captured>>,
}

impl Wiretap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Captured> {
        self.captured
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn output_records(&self) -> Vec<Record> {
        self.lock().output.clone()
    }

    pub fn error_records(&self) -> Vec<Record> {
        self.lock().errors.clone()
    }

    pub fn clear(&self) {
        let mut captured = self.lock();
        captured.output.clear();
        captured.errors.clear();
    }
}

impl Sink for Wiretap {
    fn name(&self) -> &str {
        "Wiretap"
    }

    fn write(&self, records: &[Record]) {
        self.lock().output.extend_from_slice(records);
    }

    fn write_errors(&self, records: &[Record]) {
        self.lock().errors.extend_from_slice(records);
    }
}
