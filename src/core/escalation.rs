//! Kernel-level sinks for unhandled escalations.
//!
//! A failure that no task handler and no process-level handler claims ends
//! up here. Sinks are isolated per call: a panicking sink never leaks into
//! another process's execution.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::ProcessId;
use crate::util::clock::now_ms;

/// Unhandled failure record.
#[derive(Debug, Clone)]
pub struct Escalation {
    /// Process the failure belongs to.
    pub process: ProcessId,
    /// Task whose failure went unhandled.
    pub task: String,
    /// The failure itself.
    pub failure: Arc<anyhow::Error>,
    /// Timestamp milliseconds.
    pub created_at_ms: u128,
}

impl Escalation {
    pub(crate) fn new(process: ProcessId, task: impl Into<String>, failure: Arc<anyhow::Error>) -> Self {
        Self {
            process,
            task: task.into(),
            failure,
            created_at_ms: now_ms(),
        }
    }
}

/// Escalation sink abstraction.
pub trait EscalationSink: Send + Sync {
    /// Record an unhandled escalation.
    fn record(&self, escalation: Escalation);
}

/// Sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEscalationSink;

impl EscalationSink for LoggingEscalationSink {
    fn record(&self, escalation: Escalation) {
        tracing::error!(
            process = %escalation.process,
            task = %escalation.task,
            error = %escalation.failure,
            "unhandled escalation"
        );
    }
}

/// In-memory sink for testing and dev, bounded to the most recent events.
pub struct InMemoryEscalationSink {
    events: Mutex<VecDeque<Escalation>>,
    max_events: usize,
}

impl InMemoryEscalationSink {
    /// Create a sink keeping at most `max_events`.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events)),
            max_events,
        }
    }

    /// Snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<Escalation> {
        self.events.lock().iter().cloned().collect()
    }
}

impl EscalationSink for InMemoryEscalationSink {
    fn record(&self, escalation: Escalation) {
        LoggingEscalationSink.record(escalation.clone());
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(escalation);
    }
}

impl<S: EscalationSink + ?Sized> EscalationSink for Arc<S> {
    fn record(&self, escalation: Escalation) {
        (**self).record(escalation);
    }
}
