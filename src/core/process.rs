//! Processes: the execution context of one causal chain of jobs.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::core::PooledObject;
use crate::util::clock::now_ms;

/// Unique process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(Uuid);

impl ProcessId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Terminal status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Every job completed or was handled.
    Completed,
    /// A failure reached the kernel escalation sink.
    Failed,
    /// The process was cancelled.
    Cancelled,
}

/// Final accounting for a process.
#[derive(Debug, Clone)]
pub struct ProcessReport {
    /// Process identifier.
    pub id: ProcessId,
    /// Terminal status.
    pub status: ProcessStatus,
    /// Unhandled failure, when `status` is `Failed`.
    pub failure: Option<Arc<anyhow::Error>>,
    /// Jobs whose task body ran.
    pub jobs_executed: u64,
    /// Managed objects bound for this process.
    pub objects_borrowed: u64,
    /// Managed objects returned or lost by this process.
    pub objects_released: u64,
    /// Wall-clock start, milliseconds since the Unix epoch.
    pub started_at_ms: u128,
    /// Wall-clock end, milliseconds since the Unix epoch.
    pub finished_at_ms: u128,
}

/// Callback run once a process reaches its terminal state.
pub type CompletionHook = Box<dyn FnOnce(&ProcessReport) + Send>;

pub(crate) struct ProcessState {
    pub works: Vec<Option<Box<dyn Any + Send>>>,
    pub objects: HashMap<usize, PooledObject>,
    pub outstanding: usize,
    pub escalations: usize,
    pub jobs_executed: u64,
    pub objects_borrowed: u64,
    pub objects_released: u64,
    pub failure: Option<Arc<anyhow::Error>>,
    pub cancelled_outcome: bool,
    pub hooks: Vec<CompletionHook>,
    pub report: Option<ProcessReport>,
}

pub(crate) struct Process {
    pub id: ProcessId,
    pub started_at_ms: u128,
    pub state: Mutex<ProcessState>,
    pub done: Condvar,
    pub cancelled: AtomicBool,
}

impl Process {
    pub fn new(work_count: usize) -> Arc<Self> {
        Arc::new(Self {
            id: ProcessId::new(),
            started_at_ms: now_ms(),
            state: Mutex::new(ProcessState {
                works: (0..work_count).map(|_| None).collect(),
                objects: HashMap::new(),
                outstanding: 1,
                escalations: 0,
                jobs_executed: 0,
                objects_borrowed: 0,
                objects_released: 0,
                failure: None,
                cancelled_outcome: false,
                hooks: Vec::new(),
                report: None,
            }),
            done: Condvar::new(),
            cancelled: AtomicBool::new(false),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Handle to an in-flight or finished process.
#[derive(Clone)]
pub struct ProcessHandle {
    pub(crate) process: Arc<Process>,
}

impl ProcessHandle {
    /// Process identifier.
    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.process.id
    }

    /// Request cancellation.
    ///
    /// Takes effect at the next job boundary; a job already executing is
    /// allowed to finish first.
    pub fn cancel(&self) {
        self.process.cancelled.store(true, Ordering::Release);
    }

    /// Whether the process has reached its terminal state.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.process.state.lock().report.is_some()
    }

    /// Block until the process finishes or `timeout` elapses.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> Option<ProcessReport> {
        let mut state = self.process.state.lock();
        if state.report.is_none() {
            let _ = self
                .process
                .done
                .wait_while_for(&mut state, |s| s.report.is_none(), timeout);
        }
        state.report.clone()
    }

    /// Run `hook` when the process finishes; immediately if it already has.
    pub fn on_complete(&self, hook: impl FnOnce(&ProcessReport) + Send + 'static) {
        let mut state = self.process.state.lock();
        match state.report.clone() {
            Some(report) => {
                drop(state);
                hook(&report);
            }
            None => state.hooks.push(Box::new(hook)),
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.process.id)
            .field("complete", &self.is_complete())
            .finish()
    }
}
