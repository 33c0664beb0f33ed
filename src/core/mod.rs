//! Core execution abstractions: teams, managed objects, tasks, processes and
//! the engine that drives jobs between them.

pub mod engine;
pub mod error;
pub mod escalation;
pub mod managed_object;
pub mod object_pool;
pub mod process;
pub mod task;
pub mod team;

pub use engine::{Engine, EngineStats, JobState, MAX_ESCALATION_DEPTH};
pub use error::{AppResult, KernelError};
pub use escalation::{Escalation, EscalationSink, InMemoryEscalationSink, LoggingEscalationSink};
pub use managed_object::{
    source_fn, Capabilities, FnSource, ManagedObjectSource, ManagedObjectUser, PooledObject,
};
pub use object_pool::{ManagedObjectPool, ManagedObjectPoolStats};
pub use process::{CompletionHook, ProcessHandle, ProcessId, ProcessReport, ProcessStatus};
pub use task::{
    Argument, DependencyScope, FailureType, GraphNames, Outcome, TaskContext, TaskFn, TaskGraph,
    TaskId, TaskSpec, WorkFactory,
};
pub use team::{Team, TeamJob, TeamStats};
