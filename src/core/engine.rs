//! Job execution engine.
//!
//! Each job walks `Created -> Ready -> Executing -> {Completed, Escalated}`:
//!
//! 1. **Bind**: every managed object dependency is sourced from its pool
//!    through a callback. A sourcing failure escalates before the task body
//!    ever runs.
//! 2. **Dispatch**: the ready job is assigned to the team configured for its
//!    task.
//! 3. **Execute**: the team thread runs the task body with the bound work,
//!    objects and argument.
//! 4. **Continue or escalate**: job-scoped objects are released, then the
//!    engine creates the successor job or routes the failure to a handler.
//!
//! A process tears down once no job is outstanding, returning its
//! process-scoped objects and running completion hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::escalation::Escalation;
use crate::core::process::{CompletionHook, Process};
use crate::core::task::{DependencyScope, TaskDef, WorkFactory};
use crate::core::{
    Argument, EscalationSink, KernelError, ManagedObjectPool, ManagedObjectUser, Outcome,
    PooledObject, ProcessHandle, ProcessReport, ProcessStatus, TaskContext, TaskGraph, TaskId,
    Team, TeamJob,
};
use crate::util::clock::now_ms;

/// Escalations allowed per process before the kernel sink takes over.
pub const MAX_ESCALATION_DEPTH: usize = 16;

/// Lifecycle of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Built, dependencies not yet bound.
    Created,
    /// Dependencies bound, waiting for a team thread.
    Ready,
    /// Task body running.
    Executing,
    /// Task body returned normally.
    Completed,
    /// Failure is being routed.
    Escalated,
}

/// Snapshot of engine activity.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Processes started.
    pub processes_started: u64,
    /// Processes that completed normally.
    pub processes_completed: u64,
    /// Processes ending with an unhandled failure.
    pub processes_failed: u64,
    /// Processes ending cancelled.
    pub processes_cancelled: u64,
    /// Processes not yet terminated.
    pub active_processes: usize,
    /// Task bodies executed.
    pub jobs_executed: u64,
}

#[derive(Debug, Default)]
struct EngineCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    jobs_executed: AtomicU64,
}

struct Job {
    id: u64,
    task: TaskId,
    process: Arc<Process>,
    argument: Option<Argument>,
    failure: Option<anyhow::Error>,
    bound: Vec<Option<PooledObject>>,
    lost: Vec<bool>,
    state: JobState,
}

/// Components the engine is assembled from.
pub(crate) struct EngineParts {
    pub graph: TaskGraph,
    pub works: Vec<WorkFactory>,
    pub teams: Vec<Arc<Team>>,
    pub pools: Vec<Arc<ManagedObjectPool>>,
    pub sink: Arc<dyn EscalationSink>,
    pub process_handler: Option<TaskId>,
}

/// Binds tasks to work and managed objects and drives them across teams.
pub struct Engine {
    graph: TaskGraph,
    works: Vec<WorkFactory>,
    teams: Vec<Arc<Team>>,
    pools: Vec<Arc<ManagedObjectPool>>,
    sink: Arc<dyn EscalationSink>,
    process_handler: Option<TaskId>,
    active: Mutex<usize>,
    idle: Condvar,
    next_job: AtomicU64,
    counters: EngineCounters,
}

impl Engine {
    pub(crate) fn new(parts: EngineParts) -> Arc<Self> {
        Arc::new(Self {
            graph: parts.graph,
            works: parts.works,
            teams: parts.teams,
            pools: parts.pools,
            sink: parts.sink,
            process_handler: parts.process_handler,
            active: Mutex::new(0),
            idle: Condvar::new(),
            next_job: AtomicU64::new(1),
            counters: EngineCounters::default(),
        })
    }

    /// The compiled task graph.
    #[must_use]
    pub const fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    /// Resolve a task name.
    #[must_use]
    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.graph.task_id(name)
    }

    /// All teams in index order.
    #[must_use]
    pub fn teams(&self) -> &[Arc<Team>] {
        &self.teams
    }

    /// Team by name.
    #[must_use]
    pub fn team(&self, name: &str) -> Option<&Arc<Team>> {
        self.teams.iter().find(|t| t.name() == name)
    }

    /// Managed object pool by name.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&Arc<ManagedObjectPool>> {
        self.pools.iter().find(|p| p.name() == name)
    }

    /// Team configured to run `task`.
    #[must_use]
    pub fn task_team(&self, task: TaskId) -> Option<&Arc<Team>> {
        self.graph.get(task).and_then(|t| self.teams.get(t.team))
    }

    /// Start a new process at `task`.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::UnknownName` if `task` is not in the graph.
    pub fn invoke(
        self: &Arc<Self>,
        task: TaskId,
        argument: Option<Argument>,
    ) -> Result<ProcessHandle, KernelError> {
        self.invoke_inner(task, argument, None)
    }

    /// Start a new process with a completion hook registered up front.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::UnknownName` if `task` is not in the graph.
    pub fn invoke_with_hook(
        self: &Arc<Self>,
        task: TaskId,
        argument: Option<Argument>,
        hook: CompletionHook,
    ) -> Result<ProcessHandle, KernelError> {
        self.invoke_inner(task, argument, Some(hook))
    }

    fn invoke_inner(
        self: &Arc<Self>,
        task: TaskId,
        argument: Option<Argument>,
        hook: Option<CompletionHook>,
    ) -> Result<ProcessHandle, KernelError> {
        let name = self.task_def(task)?.name.clone();
        let process = Process::new(self.works.len());
        if let Some(hook) = hook {
            process.state.lock().hooks.push(hook);
        }
        *self.active.lock() += 1;
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        debug!(process = %process.id, task = %name, "process started");

        let handle = ProcessHandle {
            process: Arc::clone(&process),
        };
        let job = self.create_job(process, task, argument, None);
        self.bind(job);
        Ok(handle)
    }

    fn task_def(&self, task: TaskId) -> Result<&TaskDef, KernelError> {
        self.graph.get(task).ok_or_else(|| KernelError::UnknownName {
            kind: "task",
            name: format!("#{}", task.index()),
        })
    }

    fn task_name(&self, task: TaskId) -> String {
        self.graph
            .task_name(task)
            .map_or_else(|| format!("#{}", task.index()), str::to_string)
    }

    fn create_job(
        &self,
        process: Arc<Process>,
        task: TaskId,
        argument: Option<Argument>,
        failure: Option<anyhow::Error>,
    ) -> Box<Job> {
        let deps = self.graph.get(task).map_or(0, |t| t.dependencies.len());
        Box::new(Job {
            id: self.next_job.fetch_add(1, Ordering::Relaxed),
            task,
            process,
            argument,
            failure,
            bound: (0..deps).map(|_| None).collect(),
            lost: vec![false; deps],
            state: JobState::Created,
        })
    }

    /// Add a job to an existing process and start binding it.
    fn spawn(
        self: &Arc<Self>,
        process: &Arc<Process>,
        task: TaskId,
        argument: Option<Argument>,
        failure: Option<anyhow::Error>,
    ) {
        process.state.lock().outstanding += 1;
        let job = self.create_job(Arc::clone(process), task, argument, failure);
        self.bind(job);
    }

    /// Source the next unbound dependency, or dispatch once all are bound.
    fn bind(self: &Arc<Self>, mut job: Box<Job>) {
        loop {
            if job.process.is_cancelled() {
                self.escalate(job, KernelError::Cancelled.into());
                return;
            }
            let dependency = match self.task_def(job.task) {
                Ok(task) => job
                    .bound
                    .iter()
                    .position(Option::is_none)
                    .map(|index| (index, task.dependencies[index])),
                Err(e) => {
                    self.terminate(job, e.into());
                    return;
                }
            };
            let Some((index, dependency)) = dependency else {
                self.dispatch(job);
                return;
            };

            if dependency.scope == DependencyScope::Process {
                let parked = job.process.state.lock().objects.remove(&dependency.pool);
                if let Some(object) = parked {
                    job.bound[index] = Some(object);
                    continue;
                }
            }

            debug!(job = job.id, dependency = index, "sourcing dependency");
            let pool = Arc::clone(&self.pools[dependency.pool]);
            pool.source(Box::new(BindUser {
                engine: Arc::clone(self),
                job,
                index,
            }));
            return;
        }
    }

    fn dispatch(self: &Arc<Self>, mut job: Box<Job>) {
        job.state = JobState::Ready;
        if job.process.is_cancelled() {
            self.escalate(job, KernelError::Cancelled.into());
            return;
        }
        let team = match self.task_def(job.task) {
            Ok(task) => Arc::clone(&self.teams[task.team]),
            Err(e) => {
                self.terminate(job, e.into());
                return;
            }
        };
        debug!(job = job.id, team = %team.name(), "job ready");
        let execute = ExecuteJob {
            engine: Arc::clone(self),
            job,
        };
        // A worker blocking on its own full queue would never be drained.
        let assigned = if team.is_current_worker() {
            team.try_assign(Box::new(execute))
        } else {
            team.assign(Box::new(execute))
        };
        if let Err(e) = assigned {
            debug!(team = %team.name(), error = %e, "job not accepted by team");
        }
    }

    fn execute(self: &Arc<Self>, mut job: Box<Job>) {
        if job.process.is_cancelled() {
            self.escalate(job, KernelError::Cancelled.into());
            return;
        }
        let task = match self.task_def(job.task) {
            Ok(task) => task,
            Err(e) => {
                self.terminate(job, e.into());
                return;
            }
        };
        job.state = JobState::Executing;
        debug!(job = job.id, process = %job.process.id, task = %task.name, "job executing");

        let mut work = task.work.map(|index| self.take_work(&job.process, index));
        let argument = job.argument.take();
        let failure = job.failure.take();
        let process = Arc::clone(&job.process);
        let cancelled = move || process.is_cancelled();

        let result = {
            let mut ctx = TaskContext {
                process: job.process.id,
                task_name: &task.name,
                work: work.as_deref_mut(),
                objects: &mut job.bound,
                lost: &mut job.lost,
                argument,
                failure: failure.as_ref(),
                cancelled: &cancelled,
            };
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| (task.function)(&mut ctx)))
        };

        {
            let mut state = job.process.state.lock();
            if let (Some(index), Some(work)) = (task.work, work) {
                state.works[index] = Some(work);
            }
            state.jobs_executed += 1;
        }
        self.counters.jobs_executed.fetch_add(1, Ordering::Relaxed);

        let result = result.unwrap_or_else(|panic| {
            Err(KernelError::TaskPanicked {
                task: task.name.clone(),
                message: panic_message(panic.as_ref()),
            }
            .into())
        });
        match result {
            Ok(outcome) => {
                job.state = JobState::Completed;
                self.complete(job, outcome);
            }
            Err(failure) => self.escalate(job, failure),
        }
    }

    fn take_work(&self, process: &Process, index: usize) -> Box<dyn std::any::Any + Send> {
        let existing = process.state.lock().works[index].take();
        existing.unwrap_or_else(|| (self.works[index])())
    }

    fn complete(self: &Arc<Self>, mut job: Box<Job>, outcome: Outcome) {
        let successor = match outcome {
            Outcome::Next(argument) => self
                .graph
                .get(job.task)
                .and_then(|t| t.next)
                .map(|next| (next, argument)),
            Outcome::Invoke { task, argument } => Some((task, argument)),
            Outcome::Finish => None,
        };
        if let Some((next, _)) = &successor {
            if let Err(e) = self.task_def(*next) {
                self.escalate(job, e.into());
                return;
            }
        }

        self.release(&mut job);
        let process = Arc::clone(&job.process);
        if process.is_cancelled() {
            // Cancellation is delivered once the executing job reports back.
            process.state.lock().cancelled_outcome = true;
        } else if let Some((next, argument)) = successor {
            debug!(process = %process.id, from = job.task.index(), to = next.index(), "continuing to next task");
            self.spawn(&process, next, argument, None);
        }
        drop(job);
        self.finish_job(&process);
    }

    /// Route a failure: task handler, then process handler, then the sink.
    fn escalate(self: &Arc<Self>, mut job: Box<Job>, failure: anyhow::Error) {
        debug!(job = job.id, from = ?job.state, "job escalated");
        job.state = JobState::Escalated;
        self.release(&mut job);
        let process = Arc::clone(&job.process);

        let cancelled = matches!(
            failure.downcast_ref::<KernelError>(),
            Some(KernelError::Cancelled)
        );
        if cancelled || process.is_cancelled() {
            debug!(process = %process.id, job = job.id, "process cancelled");
            process.state.lock().cancelled_outcome = true;
            drop(job);
            self.finish_job(&process);
            return;
        }

        let task_name = self.task_name(job.task);
        let depth = {
            let mut state = process.state.lock();
            state.escalations += 1;
            state.escalations
        };
        if depth > MAX_ESCALATION_DEPTH {
            self.unhandled(
                &process,
                &task_name,
                failure.context(KernelError::EscalationDepth(MAX_ESCALATION_DEPTH)),
            );
            drop(job);
            self.finish_job(&process);
            return;
        }

        let handler = self
            .graph
            .get(job.task)
            .and_then(|task| task.handler_for(&failure))
            .or_else(|| self.process_handler.filter(|h| *h != job.task));
        match handler {
            Some(handler) => {
                debug!(
                    process = %process.id,
                    task = %task_name,
                    handler = %self.task_name(handler),
                    error = %failure,
                    "escalating to handler"
                );
                self.spawn(&process, handler, None, Some(failure));
            }
            None => self.unhandled(&process, &task_name, failure),
        }
        drop(job);
        self.finish_job(&process);
    }

    /// Terminal failure that bypasses handlers (team stopped, broken link).
    fn terminate(self: &Arc<Self>, mut job: Box<Job>, failure: anyhow::Error) {
        job.state = JobState::Escalated;
        self.release(&mut job);
        let process = Arc::clone(&job.process);
        let task_name = self.task_name(job.task);
        if matches!(failure.downcast_ref::<KernelError>(), Some(KernelError::Cancelled)) {
            process.state.lock().cancelled_outcome = true;
        } else {
            self.unhandled(&process, &task_name, failure);
        }
        drop(job);
        self.finish_job(&process);
    }

    fn unhandled(&self, process: &Process, task: &str, failure: anyhow::Error) {
        let failure = Arc::new(failure);
        {
            let mut state = process.state.lock();
            if state.failure.is_none() {
                state.failure = Some(Arc::clone(&failure));
            }
        }
        let escalation = Escalation::new(process.id, task, failure);
        let sink = Arc::clone(&self.sink);
        let recorded =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || sink.record(escalation)));
        if recorded.is_err() {
            error!(process = %process.id, task, "escalation sink panicked");
        }
    }

    /// Return job-scoped objects to their pools and park process-scoped ones.
    fn release(&self, job: &mut Job) {
        let scopes: Vec<DependencyScope> = self
            .graph
            .get(job.task)
            .map(|t| t.dependencies.iter().map(|d| d.scope).collect())
            .unwrap_or_default();
        for (index, slot) in job.bound.iter_mut().enumerate() {
            let Some(object) = slot.take() else { continue };
            let lost = job.lost.get(index).copied().unwrap_or(false);
            let scope = scopes.get(index).copied().unwrap_or(DependencyScope::Job);
            if scope == DependencyScope::Process && !lost {
                let mut state = job.process.state.lock();
                if !state.objects.contains_key(&object.pool) {
                    state.objects.insert(object.pool, object);
                    continue;
                }
                drop(state);
                self.release_object(&job.process, object, false);
                continue;
            }
            self.release_object(&job.process, object, lost);
        }
    }

    fn release_object(&self, process: &Process, object: PooledObject, lost: bool) {
        let pool = &self.pools[object.pool];
        let result = if lost {
            pool.lose(object)
        } else {
            pool.return_instance(object)
        };
        if let Err(e) = result {
            warn!(process = %process.id, pool = %pool.name(), error = %e, "release failed");
        }
        process.state.lock().objects_released += 1;
    }

    /// Mark one job finished; tear the process down when none remain.
    fn finish_job(&self, process: &Arc<Process>) {
        let parked = {
            let mut state = process.state.lock();
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outstanding > 0 {
                return;
            }
            for work in &mut state.works {
                *work = None;
            }
            std::mem::take(&mut state.objects)
        };
        for object in parked.into_values() {
            self.release_object(process, object, false);
        }

        let (report, hooks) = {
            let mut state = process.state.lock();
            let status = if state.cancelled_outcome {
                ProcessStatus::Cancelled
            } else if state.failure.is_some() {
                ProcessStatus::Failed
            } else {
                ProcessStatus::Completed
            };
            let report = ProcessReport {
                id: process.id,
                status,
                failure: state.failure.clone(),
                jobs_executed: state.jobs_executed,
                objects_borrowed: state.objects_borrowed,
                objects_released: state.objects_released,
                started_at_ms: process.started_at_ms,
                finished_at_ms: now_ms(),
            };
            let counter = match status {
                ProcessStatus::Completed => &self.counters.completed,
                ProcessStatus::Failed => &self.counters.failed,
                ProcessStatus::Cancelled => &self.counters.cancelled,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            state.report = Some(report.clone());
            (report, std::mem::take(&mut state.hooks))
        };
        process.done.notify_all();
        debug!(process = %report.id, status = ?report.status, jobs = report.jobs_executed, "process finished");

        for hook in hooks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&report))).is_err() {
                error!(process = %report.id, "completion hook panicked");
            }
        }

        let mut active = self.active.lock();
        *active = active.saturating_sub(1);
        if *active == 0 {
            self.idle.notify_all();
        }
    }

    /// Processes not yet terminated.
    #[must_use]
    pub fn active_processes(&self) -> usize {
        *self.active.lock()
    }

    /// Block until no process is active or `timeout` elapses.
    /// Returns whether the engine is idle.
    #[must_use]
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let mut active = self.active.lock();
        if *active > 0 {
            let _ = self.idle.wait_while_for(&mut active, |a| *a > 0, timeout);
        }
        let idle = *active == 0;
        if !idle {
            info!(active = *active, "engine still busy after wait");
        }
        idle
    }

    /// Current engine statistics.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            processes_started: self.counters.started.load(Ordering::Relaxed),
            processes_completed: self.counters.completed.load(Ordering::Relaxed),
            processes_failed: self.counters.failed.load(Ordering::Relaxed),
            processes_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            active_processes: self.active_processes(),
            jobs_executed: self.counters.jobs_executed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("graph", &self.graph)
            .field("teams", &self.teams)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

/// Receives a sourced dependency and continues binding the job.
struct BindUser {
    engine: Arc<Engine>,
    job: Box<Job>,
    index: usize,
}

impl ManagedObjectUser for BindUser {
    fn complete(self: Box<Self>, mut object: PooledObject) {
        let Self {
            engine,
            mut job,
            index,
        } = *self;
        engine.pools[object.pool].bind_process(&mut object, job.process.id);
        job.process.state.lock().objects_borrowed += 1;
        job.bound[index] = Some(object);
        engine.bind(job);
    }

    fn failed(self: Box<Self>, cause: anyhow::Error) {
        let Self { engine, job, index } = *self;
        debug!(job = job.id, dependency = index, error = %cause, "dependency sourcing failed");
        engine.escalate(job, cause);
    }
}

/// Team job wrapping one ready job.
struct ExecuteJob {
    engine: Arc<Engine>,
    job: Box<Job>,
}

impl TeamJob for ExecuteJob {
    fn run(self: Box<Self>) {
        let Self { engine, job } = *self;
        engine.execute(job);
    }

    fn cancel(self: Box<Self>, cause: KernelError) {
        let Self { engine, job } = *self;
        warn!(job = job.id, state = ?job.state, error = %cause, "ready job cancelled by team");
        engine.terminate(job, cause.into());
    }
}
