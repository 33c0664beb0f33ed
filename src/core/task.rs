//! Task descriptors and the compiled task graph.
//!
//! Tasks are declared by name ([`TaskSpec`]) and compiled once into a flat
//! [`TaskGraph`] where every link (team, work, dependency, next task,
//! failure handler) is an index. The graph is shared read-only by all jobs.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::{KernelError, PooledObject, ProcessId};

/// Value passed into a task invocation.
pub type Argument = Box<dyn Any + Send>;

/// Task body: runs on a team thread with the bound work and objects.
pub type TaskFn = Arc<dyn Fn(&mut TaskContext<'_>) -> anyhow::Result<Outcome> + Send + Sync>;

/// Factory creating one work instance per process.
pub type WorkFactory = Arc<dyn Fn() -> Box<dyn Any + Send> + Send + Sync>;

/// Index of a task in the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    /// Position of the task in the graph.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// How long a bound managed object stays with its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyScope {
    /// Released as soon as the job finishes or escalates.
    Job,
    /// Bound once and shared by later jobs of the same process; released at
    /// process teardown.
    Process,
}

/// What a task asks the engine to do next.
pub enum Outcome {
    /// Follow the task's declared next link, if any.
    Next(Option<Argument>),
    /// Invoke a specific task.
    Invoke {
        /// Target task.
        task: TaskId,
        /// Argument for the target.
        argument: Option<Argument>,
    },
    /// End this causal chain.
    Finish,
}

impl Outcome {
    /// Follow the next link without an argument.
    #[must_use]
    pub const fn next() -> Self {
        Self::Next(None)
    }

    /// Follow the next link passing `value`.
    pub fn next_with<T: Any + Send>(value: T) -> Self {
        Self::Next(Some(Box::new(value)))
    }

    /// Invoke `task` without an argument.
    #[must_use]
    pub const fn invoke(task: TaskId) -> Self {
        Self::Invoke {
            task,
            argument: None,
        }
    }

    /// Invoke `task` passing `value`.
    pub fn invoke_with<T: Any + Send>(task: TaskId, value: T) -> Self {
        Self::Invoke {
            task,
            argument: Some(Box::new(value)),
        }
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next(arg) => f.debug_tuple("Next").field(&arg.is_some()).finish(),
            Self::Invoke { task, argument } => f
                .debug_struct("Invoke")
                .field("task", task)
                .field("argument", &argument.is_some())
                .finish(),
            Self::Finish => f.write_str("Finish"),
        }
    }
}

/// Failure type a handler is declared for.
#[derive(Clone, Copy)]
pub struct FailureType {
    name: &'static str,
    matcher: fn(&(dyn std::error::Error + 'static)) -> bool,
    catch_all: bool,
}

impl FailureType {
    /// Matches causes of concrete type `E`.
    #[must_use]
    pub fn of<E: std::error::Error + 'static>() -> Self {
        Self {
            name: std::any::type_name::<E>(),
            matcher: |cause| cause.is::<E>(),
            catch_all: false,
        }
    }

    /// Matches any failure; only consulted when no typed handler matches.
    #[must_use]
    pub fn any() -> Self {
        Self {
            name: "any",
            matcher: |_| true,
            catch_all: true,
        }
    }

    /// Type name used for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Name-based task declaration, compiled by [`TaskGraph::compile`].
#[derive(Clone)]
pub struct TaskSpec {
    name: String,
    team: String,
    work: Option<String>,
    dependencies: Vec<(String, DependencyScope)>,
    next: Option<String>,
    handlers: Vec<(FailureType, String)>,
    function: TaskFn,
}

impl TaskSpec {
    /// Declare task `name` executed by `team`.
    pub fn new<F>(name: impl Into<String>, team: impl Into<String>, function: F) -> Self
    where
        F: Fn(&mut TaskContext<'_>) -> anyhow::Result<Outcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            team: team.into(),
            work: None,
            dependencies: Vec::new(),
            next: None,
            handlers: Vec::new(),
            function: Arc::new(function),
        }
    }

    /// Task name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind the task to a work type.
    #[must_use]
    pub fn work(mut self, work: impl Into<String>) -> Self {
        self.work = Some(work.into());
        self
    }

    /// Add a job-scoped dependency; its index is the declaration order.
    #[must_use]
    pub fn depends_on(mut self, source: impl Into<String>) -> Self {
        self.dependencies.push((source.into(), DependencyScope::Job));
        self
    }

    /// Add a process-scoped dependency.
    #[must_use]
    pub fn depends_on_process(mut self, source: impl Into<String>) -> Self {
        self.dependencies
            .push((source.into(), DependencyScope::Process));
        self
    }

    /// Declare the normal next-task link.
    #[must_use]
    pub fn next(mut self, task: impl Into<String>) -> Self {
        self.next = Some(task.into());
        self
    }

    /// Route failures of type `E` to `handler`.
    #[must_use]
    pub fn on_failure<E: std::error::Error + 'static>(mut self, handler: impl Into<String>) -> Self {
        self.handlers.push((FailureType::of::<E>(), handler.into()));
        self
    }

    /// Route any otherwise unmatched failure to `handler`.
    #[must_use]
    pub fn on_any_failure(mut self, handler: impl Into<String>) -> Self {
        self.handlers.push((FailureType::any(), handler.into()));
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("work", &self.work)
            .field("dependencies", &self.dependencies)
            .field("next", &self.next)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// Compiled dependency link.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Dependency {
    pub pool: usize,
    pub scope: DependencyScope,
}

/// Compiled task.
pub(crate) struct TaskDef {
    pub name: String,
    pub team: usize,
    pub work: Option<usize>,
    pub dependencies: Vec<Dependency>,
    pub next: Option<TaskId>,
    pub handlers: Vec<(FailureType, TaskId)>,
    pub function: TaskFn,
}

impl TaskDef {
    /// Handler for `failure`: causes are tried outermost first against the
    /// typed handlers, then the catch-all.
    pub fn handler_for(&self, failure: &anyhow::Error) -> Option<TaskId> {
        for cause in failure.chain() {
            let typed = self
                .handlers
                .iter()
                .find(|(ty, _)| !ty.catch_all && (ty.matcher)(cause));
            if let Some((_, handler)) = typed {
                return Some(*handler);
            }
        }
        self.handlers
            .iter()
            .find(|(ty, _)| ty.catch_all)
            .map(|(_, handler)| *handler)
    }
}

/// Names available to the graph compiler, in index order.
#[derive(Debug, Default, Clone)]
pub struct GraphNames {
    /// Team names.
    pub teams: Vec<String>,
    /// Work names.
    pub works: Vec<String>,
    /// Managed object source names.
    pub sources: Vec<String>,
}

fn index_of(names: &[String], kind: &'static str, name: &str) -> Result<usize, KernelError> {
    names
        .iter()
        .position(|n| n == name)
        .ok_or_else(|| KernelError::UnknownName {
            kind,
            name: name.to_string(),
        })
}

/// Flat, index-linked task graph.
pub struct TaskGraph {
    tasks: Vec<TaskDef>,
    by_name: HashMap<String, TaskId>,
}

impl TaskGraph {
    /// Resolve every name in `specs` into index links.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnknownName` for a reference that does not resolve
    /// - `KernelError::InvalidConfig` for duplicate task names
    pub fn compile(specs: Vec<TaskSpec>, names: &GraphNames) -> Result<Self, KernelError> {
        let mut by_name = HashMap::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            if by_name.insert(spec.name.clone(), TaskId(index)).is_some() {
                return Err(KernelError::InvalidConfig(format!(
                    "duplicate task `{}`",
                    spec.name
                )));
            }
        }
        let task_ref = |name: &str| {
            by_name
                .get(name)
                .copied()
                .ok_or_else(|| KernelError::UnknownName {
                    kind: "task",
                    name: name.to_string(),
                })
        };

        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            let team = index_of(&names.teams, "team", &spec.team)?;
            let work = spec
                .work
                .as_deref()
                .map(|w| index_of(&names.works, "work", w))
                .transpose()?;
            let dependencies = spec
                .dependencies
                .iter()
                .map(|(source, scope)| -> Result<Dependency, KernelError> {
                    Ok(Dependency {
                        pool: index_of(&names.sources, "managed object source", source)?,
                        scope: *scope,
                    })
                })
                .collect::<Result<Vec<_>, KernelError>>()?;
            let next = spec.next.as_deref().map(task_ref).transpose()?;
            let handlers = spec
                .handlers
                .iter()
                .map(|(ty, handler)| -> Result<(FailureType, TaskId), KernelError> {
                    Ok((*ty, task_ref(handler)?))
                })
                .collect::<Result<Vec<_>, KernelError>>()?;
            tasks.push(TaskDef {
                name: spec.name,
                team,
                work,
                dependencies,
                next,
                handlers,
                function: spec.function,
            });
        }
        Ok(Self { tasks, by_name })
    }

    /// Look up a task id by name.
    #[must_use]
    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.by_name.get(name).copied()
    }

    /// Name of a task.
    #[must_use]
    pub fn task_name(&self, id: TaskId) -> Option<&str> {
        self.tasks.get(id.0).map(|t| t.name.as_str())
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub(crate) fn get(&self, id: TaskId) -> Option<&TaskDef> {
        self.tasks.get(id.0)
    }
}

impl fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tasks.iter().map(|t| &t.name))
            .finish()
    }
}

/// Everything a task body can reach while it runs.
pub struct TaskContext<'a> {
    pub(crate) process: ProcessId,
    pub(crate) task_name: &'a str,
    pub(crate) work: Option<&'a mut (dyn Any + Send)>,
    pub(crate) objects: &'a mut [Option<PooledObject>],
    pub(crate) lost: &'a mut [bool],
    pub(crate) argument: Option<Argument>,
    pub(crate) failure: Option<&'a anyhow::Error>,
    pub(crate) cancelled: &'a dyn Fn() -> bool,
}

impl TaskContext<'_> {
    /// Owning process.
    #[must_use]
    pub const fn process_id(&self) -> ProcessId {
        self.process
    }

    /// Name of the running task.
    #[must_use]
    pub const fn task_name(&self) -> &str {
        self.task_name
    }

    /// The task's work instance as `W`.
    pub fn work<W: 'static>(&mut self) -> Option<&mut W> {
        self.work.as_deref_mut()?.downcast_mut::<W>()
    }

    /// Managed object bound for dependency `index`, as `T`.
    pub fn object<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        self.objects.get_mut(index)?.as_mut()?.get_mut::<T>()
    }

    /// Managed object for dependency `index` with its pool identity.
    #[must_use]
    pub fn pooled(&self, index: usize) -> Option<&PooledObject> {
        self.objects.get(index)?.as_ref()
    }

    /// Discard the object for dependency `index` instead of returning it.
    pub fn mark_lost(&mut self, index: usize) {
        if let Some(flag) = self.lost.get_mut(index) {
            *flag = true;
        }
    }

    /// Borrow the invocation argument as `T`.
    #[must_use]
    pub fn argument<T: 'static>(&self) -> Option<&T> {
        self.argument.as_ref()?.downcast_ref::<T>()
    }

    /// Take ownership of the invocation argument as `T`.
    pub fn take_argument<T: 'static>(&mut self) -> Option<T> {
        match self.argument.take()?.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(original) => {
                self.argument = Some(original);
                None
            }
        }
    }

    /// The failure being handled, for handler tasks.
    #[must_use]
    pub const fn failure(&self) -> Option<&anyhow::Error> {
        self.failure
    }

    /// Whether the process has been cancelled; long tasks may stop early.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        (self.cancelled)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("disk full")]
    struct DiskFull;

    #[derive(Debug, thiserror::Error)]
    #[error("write failed")]
    struct WriteFailed(#[source] DiskFull);

    fn names() -> GraphNames {
        GraphNames {
            teams: vec!["cpu".into()],
            works: vec!["session".into()],
            sources: vec!["db".into()],
        }
    }

    fn noop(_: &mut TaskContext<'_>) -> anyhow::Result<Outcome> {
        Ok(Outcome::Finish)
    }

    #[test]
    fn test_compile_resolves_links() {
        let graph = TaskGraph::compile(
            vec![
                TaskSpec::new("a", "cpu", noop)
                    .work("session")
                    .depends_on("db")
                    .next("b")
                    .on_failure::<DiskFull>("b"),
                TaskSpec::new("b", "cpu", noop),
            ],
            &names(),
        )
        .unwrap();

        let a = graph.get(graph.task_id("a").unwrap()).unwrap();
        assert_eq!(a.next, graph.task_id("b"));
        assert_eq!(a.work, Some(0));
        assert_eq!(a.dependencies[0].pool, 0);
        assert_eq!(a.handlers.len(), 1);
    }

    #[test]
    fn test_compile_rejects_unknown_names() {
        let err = TaskGraph::compile(vec![TaskSpec::new("a", "gpu", noop)], &names()).unwrap_err();
        assert!(matches!(err, KernelError::UnknownName { kind: "team", .. }));

        let err =
            TaskGraph::compile(vec![TaskSpec::new("a", "cpu", noop).next("z")], &names()).unwrap_err();
        assert!(matches!(err, KernelError::UnknownName { kind: "task", .. }));
    }

    #[test]
    fn test_most_specific_handler_wins() {
        let graph = TaskGraph::compile(
            vec![
                TaskSpec::new("a", "cpu", noop)
                    .on_any_failure("fallback")
                    .on_failure::<DiskFull>("disk")
                    .on_failure::<WriteFailed>("write"),
                TaskSpec::new("fallback", "cpu", noop),
                TaskSpec::new("disk", "cpu", noop),
                TaskSpec::new("write", "cpu", noop),
            ],
            &names(),
        )
        .unwrap();
        let a = graph.get(TaskId(0)).unwrap();

        let outer = anyhow::Error::new(WriteFailed(DiskFull));
        assert_eq!(a.handler_for(&outer), graph.task_id("write"));

        let inner = anyhow::Error::new(DiskFull).context("while flushing");
        assert_eq!(a.handler_for(&inner), graph.task_id("disk"));

        let other = anyhow::anyhow!("unrelated");
        assert_eq!(a.handler_for(&other), graph.task_id("fallback"));
    }
}
