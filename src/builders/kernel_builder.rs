//! Builder assembling a [`Kernel`] from descriptors.
//!
//! Everything is registered by name. `build()` resolves names into index
//! links once (teams, works, sources, tasks, handlers) and fails fast on
//! anything that does not resolve.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::{KernelConfig, ListenerConfig, ManagedObjectConfig, TeamConfig};
use crate::core::engine::EngineParts;
use crate::core::{
    Argument, Engine, EscalationSink, GraphNames, KernelError, LoggingEscalationSink,
    ManagedObjectPool, ManagedObjectSource, TaskGraph, TaskId, TaskSpec, Team, WorkFactory,
};
use crate::infra::protocol::CommunicationProtocol;
use crate::infra::socket::{EngineDispatch, SocketManager};
use crate::runtime::kernel::{Kernel, PendingListener};

type PoolFactory =
    Box<dyn FnOnce(usize, ManagedObjectConfig) -> Result<ManagedObjectPool, KernelError>>;

type ListenerFactory = Box<
    dyn FnOnce(String, ListenerConfig, Arc<Engine>, TaskId) -> Result<SocketManager, KernelError>
        + Send,
>;

struct SourceEntry {
    name: String,
    config: Option<ManagedObjectConfig>,
    factory: PoolFactory,
}

struct ListenerEntry {
    name: String,
    config: Option<ListenerConfig>,
    task: String,
    factory: ListenerFactory,
}

/// Collects kernel descriptors before start-up.
pub struct KernelBuilder {
    teams: Vec<TeamConfig>,
    works: Vec<(String, WorkFactory)>,
    sources: Vec<SourceEntry>,
    tasks: Vec<TaskSpec>,
    startup: Vec<(String, Option<Argument>)>,
    listeners: Vec<ListenerEntry>,
    object_configs: HashMap<String, ManagedObjectConfig>,
    listener_configs: HashMap<String, ListenerConfig>,
    process_handler: Option<String>,
    sink: Option<Arc<dyn EscalationSink>>,
    shutdown_timeout: Duration,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::from_config(KernelConfig::default())
    }
}

impl KernelBuilder {
    /// Empty builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder seeded with the teams, pool policies and listener settings of
    /// `config`. Sources, tasks and listeners are still registered in code;
    /// their names pick up the matching configuration entries.
    #[must_use]
    pub fn from_config(config: KernelConfig) -> Self {
        let shutdown_timeout = config.shutdown_timeout();
        Self {
            teams: config.teams,
            works: Vec::new(),
            sources: Vec::new(),
            tasks: Vec::new(),
            startup: Vec::new(),
            listeners: Vec::new(),
            object_configs: config.managed_objects,
            listener_configs: config.listeners,
            process_handler: None,
            sink: None,
            shutdown_timeout,
        }
    }

    /// Register a team.
    #[must_use]
    pub fn team(mut self, config: TeamConfig) -> Self {
        self.teams.push(config);
        self
    }

    /// Register a work type; one instance is created per process on first use.
    #[must_use]
    pub fn work<W, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        W: Any + Send,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let factory: WorkFactory = Arc::new(move || Box::new(factory()) as Box<dyn Any + Send>);
        self.works.push((name.into(), factory));
        self
    }

    /// Register a managed object source using the configured (or default)
    /// pool policy for `name`.
    #[must_use]
    pub fn managed_object<S: ManagedObjectSource>(self, name: impl Into<String>, source: S) -> Self {
        self.add_source(name.into(), None, source)
    }

    /// Register a managed object source with an explicit pool policy.
    #[must_use]
    pub fn managed_object_with<S: ManagedObjectSource>(
        self,
        name: impl Into<String>,
        config: ManagedObjectConfig,
        source: S,
    ) -> Self {
        self.add_source(name.into(), Some(config), source)
    }

    fn add_source<S: ManagedObjectSource>(
        mut self,
        name: String,
        config: Option<ManagedObjectConfig>,
        source: S,
    ) -> Self {
        let pool_name = name.clone();
        self.sources.push(SourceEntry {
            name,
            config,
            factory: Box::new(move |index, config| {
                ManagedObjectPool::new(pool_name, index, config, source)
            }),
        });
        self
    }

    /// Register a task.
    #[must_use]
    pub fn task(mut self, spec: TaskSpec) -> Self {
        self.tasks.push(spec);
        self
    }

    /// Start a process at `task` once, when the kernel opens.
    #[must_use]
    pub fn startup_job(mut self, task: impl Into<String>, argument: Option<Argument>) -> Self {
        self.startup.push((task.into(), argument));
        self
    }

    /// Handler task for failures no task-level handler claims.
    #[must_use]
    pub fn process_handler(mut self, task: impl Into<String>) -> Self {
        self.process_handler = Some(task.into());
        self
    }

    /// Kernel-level sink for unhandled escalations.
    #[must_use]
    pub fn escalation_sink<S: EscalationSink + 'static>(mut self, sink: S) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// How long `close_kernel` waits for in-flight processes.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Register a listener whose requests start processes at `task`.
    #[must_use]
    pub fn listener<P: CommunicationProtocol>(
        self,
        name: impl Into<String>,
        config: ListenerConfig,
        protocol: P,
        task: impl Into<String>,
    ) -> Self {
        self.add_listener(name.into(), Some(config), protocol, task.into())
    }

    /// Register a listener configured under `name` in the kernel config.
    #[must_use]
    pub fn configured_listener<P: CommunicationProtocol>(
        self,
        name: impl Into<String>,
        protocol: P,
        task: impl Into<String>,
    ) -> Self {
        self.add_listener(name.into(), None, protocol, task.into())
    }

    fn add_listener<P: CommunicationProtocol>(
        mut self,
        name: String,
        config: Option<ListenerConfig>,
        protocol: P,
        task: String,
    ) -> Self {
        self.listeners.push(ListenerEntry {
            name,
            config,
            task,
            factory: Box::new(move |name, config, engine, task| {
                SocketManager::bind(name, config, protocol, EngineDispatch::new(engine, task))
            }),
        });
        self
    }

    /// Resolve every name and assemble the kernel. Nothing is started.
    ///
    /// # Errors
    ///
    /// - `KernelError::InvalidConfig` for invalid descriptors or duplicates
    /// - `KernelError::UnknownName` for references that do not resolve
    pub fn build(self) -> Result<Kernel, KernelError> {
        let names = GraphNames {
            teams: self.teams.iter().map(|t| t.name.clone()).collect(),
            works: self.works.iter().map(|(n, _)| n.clone()).collect(),
            sources: self.sources.iter().map(|s| s.name.clone()).collect(),
        };
        reject_duplicates("team", &names.teams)?;
        reject_duplicates("work", &names.works)?;
        reject_duplicates("managed object source", &names.sources)?;

        let teams = self
            .teams
            .into_iter()
            .map(|config| Team::new(config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        let mut pools = Vec::with_capacity(self.sources.len());
        for (index, entry) in self.sources.into_iter().enumerate() {
            let config = entry
                .config
                .or_else(|| self.object_configs.get(&entry.name).cloned())
                .unwrap_or_default();
            pools.push(Arc::new((entry.factory)(index, config)?));
        }

        let graph = TaskGraph::compile(self.tasks, &names)?;
        let resolve = |name: &str| {
            graph.task_id(name).ok_or_else(|| KernelError::UnknownName {
                kind: "task",
                name: name.to_string(),
            })
        };
        let process_handler = self.process_handler.as_deref().map(resolve).transpose()?;
        let startup = self
            .startup
            .into_iter()
            .map(|(task, argument)| -> Result<(TaskId, Option<Argument>), KernelError> {
                Ok((resolve(&task)?, argument))
            })
            .collect::<Result<Vec<_>, KernelError>>()?;

        let mut listeners = Vec::with_capacity(self.listeners.len());
        for entry in self.listeners {
            let config = entry
                .config
                .or_else(|| self.listener_configs.get(&entry.name).cloned())
                .ok_or_else(|| KernelError::UnknownName {
                    kind: "listener configuration",
                    name: entry.name.clone(),
                })?;
            config.validate().map_err(|e| {
                KernelError::InvalidConfig(format!("listener `{}` invalid: {e}", entry.name))
            })?;
            let task = resolve(&entry.task)?;
            let factory = entry.factory;
            let name = entry.name;
            listeners.push(PendingListener {
                name: name.clone(),
                bind: Box::new(move |engine| factory(name, config, engine, task)),
            });
        }

        debug!(
            teams = teams.len(),
            pools = pools.len(),
            tasks = graph.len(),
            listeners = listeners.len(),
            "kernel assembled"
        );

        let engine = Engine::new(EngineParts {
            graph,
            works: self.works.into_iter().map(|(_, factory)| factory).collect(),
            teams,
            pools,
            sink: self
                .sink
                .unwrap_or_else(|| Arc::new(LoggingEscalationSink)),
            process_handler,
        });
        Ok(Kernel::new(engine, startup, listeners, self.shutdown_timeout))
    }
}

fn reject_duplicates(kind: &str, names: &[String]) -> Result<(), KernelError> {
    let mut seen = std::collections::HashSet::with_capacity(names.len());
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(KernelError::InvalidConfig(format!("duplicate {kind} `{name}`")));
        }
    }
    Ok(())
}

impl std::fmt::Debug for KernelBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelBuilder")
            .field("teams", &self.teams)
            .field("works", &self.works.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("sources", &self.sources.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("tasks", &self.tasks)
            .field("listeners", &self.listeners.iter().map(|l| &l.name).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{source_fn, Outcome};

    fn noop(_: &mut crate::core::TaskContext<'_>) -> anyhow::Result<Outcome> {
        Ok(Outcome::Finish)
    }

    #[test]
    fn test_build_resolves_names() {
        let kernel = KernelBuilder::new()
            .team(TeamConfig::single_thread("io"))
            .managed_object("db", source_fn(|| Ok(0_u8)))
            .task(TaskSpec::new("a", "io", noop).depends_on("db"))
            .process_handler("a")
            .startup_job("a", None)
            .build()
            .unwrap();
        assert!(kernel.task_id("a").is_some());
        assert!(kernel.engine().pool("db").is_some());
    }

    #[test]
    fn test_build_rejects_unknown_startup_task() {
        let err = KernelBuilder::new()
            .team(TeamConfig::single_thread("io"))
            .startup_job("missing", None)
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::UnknownName { kind: "task", .. }));
    }

    #[test]
    fn test_build_rejects_duplicate_sources() {
        let err = KernelBuilder::new()
            .managed_object("db", source_fn(|| Ok(0_u8)))
            .managed_object("db", source_fn(|| Ok(1_u8)))
            .build()
            .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn test_listener_requires_configuration() {
        let err = KernelBuilder::new()
            .team(TeamConfig::single_thread("io"))
            .task(TaskSpec::new("serve", "io", noop))
            .configured_listener("web", crate::infra::HttpProtocol::default(), "serve")
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::UnknownName {
                kind: "listener configuration",
                ..
            }
        ));
    }
}
