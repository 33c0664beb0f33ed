//! Kernel lifecycle: `open_kernel` / `close_kernel`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::builders::KernelBuilder;
use crate::core::{
    Argument, Engine, EngineStats, KernelError, ManagedObjectPoolStats, ProcessHandle, TaskId,
    TeamStats,
};
use crate::infra::socket::{SocketManager, SocketStats};

/// Listener resolved at build time, bound when the kernel opens.
pub(crate) struct PendingListener {
    pub name: String,
    pub bind: Box<dyn FnOnce(Arc<Engine>) -> Result<SocketManager, KernelError> + Send>,
}

/// Lifecycle of a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    /// Built, nothing started.
    Built,
    /// Teams and listeners running.
    Open,
    /// Shut down; cannot be reopened.
    Closed,
}

struct Lifecycle {
    state: KernelState,
    startup: Vec<(TaskId, Option<Argument>)>,
    pending: Vec<PendingListener>,
    listeners: Vec<SocketManager>,
    startup_processes: Vec<ProcessHandle>,
}

/// Execution kernel: engine, teams, pools and listeners under one lifecycle.
pub struct Kernel {
    engine: Arc<Engine>,
    lifecycle: Mutex<Lifecycle>,
    shutdown_timeout: Duration,
}

impl Kernel {
    pub(crate) fn new(
        engine: Arc<Engine>,
        startup: Vec<(TaskId, Option<Argument>)>,
        pending: Vec<PendingListener>,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            lifecycle: Mutex::new(Lifecycle {
                state: KernelState::Built,
                startup,
                pending,
                listeners: Vec::new(),
                startup_processes: Vec::new(),
            }),
            shutdown_timeout,
        }
    }

    /// Start describing a kernel.
    #[must_use]
    pub fn builder() -> KernelBuilder {
        KernelBuilder::new()
    }

    /// The execution engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> KernelState {
        self.lifecycle.lock().state
    }

    /// Resolve a task name.
    #[must_use]
    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.engine.task_id(name)
    }

    /// Add a startup job; only allowed before `open_kernel`.
    ///
    /// # Errors
    ///
    /// - `KernelError::UnknownName` if `task` does not exist
    /// - `KernelError::KernelState` once the kernel has been opened
    pub fn register_startup_job(
        &self,
        task: &str,
        argument: Option<Argument>,
    ) -> Result<(), KernelError> {
        let id = self.task_id(task).ok_or_else(|| KernelError::UnknownName {
            kind: "task",
            name: task.to_string(),
        })?;
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.state != KernelState::Built {
            return Err(KernelError::KernelState(
                "startup jobs must be registered before open".into(),
            ));
        }
        lifecycle.startup.push((id, argument));
        Ok(())
    }

    /// Start all teams, bind all listeners, then run the startup jobs.
    ///
    /// Opening an open kernel is a no-op.
    ///
    /// # Errors
    ///
    /// - `KernelError::KernelState` if the kernel was closed
    /// - team or listener start-up failures; everything already started is
    ///   stopped again and the kernel is closed
    pub fn open_kernel(&self) -> Result<(), KernelError> {
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.state {
            KernelState::Open => return Ok(()),
            KernelState::Closed => {
                return Err(KernelError::KernelState("kernel is closed".into()));
            }
            KernelState::Built => {}
        }

        if let Err(e) = self.start(&mut lifecycle) {
            warn!(error = %e, "kernel failed to open; rolling back");
            let listeners = std::mem::take(&mut lifecycle.listeners);
            lifecycle.state = KernelState::Closed;
            drop(lifecycle);
            self.stop_all(listeners);
            return Err(e);
        }

        lifecycle.state = KernelState::Open;
        let startup = std::mem::take(&mut lifecycle.startup);
        drop(lifecycle);

        // Caller-runs teams may execute startup jobs inline, so no lock here.
        let mut processes = Vec::with_capacity(startup.len());
        for (task, argument) in startup {
            match self.engine.invoke(task, argument) {
                Ok(handle) => processes.push(handle),
                Err(e) => warn!(task = task.index(), error = %e, "startup job not started"),
            }
        }
        let count = processes.len();
        self.lifecycle.lock().startup_processes = processes;
        info!(
            teams = self.engine.teams().len(),
            startup_jobs = count,
            "kernel open"
        );
        Ok(())
    }

    fn start(&self, lifecycle: &mut Lifecycle) -> Result<(), KernelError> {
        for team in self.engine.teams() {
            team.start()?;
        }
        for pending in std::mem::take(&mut lifecycle.pending) {
            let name = pending.name;
            let listener = (pending.bind)(Arc::clone(&self.engine)).map_err(|e| {
                warn!(listener = %name, error = %e, "listener failed to bind");
                e
            })?;
            lifecycle.listeners.push(listener);
        }
        Ok(())
    }

    /// Stop listeners, wait for in-flight processes up to the shutdown
    /// timeout, then stop every team. Idempotent.
    ///
    /// Returns whether every process finished before the teams stopped.
    pub fn close_kernel(&self) -> bool {
        let listeners = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == KernelState::Closed {
                return true;
            }
            let was_open = lifecycle.state == KernelState::Open;
            lifecycle.state = KernelState::Closed;
            if !was_open {
                return true;
            }
            std::mem::take(&mut lifecycle.listeners)
        };
        info!("kernel closing");
        self.stop_all(listeners)
    }

    fn stop_all(&self, listeners: Vec<SocketManager>) -> bool {
        for listener in &listeners {
            listener.shutdown();
        }
        let drained = self.engine.wait_idle(self.shutdown_timeout);
        if !drained {
            warn!(
                active = self.engine.active_processes(),
                timeout_ms = self.shutdown_timeout.as_millis(),
                "processes still running at shutdown"
            );
        }
        for team in self.engine.teams() {
            team.stop();
        }
        info!(drained, "kernel closed");
        drained
    }

    /// Start a process at `task`.
    ///
    /// # Errors
    ///
    /// - `KernelError::KernelState` unless the kernel is open
    /// - `KernelError::UnknownName` for an unknown task
    pub fn invoke(&self, task: TaskId, argument: Option<Argument>) -> Result<ProcessHandle, KernelError> {
        if self.state() != KernelState::Open {
            return Err(KernelError::KernelState("kernel is not open".into()));
        }
        self.engine.invoke(task, argument)
    }

    /// Start a process at the task named `task`.
    ///
    /// # Errors
    ///
    /// Same as [`Kernel::invoke`].
    pub fn invoke_named(&self, task: &str, argument: Option<Argument>) -> Result<ProcessHandle, KernelError> {
        let id = self.task_id(task).ok_or_else(|| KernelError::UnknownName {
            kind: "task",
            name: task.to_string(),
        })?;
        self.invoke(id, argument)
    }

    /// Processes started by startup jobs.
    #[must_use]
    pub fn startup_processes(&self) -> Vec<ProcessHandle> {
        self.lifecycle.lock().startup_processes.clone()
    }

    /// Bound address of the listener `name`.
    #[must_use]
    pub fn listener_addr(&self, name: &str) -> Option<SocketAddr> {
        self.lifecycle
            .lock()
            .listeners
            .iter()
            .find(|l| l.name() == name)
            .map(SocketManager::local_addr)
    }

    /// Statistics of the listener `name`.
    #[must_use]
    pub fn listener_stats(&self, name: &str) -> Option<SocketStats> {
        self.lifecycle
            .lock()
            .listeners
            .iter()
            .find(|l| l.name() == name)
            .map(SocketManager::stats)
    }

    /// Statistics of every team.
    #[must_use]
    pub fn team_stats(&self) -> Vec<TeamStats> {
        self.engine.teams().iter().map(|t| t.stats()).collect()
    }

    /// Statistics of the managed object pool `name`.
    #[must_use]
    pub fn pool_stats(&self, name: &str) -> Option<ManagedObjectPoolStats> {
        self.engine.pool(name).map(|p| p.stats())
    }

    /// Engine statistics.
    #[must_use]
    pub fn engine_stats(&self) -> EngineStats {
        self.engine.stats()
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        self.close_kernel();
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("state", &self.state())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}
