//! Named worker teams with selectable execution strategies.
//!
//! A [`Team`] executes [`TeamJob`]s according to its [`TeamStrategy`]:
//!
//! - **Fixed pool**: N persistent workers pull from one shared FIFO queue
//! - **Single thread**: a fixed pool of one, strictly serial
//! - **Thread per job**: a fresh thread per job, no queueing
//! - **Caller runs**: the job runs on the assigning thread, trampolined so
//!   long causal chains do not grow the call stack
//!
//! Strategies are a closed set selected by configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use team_kernel::config::TeamConfig;
//! use team_kernel::core::Team;
//!
//! let team = Team::new(TeamConfig::fixed_pool("cpu", 4))?;
//! team.start()?;
//! team.assign(Box::new(|| println!("hello from a worker")))?;
//! team.stop();
//! ```

mod caller_runs;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{TeamConfig, TeamStrategy};
use crate::core::KernelError;

/// Unit of work a team can execute.
///
/// Every job handed to a team ends in exactly one of `run` or `cancel`.
pub trait TeamJob: Send + 'static {
    /// Execute the job on the team's thread.
    fn run(self: Box<Self>);

    /// Report that the job will never run.
    fn cancel(self: Box<Self>, cause: KernelError);
}

impl<F> TeamJob for F
where
    F: FnOnce() + Send + 'static,
{
    fn run(self: Box<Self>) {
        (*self)();
    }

    fn cancel(self: Box<Self>, cause: KernelError) {
        warn!(error = %cause, "closure job cancelled");
    }
}

/// Snapshot of team activity.
#[derive(Debug, Clone, Default)]
pub struct TeamStats {
    /// Team name.
    pub name: String,
    /// Concurrency bound, `None` when unbounded.
    pub capacity: Option<usize>,
    /// Jobs accepted by `assign`.
    pub submitted: u64,
    /// Jobs waiting in the queue.
    pub queued: u64,
    /// Jobs currently executing.
    pub active: u64,
    /// Highest observed number of concurrently executing jobs.
    pub peak_active: u64,
    /// Jobs that finished running.
    pub completed: u64,
    /// Jobs reported as cancelled.
    pub cancelled: u64,
}

/// Internal counters for team statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct TeamCounters {
    pub submitted: AtomicU64,
    pub queued: AtomicU64,
    pub active: AtomicU64,
    pub peak_active: AtomicU64,
    pub completed: AtomicU64,
    pub cancelled: AtomicU64,
}

impl TeamCounters {
    /// Run a job while tracking active/peak/completed counts.
    pub(crate) fn execute(&self, job: Box<dyn TeamJob>) {
        let now_active = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active.fetch_max(now_active, Ordering::AcqRel);

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| job.run()));
        if outcome.is_err() {
            warn!("team job panicked; worker continues");
        }

        self.active.fetch_sub(1, Ordering::AcqRel);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn cancel(&self, job: Box<dyn TeamJob>, cause: KernelError) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
        job.cancel(cause);
    }

    fn snapshot(&self, name: &str, capacity: Option<usize>) -> TeamStats {
        TeamStats {
            name: name.to_string(),
            capacity,
            submitted: self.submitted.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            peak_active: self.peak_active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Live execution machinery for a started team.
enum Runner {
    Queue {
        tx: Sender<Box<dyn TeamJob>>,
        workers: Vec<JoinHandle<()>>,
    },
    ThreadPerJob {
        threads: Vec<JoinHandle<()>>,
        next_id: u64,
    },
    CallerRuns,
}

enum TeamState {
    Created,
    Running(Runner),
    Stopped,
}

/// A named worker team.
pub struct Team {
    config: TeamConfig,
    state: Mutex<TeamState>,
    counters: Arc<TeamCounters>,
}

impl Team {
    /// Create a team; no threads are spawned until [`Team::start`].
    ///
    /// # Errors
    ///
    /// Returns `KernelError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: TeamConfig) -> Result<Self, KernelError> {
        config.validate().map_err(KernelError::InvalidConfig)?;
        Ok(Self {
            config,
            state: Mutex::new(TeamState::Created),
            counters: Arc::new(TeamCounters::default()),
        })
    }

    /// Team name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Team strategy.
    #[must_use]
    pub const fn strategy(&self) -> TeamStrategy {
        self.config.strategy
    }

    /// Whether the team currently accepts jobs.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), TeamState::Running(_))
    }

    /// Begin accepting jobs. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `KernelError::Io` if a worker thread cannot be spawned.
    pub fn start(&self) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        if !matches!(*state, TeamState::Created) {
            return Ok(());
        }

        let runner = match self.config.strategy {
            TeamStrategy::FixedPool { workers } => self.spawn_queue(workers)?,
            TeamStrategy::SingleThread => self.spawn_queue(1)?,
            TeamStrategy::ThreadPerJob => Runner::ThreadPerJob {
                threads: Vec::new(),
                next_id: 0,
            },
            TeamStrategy::CallerRuns => Runner::CallerRuns,
        };
        *state = TeamState::Running(runner);

        info!(
            team = %self.config.name,
            strategy = ?self.config.strategy,
            queue_capacity = ?self.config.queue_capacity,
            "team started"
        );
        Ok(())
    }

    fn spawn_queue(&self, workers: usize) -> Result<Runner, KernelError> {
        let (tx, rx) = match self.config.queue_capacity {
            Some(capacity) => bounded::<Box<dyn TeamJob>>(capacity),
            None => unbounded::<Box<dyn TeamJob>>(),
        };
        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let spawned = worker::spawn_worker(
                &self.config.name,
                worker_id,
                rx.clone(),
                Arc::clone(&self.counters),
                self.config.thread_stack_size,
            );
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(KernelError::Io(e));
                }
            }
        }
        Ok(Runner::Queue {
            tx,
            workers: handles,
        })
    }

    /// Hand a job to the team.
    ///
    /// Blocks only when a bounded queue is full. A job that cannot be
    /// accepted is cancelled before this returns.
    ///
    /// # Errors
    ///
    /// - `KernelError::TeamStopped` if the team is not running
    /// - `KernelError::Io` if a thread-per-job thread cannot be spawned
    pub fn assign(&self, job: Box<dyn TeamJob>) -> Result<(), KernelError> {
        let mut state = self.state.lock();
        let runner = match &mut *state {
            TeamState::Running(runner) => runner,
            TeamState::Created | TeamState::Stopped => {
                drop(state);
                self.reject(job);
                return Err(KernelError::TeamStopped(self.config.name.clone()));
            }
        };

        match runner {
            Runner::Queue { tx, .. } => {
                let tx = tx.clone();
                drop(state);
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                if let Err(crossbeam_channel::SendError(job)) = tx.send(job) {
                    self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                    self.reject(job);
                    return Err(KernelError::TeamStopped(self.config.name.clone()));
                }
                Ok(())
            }
            Runner::ThreadPerJob { threads, next_id } => {
                threads.retain(|handle| !handle.is_finished());
                let id = *next_id;
                *next_id += 1;
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);

                let slot = Arc::new(Mutex::new(Some(job)));
                let thread_slot = Arc::clone(&slot);
                let counters = Arc::clone(&self.counters);
                let spawned = thread::Builder::new()
                    .name(format!("{}-job-{id}", self.config.name))
                    .stack_size(self.config.thread_stack_size)
                    .spawn(move || {
                        if let Some(job) = thread_slot.lock().take() {
                            counters.execute(job);
                        }
                    });
                match spawned {
                    Ok(handle) => {
                        threads.push(handle);
                        Ok(())
                    }
                    Err(e) => {
                        drop(state);
                        if let Some(job) = slot.lock().take() {
                            self.counters.cancel(
                                job,
                                KernelError::TeamStopped(self.config.name.clone()),
                            );
                        }
                        Err(KernelError::Io(e))
                    }
                }
            }
            Runner::CallerRuns => {
                drop(state);
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                caller_runs::run_trampolined(job, Arc::clone(&self.counters));
                Ok(())
            }
        }
    }

    /// Like [`Team::assign`], but never blocks on a full bounded queue.
    ///
    /// # Errors
    ///
    /// - `KernelError::QueueFull` if the bounded queue has no room; the job
    ///   is cancelled
    /// - any error [`Team::assign`] returns
    pub fn try_assign(&self, job: Box<dyn TeamJob>) -> Result<(), KernelError> {
        let queue = match &*self.state.lock() {
            TeamState::Running(Runner::Queue { tx, .. }) => Some(tx.clone()),
            _ => None,
        };
        let Some(tx) = queue else {
            return self.assign(job);
        };
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        match tx.try_send(job) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(job)) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                let name = self.config.name.clone();
                debug!(team = %name, "team queue full");
                self.counters.cancel(job, KernelError::QueueFull(name.clone()));
                Err(KernelError::QueueFull(name))
            }
            Err(TrySendError::Disconnected(job)) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                self.reject(job);
                Err(KernelError::TeamStopped(self.config.name.clone()))
            }
        }
    }

    /// Whether the calling thread is one of this team's queue workers.
    #[must_use]
    pub fn is_current_worker(&self) -> bool {
        worker::is_current(&self.counters)
    }

    fn reject(&self, job: Box<dyn TeamJob>) {
        debug!(team = %self.config.name, "job rejected by stopped team");
        self.counters
            .cancel(job, KernelError::TeamStopped(self.config.name.clone()));
    }

    /// Stop accepting jobs, let workers drain queued and in-flight jobs,
    /// then join them. Idempotent.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), TeamState::Stopped);
        let TeamState::Running(runner) = previous else {
            return;
        };

        info!(team = %self.config.name, "stopping team");
        let current = thread::current().id();
        let handles = match runner {
            Runner::Queue { tx, workers } => {
                // Workers exit once the queue is drained and every sender is gone.
                drop(tx);
                workers
            }
            Runner::ThreadPerJob { threads, .. } => threads,
            Runner::CallerRuns => Vec::new(),
        };

        let mut joined = 0usize;
        for handle in handles {
            if handle.thread().id() == current {
                warn!(team = %self.config.name, "stop called from own worker; not joining self");
                continue;
            }
            if handle.join().is_err() {
                warn!(team = %self.config.name, "team thread panicked");
            }
            joined += 1;
        }
        info!(team = %self.config.name, joined, "team stopped");
    }

    /// Current team statistics.
    #[must_use]
    pub fn stats(&self) -> TeamStats {
        self.counters
            .snapshot(&self.config.name, self.config.strategy.capacity())
    }
}

impl Drop for Team {
    fn drop(&mut self) {
        // Dropping the sender lets queue workers drain and exit on their own.
        let state = std::mem::replace(self.state.get_mut(), TeamState::Stopped);
        if let TeamState::Running(_) = state {
            debug!(team = %self.config.name, "team dropped without explicit stop - threads detached");
        }
    }
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("name", &self.config.name)
            .field("strategy", &self.config.strategy)
            .finish_non_exhaustive()
    }
}
