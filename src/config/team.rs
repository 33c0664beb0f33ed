//! Team configuration.

use serde::{Deserialize, Serialize};

/// Default worker thread stack size (2 MiB).
pub const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

const MIN_STACK_SIZE: usize = 64 * 1024;

fn default_stack_size() -> usize {
    DEFAULT_STACK_SIZE
}

/// Execution strategy of a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamStrategy {
    /// A fresh thread per job, torn down on completion.
    ThreadPerJob,
    /// A fixed number of persistent workers pulling from a shared FIFO queue.
    FixedPool {
        /// Number of worker threads.
        workers: usize,
    },
    /// Exactly one worker thread with strict FIFO execution.
    SingleThread,
    /// Jobs run synchronously on the assigning thread.
    CallerRuns,
}

impl TeamStrategy {
    /// Maximum concurrently executing jobs, `None` when unbounded.
    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        match self {
            Self::ThreadPerJob | Self::CallerRuns => None,
            Self::FixedPool { workers } => Some(*workers),
            Self::SingleThread => Some(1),
        }
    }
}

/// Named team descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamConfig {
    /// Team name referenced by tasks.
    pub name: String,
    /// Execution strategy.
    pub strategy: TeamStrategy,
    /// Bounded queue capacity; `None` means unbounded.
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    /// Stack size for spawned threads.
    #[serde(default = "default_stack_size")]
    pub thread_stack_size: usize,
}

impl TeamConfig {
    /// A team with `workers` persistent threads.
    pub fn fixed_pool(name: impl Into<String>, workers: usize) -> Self {
        Self::with_strategy(name, TeamStrategy::FixedPool { workers })
    }

    /// A fixed pool sized to the number of logical CPUs.
    pub fn fixed_pool_per_cpu(name: impl Into<String>) -> Self {
        Self::fixed_pool(name, num_cpus::get())
    }

    /// A team spawning one thread per job.
    pub fn thread_per_job(name: impl Into<String>) -> Self {
        Self::with_strategy(name, TeamStrategy::ThreadPerJob)
    }

    /// A team with a single dedicated worker.
    pub fn single_thread(name: impl Into<String>) -> Self {
        Self::with_strategy(name, TeamStrategy::SingleThread)
    }

    /// A team running jobs on the caller's thread.
    pub fn caller_runs(name: impl Into<String>) -> Self {
        Self::with_strategy(name, TeamStrategy::CallerRuns)
    }

    fn with_strategy(name: impl Into<String>, strategy: TeamStrategy) -> Self {
        Self {
            name: name.into(),
            strategy,
            queue_capacity: None,
            thread_stack_size: DEFAULT_STACK_SIZE,
        }
    }

    /// Bound the job queue, making `assign` block when full.
    #[must_use]
    pub const fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Validate team configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("team name must not be empty".into());
        }
        if let TeamStrategy::FixedPool { workers } = self.strategy {
            if workers == 0 {
                return Err("fixed pool workers must be greater than 0".into());
            }
        }
        if self.queue_capacity == Some(0) {
            return Err("queue_capacity must be greater than 0".into());
        }
        if self.thread_stack_size < MIN_STACK_SIZE {
            return Err(format!("thread_stack_size must be at least {MIN_STACK_SIZE}"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_capacity() {
        assert_eq!(TeamStrategy::FixedPool { workers: 3 }.capacity(), Some(3));
        assert_eq!(TeamStrategy::SingleThread.capacity(), Some(1));
        assert_eq!(TeamStrategy::ThreadPerJob.capacity(), None);
        assert_eq!(TeamStrategy::CallerRuns.capacity(), None);
    }

    #[test]
    fn test_strategy_serde_tag() {
        let json = r#"{"name":"cpu","strategy":{"kind":"fixed_pool","workers":4}}"#;
        let cfg: TeamConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.strategy, TeamStrategy::FixedPool { workers: 4 });
        assert_eq!(cfg.thread_stack_size, DEFAULT_STACK_SIZE);
        assert!(cfg.queue_capacity.is_none());
    }
}
