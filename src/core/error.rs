//! Error types for kernel operations.

use thiserror::Error;

/// Errors produced by kernel components.
#[derive(Debug, Error)]
pub enum KernelError {
    /// The team has been stopped and no longer accepts jobs.
    #[error("team `{0}` is stopped")]
    TeamStopped(String),
    /// A bounded team queue rejected the job.
    #[error("queue full: {0}")]
    QueueFull(String),
    /// No instance could be sourced and the waiter queue is at capacity.
    #[error("managed object pool `{0}` exhausted")]
    PoolExhausted(String),
    /// An instance was returned or lost without being borrowed.
    #[error("instance {instance} is not borrowed from pool `{pool}`")]
    NotBorrowed {
        /// Pool name.
        pool: String,
        /// Instance identifier.
        instance: u64,
    },
    /// A name referenced during graph compilation does not exist.
    #[error("unknown {kind} `{name}`")]
    UnknownName {
        /// Kind of the referenced item (task, team, work, source).
        kind: &'static str,
        /// The unresolved name.
        name: String,
    },
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The process was cancelled.
    #[error("process cancelled")]
    Cancelled,
    /// Escalations exceeded the per-process depth limit.
    #[error("escalation depth exceeded ({0})")]
    EscalationDepth(usize),
    /// The task panicked while executing.
    #[error("task `{task}` panicked: {message}")]
    TaskPanicked {
        /// Task name.
        task: String,
        /// Panic payload rendered as text.
        message: String,
    },
    /// The kernel is not in a state that permits the operation.
    #[error("kernel state: {0}")]
    KernelState(String),
    /// Outbound queue for a connection is over its threshold.
    #[error("connection {0} is applying backpressure")]
    Backpressure(u64),
    /// The connection has already been closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(u64),
    /// The peer sent bytes the protocol could not decode.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// TLS context or session failure.
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KernelError::TeamStopped("io".into());
        assert_eq!(err.to_string(), "team `io` is stopped");

        let err = KernelError::NotBorrowed {
            pool: "db".into(),
            instance: 7,
        };
        assert_eq!(err.to_string(), "instance 7 is not borrowed from pool `db`");

        let err = KernelError::UnknownName {
            kind: "task",
            name: "missing".into(),
        };
        assert_eq!(err.to_string(), "unknown task `missing`");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: KernelError = io.into();
        assert!(matches!(err, KernelError::Io(_)));
    }
}
