//! Managed object source configuration.

use serde::{Deserialize, Serialize};

fn default_max_waiters() -> usize {
    1024
}

/// Pooling policy for a managed object source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedObjectConfig {
    /// Whether returned instances are kept idle for reuse.
    #[serde(default = "default_pooled")]
    pub pooled: bool,
    /// Upper bound on live instances (idle + borrowed); `None` is unbounded.
    #[serde(default)]
    pub max_size: Option<usize>,
    /// Maximum requests queued while the pool is at its bound.
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,
}

const fn default_pooled() -> bool {
    true
}

impl Default for ManagedObjectConfig {
    fn default() -> Self {
        Self::pooled(None)
    }
}

impl ManagedObjectConfig {
    /// Pooled source with an optional size bound.
    #[must_use]
    pub fn pooled(max_size: Option<usize>) -> Self {
        Self {
            pooled: true,
            max_size,
            max_waiters: default_max_waiters(),
        }
    }

    /// Unpooled source: every request constructs a fresh instance.
    #[must_use]
    pub fn eager() -> Self {
        Self {
            pooled: false,
            max_size: None,
            max_waiters: default_max_waiters(),
        }
    }

    /// Set the waiter queue bound.
    #[must_use]
    pub const fn with_max_waiters(mut self, max_waiters: usize) -> Self {
        self.max_waiters = max_waiters;
        self
    }

    /// Validate pool policy values.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == Some(0) {
            return Err("max_size must be greater than 0".into());
        }
        Ok(())
    }
}
