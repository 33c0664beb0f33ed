//! Socket listener configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_bind() -> String {
    "127.0.0.1:0".into()
}

fn default_selector_loops() -> usize {
    num_cpus::get()
}

const fn default_buffer_size() -> usize {
    8 * 1024
}

const fn default_backpressure_threshold() -> usize {
    1024 * 1024
}

const fn default_idle_timeout_ms() -> u64 {
    60_000
}

const fn default_housekeeping_interval_ms() -> u64 {
    1_000
}

/// PEM files making up a TLS server context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain, leaf first.
    pub cert_path: PathBuf,
    /// PKCS#8, PKCS#1 or SEC1 private key.
    pub key_path: PathBuf,
}

/// Listener descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address, e.g. `0.0.0.0:8080`.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Number of selector loops (each on its own thread).
    #[serde(default = "default_selector_loops")]
    pub selector_loops: usize,
    /// Size of pooled read buffers.
    #[serde(default = "default_buffer_size")]
    pub read_buffer_size: usize,
    /// Maximum size of each encoded write buffer.
    #[serde(default = "default_buffer_size")]
    pub write_buffer_size: usize,
    /// Queued outbound bytes above which writes are refused.
    #[serde(default = "default_backpressure_threshold")]
    pub backpressure_threshold: usize,
    /// Inactivity period after which a connection is closed.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Upper bound on a single readiness wait.
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
    /// Optional TLS context.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            selector_loops: default_selector_loops(),
            read_buffer_size: default_buffer_size(),
            write_buffer_size: default_buffer_size(),
            backpressure_threshold: default_backpressure_threshold(),
            idle_timeout_ms: default_idle_timeout_ms(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            tls: None,
        }
    }
}

impl ListenerConfig {
    /// Listener bound to `bind` with default tuning.
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            ..Self::default()
        }
    }

    /// Set the selector loop count.
    #[must_use]
    pub const fn with_selector_loops(mut self, loops: usize) -> Self {
        self.selector_loops = loops;
        self
    }

    /// Set the write buffer size used when encoding responses.
    #[must_use]
    pub const fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the read buffer size.
    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the backpressure threshold in bytes.
    #[must_use]
    pub const fn with_backpressure_threshold(mut self, bytes: usize) -> Self {
        self.backpressure_threshold = bytes;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub const fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// Set the upper bound on a single readiness wait.
    #[must_use]
    pub const fn with_housekeeping_interval_ms(mut self, ms: u64) -> Self {
        self.housekeeping_interval_ms = ms;
        self
    }

    /// Enable TLS from PEM files.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Idle timeout as a duration.
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Housekeeping interval as a duration.
    #[must_use]
    pub const fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    /// Parsed bind address.
    pub fn bind_addr(&self) -> Result<SocketAddr, String> {
        self.bind
            .parse()
            .map_err(|e| format!("bind `{}` invalid: {e}", self.bind))
    }

    /// Validate listener values.
    pub fn validate(&self) -> Result<(), String> {
        self.bind_addr()?;
        if self.selector_loops == 0 {
            return Err("selector_loops must be greater than 0".into());
        }
        if self.read_buffer_size == 0 || self.write_buffer_size == 0 {
            return Err("buffer sizes must be greater than 0".into());
        }
        if self.backpressure_threshold == 0 {
            return Err("backpressure_threshold must be greater than 0".into());
        }
        if self.idle_timeout_ms == 0 || self.housekeeping_interval_ms == 0 {
            return Err("timeouts must be greater than 0".into());
        }
        Ok(())
    }
}
