//! Root kernel configuration and loading.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{ListenerConfig, ManagedObjectConfig, TeamConfig};

/// Environment variable naming the JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "TEAM_KERNEL_CONFIG";
/// Environment variable overriding the shutdown timeout.
pub const SHUTDOWN_TIMEOUT_ENV: &str = "TEAM_KERNEL_SHUTDOWN_TIMEOUT_MS";

const fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

/// Root kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Team descriptors.
    #[serde(default)]
    pub teams: Vec<TeamConfig>,
    /// Pool policy per managed object source name.
    #[serde(default)]
    pub managed_objects: HashMap<String, ManagedObjectConfig>,
    /// Listener descriptors keyed by listener name.
    #[serde(default)]
    pub listeners: HashMap<String, ListenerConfig>,
    /// How long `close_kernel` waits for in-flight processes.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            teams: Vec::new(),
            managed_objects: HashMap::new(),
            listeners: HashMap::new(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl KernelConfig {
    /// Shutdown timeout as a duration.
    #[must_use]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Validate all descriptors and reject duplicate team names.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for team in &self.teams {
            team.validate()
                .map_err(|e| format!("team `{}` invalid: {e}", team.name))?;
            if !seen.insert(team.name.as_str()) {
                return Err(format!("duplicate team `{}`", team.name));
            }
        }
        for (name, mo) in &self.managed_objects {
            mo.validate()
                .map_err(|e| format!("managed object `{name}` invalid: {e}"))?;
        }
        for (name, listener) in &self.listeners {
            listener
                .validate()
                .map_err(|e| format!("listener `{name}` invalid: {e}"))?;
        }
        if self.shutdown_timeout_ms == 0 {
            return Err("shutdown_timeout_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse kernel configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from the environment.
    ///
    /// A `.env` file is honoured when present. The JSON file named by
    /// `TEAM_KERNEL_CONFIG` is parsed if set, otherwise defaults are used;
    /// `TEAM_KERNEL_SHUTDOWN_TIMEOUT_MS` overrides the shutdown timeout.
    pub fn load() -> Result<Self, String> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(format!(".env error: {e}"));
            }
        }
        let mut cfg = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| format!("read `{path}`: {e}"))?;
                serde_json::from_str(&raw).map_err(|e| format!("parse error: {e}"))?
            }
            Err(_) => Self::default(),
        };
        if let Ok(raw) = std::env::var(SHUTDOWN_TIMEOUT_ENV) {
            cfg.shutdown_timeout_ms = raw
                .parse()
                .map_err(|e| format!("{SHUTDOWN_TIMEOUT_ENV} invalid: {e}"))?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
