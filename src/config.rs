use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Per-manager supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    /// Human-readable name used in logs and status output
    pub display_name: String,
    /// Delay before this manager is launched at boot
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// How often the boot supervisor checks this manager's liveness
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Whether the boot supervisor restarts this manager when it dies
    #[serde(default = "default_critical")]
    pub critical: bool,
}

impl ManagerSettings {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

fn default_startup_delay() -> u64 {
    1
}

fn default_health_interval() -> u64 {
    30
}

fn default_critical() -> bool {
    true
}

/// Process-wide supervision configuration, loaded once at startup and passed
/// by reference into every manager and the boot supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Component reconciliation interval
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Delay after spawn before a component counts as running
    #[serde(default = "default_confirm_delay")]
    pub confirm_delay_ms: u64,
    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// First restart backoff after a crash
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Upper bound for restart backoff
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Managers keyed by affinity
    #[serde(default)]
    pub managers: BTreeMap<String, ManagerSettings>,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_confirm_delay() -> u64 {
    500
}

fn default_stop_grace() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let mut managers = BTreeMap::new();
        managers.insert(
            "daemon_manager".to_string(),
            ManagerSettings {
                display_name: "Daemon Manager".to_string(),
                startup_delay_secs: 1,
                health_check_interval_secs: 30,
                critical: true,
            },
        );
        managers.insert(
            "nano_manager".to_string(),
            ManagerSettings {
                display_name: "Nano Manager".to_string(),
                startup_delay_secs: 1,
                health_check_interval_secs: 30,
                critical: true,
            },
        );
        managers.insert(
            "main_llm_manager".to_string(),
            ManagerSettings {
                display_name: "Main LLM Manager".to_string(),
                startup_delay_secs: 2,
                health_check_interval_secs: 60,
                critical: false,
            },
        );

        Self {
            poll_interval_secs: default_poll_interval(),
            confirm_delay_ms: default_confirm_delay(),
            stop_grace_secs: default_stop_grace(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            managers,
        }
    }
}

impl SupervisorConfig {
    /// Load from the warden config file, falling back to built-in defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&crate::clienv::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading supervisor config");

        if !path.exists() {
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(managers = config.managers.len(), "Supervisor config loaded");
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn confirm_delay(&self) -> Duration {
        Duration::from_millis(self.confirm_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn manager(&self, affinity: &str) -> Option<&ManagerSettings> {
        self.managers.get(affinity)
    }
}
