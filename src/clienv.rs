//! Environment variables and derived filesystem paths.
//!
//! Every path warden touches is resolved here so the rest of the crate never
//! reads `std::env` directly.

use std::path::PathBuf;

pub const ENV_DATA_DIR: &str = "WARDEN_DATA_DIR";
pub const ENV_DB: &str = "WARDEN_DB";
pub const ENV_CONFIG_DIR: &str = "WARDEN_CONFIG_DIR";
pub const ENV_RUNTIME: &str = "WARDEN_RUNTIME";
pub const ENV_COMPONENTS_DIR: &str = "WARDEN_COMPONENTS_DIR";

const WARDEN_SUBDIR: &str = "warden";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const FALLBACK_CONFIG_DIR: &str = "~/.config";

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Warden data directory ($WARDEN_DATA_DIR or ~/.local/share/warden)
pub fn data_dir() -> PathBuf {
    let dir = env_opt(ENV_DATA_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
                .join(WARDEN_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Warden config directory ($WARDEN_CONFIG_DIR or ~/.config/warden)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(ENV_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(WARDEN_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Store path ($WARDEN_DB or <data_dir>/warden.db)
pub fn db_path() -> PathBuf {
    let path = env_opt(ENV_DB)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("warden.db"));
    tracing::trace!(path = %path.display(), "Store path");
    path
}

/// PID file directory (<data_dir>/pids)
pub fn pid_dir() -> PathBuf {
    data_dir().join("pids")
}

/// Component log directory (<data_dir>/logs)
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Manager log directory (<data_dir>/logs_managers)
pub fn manager_logs_dir() -> PathBuf {
    data_dir().join("logs_managers")
}

/// Component executables directory ($WARDEN_COMPONENTS_DIR or
/// <data_dir>/components). Relative `base_script_name` values resolve here.
pub fn components_dir() -> PathBuf {
    let dir = env_opt(ENV_COMPONENTS_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("components"));
    tracing::trace!(dir = %dir.display(), "Resolved components directory");
    dir
}

/// Boot supervisor PID file (<data_dir>/pids/supervisor.pid)
pub fn supervisor_pid_path() -> PathBuf {
    pid_dir().join("supervisor.pid")
}

/// Supervisor config file (<config_dir>/config.toml)
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Optional isolated runtime interpreter ($WARDEN_RUNTIME).
///
/// When set, component executables are launched through this interpreter
/// instead of being executed directly. Affects spawn parameters only.
pub fn runtime_interpreter() -> Option<PathBuf> {
    let val = env_opt(ENV_RUNTIME).map(PathBuf::from);
    tracing::trace!(value = ?val, "WARDEN_RUNTIME env var");
    val
}
