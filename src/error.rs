use thiserror::Error;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("component not found: {0}")]
    ComponentNotFound(String),

    #[error("unknown manager affinity '{affinity}' (referenced by component '{component}')")]
    UnknownAffinity { affinity: String, component: String },

    #[error("failed to spawn component '{component}': {reason}")]
    SpawnFailed { component: String, reason: String },

    #[error("failed to stop process {pid} for '{component}'")]
    StopFailed { component: String, pid: u32 },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;
