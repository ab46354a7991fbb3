use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Administrator-declared target state for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DesiredState {
    Active,
    Inactive,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredState::Active => "active",
            DesiredState::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(DesiredState::Active),
            "inactive" => Some(DesiredState::Inactive),
            _ => None,
        }
    }
}

/// One row of `autorun_components`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub component_id: String,
    pub base_script_name: String,
    pub manager_affinity: String,
    pub desired_state: DesiredState,
    pub launch_args_json: String,
    pub run_type_on_boot: String,
    pub description: Option<String>,
}

impl ComponentRecord {
    /// Decode `launch_args_json` (a flat JSON object) into `key value`
    /// argument pairs. An unparseable value is logged and treated as empty.
    pub fn launch_args(&self) -> Vec<String> {
        let raw = self.launch_args_json.trim();
        if raw.is_empty() || raw == "{}" {
            return Vec::new();
        }
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(map) => {
                let mut args = Vec::with_capacity(map.len() * 2);
                for (key, value) in map {
                    args.push(key);
                    match value {
                        // empty or null value means a bare flag
                        serde_json::Value::String(s) if s.is_empty() => {}
                        serde_json::Value::Null => {}
                        serde_json::Value::String(s) => args.push(s),
                        other => args.push(other.to_string()),
                    }
                }
                args
            }
            Err(e) => {
                tracing::warn!(
                    component = %self.component_id,
                    error = %e,
                    "Could not parse launch_args_json, launching without extra args"
                );
                Vec::new()
            }
        }
    }
}

/// Event kinds written to `component_lifecycle_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Stop,
    Crash,
    Error,
    ManagerEvent,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::Stop => "stop",
            EventKind::Crash => "crash",
            EventKind::Error => "error",
            EventKind::ManagerEvent => "manager-event",
        }
    }
}

/// One row of `component_lifecycle_log`, as read back for status queries.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub id: i64,
    pub component_id: String,
    pub event_kind: String,
    pub pid: Option<u32>,
    pub detail: Option<String>,
    pub manager_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of `llm_notifications`.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: i64,
    pub recipient: String,
    pub kind: String,
    pub payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of `llm_io_config`.
#[derive(Debug, Clone)]
pub struct IoConfig {
    pub llm_id: String,
    pub input_tables_csv: String,
    pub output_table: String,
    pub needs_reload: bool,
}

impl IoConfig {
    /// Input tables in listed order.
    pub fn input_tables(&self) -> Vec<String> {
        self.input_tables_csv
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

/// One row of the designated output channel (`llm_outputs`).
#[derive(Debug, Clone)]
pub struct OutputRow {
    pub id: i64,
    pub llm_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// One row of `system_metrics_log`.
#[derive(Debug, Clone)]
pub struct MetricSample {
    pub cpu_usage: f64,
    pub mem_usage: f64,
    pub cpu_temp: Option<f64>,
    pub created_at: DateTime<Utc>,
}
