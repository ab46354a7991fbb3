//! Shared SQLite store.
//!
//! The store is the only resource shared across process boundaries: desired
//! component state, the append-only lifecycle log, and the notification
//! tables all live here. Every operation is a single-statement transaction so
//! a crash mid-call never leaves a half-written row visible to other readers,
//! and cross-process races (two managers, two command readers) are settled by
//! SQLite's own isolation rather than application locking.

mod schema;

pub mod models;

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::{Result, WardenError};
use models::{
    ComponentRecord, DesiredState, EventKind, IoConfig, LifecycleEvent, MetricSample,
    Notification, OutputRow,
};

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_default() -> Result<Self> {
        Self::open(&crate::clienv::db_path())
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        schema::run_migrations(&conn)
    }

    // ============================================================
    // Component records
    // ============================================================

    /// Administrative insert. Returns false when the component already exists.
    pub fn insert_component(&self, record: &ComponentRecord) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO autorun_components
             (component_id, base_script_name, manager_affinity, desired_state,
              launch_args_json, run_type_on_boot, description)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                &record.component_id,
                &record.base_script_name,
                &record.manager_affinity,
                record.desired_state.as_str(),
                &record.launch_args_json,
                &record.run_type_on_boot,
                &record.description,
            ),
        )?;
        Ok(inserted > 0)
    }

    /// Components assigned to one manager, ordered by id.
    pub fn list_components_for_manager(&self, affinity: &str) -> Result<Vec<ComponentRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT component_id, base_script_name, manager_affinity, desired_state,
                    launch_args_json, run_type_on_boot, description
             FROM autorun_components
             WHERE manager_affinity = ?
             ORDER BY component_id",
        )?;
        let records = stmt
            .query_map([affinity], component_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn list_all_components(&self) -> Result<Vec<ComponentRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT component_id, base_script_name, manager_affinity, desired_state,
                    launch_args_json, run_type_on_boot, description
             FROM autorun_components
             ORDER BY manager_affinity, component_id",
        )?;
        let records = stmt
            .query_map([], component_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn get_component(&self, component_id: &str) -> Result<Option<ComponentRecord>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let record = conn
            .query_row(
                "SELECT component_id, base_script_name, manager_affinity, desired_state,
                        launch_args_json, run_type_on_boot, description
                 FROM autorun_components
                 WHERE component_id = ?",
                [component_id],
                component_from_row,
            )
            .optional()?;
        Ok(record)
    }

    /// Flip desired state. Errors when the component id is unknown so callers
    /// (command dispatch, `enable`/`disable`) never mutate blindly.
    pub fn set_desired_state(&self, component_id: &str, state: DesiredState) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute(
            "UPDATE autorun_components SET desired_state = ? WHERE component_id = ?",
            (state.as_str(), component_id),
        )?;
        if changed == 0 {
            return Err(WardenError::ComponentNotFound(component_id.to_string()));
        }
        Ok(())
    }

    /// Distinct manager affinities currently referenced by components.
    pub fn list_affinities(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT DISTINCT manager_affinity FROM autorun_components ORDER BY manager_affinity",
        )?;
        let affinities = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(affinities)
    }

    /// Test-only stand-in for administrative deletion, which happens outside
    /// the core in production.
    #[cfg(test)]
    pub fn delete_component(&self, component_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "DELETE FROM autorun_components WHERE component_id = ?",
            [component_id],
        )?;
        Ok(())
    }

    // ============================================================
    // Lifecycle log (append-only)
    // ============================================================

    pub fn append_lifecycle_event(
        &self,
        component_id: &str,
        kind: EventKind,
        pid: Option<u32>,
        detail: &str,
        manager_id: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO component_lifecycle_log (component_id, event_kind, pid, detail, manager_id)
             VALUES (?, ?, ?, ?, ?)",
            (component_id, kind.as_str(), pid, detail, manager_id),
        )?;
        Ok(())
    }

    pub fn last_event_for(&self, component_id: &str) -> Result<Option<LifecycleEvent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let event = conn
            .query_row(
                "SELECT id, component_id, event_kind, pid, detail, manager_id, created_at
                 FROM component_lifecycle_log
                 WHERE component_id = ?
                 ORDER BY id DESC
                 LIMIT 1",
                [component_id],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    pub fn events_for(&self, component_id: &str, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, component_id, event_kind, pid, detail, manager_id, created_at
             FROM component_lifecycle_log
             WHERE component_id = ?
             ORDER BY id DESC
             LIMIT ?",
        )?;
        let events = stmt
            .query_map((component_id, limit as i64), event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Recent crash/error rows for the status view.
    pub fn recent_failures(&self, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, component_id, event_kind, pid, detail, manager_id, created_at
             FROM component_lifecycle_log
             WHERE event_kind IN ('crash', 'error')
             ORDER BY id DESC
             LIMIT ?",
        )?;
        let events = stmt
            .query_map([limit as i64], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    /// Most recent manager-event per distinct component id, for status output.
    pub fn recent_manager_events(&self, limit: usize) -> Result<Vec<LifecycleEvent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, component_id, event_kind, pid, detail, manager_id, created_at
             FROM component_lifecycle_log
             WHERE id IN (
                 SELECT MAX(id) FROM component_lifecycle_log
                 WHERE event_kind = 'manager-event'
                 GROUP BY component_id
             )
             ORDER BY component_id
             LIMIT ?",
        )?;
        let events = stmt
            .query_map([limit as i64], event_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ============================================================
    // Notifications
    // ============================================================

    pub fn publish_notification(
        &self,
        recipient: &str,
        kind: &str,
        payload: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO llm_notifications (recipient, kind, payload) VALUES (?, ?, ?)",
            (recipient, kind, payload),
        )?;
        Ok(())
    }

    /// Unconsumed notifications for a recipient, oldest first.
    pub fn pending_notifications(&self, recipient: &str) -> Result<Vec<Notification>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, recipient, kind, payload, created_at
             FROM llm_notifications
             WHERE recipient = ? AND consumed_flag = 0
             ORDER BY id",
        )?;
        let notifications = stmt
            .query_map([recipient], |row| {
                Ok(Notification {
                    id: row.get(0)?,
                    recipient: row.get(1)?,
                    kind: row.get(2)?,
                    payload: row.get(3)?,
                    created_at: parse_datetime(row.get::<_, String>(4)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(notifications)
    }

    /// Claim a notification for consumption. The conditional update makes
    /// exactly one racing caller win; the loser sees false and moves on.
    pub fn claim_notification(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let claimed = conn.execute(
            "UPDATE llm_notifications SET consumed_flag = 1 WHERE id = ? AND consumed_flag = 0",
            [id],
        )?;
        Ok(claimed > 0)
    }

    // ============================================================
    // IO config (reload-flag convention)
    // ============================================================

    pub fn io_config(&self, llm_id: &str) -> Result<Option<IoConfig>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let config = conn
            .query_row(
                "SELECT llm_id, input_tables_csv, output_table, needs_reload
                 FROM llm_io_config
                 WHERE llm_id = ?",
                [llm_id],
                |row| {
                    Ok(IoConfig {
                        llm_id: row.get(0)?,
                        input_tables_csv: row.get(1)?,
                        output_table: row.get(2)?,
                        needs_reload: row.get::<_, i64>(3)? != 0,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    pub fn upsert_io_config(
        &self,
        llm_id: &str,
        input_tables_csv: &str,
        output_table: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO llm_io_config (llm_id, input_tables_csv, output_table, needs_reload)
             VALUES (?, ?, ?, 0)
             ON CONFLICT(llm_id) DO UPDATE SET
                 input_tables_csv = excluded.input_tables_csv,
                 output_table = excluded.output_table,
                 needs_reload = 1",
            (llm_id, input_tables_csv, output_table),
        )?;
        Ok(())
    }

    /// Mark a recipient's configuration as changed.
    pub fn set_needs_reload(&self, llm_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn.execute(
            "UPDATE llm_io_config SET needs_reload = 1 WHERE llm_id = ?",
            [llm_id],
        )?;
        if changed == 0 {
            return Err(WardenError::ComponentNotFound(llm_id.to_string()));
        }
        Ok(())
    }

    /// Atomically test-and-clear the reload flag. True means this caller is
    /// responsible for publishing the CONFIG_RELOAD notification.
    pub fn take_reload_request(&self, llm_id: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let taken = conn.execute(
            "UPDATE llm_io_config SET needs_reload = 0 WHERE llm_id = ? AND needs_reload = 1",
            [llm_id],
        )?;
        Ok(taken > 0)
    }

    /// Recipients whose reload flag is currently set.
    pub fn reload_requested(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt =
            conn.prepare("SELECT llm_id FROM llm_io_config WHERE needs_reload = 1 ORDER BY llm_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    // ============================================================
    // Output channel
    // ============================================================

    pub fn append_output(&self, llm_id: &str, content: &str) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO llm_outputs (llm_id, content) VALUES (?, ?)",
            (llm_id, content),
        )?;
        Ok(())
    }

    /// Output rows newer than `last_id`, in insertion order.
    pub fn outputs_after(&self, last_id: i64) -> Result<Vec<OutputRow>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT id, llm_id, content, created_at FROM llm_outputs WHERE id > ? ORDER BY id",
        )?;
        let rows = stmt
            .query_map([last_id], |row| {
                Ok(OutputRow {
                    id: row.get(0)?,
                    llm_id: row.get(1)?,
                    content: row.get(2)?,
                    created_at: parse_datetime(row.get::<_, String>(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete_output(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM llm_outputs WHERE id = ?", [id])?;
        Ok(())
    }

    // ============================================================
    // Metrics (written by owning components, read-only here)
    // ============================================================

    pub fn recent_metrics(&self, limit: usize) -> Result<Vec<MetricSample>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn.prepare(
            "SELECT cpu_usage, mem_usage, cpu_temp, created_at
             FROM system_metrics_log
             ORDER BY id DESC
             LIMIT ?",
        )?;
        let samples = stmt
            .query_map([limit as i64], |row| {
                Ok(MetricSample {
                    cpu_usage: row.get(0)?,
                    mem_usage: row.get(1)?,
                    cpu_temp: row.get(2)?,
                    created_at: parse_datetime(row.get::<_, String>(3)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(samples)
    }
}

fn component_from_row(row: &Row<'_>) -> rusqlite::Result<ComponentRecord> {
    let state: String = row.get(3)?;
    Ok(ComponentRecord {
        component_id: row.get(0)?,
        base_script_name: row.get(1)?,
        manager_affinity: row.get(2)?,
        desired_state: DesiredState::parse(&state).unwrap_or(DesiredState::Inactive),
        launch_args_json: row.get(4)?,
        run_type_on_boot: row.get(5)?,
        description: row.get(6)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<LifecycleEvent> {
    Ok(LifecycleEvent {
        id: row.get(0)?,
        component_id: row.get(1)?,
        event_kind: row.get(2)?,
        pid: row.get(3)?,
        detail: row.get(4)?,
        manager_id: row.get(5)?,
        created_at: parse_datetime(row.get::<_, String>(6)?),
    })
}

/// SQLite's datetime('now') default and RFC 3339 both appear in the wild.
fn parse_datetime(raw: String) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&raw) {
        return dt.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}
