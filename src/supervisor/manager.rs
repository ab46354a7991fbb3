//! Per-affinity reconciliation loop.
//!
//! A `ComponentManager` owns every component whose `manager_affinity` matches
//! its own, and on each poll diffs live process state against the desired
//! state in the store, issuing the minimal transitions to make them match.
//! Component failures are always recovered locally (restart with backoff) and
//! never escalate past the manager; only the manager process itself dying is
//! the boot supervisor's business.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::store::models::{ComponentRecord, DesiredState, EventKind};
use crate::store::Store;
use crate::supervisor::backoff::Backoff;
use crate::supervisor::process::{ProcessHandle, SpawnSpec};

/// Reconciliation state for one component id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl ComponentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentState::Unknown => "unknown",
            ComponentState::Starting => "starting",
            ComponentState::Running => "running",
            ComponentState::Stopping => "stopping",
            ComponentState::Stopped => "stopped",
            ComponentState::Failed => "failed",
        }
    }
}

/// Filesystem and spawn environment for a manager, resolved once at startup
/// and passed in. Nothing in the reconciliation path reads the environment.
#[derive(Debug, Clone)]
pub struct ManagerContext {
    pub pid_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub components_dir: PathBuf,
    /// Isolated interpreter to launch components through, when configured
    pub runtime: Option<PathBuf>,
}

impl ManagerContext {
    pub fn from_env() -> Self {
        Self {
            pid_dir: crate::clienv::pid_dir(),
            logs_dir: crate::clienv::logs_dir(),
            components_dir: crate::clienv::components_dir(),
            runtime: crate::clienv::runtime_interpreter(),
        }
    }
}

struct ManagedComponent {
    state: ComponentState,
    handle: Option<ProcessHandle>,
    consecutive_failures: u32,
    next_restart_at: Option<Instant>,
}

impl ManagedComponent {
    fn new() -> Self {
        Self {
            state: ComponentState::Unknown,
            handle: None,
            consecutive_failures: 0,
            next_restart_at: None,
        }
    }
}

pub struct ComponentManager {
    affinity: String,
    store: Store,
    config: SupervisorConfig,
    ctx: ManagerContext,
    backoff: Backoff,
    components: HashMap<String, ManagedComponent>,
}

impl ComponentManager {
    pub fn new(
        affinity: impl Into<String>,
        store: Store,
        config: SupervisorConfig,
        ctx: ManagerContext,
    ) -> Self {
        let backoff = Backoff::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_cap_secs),
        );
        Self {
            affinity: affinity.into(),
            store,
            config,
            ctx,
            backoff,
            components: HashMap::new(),
        }
    }

    pub fn affinity(&self) -> &str {
        &self.affinity
    }

    /// Current state for one component id, if tracked.
    pub fn state_of(&self, component_id: &str) -> Option<ComponentState> {
        self.components.get(component_id).map(|c| c.state)
    }

    /// Live pid for one component id, if any.
    pub fn pid_of(&self, component_id: &str) -> Option<u32> {
        self.components
            .get(component_id)
            .and_then(|c| c.handle.as_ref())
            .map(|h| h.pid())
    }

    /// Run one reconciliation pass: refresh liveness, stop what should not
    /// run, start what should. A transient store failure is logged and left
    /// for the next poll; it never brings the manager down.
    pub async fn reconcile_once(&mut self) {
        let records = match self.store.list_components_for_manager(&self.affinity) {
            Ok(records) => records,
            Err(e) => {
                warn!(
                    affinity = %self.affinity,
                    error = %e,
                    "Store unavailable, retrying next poll"
                );
                return;
            }
        };

        self.stop_unassigned(&records).await;

        for record in records {
            self.reconcile_component(&record).await;
        }
    }

    /// Ids that disappeared from the assigned set are an implicit
    /// desired=inactive (administrative deletion).
    async fn stop_unassigned(&mut self, records: &[ComponentRecord]) {
        let assigned: Vec<&str> = records.iter().map(|r| r.component_id.as_str()).collect();
        let tracked: Vec<String> = self
            .components
            .keys()
            .filter(|id| !assigned.contains(&id.as_str()))
            .cloned()
            .collect();

        for id in tracked {
            let live = self
                .components
                .get_mut(&id)
                .and_then(|c| c.handle.as_mut())
                .map(|h| h.is_alive())
                .unwrap_or(false);
            if live {
                info!(component = %id, "Component removed from assigned set, stopping");
                self.stop_component(&id, "removed from assigned set").await;
            }
            self.components.remove(&id);
        }
    }

    async fn reconcile_component(&mut self, record: &ComponentRecord) {
        let id = record.component_id.clone();

        if !self.components.contains_key(&id) {
            let mut entry = ManagedComponent::new();
            // crash recovery: adopt a process left behind by a previous
            // manager run instead of spawning a duplicate
            if let Some(handle) =
                ProcessHandle::reclaim(&self.ctx.pid_dir, &id, &self.executable_for(record))
            {
                entry.state = ComponentState::Running;
                entry.handle = Some(handle);
            }
            self.components.insert(id.clone(), entry);
        }

        self.refresh_liveness(&id, record);

        match record.desired_state {
            DesiredState::Active => self.ensure_running(record).await,
            DesiredState::Inactive => {
                let live = self
                    .components
                    .get_mut(&id)
                    .and_then(|c| c.handle.as_mut())
                    .map(|h| h.is_alive())
                    .unwrap_or(false);
                if live {
                    self.stop_component(&id, "desired state is inactive").await;
                }
            }
        }
    }

    /// Detect unexpected exits: a dead process we did not ask to stop is a
    /// crash, distinct from a requested stop.
    fn refresh_liveness(&mut self, id: &str, record: &ComponentRecord) {
        let Some(entry) = self.components.get_mut(id) else {
            return;
        };
        let Some(handle) = entry.handle.as_mut() else {
            return;
        };

        if handle.is_alive() {
            return;
        }

        let pid = handle.pid();
        handle.remove_pid_file();
        entry.handle = None;

        let crashed = matches!(
            entry.state,
            ComponentState::Running | ComponentState::Starting
        );
        if !crashed {
            entry.state = ComponentState::Stopped;
            return;
        }

        entry.consecutive_failures += 1;
        let failures = entry.consecutive_failures;
        let delay = self.backoff.delay(failures);
        entry.next_restart_at = Some(Instant::now() + delay);
        entry.state = ComponentState::Failed;

        warn!(
            component = %id,
            pid = pid,
            failures = failures,
            backoff_secs = delay.as_secs(),
            "Component exited unexpectedly"
        );
        self.record_event(
            &record.component_id,
            EventKind::Crash,
            Some(pid),
            &format!("process exited unexpectedly ({failures} consecutive failures)"),
        );
    }

    async fn ensure_running(&mut self, record: &ComponentRecord) {
        let id = record.component_id.as_str();
        {
            let Some(entry) = self.components.get_mut(id) else {
                return;
            };
            if entry.handle.is_some() {
                return;
            }
            if let Some(at) = entry.next_restart_at {
                if Instant::now() < at {
                    debug!(component = %id, "Restart gated by backoff");
                    return;
                }
            }
            entry.state = ComponentState::Starting;
        }

        self.start_component(record).await;
    }

    async fn start_component(&mut self, record: &ComponentRecord) {
        let id = record.component_id.clone();
        let executable = self.executable_for(record);

        if !executable.exists() {
            self.fail_start(
                &id,
                &format!("executable not found: {}", executable.display()),
            );
            return;
        }

        let mut args = record.launch_args();
        args.push("--run-type".to_string());
        args.push(record.run_type_on_boot.clone());

        let spec = SpawnSpec {
            component_id: id.clone(),
            executable,
            args,
            runtime: self.ctx.runtime.clone(),
            pid_dir: self.ctx.pid_dir.clone(),
            logs_dir: self.ctx.logs_dir.clone(),
        };

        let mut handle = match ProcessHandle::spawn(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.fail_start(&id, &e.to_string());
                return;
            }
        };

        // guard against immediate-exit failures being reported as success
        tokio::time::sleep(self.config.confirm_delay()).await;

        if !handle.is_alive() {
            handle.remove_pid_file();
            self.fail_start(&id, "process exited immediately after spawn");
            return;
        }

        let pid = handle.pid();
        info!(component = %id, pid = pid, "Component started");
        self.record_event(&id, EventKind::Start, Some(pid), "process started");

        if let Some(entry) = self.components.get_mut(&id) {
            entry.handle = Some(handle);
            entry.state = ComponentState::Running;
            entry.consecutive_failures = 0;
            entry.next_restart_at = None;
        }
    }

    fn fail_start(&mut self, id: &str, reason: &str) {
        warn!(component = %id, reason = %reason, "Start failed");
        self.record_event(id, EventKind::Error, None, reason);
        if let Some(entry) = self.components.get_mut(id) {
            entry.state = ComponentState::Failed;
            entry.consecutive_failures += 1;
            let delay = self.backoff.delay(entry.consecutive_failures);
            entry.next_restart_at = Some(Instant::now() + delay);
        }
    }

    async fn stop_component(&mut self, id: &str, reason: &str) {
        let grace = self.config.stop_grace();
        let Some(entry) = self.components.get_mut(id) else {
            return;
        };
        let Some(handle) = entry.handle.as_mut() else {
            return;
        };

        entry.state = ComponentState::Stopping;
        let pid = handle.pid();

        match handle.terminate(grace).await {
            Ok(escalated) => {
                handle.remove_pid_file();
                entry.handle = None;
                entry.state = ComponentState::Stopped;
                let detail = if escalated {
                    format!("{reason} (forced kill after grace period)")
                } else {
                    reason.to_string()
                };
                info!(component = %id, pid = pid, escalated = escalated, "Component stopped");
                self.record_event(id, EventKind::Stop, Some(pid), &detail);
            }
            Err(e) => {
                // still alive after SIGKILL; retry on the next poll
                warn!(component = %id, pid = pid, error = %e, "Stop failed");
                if let Some(entry) = self.components.get_mut(id) {
                    entry.state = ComponentState::Running;
                }
                self.record_event(id, EventKind::Error, Some(pid), &format!("stop failed: {e}"));
            }
        }
    }

    /// Stop everything this manager owns. Called on shutdown so children are
    /// accounted for before the manager process exits.
    pub async fn shutdown(&mut self) {
        let mut live = Vec::new();
        for (id, component) in self.components.iter_mut() {
            let alive = component
                .handle
                .as_mut()
                .map(|h| h.is_alive())
                .unwrap_or(false);
            if alive {
                live.push(id.clone());
            }
        }

        for id in live {
            self.stop_component(&id, "manager shutting down").await;
        }
    }

    /// Main loop: reconcile on every poll tick until a termination signal,
    /// then stop owned components and exit.
    #[cfg(unix)]
    pub async fn run(mut self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        info!(affinity = %self.affinity, "Component manager starting");

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reconcile_once().await;
                }
                _ = sigterm.recv() => {
                    info!(affinity = %self.affinity, "Received SIGTERM");
                    break;
                }
                _ = sigint.recv() => {
                    info!(affinity = %self.affinity, "Received SIGINT");
                    break;
                }
            }
        }

        self.shutdown().await;
        info!(affinity = %self.affinity, "Component manager stopped");
        Ok(())
    }

    fn executable_for(&self, record: &ComponentRecord) -> PathBuf {
        let script = PathBuf::from(&record.base_script_name);
        if script.is_absolute() {
            script
        } else {
            self.ctx.components_dir.join(script)
        }
    }

    /// Lifecycle events are best-effort under store outage: losing one is
    /// logged loudly but must not stop reconciliation.
    fn record_event(&self, component_id: &str, kind: EventKind, pid: Option<u32>, detail: &str) {
        if let Err(e) =
            self.store
                .append_lifecycle_event(component_id, kind, pid, detail, Some(&self.affinity))
        {
            warn!(
                component = %component_id,
                kind = kind.as_str(),
                error = %e,
                "Could not append lifecycle event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn test_config(backoff_base_secs: u64) -> SupervisorConfig {
        SupervisorConfig {
            poll_interval_secs: 1,
            confirm_delay_ms: 100,
            stop_grace_secs: 2,
            backoff_base_secs,
            backoff_cap_secs: 300,
            ..SupervisorConfig::default()
        }
    }

    fn test_manager(dir: &TempDir, backoff_base_secs: u64) -> (ComponentManager, Store) {
        let store = Store::open_memory().unwrap();
        store.migrate().unwrap();
        let ctx = ManagerContext {
            pid_dir: dir.path().join("pids"),
            logs_dir: dir.path().join("logs"),
            components_dir: dir.path().to_path_buf(),
            runtime: None,
        };
        let manager = ComponentManager::new(
            "daemon_manager",
            store.clone(),
            test_config(backoff_base_secs),
            ctx,
        );
        (manager, store)
    }

    fn insert(store: &Store, id: &str, script: &str, state: DesiredState) {
        store
            .insert_component(&ComponentRecord {
                component_id: id.to_string(),
                base_script_name: script.to_string(),
                manager_affinity: "daemon_manager".to_string(),
                desired_state: state,
                launch_args_json: "{}".to_string(),
                run_type_on_boot: "PRIMARY_RUN".to_string(),
                description: None,
            })
            .unwrap();
    }

    fn count_events(store: &Store, id: &str, kind: &str) -> usize {
        store
            .events_for(id, 100)
            .unwrap()
            .iter()
            .filter(|e| e.event_kind == kind)
            .count()
    }

    #[tokio::test]
    async fn starts_desired_active_component() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "cpu_usage_daemon", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 2);
        insert(&store, "cpu_usage_daemon", "cpu_usage_daemon", DesiredState::Active);

        manager.reconcile_once().await;

        assert_eq!(manager.state_of("cpu_usage_daemon"), Some(ComponentState::Running));
        let pid = manager.pid_of("cpu_usage_daemon").unwrap();
        assert!(crate::supervisor::process::process_alive(pid));

        let event = store.last_event_for("cpu_usage_daemon").unwrap().unwrap();
        assert_eq!(event.event_kind, "start");
        assert_eq!(event.pid, Some(pid));
        assert_eq!(event.manager_id.as_deref(), Some("daemon_manager"));

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_reconcile_spawns_once() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 2);
        insert(&store, "comp", "comp", DesiredState::Active);

        manager.reconcile_once().await;
        let pid = manager.pid_of("comp").unwrap();
        manager.reconcile_once().await;
        manager.reconcile_once().await;

        assert_eq!(manager.pid_of("comp"), Some(pid));
        assert_eq!(count_events(&store, "comp", "start"), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stops_component_when_desired_inactive() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 2);
        insert(&store, "comp", "comp", DesiredState::Active);

        manager.reconcile_once().await;
        let pid = manager.pid_of("comp").unwrap();

        store.set_desired_state("comp", DesiredState::Inactive).unwrap();
        manager.reconcile_once().await;

        assert_eq!(manager.state_of("comp"), Some(ComponentState::Stopped));
        assert!(!crate::supervisor::process::process_alive(pid));
        assert_eq!(count_events(&store, "comp", "stop"), 1);
        assert!(!crate::supervisor::process::pid_file_path(
            &dir.path().join("pids"),
            "comp"
        )
        .exists());

        // second pass is a no-op
        manager.reconcile_once().await;
        assert_eq!(count_events(&store, "comp", "stop"), 1);
    }

    #[tokio::test]
    async fn crash_is_recorded_and_gated_by_backoff() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 60);
        insert(&store, "comp", "comp", DesiredState::Active);

        manager.reconcile_once().await;
        let pid = manager.pid_of("comp").unwrap();

        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.reconcile_once().await;
        assert_eq!(manager.state_of("comp"), Some(ComponentState::Failed));
        assert_eq!(count_events(&store, "comp", "crash"), 1);

        // backoff (60s base) holds the restart back
        manager.reconcile_once().await;
        assert_eq!(count_events(&store, "comp", "start"), 1);
        assert_eq!(manager.state_of("comp"), Some(ComponentState::Failed));
    }

    #[tokio::test]
    async fn crash_restarts_once_backoff_elapses() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        // zero base backoff: eligible for restart immediately
        let (mut manager, store) = test_manager(&dir, 0);
        insert(&store, "comp", "comp", DesiredState::Active);

        manager.reconcile_once().await;
        let first_pid = manager.pid_of("comp").unwrap();
        unsafe {
            libc::kill(-(first_pid as i32), libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        manager.reconcile_once().await; // records crash
        manager.reconcile_once().await; // restarts

        let second_pid = manager.pid_of("comp").unwrap();
        assert_ne!(first_pid, second_pid);
        assert_eq!(count_events(&store, "comp", "start"), 2);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn immediate_exit_is_a_failed_start() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "flaky", "exit 1");
        let (mut manager, store) = test_manager(&dir, 60);
        insert(&store, "flaky", "flaky", DesiredState::Active);

        manager.reconcile_once().await;

        assert_eq!(manager.state_of("flaky"), Some(ComponentState::Failed));
        assert_eq!(count_events(&store, "flaky", "start"), 0);
        assert_eq!(count_events(&store, "flaky", "error"), 1);
    }

    #[tokio::test]
    async fn missing_executable_is_a_failed_start() {
        let dir = TempDir::new().unwrap();
        let (mut manager, store) = test_manager(&dir, 60);
        insert(&store, "ghost", "no_such_script", DesiredState::Active);

        manager.reconcile_once().await;

        assert_eq!(manager.state_of("ghost"), Some(ComponentState::Failed));
        let event = store.last_event_for("ghost").unwrap().unwrap();
        assert_eq!(event.event_kind, "error");
        assert!(event.detail.unwrap().contains("executable not found"));
    }

    #[tokio::test]
    async fn removed_component_is_implicitly_stopped() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 2);
        insert(&store, "comp", "comp", DesiredState::Active);

        manager.reconcile_once().await;
        let pid = manager.pid_of("comp").unwrap();

        store.delete_component("comp").unwrap();
        manager.reconcile_once().await;

        assert!(!crate::supervisor::process::process_alive(pid));
        assert_eq!(count_events(&store, "comp", "stop"), 1);
        assert!(manager.state_of("comp").is_none());
    }

    #[tokio::test]
    async fn restarted_manager_adopts_live_process() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 2);
        insert(&store, "comp", "comp", DesiredState::Active);

        manager.reconcile_once().await;
        let pid = manager.pid_of("comp").unwrap();
        drop(manager);

        // fresh manager over the same pid dir, simulating a manager restart
        let ctx = ManagerContext {
            pid_dir: dir.path().join("pids"),
            logs_dir: dir.path().join("logs"),
            components_dir: dir.path().to_path_buf(),
            runtime: None,
        };
        let mut restarted =
            ComponentManager::new("daemon_manager", store.clone(), test_config(2), ctx);
        restarted.reconcile_once().await;

        assert_eq!(restarted.pid_of("comp"), Some(pid));
        assert_eq!(restarted.state_of("comp"), Some(ComponentState::Running));
        assert_eq!(count_events(&store, "comp", "start"), 1);

        restarted.shutdown().await;
    }

    #[tokio::test]
    async fn stale_pid_file_is_cleaned_and_component_restarted() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "comp", "sleep 30");
        let (mut manager, store) = test_manager(&dir, 2);
        insert(&store, "comp", "comp", DesiredState::Active);

        // component died while its manager was down
        let pid_dir = dir.path().join("pids");
        fs::create_dir_all(&pid_dir).unwrap();
        fs::write(
            crate::supervisor::process::pid_file_path(&pid_dir, "comp"),
            "999999999",
        )
        .unwrap();

        manager.reconcile_once().await;

        let pid = manager.pid_of("comp").unwrap();
        assert!(crate::supervisor::process::process_alive(pid));
        assert_eq!(count_events(&store, "comp", "start"), 1);

        manager.shutdown().await;
    }
}
