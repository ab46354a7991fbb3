//! Supervisor-of-supervisors.
//!
//! The boot supervisor owns the component managers as supervised children,
//! applying the same starting/running/failed/restart machinery managers apply
//! to components, gated by each manager's `critical` flag. Managers are
//! launched through the warden binary itself (`warden manager <affinity>`).

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{ManagerSettings, SupervisorConfig};
use crate::error::{Result, WardenError};
use crate::store::models::EventKind;
use crate::store::Store;
use crate::supervisor::backoff::Backoff;
use crate::supervisor::manager::ComponentState;
use crate::supervisor::process::{pid_file_path, ProcessHandle, SpawnSpec};

const SUPERVISOR_ID: &str = "supervisor";
/// Main monitoring loop granularity; per-manager intervals gate actual checks.
const MONITOR_TICK: Duration = Duration::from_secs(1);

struct SupervisedManager {
    affinity: String,
    settings: ManagerSettings,
    state: ComponentState,
    handle: Option<ProcessHandle>,
    consecutive_failures: u32,
    next_restart_at: Option<Instant>,
    last_check: Option<Instant>,
}

pub struct BootSupervisor {
    store: Store,
    config: SupervisorConfig,
    /// The warden binary managers are launched through
    exe: PathBuf,
    pid_dir: PathBuf,
    logs_dir: PathBuf,
    backoff: Backoff,
    managers: Vec<SupervisedManager>,
}

impl BootSupervisor {
    /// Build the supervisor and its manager registry. Components referencing
    /// an unregistered affinity make this fail before anything is launched.
    pub fn new(
        store: Store,
        config: SupervisorConfig,
        exe: PathBuf,
        pid_dir: PathBuf,
        logs_dir: PathBuf,
    ) -> Result<Self> {
        let registry = crate::supervisor::registry::ManagerRegistry::from_config(&config);
        registry.validate_store(&store)?;

        let managers = registry
            .affinities()
            .map(|(affinity, settings)| SupervisedManager {
                affinity: affinity.clone(),
                settings: settings.clone(),
                state: ComponentState::Unknown,
                handle: None,
                consecutive_failures: 0,
                next_restart_at: None,
                last_check: None,
            })
            .collect();

        let backoff = Backoff::new(
            Duration::from_secs(config.backoff_base_secs),
            Duration::from_secs(config.backoff_cap_secs),
        );

        Ok(Self {
            store,
            config,
            exe,
            pid_dir,
            logs_dir,
            backoff,
            managers,
        })
    }

    /// Run until a termination signal, then perform ordered shutdown. Exits
    /// only after every child has been accounted for.
    #[cfg(unix)]
    pub async fn run(mut self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        info!("Boot supervisor starting");
        self.claim_pid_file()?;

        if let Err(e) = self.start_managers().await {
            self.shutdown_all().await;
            self.release_pid_file();
            return Err(e);
        }

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut interval = tokio::time::interval(MONITOR_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(managers = self.managers.len(), "Boot supervisor ready");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_managers().await;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, starting graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, starting graceful shutdown");
                    break;
                }
            }
        }

        self.shutdown_all().await;
        self.release_pid_file();
        info!("Boot supervisor stopped");
        Ok(())
    }

    fn claim_pid_file(&self) -> Result<()> {
        // reclaim validates liveness and clears stale files as a side effect
        if let Some(running) = ProcessHandle::reclaim(&self.pid_dir, SUPERVISOR_ID, &self.exe) {
            return Err(WardenError::Config(format!(
                "supervisor already running with PID {}",
                running.pid()
            )));
        }
        fs::create_dir_all(&self.pid_dir)?;
        fs::write(
            pid_file_path(&self.pid_dir, SUPERVISOR_ID),
            std::process::id().to_string(),
        )?;
        Ok(())
    }

    fn release_pid_file(&self) {
        let path = pid_file_path(&self.pid_dir, SUPERVISOR_ID);
        if path.exists() {
            let _ = fs::remove_file(path);
        }
    }

    /// Launch every registered manager, respecting configured startup delays
    /// so managers do not stampede the store together.
    async fn start_managers(&mut self) -> Result<()> {
        for i in 0..self.managers.len() {
            let delay = self.managers[i].settings.startup_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if let Err(e) = self.spawn_manager(i).await {
                let manager = &self.managers[i];
                error!(
                    manager = %manager.settings.display_name,
                    error = %e,
                    "Failed to launch manager"
                );
                if manager.settings.critical {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn spawn_manager(&mut self, index: usize) -> Result<()> {
        let (affinity, display_name) = {
            let manager = &self.managers[index];
            (
                manager.affinity.clone(),
                manager.settings.display_name.clone(),
            )
        };

        let spec = SpawnSpec {
            component_id: affinity.clone(),
            executable: self.exe.clone(),
            args: vec!["manager".to_string(), affinity.clone()],
            runtime: None,
            pid_dir: self.pid_dir.clone(),
            logs_dir: self.logs_dir.clone(),
        };

        let handle = ProcessHandle::spawn(&spec).await?;
        let pid = handle.pid();
        info!(manager = %display_name, pid = pid, "Manager launched");
        self.record_manager_event(&affinity, Some(pid), "manager started");

        let manager = &mut self.managers[index];
        manager.handle = Some(handle);
        manager.state = ComponentState::Running;
        manager.last_check = Some(Instant::now());
        Ok(())
    }

    /// Health pass: each manager is checked at its own configured interval;
    /// critical managers that died are restarted with backoff, non-critical
    /// ones are logged and left stopped.
    pub(crate) async fn check_managers(&mut self) {
        let now = Instant::now();

        for i in 0..self.managers.len() {
            let due = {
                let manager = &self.managers[i];
                match manager.last_check {
                    Some(at) => now.duration_since(at) >= manager.settings.health_check_interval(),
                    None => true,
                }
            };
            if !due {
                continue;
            }
            self.managers[i].last_check = Some(now);

            let died = {
                let manager = &mut self.managers[i];
                match manager.handle.as_mut() {
                    Some(handle) => !handle.is_alive(),
                    None => false,
                }
            };

            if died {
                self.handle_manager_death(i);
            }

            let restart_due = {
                let manager = &self.managers[i];
                manager.handle.is_none()
                    && manager.state == ComponentState::Failed
                    && manager.settings.critical
                    && manager
                        .next_restart_at
                        .map(|at| Instant::now() >= at)
                        .unwrap_or(true)
            };

            if restart_due {
                let display_name = self.managers[i].settings.display_name.clone();
                info!(manager = %display_name, "Restarting crashed manager");
                if let Err(e) = self.spawn_manager(i).await {
                    warn!(manager = %display_name, error = %e, "Manager restart failed");
                    let manager = &mut self.managers[i];
                    manager.consecutive_failures += 1;
                    manager.next_restart_at =
                        Some(Instant::now() + self.backoff.delay(manager.consecutive_failures));
                }
            }
        }
    }

    fn handle_manager_death(&mut self, index: usize) {
        let (affinity, display_name, critical, pid, failures) = {
            let manager = &mut self.managers[index];
            let pid = manager.handle.as_ref().map(|h| h.pid());
            if let Some(handle) = manager.handle.take() {
                handle.remove_pid_file();
            }
            manager.consecutive_failures += 1;
            (
                manager.affinity.clone(),
                manager.settings.display_name.clone(),
                manager.settings.critical,
                pid,
                manager.consecutive_failures,
            )
        };

        warn!(manager = %display_name, pid = ?pid, "Manager died unexpectedly");
        self.record_manager_event(&affinity, pid, "manager crashed");

        let delay = self.backoff.delay(failures);
        let manager = &mut self.managers[index];
        if critical {
            manager.state = ComponentState::Failed;
            manager.next_restart_at = Some(Instant::now() + delay);
        } else {
            info!(manager = %display_name, "Manager is non-critical, leaving stopped");
            manager.state = ComponentState::Stopped;
        }
    }

    /// Ordered shutdown: signal every manager, wait out the grace period,
    /// force-kill stragglers, record the outcome for each.
    pub(crate) async fn shutdown_all(&mut self) {
        let grace = self.config.stop_grace();

        for i in 0..self.managers.len() {
            let affinity = self.managers[i].affinity.clone();
            let Some(mut handle) = self.managers[i].handle.take() else {
                continue;
            };
            let pid = handle.pid();

            match handle.terminate(grace).await {
                Ok(escalated) => {
                    handle.remove_pid_file();
                    self.managers[i].state = ComponentState::Stopped;
                    let detail = if escalated {
                        "manager stopped (forced kill after grace period)"
                    } else {
                        "manager stopped"
                    };
                    self.record_manager_event(&affinity, Some(pid), detail);
                }
                Err(e) => {
                    error!(manager = %affinity, pid = pid, error = %e, "Could not stop manager");
                    self.record_manager_event(
                        &affinity,
                        Some(pid),
                        "manager stop failed after kill escalation",
                    );
                }
            }
        }
    }

    fn record_manager_event(&self, affinity: &str, pid: Option<u32>, detail: &str) {
        if let Err(e) = self.store.append_lifecycle_event(
            affinity,
            EventKind::ManagerEvent,
            pid,
            detail,
            Some(SUPERVISOR_ID),
        ) {
            warn!(manager = %affinity, error = %e, "Could not append manager event");
        }
    }

    #[cfg(test)]
    fn manager_pid(&self, affinity: &str) -> Option<u32> {
        self.managers
            .iter()
            .find(|m| m.affinity == affinity)
            .and_then(|m| m.handle.as_ref())
            .map(|h| h.pid())
    }

    #[cfg(test)]
    fn manager_state(&self, affinity: &str) -> Option<ComponentState> {
        self.managers
            .iter()
            .find(|m| m.affinity == affinity)
            .map(|m| m.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_manager_exe(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("fake-manager");
        fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn one_manager_config(critical: bool) -> SupervisorConfig {
        let mut managers = BTreeMap::new();
        managers.insert(
            "daemon_manager".to_string(),
            ManagerSettings {
                display_name: "Daemon Manager".to_string(),
                startup_delay_secs: 0,
                health_check_interval_secs: 0,
                critical,
            },
        );
        SupervisorConfig {
            stop_grace_secs: 2,
            backoff_base_secs: 0,
            managers,
            ..SupervisorConfig::default()
        }
    }

    fn test_boot(dir: &TempDir, critical: bool) -> (BootSupervisor, Store) {
        let store = Store::open_memory().unwrap();
        store.migrate().unwrap();
        let boot = BootSupervisor::new(
            store.clone(),
            one_manager_config(critical),
            fake_manager_exe(dir),
            dir.path().join("pids"),
            dir.path().join("logs_managers"),
        )
        .unwrap();
        (boot, store)
    }

    fn manager_events(store: &Store, affinity: &str) -> Vec<String> {
        // events_for returns newest first; flip to chronological order
        store
            .events_for(affinity, 100)
            .unwrap()
            .into_iter()
            .rev()
            .filter(|e| e.event_kind == "manager-event")
            .filter_map(|e| e.detail)
            .collect()
    }

    #[test]
    fn unknown_affinity_fails_construction() {
        let dir = TempDir::new().unwrap();
        let store = Store::open_memory().unwrap();
        store.migrate().unwrap();
        store
            .insert_component(&crate::store::models::ComponentRecord {
                component_id: "orphan".to_string(),
                base_script_name: "orphan.py".to_string(),
                manager_affinity: "nobody".to_string(),
                desired_state: crate::store::models::DesiredState::Active,
                launch_args_json: "{}".to_string(),
                run_type_on_boot: "PRIMARY_RUN".to_string(),
                description: None,
            })
            .unwrap();

        let result = BootSupervisor::new(
            store,
            one_manager_config(true),
            fake_manager_exe(&dir),
            dir.path().join("pids"),
            dir.path().join("logs"),
        );
        assert!(matches!(result, Err(WardenError::UnknownAffinity { .. })));
    }

    #[tokio::test]
    async fn launches_and_stops_managers() {
        let dir = TempDir::new().unwrap();
        let (mut boot, store) = test_boot(&dir, true);

        boot.start_managers().await.unwrap();
        let pid = boot.manager_pid("daemon_manager").unwrap();
        assert!(crate::supervisor::process::process_alive(pid));

        let events = manager_events(&store, "daemon_manager");
        assert_eq!(events, vec!["manager started"]);

        boot.shutdown_all().await;
        assert!(!crate::supervisor::process::process_alive(pid));
        assert_eq!(boot.manager_state("daemon_manager"), Some(ComponentState::Stopped));

        let events = manager_events(&store, "daemon_manager");
        assert_eq!(events.len(), 2);
        assert!(events[1].starts_with("manager stopped"));
    }

    #[tokio::test]
    async fn critical_manager_is_restarted_after_crash() {
        let dir = TempDir::new().unwrap();
        let (mut boot, store) = test_boot(&dir, true);

        boot.start_managers().await.unwrap();
        let first_pid = boot.manager_pid("daemon_manager").unwrap();

        unsafe {
            libc::kill(first_pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        // one pass records the crash, the next restarts (zero backoff base)
        boot.check_managers().await;
        boot.check_managers().await;

        let second_pid = boot.manager_pid("daemon_manager").unwrap();
        assert_ne!(first_pid, second_pid);
        assert!(crate::supervisor::process::process_alive(second_pid));

        let events = manager_events(&store, "daemon_manager");
        assert!(events.contains(&"manager crashed".to_string()));
        assert_eq!(
            events.iter().filter(|d| *d == "manager started").count(),
            2
        );

        boot.shutdown_all().await;
    }

    #[tokio::test]
    async fn non_critical_manager_stays_down() {
        let dir = TempDir::new().unwrap();
        let (mut boot, store) = test_boot(&dir, false);

        boot.start_managers().await.unwrap();
        let pid = boot.manager_pid("daemon_manager").unwrap();

        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        boot.check_managers().await;
        boot.check_managers().await;

        assert!(boot.manager_pid("daemon_manager").is_none());
        assert_eq!(boot.manager_state("daemon_manager"), Some(ComponentState::Stopped));

        let events = manager_events(&store, "daemon_manager");
        assert!(events.contains(&"manager crashed".to_string()));
        assert_eq!(
            events.iter().filter(|d| *d == "manager started").count(),
            1
        );
    }
}
