use std::fs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use warden::clienv;
use warden::config::SupervisorConfig;
use warden::store::Store;
use warden::supervisor::process::{pid_file_path, process_alive};
use warden::supervisor::{BootSupervisor, ComponentManager, ManagerContext};

/// How long `stop` waits for the supervisor to wind down its tree.
const STOP_TIMEOUT: Duration = Duration::from_secs(60);
/// Settle time after launching the supervisor before confirming it came up.
const START_CONFIRM: Duration = Duration::from_secs(3);

pub(crate) async fn cmd_start() -> Result<()> {
    if let Some(pid) = supervisor_pid() {
        println!("System is already running (supervisor PID: {pid})");
        return Ok(());
    }

    let db = clienv::db_path();
    if !db.exists() {
        bail!(
            "Store not initialized at {}. Run `warden init` first.",
            db.display()
        );
    }

    println!("Starting warden system...");

    let logs_dir = clienv::manager_logs_dir();
    fs::create_dir_all(&logs_dir)?;
    let log = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join("supervisor.log"))?;
    let err = log.try_clone()?;

    let exe = std::env::current_exe().context("Failed to resolve warden binary path")?;
    let mut cmd = tokio::process::Command::new(exe);
    cmd.arg("supervisor");
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(log);
    cmd.stderr(err);
    #[cfg(unix)]
    cmd.process_group(0);
    let mut child = cmd.spawn().context("Failed to launch supervisor")?;

    tokio::time::sleep(START_CONFIRM).await;

    match supervisor_pid() {
        Some(pid) => {
            println!("System started (supervisor PID: {pid})");
            println!("Logs: {}", logs_dir.join("supervisor.log").display());
            Ok(())
        }
        None => {
            // reap the failed child before reporting
            let _ = child.try_wait();
            bail!(
                "Supervisor did not come up. Check {}",
                logs_dir.join("supervisor.log").display()
            );
        }
    }
}

pub(crate) async fn cmd_stop(force: bool) -> Result<()> {
    let Some(pid) = supervisor_pid() else {
        println!("System is not running.");
        return Ok(());
    };

    if force {
        println!("Force stopping system (supervisor PID: {pid})...");
        #[cfg(unix)]
        unsafe {
            libc::kill(pid as i32, libc::SIGKILL);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        let path = pid_file_path(&clienv::pid_dir(), "supervisor");
        if path.exists() {
            let _ = fs::remove_file(path);
        }
        println!("System forcefully stopped.");
        return Ok(());
    }

    println!("Stopping system gracefully (supervisor PID: {pid})...");
    #[cfg(unix)]
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }

    let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if supervisor_pid().is_none() {
            println!("System stopped.");
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    bail!("System did not stop gracefully. Use `warden stop --force`.");
}

pub(crate) async fn cmd_restart() -> Result<()> {
    println!("Restarting warden system...");
    if supervisor_pid().is_some() {
        cmd_stop(false).await?;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    cmd_start().await
}

pub(crate) async fn cmd_status(detailed: bool) -> Result<()> {
    let store = open_store()?;
    let config = SupervisorConfig::load()?;

    println!();
    println!("{}", "=".repeat(72));
    println!("WARDEN SYSTEM STATUS");
    println!("{}", "=".repeat(72));

    match supervisor_pid() {
        Some(pid) => println!("\n[ok] Supervisor: running (PID {pid})"),
        None => println!("\n[--] Supervisor: stopped"),
    }

    let manager_events = store.recent_manager_events(50)?;
    if !manager_events.is_empty() {
        println!("\nManagers:");
        for event in &manager_events {
            let name = config
                .manager(&event.component_id)
                .map(|m| m.display_name.as_str())
                .unwrap_or(event.component_id.as_str());
            let alive = event.pid.map(process_alive).unwrap_or(false);
            let detail = event.detail.as_deref().unwrap_or("-");
            let symbol = if alive && detail.contains("started") {
                "[ok]"
            } else {
                "[--]"
            };
            println!("  {symbol} {name}: {detail}");
            if detailed {
                println!(
                    "       PID: {}, last update: {}",
                    event.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                    event.created_at
                );
            }
        }
    }

    let components = store.list_all_components()?;
    if !components.is_empty() {
        println!("\nComponents:");
        let mut current_manager = String::new();
        for record in &components {
            if record.manager_affinity != current_manager {
                current_manager = record.manager_affinity.clone();
                println!("\n  [{current_manager}]");
            }

            let last = store.last_event_for(&record.component_id)?;
            let last_kind = last
                .as_ref()
                .map(|e| e.event_kind.clone())
                .unwrap_or_else(|| "no-recent-events".to_string());
            let pid = last.as_ref().and_then(|e| e.pid);
            let alive = pid.map(process_alive).unwrap_or(false);

            let symbol = match record.desired_state.as_str() {
                "inactive" => "[  ]",
                _ if last_kind == "start" && alive => "[ok]",
                _ if last_kind == "stop" || last_kind == "no-recent-events" => "[--]",
                _ => "[!!]",
            };
            println!("    {symbol} {}: {last_kind}", record.component_id);
            if detailed {
                println!(
                    "         desired: {}, PID: {}",
                    record.desired_state.as_str(),
                    pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }

    let failures = store.recent_failures(if detailed { 10 } else { 5 })?;
    if !failures.is_empty() {
        println!("\nRecent failures ({}):", failures.len());
        for event in &failures {
            println!(
                "  - {}: {} - {}",
                event.component_id,
                event.event_kind,
                event.detail.as_deref().unwrap_or("no detail")
            );
        }
    }

    println!("\n{}", "=".repeat(72));
    Ok(())
}

pub(crate) async fn cmd_supervisor() -> Result<()> {
    let store = open_store()?;
    let config = SupervisorConfig::load()?;
    let exe = std::env::current_exe().context("Failed to resolve warden binary path")?;

    info!("Running boot supervisor in foreground (Ctrl+C to stop)");
    let supervisor = BootSupervisor::new(
        store,
        config,
        exe,
        clienv::pid_dir(),
        clienv::manager_logs_dir(),
    )?;
    supervisor.run().await?;
    Ok(())
}

pub(crate) async fn cmd_manager(affinity: &str) -> Result<()> {
    let store = open_store()?;
    let config = SupervisorConfig::load()?;

    if config.manager(affinity).is_none() {
        bail!(
            "Unknown manager affinity '{affinity}'. Configured: {}",
            config
                .managers
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }

    let manager = ComponentManager::new(affinity, store, config, ManagerContext::from_env());
    manager.run().await?;
    Ok(())
}

pub(crate) async fn cmd_reload_bridge() -> Result<()> {
    let store = open_store()?;
    warden::notify::run_reload_bridge(store, Duration::from_secs(5)).await?;
    Ok(())
}

pub(crate) async fn cmd_command_reader() -> Result<()> {
    let store = open_store()?;
    let reader = warden::command_reader::CommandReader::new(store);
    reader.run(Duration::from_secs(5)).await?;
    Ok(())
}

fn open_store() -> Result<Store> {
    let db = clienv::db_path();
    if !db.exists() {
        bail!(
            "Store not initialized at {}. Run `warden init` first.",
            db.display()
        );
    }
    Ok(Store::open(&db)?)
}

/// Live supervisor PID, validated against the OS rather than trusted from
/// the PID file.
fn supervisor_pid() -> Option<u32> {
    let path = clienv::supervisor_pid_path();
    let raw = fs::read_to_string(path).ok()?;
    let pid = raw.trim().parse::<u32>().ok()?;
    process_alive(pid).then_some(pid)
}
