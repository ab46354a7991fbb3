use anyhow::{Context, Result};
use warden::clienv;
use warden::store::models::{ComponentRecord, DesiredState};
use warden::store::Store;
use warden::WardenError;

pub(crate) fn cmd_init() -> Result<()> {
    let db = clienv::db_path();
    println!("Initializing store at {}", db.display());

    let store = Store::open(&db)?;
    store.migrate()?;

    println!("\nSeeding default components...");
    for record in default_components()? {
        if store.insert_component(&record)? {
            println!(
                "  added {} ({})",
                record.component_id,
                record.desired_state.as_str()
            );
        } else {
            println!("  exists {}", record.component_id);
        }
    }

    if store.io_config("main_llm_processor")?.is_none() {
        store.upsert_io_config("main_llm_processor", "system_metrics_log", "llm_outputs")?;
        println!("  added llm_io_config for main_llm_processor");
    }

    println!("\nStore initialized. Run `warden start` to bring the system up.");
    Ok(())
}

pub(crate) fn cmd_enable(component_id: &str) -> Result<()> {
    set_state(component_id, DesiredState::Active)?;
    println!("Component '{component_id}' enabled.");
    println!("The owning manager will start it within one poll interval.");
    Ok(())
}

pub(crate) fn cmd_disable(component_id: &str) -> Result<()> {
    set_state(component_id, DesiredState::Inactive)?;
    println!("Component '{component_id}' disabled.");
    println!("The owning manager will stop it within one poll interval.");
    Ok(())
}

fn set_state(component_id: &str, state: DesiredState) -> Result<()> {
    let store = Store::open(&clienv::db_path())?;
    match store.set_desired_state(component_id, state) {
        Ok(()) => Ok(()),
        Err(WardenError::ComponentNotFound(id)) => {
            anyhow::bail!("Component '{id}' not found. See `warden status` for known components.")
        }
        Err(e) => Err(e.into()),
    }
}

/// The stock component set: metric daemons plus warden's own bridge daemons,
/// supervised like any other component.
fn default_components() -> Result<Vec<ComponentRecord>> {
    let warden_exe = std::env::current_exe()
        .context("Failed to resolve warden binary path")?
        .display()
        .to_string();

    Ok(vec![
        ComponentRecord {
            component_id: "temp_main_daemon".to_string(),
            base_script_name: "temp_main_daemon".to_string(),
            manager_affinity: "daemon_manager".to_string(),
            desired_state: DesiredState::Active,
            launch_args_json: "{}".to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("CPU temperature monitoring daemon".to_string()),
        },
        ComponentRecord {
            component_id: "system_metrics_daemon".to_string(),
            base_script_name: "system_metrics_daemon".to_string(),
            manager_affinity: "daemon_manager".to_string(),
            desired_state: DesiredState::Active,
            launch_args_json: "{}".to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("Cross-platform system metrics collector".to_string()),
        },
        ComponentRecord {
            component_id: "reload_bridge".to_string(),
            base_script_name: warden_exe.clone(),
            manager_affinity: "daemon_manager".to_string(),
            desired_state: DesiredState::Active,
            launch_args_json: r#"{"reload-bridge": ""}"#.to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("Turns needs_reload flags into CONFIG_RELOAD notifications".to_string()),
        },
        ComponentRecord {
            component_id: "command_reader".to_string(),
            base_script_name: warden_exe,
            manager_affinity: "daemon_manager".to_string(),
            desired_state: DesiredState::Active,
            launch_args_json: r#"{"command-reader": ""}"#.to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("Applies CMD: rows from the output channel".to_string()),
        },
        ComponentRecord {
            component_id: "main_llm_processor".to_string(),
            base_script_name: "llm_processor".to_string(),
            manager_affinity: "main_llm_manager".to_string(),
            desired_state: DesiredState::Inactive,
            launch_args_json: r#"{"--model": "default", "--threads": "4"}"#.to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("Main LLM processing component".to_string()),
        },
        ComponentRecord {
            component_id: "nano_analyzer_01".to_string(),
            base_script_name: "nano_instance".to_string(),
            manager_affinity: "nano_manager".to_string(),
            desired_state: DesiredState::Inactive,
            launch_args_json: r#"{"--instance-id": "analyzer_01", "--mode": "analysis"}"#.to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("Nano instance for data analysis".to_string()),
        },
        ComponentRecord {
            component_id: "nano_collector_01".to_string(),
            base_script_name: "nano_instance".to_string(),
            manager_affinity: "nano_manager".to_string(),
            desired_state: DesiredState::Inactive,
            launch_args_json: r#"{"--instance-id": "collector_01", "--mode": "collection"}"#.to_string(),
            run_type_on_boot: "PRIMARY_RUN".to_string(),
            description: Some("Nano instance for data collection".to_string()),
        },
    ])
}
