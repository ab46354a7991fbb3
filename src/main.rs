mod args;
mod cmd_component;
mod cmd_logs;
mod cmd_metrics;
mod cmd_system;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_component::cmd_init()?,
        Commands::Start => cmd_system::cmd_start().await?,
        Commands::Stop { force } => cmd_system::cmd_stop(force).await?,
        Commands::Restart => cmd_system::cmd_restart().await?,
        Commands::Status { detailed } => cmd_system::cmd_status(detailed).await?,
        Commands::Logs {
            component,
            lines,
            follow,
        } => cmd_logs::cmd_logs(component.as_deref(), lines, follow).await?,
        Commands::Enable { component_id } => cmd_component::cmd_enable(&component_id)?,
        Commands::Disable { component_id } => cmd_component::cmd_disable(&component_id)?,
        Commands::Metrics { limit } => cmd_metrics::cmd_metrics(limit)?,
        Commands::Supervisor => cmd_system::cmd_supervisor().await?,
        Commands::Manager { affinity } => cmd_system::cmd_manager(&affinity).await?,
        Commands::ReloadBridge { .. } => cmd_system::cmd_reload_bridge().await?,
        Commands::CommandReader { .. } => cmd_system::cmd_command_reader().await?,
    }

    Ok(())
}
