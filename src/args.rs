use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Desired-state process supervisor", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Initialize the store schema and seed the default component set
    Init,

    /// Start the system (launches the boot supervisor in the background)
    Start,

    /// Stop the system gracefully
    Stop {
        /// Force stop (SIGKILL) instead of graceful (SIGTERM)
        #[arg(long)]
        force: bool,
    },

    /// Restart the system
    Restart,

    /// Show per-manager and per-component status
    Status {
        /// Include PIDs and event timestamps
        #[arg(long)]
        detailed: bool,
    },

    /// Show or follow a component's log stream
    Logs {
        /// Component id (lists available logs if omitted)
        component: Option<String>,

        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Follow log output (stream continuously)
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Enable a component (desired_state = active)
    Enable {
        /// Component id
        component_id: String,
    },

    /// Disable a component (desired_state = inactive)
    Disable {
        /// Component id
        component_id: String,
    },

    /// Show recent system metrics
    Metrics {
        /// Number of recent metric rows to read
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Run the boot supervisor in the foreground (Ctrl+C to stop)
    Supervisor,

    /// Run one component manager in the foreground (launched by the supervisor)
    Manager {
        /// Manager affinity key (e.g. daemon_manager)
        affinity: String,
    },

    /// Run the reload bridge: turns needs_reload flags into CONFIG_RELOAD
    /// notifications
    ReloadBridge {
        #[arg(long = "run-type", hide = true)]
        run_type: Option<String>,
    },

    /// Run the command reader: applies CMD: rows from the output channel
    CommandReader {
        #[arg(long = "run-type", hide = true)]
        run_type: Option<String>,
    },
}
