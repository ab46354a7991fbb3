//! Command dispatch from the output channel.
//!
//! A higher-level process starts and stops components by writing
//! `CMD:`-prefixed rows into `llm_outputs`. The reader translates them into
//! desired-state mutations: `CMD:START <id>` and `CMD:STOP <id>`. The
//! referenced component must already exist; unknown ids are rejected and
//! logged, never created.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Result, WardenError};
use crate::store::models::{DesiredState, EventKind, OutputRow};
use crate::store::Store;

pub const CMD_PREFIX: &str = "CMD:";
const READER_ID: &str = "command_reader";

pub struct CommandReader {
    store: Store,
    last_id: i64,
}

impl CommandReader {
    pub fn new(store: Store) -> Self {
        Self { store, last_id: 0 }
    }

    /// Scan output rows newer than the cursor, act on commands, and delete
    /// consumed command rows. Non-command output is left in place.
    pub fn scan_once(&mut self) -> Result<usize> {
        let mut acted = 0;
        for row in self.store.outputs_after(self.last_id)? {
            self.last_id = row.id;
            let Some(command) = row.content.strip_prefix(CMD_PREFIX) else {
                continue;
            };
            if self.dispatch(command.trim(), &row) {
                acted += 1;
            }
            self.store.delete_output(row.id)?;
        }
        Ok(acted)
    }

    fn dispatch(&self, command: &str, row: &OutputRow) -> bool {
        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("START"), Some(id)) => self.apply(id, DesiredState::Active, "CMD:START"),
            (Some("STOP"), Some(id)) => self.apply(id, DesiredState::Inactive, "CMD:STOP"),
            _ => {
                warn!(
                    source = %row.llm_id,
                    content = %row.content,
                    "Unrecognized command, dropping"
                );
                false
            }
        }
    }

    /// The existence check and the flip are one conditional update, so two
    /// racing readers cannot double-act and an unknown id never mutates.
    fn apply(&self, component_id: &str, state: DesiredState, verb: &str) -> bool {
        match self.store.set_desired_state(component_id, state) {
            Ok(()) => {
                info!(component = %component_id, state = state.as_str(), verb = verb, "Command applied");
                self.record(
                    component_id,
                    EventKind::ManagerEvent,
                    &format!("desired_state set to {} by {verb}", state.as_str()),
                );
                true
            }
            Err(WardenError::ComponentNotFound(_)) => {
                warn!(component = %component_id, verb = verb, "Command rejected: unknown component");
                self.record(
                    component_id,
                    EventKind::Error,
                    &format!("{verb} rejected: unknown component"),
                );
                false
            }
            Err(e) => {
                warn!(component = %component_id, error = %e, "Command failed");
                false
            }
        }
    }

    fn record(&self, component_id: &str, kind: EventKind, detail: &str) {
        if let Err(e) =
            self.store
                .append_lifecycle_event(component_id, kind, None, detail, Some(READER_ID))
        {
            warn!(component = %component_id, error = %e, "Could not append lifecycle event");
        }
    }

    /// Long-running reader loop.
    #[cfg(unix)]
    pub async fn run(mut self, poll: Duration) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        info!("Command reader starting");
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scan_once() {
                        warn!(error = %e, "Store unavailable, retrying next poll");
                    }
                }
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
            }
        }

        info!("Command reader stopped");
        Ok(())
    }
}
