//! Notification protocol over the shared store.
//!
//! Components that cannot call each other directly exchange short control
//! messages through `llm_notifications`: publish a row, recipient polls and
//! claims it. Delivery is at-least-once with idempotent consumers: a crash
//! between reading and claiming redelivers, so every action a message
//! triggers must tolerate running twice.

use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::store::models::{EventKind, Notification};
use crate::store::Store;

pub const KIND_CONFIG_RELOAD: &str = "CONFIG_RELOAD";
pub const KIND_RUN: &str = "RUN";
pub const KIND_PUSH: &str = "PUSH";
pub const KIND_PULL_REQUEST: &str = "PULL_REQUEST";

/// Message kinds. Unknown kinds are preserved so consumers can log what they
/// dropped instead of crashing on messages from newer publishers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    /// Re-read configuration before resuming normal work
    ConfigReload,
    /// Perform one unit of work immediately
    Run,
    /// Like Run, scoped to the sources named in the payload
    Push,
    /// Publish a formatted request to the output channel for a third party
    PullRequest,
    Other(String),
}

impl NotificationKind {
    pub fn parse(raw: &str) -> Self {
        match raw {
            KIND_CONFIG_RELOAD => NotificationKind::ConfigReload,
            KIND_RUN => NotificationKind::Run,
            KIND_PUSH => NotificationKind::Push,
            KIND_PULL_REQUEST => NotificationKind::PullRequest,
            other => NotificationKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::ConfigReload => KIND_CONFIG_RELOAD,
            NotificationKind::Run => KIND_RUN,
            NotificationKind::Push => KIND_PUSH,
            NotificationKind::PullRequest => KIND_PULL_REQUEST,
            NotificationKind::Other(raw) => raw,
        }
    }
}

/// Typed per-recipient inbox with claim-then-act consumption.
pub struct Inbox {
    store: Store,
    recipient: String,
}

impl Inbox {
    pub fn new(store: Store, recipient: impl Into<String>) -> Self {
        Self {
            store,
            recipient: recipient.into(),
        }
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    /// Unconsumed messages, oldest first.
    pub fn pending(&self) -> Result<Vec<Notification>> {
        self.store.pending_notifications(&self.recipient)
    }

    /// Drain pending messages in creation order. Each message is claimed
    /// through the store's conditional update (exactly one racing consumer
    /// wins) and then handed to `handler`. Unknown kinds are claimed, logged
    /// and dropped. A handler error is recorded in the lifecycle log and does
    /// not stop the drain.
    pub fn process_pending<F>(&self, mut handler: F) -> Result<usize>
    where
        F: FnMut(&NotificationKind, Option<&str>) -> Result<()>,
    {
        let mut handled = 0;
        for message in self.pending()? {
            if !self.store.claim_notification(message.id)? {
                // another consumer of this inbox got there first
                continue;
            }

            let kind = NotificationKind::parse(&message.kind);
            if let NotificationKind::Other(raw) = &kind {
                warn!(recipient = %self.recipient, kind = %raw, "Dropping notification of unknown kind");
                continue;
            }

            if let Err(e) = handler(&kind, message.payload.as_deref()) {
                warn!(
                    recipient = %self.recipient,
                    kind = %kind.as_str(),
                    error = %e,
                    "Notification handler failed"
                );
                if let Err(log_err) = self.store.append_lifecycle_event(
                    &self.recipient,
                    EventKind::Error,
                    None,
                    &format!("notification handler failed for {}: {e}", kind.as_str()),
                    None,
                ) {
                    warn!(error = %log_err, "Could not append lifecycle event");
                }
                continue;
            }
            handled += 1;
        }
        Ok(handled)
    }
}

/// Source tables named by a PUSH payload, in listed order. How the results
/// are combined is the consumer's policy, not the protocol's.
pub fn parse_push_payload(payload: &str) -> Vec<String> {
    payload
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Answer a PULL_REQUEST by publishing a formatted request to the
/// recipient's output channel, where a third party can observe it and
/// respond out-of-band.
pub fn respond_pull_request(store: &Store, recipient: &str, payload: &str) -> Result<()> {
    store.append_output(recipient, &format!("{KIND_PULL_REQUEST}:{payload}"))
}

/// One pass of the reload bridge: turn every set `needs_reload` flag into a
/// CONFIG_RELOAD notification. The flag is test-and-cleared atomically so two
/// bridges never publish for the same request.
pub fn bridge_reload_flags(store: &Store) -> Result<usize> {
    let mut published = 0;
    for llm_id in store.reload_requested()? {
        if store.take_reload_request(&llm_id)? {
            store.publish_notification(&llm_id, KIND_CONFIG_RELOAD, None)?;
            info!(recipient = %llm_id, "Published CONFIG_RELOAD");
            published += 1;
        }
    }
    Ok(published)
}

/// Long-running reload bridge loop.
#[cfg(unix)]
pub async fn run_reload_bridge(store: Store, poll: Duration) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    info!("Reload bridge starting");
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut interval = tokio::time::interval(poll);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = bridge_reload_flags(&store) {
                    warn!(error = %e, "Store unavailable, retrying next poll");
                }
            }
            _ = sigterm.recv() => break,
            _ = sigint.recv() => break,
        }
    }

    info!("Reload bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Store {
        let store = Store::open_memory().unwrap();
        store.migrate().unwrap();
        store
    }

    #[test]
    fn kind_parse_roundtrip() {
        assert_eq!(
            NotificationKind::parse("CONFIG_RELOAD"),
            NotificationKind::ConfigReload
        );
        assert_eq!(NotificationKind::parse("RUN"), NotificationKind::Run);
        assert_eq!(NotificationKind::parse("PUSH"), NotificationKind::Push);
        assert_eq!(
            NotificationKind::parse("PULL_REQUEST"),
            NotificationKind::PullRequest
        );
        assert_eq!(
            NotificationKind::parse("FUTURE_KIND"),
            NotificationKind::Other("FUTURE_KIND".to_string())
        );
        assert_eq!(NotificationKind::parse("FUTURE_KIND").as_str(), "FUTURE_KIND");
    }

    #[test]
    fn messages_handled_in_creation_order() {
        let store = test_store();
        store
            .publish_notification("llm", KIND_CONFIG_RELOAD, None)
            .unwrap();
        store
            .publish_notification("llm", KIND_PUSH, Some("system_metrics_log"))
            .unwrap();
        store.publish_notification("other", KIND_RUN, None).unwrap();

        let inbox = Inbox::new(store.clone(), "llm");
        let mut seen = Vec::new();
        let handled = inbox
            .process_pending(|kind, payload| {
                seen.push((kind.clone(), payload.map(str::to_string)));
                Ok(())
            })
            .unwrap();

        assert_eq!(handled, 2);
        assert_eq!(seen[0].0, NotificationKind::ConfigReload);
        assert_eq!(seen[1].0, NotificationKind::Push);
        assert_eq!(seen[1].1.as_deref(), Some("system_metrics_log"));

        // the other recipient's message is untouched
        assert_eq!(store.pending_notifications("other").unwrap().len(), 1);
    }

    #[test]
    fn unknown_kind_is_claimed_and_dropped() {
        let store = test_store();
        store
            .publish_notification("llm", "FUTURE_KIND", Some("x"))
            .unwrap();

        let inbox = Inbox::new(store.clone(), "llm");
        let handled = inbox
            .process_pending(|_, _| panic!("handler must not see unknown kinds"))
            .unwrap();

        assert_eq!(handled, 0);
        assert!(inbox.pending().unwrap().is_empty());
    }

    #[test]
    fn already_claimed_message_is_skipped() {
        let store = test_store();
        store.publish_notification("llm", KIND_RUN, None).unwrap();
        let id = store.pending_notifications("llm").unwrap()[0].id;
        store.claim_notification(id).unwrap();

        let inbox = Inbox::new(store, "llm");
        let handled = inbox.process_pending(|_, _| Ok(())).unwrap();
        assert_eq!(handled, 0);
    }

    #[test]
    fn crash_after_read_redelivers_idempotently() {
        let store = test_store();
        store
            .upsert_io_config("llm", "system_metrics_log", "llm_outputs")
            .unwrap();
        store
            .publish_notification("llm", KIND_CONFIG_RELOAD, None)
            .unwrap();

        let inbox = Inbox::new(store.clone(), "llm");
        let mut reload_count = 0;
        let mut reload = |store: &Store| {
            // the action a CONFIG_RELOAD triggers: re-read the io config row
            let config = store.io_config("llm").unwrap().unwrap();
            assert_eq!(config.output_table, "llm_outputs");
            reload_count += 1;
        };

        // first consumer reads and acts but crashes before claiming
        let pending = inbox.pending().unwrap();
        assert_eq!(pending.len(), 1);
        reload(&store);

        // restarted consumer sees the same message again and consumes it
        let handled = inbox
            .process_pending(|kind, _| {
                assert_eq!(*kind, NotificationKind::ConfigReload);
                reload(&store);
                Ok(())
            })
            .unwrap();

        assert_eq!(handled, 1);
        assert_eq!(reload_count, 2);
        // visible state identical to a single consumption
        assert!(inbox.pending().unwrap().is_empty());
        assert!(!store.io_config("llm").unwrap().unwrap().needs_reload);
    }

    #[test]
    fn config_reload_scenario() {
        let store = test_store();
        store
            .upsert_io_config("main_llm_processor", "system_metrics_log", "llm_outputs")
            .unwrap();
        assert!(!store.io_config("main_llm_processor").unwrap().unwrap().needs_reload);

        store
            .publish_notification("main_llm_processor", KIND_CONFIG_RELOAD, None)
            .unwrap();

        let inbox = Inbox::new(store.clone(), "main_llm_processor");
        let mut reloads = 0;
        inbox
            .process_pending(|_, _| {
                store.io_config("main_llm_processor").unwrap().unwrap();
                reloads += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(reloads, 1);
        assert!(inbox.pending().unwrap().is_empty());

        // republishing re-triggers only the reload itself
        store
            .publish_notification("main_llm_processor", KIND_CONFIG_RELOAD, None)
            .unwrap();
        inbox
            .process_pending(|_, _| {
                store.io_config("main_llm_processor").unwrap().unwrap();
                reloads += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(reloads, 2);
        assert!(!store.io_config("main_llm_processor").unwrap().unwrap().needs_reload);
    }

    #[test]
    fn handler_error_is_logged_not_fatal() {
        let store = test_store();
        store.publish_notification("llm", KIND_RUN, None).unwrap();
        store.publish_notification("llm", KIND_RUN, None).unwrap();

        let inbox = Inbox::new(store.clone(), "llm");
        let mut calls = 0;
        let handled = inbox
            .process_pending(|_, _| {
                calls += 1;
                if calls == 1 {
                    Err(crate::error::WardenError::Config("boom".to_string()))
                } else {
                    Ok(())
                }
            })
            .unwrap();

        assert_eq!(calls, 2);
        assert_eq!(handled, 1);
        // the failure is visible in the lifecycle log
        let last = store.last_event_for("llm").unwrap().unwrap();
        assert_eq!(last.event_kind, "error");
    }

    #[test]
    fn push_payload_preserves_listed_order() {
        assert_eq!(
            parse_push_payload("cpu_temperature_log, system_metrics_log"),
            vec!["cpu_temperature_log", "system_metrics_log"]
        );
        assert!(parse_push_payload("").is_empty());
    }

    #[test]
    fn pull_request_response_lands_in_output_channel() {
        let store = test_store();
        respond_pull_request(&store, "nano_analyzer_01", "system_metrics_log").unwrap();

        let rows = store.outputs_after(0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].llm_id, "nano_analyzer_01");
        assert_eq!(rows[0].content, "PULL_REQUEST:system_metrics_log");
    }

    #[test]
    fn reload_bridge_publishes_once_per_request() {
        let store = test_store();
        store
            .upsert_io_config("llm", "system_metrics_log", "llm_outputs")
            .unwrap();
        store.set_needs_reload("llm").unwrap();

        assert_eq!(bridge_reload_flags(&store).unwrap(), 1);
        // flag cleared, nothing more to publish
        assert_eq!(bridge_reload_flags(&store).unwrap(), 0);

        let pending = store.pending_notifications("llm").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, KIND_CONFIG_RELOAD);
    }
}
