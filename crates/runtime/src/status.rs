//! Status aggregation.
//!
//! Plugin and bundle status events arrive from any number of engine tasks.
//! They are funnelled through one channel into a single consumer that
//! records them in the [`StatusAggregator`] and publishes a fresh
//! [`RuntimeSnapshot`] after each one. Readers only ever see whole
//! snapshots.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use warden_engine::plugins::{
    BundleStatus, PluginState, PluginStatus, BUNDLE_ERROR_CODE, DISCOVERY_PLUGIN, STATUS_PLUGIN,
};

/// Extra error reported for bundles that were never activated.
pub const NEVER_ACTIVATED: &str = "bundle has never been activated";

// ── Recorded state ────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubsystemState {
    pub loaded: bool,
    pub last_error: Option<String>,
}

impl From<&PluginStatus> for SubsystemState {
    fn from(status: &PluginStatus) -> Self {
        match status.state {
            PluginState::Ok | PluginState::Warn => Self {
                loaded: true,
                last_error: None,
            },
            PluginState::NotReady => Self {
                loaded: false,
                last_error: None,
            },
            PluginState::Err => Self {
                loaded: false,
                last_error: Some(
                    status
                        .message
                        .clone()
                        .unwrap_or_else(|| "there was an error loading the plugin".to_string()),
                ),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BundleState {
    pub revision: String,
    pub errors: Vec<String>,
    pub message: String,
    pub last_activation: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
}

impl From<&BundleStatus> for BundleState {
    fn from(status: &BundleStatus) -> Self {
        let mut errors = status.errors.clone();
        let message = status.message.clone().unwrap_or_default();
        if status.code.as_deref() == Some(BUNDLE_ERROR_CODE) {
            errors.push(format!("bundle error: {message}"));
        }
        Self {
            revision: status.active_revision.clone(),
            errors,
            message,
            last_activation: status.last_successful_activation,
            last_download: status.last_successful_download,
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubsystemSummary {
    pub name: String,
    pub loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BundleSummary {
    pub id: String,
    pub revision: String,
    pub errors: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub last_activation: Option<DateTime<Utc>>,
    pub last_download: Option<DateTime<Utc>>,
}

/// Point-in-time readiness view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    pub ready: bool,
    pub errors: Vec<String>,
    pub bundles: Vec<BundleSummary>,
    pub subsystems: Vec<SubsystemSummary>,
}

impl RuntimeSnapshot {
    /// Subsystem errors followed by every bundle's errors.
    pub fn all_errors(&self) -> Vec<String> {
        let mut errors = self.errors.clone();
        for bundle in &self.bundles {
            errors.extend(bundle.errors.iter().map(|e| format!("{}: {e}", bundle.id)));
        }
        errors
    }
}

// ── Aggregator ────────────────────────────────────────────────

pub struct StatusAggregator {
    subsystems: DashMap<String, SubsystemState>,
    bundles: DashMap<String, BundleState>,
    discovery_configured: bool,
}

impl StatusAggregator {
    pub fn new(discovery_configured: bool) -> Self {
        Self {
            subsystems: DashMap::new(),
            bundles: DashMap::new(),
            discovery_configured,
        }
    }

    pub fn record_subsystem(&self, name: &str, state: SubsystemState) {
        trace!(subsystem = name, loaded = state.loaded, "subsystem state recorded");
        self.subsystems.insert(name.to_string(), state);
    }

    pub fn record_bundle(&self, id: &str, state: BundleState) {
        trace!(bundle = id, revision = %state.revision, errors = state.errors.len(), "bundle state recorded");
        self.bundles.insert(id.to_string(), state);
    }

    /// Subsystems that never gate readiness.
    fn carved_out(&self, name: &str) -> bool {
        name == STATUS_PLUGIN || (name == DISCOVERY_PLUGIN && !self.discovery_configured)
    }

    pub fn snapshot(&self) -> RuntimeSnapshot {
        let mut ready = true;
        let mut errors = Vec::new();
        let mut subsystems: Vec<SubsystemSummary> = self
            .subsystems
            .iter()
            .map(|entry| {
                let (name, state) = entry.pair();
                if !self.carved_out(name) {
                    if !state.loaded {
                        ready = false;
                    }
                    if let Some(err) = &state.last_error {
                        errors.push(format!("plugin '{name}' encountered an error: {err}"));
                    }
                }
                SubsystemSummary {
                    name: name.clone(),
                    loaded: state.loaded,
                    error: state.last_error.clone(),
                }
            })
            .collect();
        subsystems.sort_by(|a, b| a.name.cmp(&b.name));
        errors.sort();

        let mut bundles: Vec<BundleSummary> = self
            .bundles
            .iter()
            .map(|entry| {
                let (id, state) = entry.pair();
                let mut errors = state.errors.clone();
                if state.last_activation.is_none() {
                    errors.push(NEVER_ACTIVATED.to_string());
                }
                BundleSummary {
                    id: id.clone(),
                    revision: state.revision.clone(),
                    errors,
                    message: state.message.clone(),
                    last_activation: state.last_activation,
                    last_download: state.last_download,
                }
            })
            .collect();
        bundles.sort_by(|a, b| a.id.cmp(&b.id));

        RuntimeSnapshot {
            ready,
            errors,
            bundles,
            subsystems,
        }
    }
}

// ── Event channel ─────────────────────────────────────────────

#[derive(Debug)]
pub enum StatusEvent {
    Subsystem { name: String, state: SubsystemState },
    Bundle { id: String, state: BundleState },
    /// Acknowledged once every earlier event has been applied.
    Flush(oneshot::Sender<()>),
}

/// Producer side of the status channel. Cheap to clone; sends never block.
#[derive(Debug, Clone)]
pub struct StatusSender {
    tx: mpsc::UnboundedSender<StatusEvent>,
}

impl StatusSender {
    pub fn subsystem(&self, name: &str, state: SubsystemState) {
        let _ = self.tx.send(StatusEvent::Subsystem {
            name: name.to_string(),
            state,
        });
    }

    pub fn bundle(&self, id: &str, state: BundleState) {
        let _ = self.tx.send(StatusEvent::Bundle {
            id: id.to_string(),
            state,
        });
    }

    /// Wait until the consumer has applied everything sent so far.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(StatusEvent::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Spawn the consumer. It runs until `shutdown` flips or every sender is gone.
pub fn spawn(
    aggregator: Arc<StatusAggregator>,
    publisher: watch::Sender<Arc<RuntimeSnapshot>>,
    mut shutdown: watch::Receiver<bool>,
) -> (StatusSender, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = rx.recv() => event,
                _ = shutdown.changed() => break,
            };
            let Some(event) = event else {
                break;
            };
            match event {
                StatusEvent::Subsystem { name, state } => aggregator.record_subsystem(&name, state),
                StatusEvent::Bundle { id, state } => aggregator.record_bundle(&id, state),
                StatusEvent::Flush(ack) => {
                    let _ = ack.send(());
                    continue;
                }
            }
            publisher.send_replace(Arc::new(aggregator.snapshot()));
        }
        debug!("status consumer stopped");
    });
    (StatusSender { tx }, handle)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    const NAMES: [&str; 5] = ["bundle", DISCOVERY_PLUGIN, STATUS_PLUGIN, "custom", "heartbeat"];

    fn event() -> impl Strategy<Value = (usize, bool, Option<String>)> {
        (0..NAMES.len(), any::<bool>(), proptest::option::of("[a-z]{1,8}"))
    }

    proptest! {
        /// Readiness equals "every gating subsystem's latest state is loaded",
        /// and errors come only from gating subsystems.
        #[test]
        fn readiness_follows_latest_gating_states(
            discovery_configured in any::<bool>(),
            events in proptest::collection::vec(event(), 0..40),
        ) {
            let agg = StatusAggregator::new(discovery_configured);
            let mut latest: BTreeMap<&str, SubsystemState> = BTreeMap::new();
            for (i, loaded, last_error) in events {
                let state = SubsystemState { loaded, last_error };
                agg.record_subsystem(NAMES[i], state.clone());
                latest.insert(NAMES[i], state);
            }

            let gating: Vec<(&&str, &SubsystemState)> = latest
                .iter()
                .filter(|(name, _)| {
                    **name != STATUS_PLUGIN && (**name != DISCOVERY_PLUGIN || discovery_configured)
                })
                .collect();
            let snap = agg.snapshot();
            prop_assert_eq!(snap.ready, gating.iter().all(|(_, s)| s.loaded));
            prop_assert_eq!(snap.subsystems.len(), latest.len());
            prop_assert_eq!(
                snap.errors.len(),
                gating.iter().filter(|(_, s)| s.last_error.is_some()).count()
            );
        }
    }
}
