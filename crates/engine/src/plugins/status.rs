//! Status plugin: reports plugin and bundle statuses to a remote service
//! and/or the log whenever they change, and periodically.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BundleStatus, Plugin, PluginError, PluginManager, PluginState, PluginStatus, STATUS_PLUGIN};
use crate::config::{ServiceConfig, StatusConfig};

struct Shared {
    manager: Weak<PluginManager>,
    config: StatusConfig,
    target: Option<(String, ServiceConfig)>,
    bundles: Mutex<BTreeMap<String, BundleStatus>>,
    changed: Notify,
}

pub struct StatusPlugin {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusPlugin {
    pub fn new(manager: &Arc<PluginManager>) -> Result<Self, PluginError> {
        let config = manager.config().status.clone().unwrap_or(StatusConfig {
            console: true,
            interval_seconds: 30,
            ..StatusConfig::default()
        });
        let target = match config.service.as_deref() {
            Some(name) => {
                let service = manager.config().service(name).ok_or_else(|| PluginError::Config {
                    plugin: STATUS_PLUGIN.to_string(),
                    message: format!("unknown service {name}"),
                })?;
                let url = format!("{}/status", service.url.trim_end_matches('/'));
                Some((url, service.clone()))
            }
            None => None,
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                manager: Arc::downgrade(manager),
                config,
                target,
                bundles: Mutex::new(BTreeMap::new()),
                changed: Notify::new(),
            }),
            shutdown,
            task: Mutex::new(None),
        })
    }
}

impl Shared {
    fn report(&self, manager: &PluginManager) -> Value {
        let bundles = self.bundles.lock().expect("status lock poisoned").clone();
        json!({
            "id": manager.id(),
            "labels": manager.config().labels,
            "plugins": manager.plugin_status(),
            "bundles": bundles,
        })
    }

    async fn send(&self) {
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let report = self.report(&manager);
        if self.config.console || self.target.is_none() {
            info!(report = %report, "status report");
        }
        let Some((url, service)) = &self.target else {
            return;
        };

        let mut request = manager
            .http()
            .post(url)
            .timeout(service.timeout())
            .header(CONTENT_TYPE, "application/json")
            .body(report.to_string());
        if let Some(auth) = service.authorization() {
            request = request.header(AUTHORIZATION, auth);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %url, "status report delivered");
                manager.update_plugin_status(STATUS_PLUGIN, PluginStatus::new(PluginState::Ok));
            }
            Ok(response) => {
                warn!(url = %url, status = %response.status(), "status service rejected report");
                manager.update_plugin_status(
                    STATUS_PLUGIN,
                    PluginStatus::with_message(PluginState::Warn, format!("status service replied {}", response.status())),
                );
            }
            Err(e) => {
                warn!(url = %url, error = %e, "status report failed");
                manager.update_plugin_status(
                    STATUS_PLUGIN,
                    PluginStatus::with_message(PluginState::Warn, e.to_string()),
                );
            }
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = self.changed.notified() => {}
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
            self.send().await;
        }
    }
}

#[async_trait]
impl Plugin for StatusPlugin {
    async fn start(&self) -> Result<(), PluginError> {
        let Some(manager) = self.shared.manager.upgrade() else {
            return Ok(());
        };

        let weak = Arc::downgrade(&self.shared);
        manager.register_plugin_status_listener(
            STATUS_PLUGIN,
            Arc::new(move |_| {
                if let Some(shared) = weak.upgrade() {
                    shared.changed.notify_one();
                }
            }),
        );
        let weak = Arc::downgrade(&self.shared);
        manager.register_bundle_listener(
            STATUS_PLUGIN,
            Arc::new(move |status: &BundleStatus| {
                if let Some(shared) = weak.upgrade() {
                    shared
                        .bundles
                        .lock()
                        .expect("status lock poisoned")
                        .insert(status.name.clone(), status.clone());
                    shared.changed.notify_one();
                }
            }),
        );

        {
            let mut task = self.task.lock().expect("task lock poisoned");
            if task.is_none() {
                let shared = self.shared.clone();
                *task = Some(tokio::spawn(shared.run(self.shutdown.subscribe())));
            }
        }
        manager.update_plugin_status(STATUS_PLUGIN, PluginStatus::new(PluginState::Ok));
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.unregister_plugin_status_listener(STATUS_PLUGIN);
            manager.unregister_bundle_listener(STATUS_PLUGIN);
        }
    }
}
