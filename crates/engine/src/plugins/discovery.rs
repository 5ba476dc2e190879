//! Discovery plugin: downloads a bundle whose data carries further engine
//! configuration and starts the bundle sources it names.
//!
//! Without a discovery configuration the plugin is inert and stays
//! `NotReady`; readiness checks are expected to skip it in that case.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::bundle::BundlePlugin;
use super::{
    BundleStatus, Download, Downloader, Plugin, PluginError, PluginManager, PluginState,
    PluginStatus, BUNDLE_PLUGIN, DISCOVERY_PLUGIN,
};
use crate::bundle::BundleLoader;
use crate::config::{BundleSourceConfig, DiscoveryConfig};
use crate::eval::value::data_at;

/// Configuration a discovery bundle may carry.
#[derive(Debug, Default, Deserialize)]
struct Discovered {
    #[serde(default)]
    bundles: BTreeMap<String, BundleSourceConfig>,
}

struct Active {
    config: DiscoveryConfig,
    downloader: Downloader,
}

struct Shared {
    manager: Weak<PluginManager>,
    active: Option<Active>,
    loader: BundleLoader,
    status: Mutex<Option<BundleStatus>>,
    discovered: Mutex<Option<Arc<BundlePlugin>>>,
}

pub struct DiscoveryPlugin {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryPlugin {
    pub fn new(manager: &Arc<PluginManager>) -> Result<Self, PluginError> {
        let active = match manager.config().discovery.clone() {
            Some(config) => {
                let (_, service) = manager
                    .config()
                    .resolve_service(config.service.as_deref())
                    .ok_or_else(|| PluginError::Config {
                        plugin: DISCOVERY_PLUGIN.to_string(),
                        message: format!(
                            "unknown service {}",
                            config.service.as_deref().unwrap_or("<none>")
                        ),
                    })?;
                let source = config.as_source();
                let resource = source.resource_for(&config.bundle_name());
                Some(Active {
                    downloader: Downloader::new(manager.http().clone(), service.clone(), &resource),
                    config,
                })
            }
            None => None,
        };
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                manager: Arc::downgrade(manager),
                active,
                loader: BundleLoader::new(),
                status: Mutex::new(None),
                discovered: Mutex::new(None),
            }),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.shared.active.is_some()
    }
}

impl Shared {
    async fn poll(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(active) = &self.active else {
            return;
        };
        let mut failures = 0u32;
        loop {
            if self.attempt(active).await {
                failures = 0;
            } else {
                failures = failures.saturating_add(1);
            }
            tokio::select! {
                _ = tokio::time::sleep(active.config.polling.delay(failures)) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn attempt(&self, active: &Active) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let name = active.config.bundle_name();
        let mut status = self
            .status
            .lock()
            .expect("discovery status lock poisoned")
            .clone()
            .unwrap_or_else(|| BundleStatus::new(&name));
        let now = Utc::now();
        status.last_request = Some(now);

        let outcome = match active.downloader.fetch().await {
            Ok(Download::NotModified) => Ok(false),
            Ok(Download::Bundle { bytes, .. }) => {
                status.last_successful_download = Some(now);
                match self.loader.load_tarball_bytes(&name, &bytes) {
                    Ok(bundle) => {
                        let revision = bundle.manifest.revision.clone();
                        self.apply(&manager, &name, &bundle.data).await.map(|_| {
                            status.active_revision = revision;
                            true
                        })
                    }
                    Err(e) => Err(PluginError::from(e)),
                }
            }
            Err(e) => Err(e),
        };

        let ok = match outcome {
            Ok(activated) => {
                if activated {
                    status.last_successful_activation = Some(Utc::now());
                }
                status.clear_error();
                true
            }
            Err(e) => {
                warn!(bundle = %name, error = %e, "discovery failed");
                status.set_error(&e);
                false
            }
        };

        *self.status.lock().expect("discovery status lock poisoned") = Some(status.clone());
        manager.report_bundle_status(&status);
        if status.last_successful_activation.is_some() {
            manager.update_plugin_status(DISCOVERY_PLUGIN, PluginStatus::new(PluginState::Ok));
        }
        ok
    }

    /// Start the bundle sources named by the discovered configuration.
    async fn apply(&self, manager: &Arc<PluginManager>, name: &str, data: &Value) -> Result<(), PluginError> {
        let path: Vec<String> = name
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let doc = data_at(data, &path).unwrap_or(data).clone();
        let discovered: Discovered = serde_json::from_value(doc).map_err(|e| PluginError::Config {
            plugin: DISCOVERY_PLUGIN.to_string(),
            message: e.to_string(),
        })?;
        if discovered.bundles.is_empty() {
            return Ok(());
        }
        if self
            .discovered
            .lock()
            .expect("discovery lock poisoned")
            .is_some()
        {
            info!("discovered bundle sources already running");
            return Ok(());
        }

        let plugin = Arc::new(BundlePlugin::new(BUNDLE_PLUGIN, manager, &discovered.bundles)?);
        manager.register(BUNDLE_PLUGIN, plugin.clone())?;
        plugin.start().await?;
        info!(bundles = ?plugin.bundle_names(), "started discovered bundle sources");
        *self.discovered.lock().expect("discovery lock poisoned") = Some(plugin);
        Ok(())
    }
}

#[async_trait]
impl Plugin for DiscoveryPlugin {
    async fn start(&self) -> Result<(), PluginError> {
        if !self.is_configured() {
            return Ok(());
        }
        let mut task = self.task.lock().expect("task lock poisoned");
        if task.is_none() {
            let shared = self.shared.clone();
            *task = Some(tokio::spawn(shared.poll(self.shutdown.subscribe())));
        }
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().expect("task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let discovered = self.shared.discovered.lock().expect("discovery lock poisoned").clone();
        if let Some(plugin) = discovered {
            plugin.stop().await;
        }
    }
}
