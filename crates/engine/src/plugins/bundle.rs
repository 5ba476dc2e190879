//! Remote bundle plugin: polls configured services for bundle tarballs and
//! activates each new download in its own write transaction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{
    BundleStatus, Download, Downloader, Plugin, PluginError, PluginManager, PluginState,
    PluginStatus,
};
use crate::bundle::{activate, ActivateOptions, Bundle, BundleLoader};
use crate::config::{BundleSourceConfig, PollingConfig};
use crate::storage::{non_empty, TransactionParams};

struct Source {
    name: String,
    polling: PollingConfig,
    downloader: Downloader,
}

struct Shared {
    plugin_name: String,
    manager: Weak<PluginManager>,
    loader: BundleLoader,
    sources: Vec<Source>,
    statuses: Mutex<BTreeMap<String, BundleStatus>>,
    activated: Mutex<BTreeSet<String>>,
}

pub struct BundlePlugin {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BundlePlugin {
    /// Plugin polling `sources`, reporting its own status as `plugin_name`.
    pub fn new(
        plugin_name: &str,
        manager: &Arc<PluginManager>,
        sources: &BTreeMap<String, BundleSourceConfig>,
    ) -> Result<Self, PluginError> {
        let mut resolved = Vec::new();
        for (name, source) in sources {
            let (_, service) = manager
                .config()
                .resolve_service(source.service.as_deref())
                .ok_or_else(|| PluginError::Config {
                    plugin: plugin_name.to_string(),
                    message: format!(
                        "bundle {name}: unknown service {}",
                        source.service.as_deref().unwrap_or("<none>")
                    ),
                })?;
            resolved.push(Source {
                name: name.clone(),
                polling: source.polling,
                downloader: Downloader::new(
                    manager.http().clone(),
                    service.clone(),
                    &source.resource_for(name),
                ),
            });
        }
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                plugin_name: plugin_name.to_string(),
                manager: Arc::downgrade(manager),
                loader: BundleLoader::new(),
                sources: resolved,
                statuses: Mutex::new(BTreeMap::new()),
                activated: Mutex::new(BTreeSet::new()),
            }),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn bundle_names(&self) -> Vec<String> {
        self.shared.sources.iter().map(|s| s.name.clone()).collect()
    }

    /// Latest status of every bundle that has been attempted.
    pub fn statuses(&self) -> BTreeMap<String, BundleStatus> {
        self.shared
            .statuses
            .lock()
            .expect("bundle status lock poisoned")
            .clone()
    }
}

impl Shared {
    async fn poll(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        loop {
            if self.attempt(index).await {
                failures = 0;
            } else {
                failures = failures.saturating_add(1);
            }
            let delay = self.sources[index].polling.delay(failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    /// One download/activation attempt. Reports the bundle status either way.
    async fn attempt(&self, index: usize) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let source = &self.sources[index];
        let mut status = self
            .statuses
            .lock()
            .expect("bundle status lock poisoned")
            .get(&source.name)
            .cloned()
            .unwrap_or_else(|| BundleStatus::new(&source.name));
        let now = Utc::now();
        status.last_request = Some(now);

        let ok = match source.downloader.fetch().await {
            Ok(Download::NotModified) => {
                status.clear_error();
                true
            }
            Ok(Download::Bundle { bytes, .. }) => {
                status.last_successful_download = Some(now);
                let outcome = match self.loader.load_tarball_bytes(&source.name, &bytes) {
                    Ok(bundle) => self.activate(&manager, &source.name, bundle).await,
                    Err(e) => Err(e.into()),
                };
                match outcome {
                    Ok(revision) => {
                        info!(bundle = %source.name, revision = %revision, "remote bundle activated");
                        status.active_revision = revision;
                        status.last_successful_activation = Some(Utc::now());
                        status.clear_error();
                        true
                    }
                    Err(e) => {
                        warn!(bundle = %source.name, error = %e, "remote bundle activation failed");
                        status.set_error(&e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!(bundle = %source.name, url = %source.downloader.url(), error = %e, "bundle download failed");
                status.set_error(&e);
                false
            }
        };

        self.statuses
            .lock()
            .expect("bundle status lock poisoned")
            .insert(source.name.clone(), status.clone());
        manager.report_bundle_status(&status);

        if status.last_successful_activation.is_some() {
            let all = {
                let mut activated = self.activated.lock().expect("activated lock poisoned");
                activated.insert(source.name.clone());
                self.sources.iter().all(|s| activated.contains(&s.name))
            };
            if all {
                manager.update_plugin_status(&self.plugin_name, PluginStatus::new(PluginState::Ok));
            }
        }
        ok
    }

    async fn activate(
        &self,
        manager: &PluginManager,
        name: &str,
        bundle: Bundle,
    ) -> Result<String, PluginError> {
        let store = manager.store().clone();
        let revision = bundle.manifest.revision.clone();
        let bundles = BTreeMap::from([(name.to_string(), bundle)]);
        let compiler = manager.new_compiler();
        let extra = BTreeMap::new();

        let mut txn = store.new_transaction(TransactionParams::WRITE).await?;
        let result = non_empty(store.as_ref(), &txn)
            .map_err(PluginError::from)
            .and_then(|existing| {
                let opts = ActivateOptions {
                    store: store.as_ref(),
                    compiler: &compiler,
                    bundles: &bundles,
                    extra_modules: &extra,
                    path_conflicts_check: existing,
                };
                activate(&opts, &mut txn).map_err(PluginError::from)
            });
        match result {
            Ok(compiled) => {
                store.commit(txn)?;
                manager.set_compiler(compiled);
                Ok(revision)
            }
            Err(e) => {
                store.abort(txn);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Plugin for BundlePlugin {
    async fn start(&self) -> Result<(), PluginError> {
        let mut tasks = self.tasks.lock().expect("task lock poisoned");
        if !tasks.is_empty() {
            return Ok(());
        }
        for index in 0..self.shared.sources.len() {
            let shared = self.shared.clone();
            let rx = self.shutdown.subscribe();
            tasks.push(tokio::spawn(shared.poll(index, rx)));
        }
        info!(plugin = %self.shared.plugin_name, bundles = self.shared.sources.len(), "bundle polling started");
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().expect("task lock poisoned").drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if let Some(manager) = self.shared.manager.upgrade() {
            manager.update_plugin_status(&self.shared.plugin_name, PluginStatus::new(PluginState::NotReady));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{build, BuildParams};
    use crate::builtins::BuiltinRegistry;
    use crate::config::{EngineConfig, ServiceConfig};
    use crate::plugins::tests::manager;
    use crate::storage::StoragePath;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn tarball() -> Vec<u8> {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("p.rego"), "package remote\nallow = true\n").unwrap();
        std::fs::write(src.path().join("data.json"), r#"{"remote": {"k": 1}}"#).unwrap();
        let mut out = Vec::new();
        let params = BuildParams {
            revision: Some("rev-7".to_string()),
            ..BuildParams::default()
        };
        build(&[src.path().to_path_buf()], &params, &BuiltinRegistry::with_defaults(), &mut out).unwrap();
        out
    }

    async fn serve_once(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 2048];
                let _ = socket.read(&mut buf).await;
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/gzip\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
            }
        });
        format!("http://{addr}")
    }

    fn config(url: &str) -> EngineConfig {
        EngineConfig {
            services: BTreeMap::from([(
                "svc".to_string(),
                ServiceConfig {
                    url: url.to_string(),
                    response_header_timeout_seconds: Some(2),
                    credentials: None,
                },
            )]),
            bundles: BTreeMap::from([(
                "authz".to_string(),
                BundleSourceConfig {
                    service: Some("svc".to_string()),
                    ..BundleSourceConfig::default()
                },
            )]),
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn downloads_and_activates_bundle() {
        let url = serve_once(tarball()).await;
        let cfg = config(&url);
        let m = manager(cfg.clone());
        let plugin = Arc::new(BundlePlugin::new("bundle", &m, &cfg.bundles).unwrap());
        m.register("bundle", plugin.clone()).unwrap();

        assert!(plugin.shared.attempt(0).await);
        assert_eq!(m.plugin_status()["bundle"].state, PluginState::Ok);
        let status = &plugin.statuses()["authz"];
        assert_eq!(status.active_revision, "rev-7");
        assert!(status.last_successful_activation.is_some());

        let store = m.store();
        let txn = store.new_transaction(TransactionParams::READ).await.unwrap();
        assert_eq!(
            store.read(&txn, &StoragePath::parse("/remote/k").unwrap()).unwrap(),
            json!(1)
        );
        assert!(m
            .compiler()
            .rule_set(&["remote".to_string(), "allow".to_string()])
            .is_some());
    }

    #[tokio::test]
    async fn unreachable_service_reports_bundle_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let cfg = config(&url);
        let m = manager(cfg.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        m.register_bundle_listener("t", Arc::new(move |st: &BundleStatus| {
            s.lock().unwrap().push(st.clone());
        }));
        let plugin = Arc::new(BundlePlugin::new("bundle", &m, &cfg.bundles).unwrap());
        m.register("bundle", plugin.clone()).unwrap();

        assert!(!plugin.shared.attempt(0).await);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].code.as_deref(), Some(crate::plugins::BUNDLE_ERROR_CODE));
        assert!(seen[0].last_successful_activation.is_none());
        assert_eq!(m.plugin_status()["bundle"].state, PluginState::NotReady);
    }

    #[tokio::test]
    async fn unknown_service_is_a_config_error() {
        let mut cfg = config("http://127.0.0.1:1");
        cfg.bundles.get_mut("authz").unwrap().service = Some("nope".to_string());
        let m = manager(cfg.clone());
        assert!(matches!(
            BundlePlugin::new("bundle", &m, &cfg.bundles),
            Err(PluginError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn stop_ends_polling() {
        let url = serve_once(tarball()).await;
        let cfg = config(&url);
        let m = manager(cfg.clone());
        let plugin = Arc::new(BundlePlugin::new("bundle", &m, &cfg.bundles).unwrap());
        m.register("bundle", plugin.clone()).unwrap();
        plugin.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), plugin.stop())
            .await
            .unwrap();
        assert!(plugin.tasks.lock().unwrap().is_empty());
    }
}
