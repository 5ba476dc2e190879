//! Plugin manager: owns the engine's shared state (store, compiler,
//! builtins) and the lifecycle and status of every registered plugin.
//!
//! Status changes are pushed to listeners. Plugin statuses are only
//! announced when they actually change, and listeners receive the maps in
//! the order the updates were applied. Listeners run outside the state
//! locks, so they may read from the manager, but must not update plugin
//! status themselves.

pub mod bundle;
pub mod discovery;
mod download;
pub mod status;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::builtins::BuiltinRegistry;
use crate::bundle::BundleError;
use crate::compile::{Compiled, Compiler};
use crate::config::EngineConfig;
use crate::storage::{StorageError, Store};

pub use download::{Download, Downloader};

/// Plugin names the engine registers itself.
pub const BUNDLE_PLUGIN: &str = "bundle";
pub const DISCOVERY_PLUGIN: &str = "discovery";
pub const STATUS_PLUGIN: &str = "status";

/// Bundle status code for download and activation failures.
pub const BUNDLE_ERROR_CODE: &str = "bundle_error";

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("plugin {plugin}: invalid configuration: {message}")]
    Config { plugin: String, message: String },

    #[error("plugin {0} is already registered")]
    Duplicate(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url}: server replied {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ── Status types ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    NotReady,
    Ok,
    Err,
    Warn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginStatus {
    pub state: PluginState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PluginStatus {
    pub fn new(state: PluginState) -> Self {
        Self {
            state,
            message: None,
        }
    }

    pub fn with_message(state: PluginState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: Some(message.into()),
        }
    }
}

/// Outcome of the latest download/activation attempt of one bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleStatus {
    pub name: String,
    #[serde(default)]
    pub active_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_activation: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_download: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_request: Option<DateTime<Utc>>,
}

impl BundleStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn set_error(&mut self, err: &dyn std::error::Error) {
        self.code = Some(BUNDLE_ERROR_CODE.to_string());
        self.message = Some(err.to_string());
        self.errors = vec![err.to_string()];
    }

    pub fn clear_error(&mut self) {
        self.code = None;
        self.message = None;
        self.errors.clear();
    }
}

pub type StatusListener = Arc<dyn Fn(&BTreeMap<String, PluginStatus>) + Send + Sync>;
pub type BundleListener = Arc<dyn Fn(&BundleStatus) + Send + Sync>;

// ── Plugin traits ───────────────────────────────────────────────────

#[async_trait]
pub trait Plugin: Send + Sync {
    async fn start(&self) -> Result<(), PluginError>;

    async fn stop(&self);

    /// Apply a new configuration. Plugins that cannot reconfigure ignore it.
    async fn reconfigure(&self, _config: Value) {}
}

/// Builds a plugin from its section of `EngineConfig::plugins`.
pub trait PluginFactory: Send + Sync {
    fn validate(&self, config: &Value) -> Result<Value, String> {
        Ok(config.clone())
    }

    fn create(&self, manager: &Arc<PluginManager>, config: Value) -> Arc<dyn Plugin>;
}

// ── Manager ─────────────────────────────────────────────────────────

pub struct ManagerParams {
    pub id: String,
    pub config: EngineConfig,
    pub store: Arc<dyn Store>,
    pub builtins: Arc<BuiltinRegistry>,
    /// Runtime description exposed to plugins (config, environment, version).
    pub info: Value,
    /// Maximum compile errors reported; 0 means unlimited.
    pub error_limit: usize,
}

pub struct PluginManager {
    id: String,
    config: EngineConfig,
    store: Arc<dyn Store>,
    builtins: Arc<BuiltinRegistry>,
    info: Value,
    error_limit: usize,
    http: reqwest::Client,
    compiler: RwLock<Arc<Compiled>>,
    plugins: Mutex<Vec<(String, Arc<dyn Plugin>)>>,
    statuses: Mutex<BTreeMap<String, PluginStatus>>,
    /// Serializes a status update together with its dispatch.
    status_dispatch: Mutex<()>,
    status_listeners: Mutex<BTreeMap<String, StatusListener>>,
    bundle_listeners: Mutex<BTreeMap<String, BundleListener>>,
}

impl PluginManager {
    pub fn new(params: ManagerParams) -> Arc<Self> {
        let compiler = Compiled::empty(params.builtins.clone());
        Arc::new(Self {
            id: params.id,
            config: params.config,
            store: params.store,
            builtins: params.builtins,
            info: params.info,
            error_limit: params.error_limit,
            http: reqwest::Client::new(),
            compiler: RwLock::new(compiler),
            plugins: Mutex::new(Vec::new()),
            statuses: Mutex::new(BTreeMap::new()),
            status_dispatch: Mutex::new(()),
            status_listeners: Mutex::new(BTreeMap::new()),
            bundle_listeners: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn builtins(&self) -> &Arc<BuiltinRegistry> {
        &self.builtins
    }

    pub fn info(&self) -> &Value {
        &self.info
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// A compiler configured with this manager's builtins and error limit.
    pub fn new_compiler(&self) -> Compiler {
        Compiler::new(self.builtins.clone()).with_error_limit(self.error_limit)
    }

    /// The most recently published compilation.
    pub fn compiler(&self) -> Arc<Compiled> {
        self.compiler.read().expect("compiler lock poisoned").clone()
    }

    pub fn set_compiler(&self, compiled: Arc<Compiled>) {
        *self.compiler.write().expect("compiler lock poisoned") = compiled;
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register a plugin under `name`. It starts out `NotReady`.
    pub fn register(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        {
            let mut plugins = self.plugins.lock().expect("plugins lock poisoned");
            if plugins.iter().any(|(n, _)| n == name) {
                return Err(PluginError::Duplicate(name.to_string()));
            }
            plugins.push((name.to_string(), plugin));
        }
        debug!(plugin = name, manager = %self.id, "registered plugin");
        self.update_plugin_status(name, PluginStatus::new(PluginState::NotReady));
        Ok(())
    }

    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins
            .lock()
            .expect("plugins lock poisoned")
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .lock()
            .expect("plugins lock poisoned")
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, p)| p.clone())
    }

    // ── Status ──────────────────────────────────────────────────────

    pub fn plugin_status(&self) -> BTreeMap<String, PluginStatus> {
        self.statuses.lock().expect("status lock poisoned").clone()
    }

    /// Record a plugin status; listeners see the full map when it changed.
    pub fn update_plugin_status(&self, name: &str, status: PluginStatus) {
        let _dispatch = self.status_dispatch.lock().expect("dispatch lock poisoned");
        let snapshot = {
            let mut statuses = self.statuses.lock().expect("status lock poisoned");
            if statuses.get(name) == Some(&status) {
                return;
            }
            statuses.insert(name.to_string(), status);
            statuses.clone()
        };
        let listeners: Vec<StatusListener> = self
            .status_listeners
            .lock()
            .expect("listener lock poisoned")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    pub fn register_plugin_status_listener(&self, name: &str, listener: StatusListener) {
        self.status_listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(name.to_string(), listener);
    }

    pub fn status_listener_names(&self) -> Vec<String> {
        self.status_listeners
            .lock()
            .expect("listener lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn unregister_plugin_status_listener(&self, name: &str) {
        self.status_listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(name);
    }

    pub fn register_bundle_listener(&self, name: &str, listener: BundleListener) {
        self.bundle_listeners
            .lock()
            .expect("listener lock poisoned")
            .insert(name.to_string(), listener);
    }

    pub fn unregister_bundle_listener(&self, name: &str) {
        self.bundle_listeners
            .lock()
            .expect("listener lock poisoned")
            .remove(name);
    }

    /// Forward a bundle status to every bundle listener.
    pub fn report_bundle_status(&self, status: &BundleStatus) {
        let listeners: Vec<BundleListener> = self
            .bundle_listeners
            .lock()
            .expect("listener lock poisoned")
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(status);
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start every registered plugin in registration order.
    pub async fn start(&self) -> Result<(), PluginError> {
        let plugins: Vec<(String, Arc<dyn Plugin>)> =
            self.plugins.lock().expect("plugins lock poisoned").clone();
        for (name, plugin) in plugins {
            if let Err(e) = plugin.start().await {
                warn!(plugin = %name, error = %e, "plugin failed to start");
                self.update_plugin_status(&name, PluginStatus::with_message(PluginState::Err, e.to_string()));
                return Err(e);
            }
        }
        info!(manager = %self.id, "plugins started");
        Ok(())
    }

    pub async fn stop(&self) {
        let plugins: Vec<(String, Arc<dyn Plugin>)> =
            self.plugins.lock().expect("plugins lock poisoned").clone();
        for (name, plugin) in plugins.into_iter().rev() {
            plugin.stop().await;
            debug!(plugin = %name, "plugin stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn manager(config: EngineConfig) -> Arc<PluginManager> {
        PluginManager::new(ManagerParams {
            id: "test".to_string(),
            config,
            store: Arc::new(InMemStore::new()),
            builtins: Arc::new(BuiltinRegistry::with_defaults()),
            info: Value::Null,
            error_limit: 10,
        })
    }

    struct Noop;

    #[async_trait]
    impl Plugin for Noop {
        async fn start(&self) -> Result<(), PluginError> {
            Ok(())
        }
        async fn stop(&self) {}
    }

    #[test]
    fn listeners_fire_only_on_change() {
        let m = manager(EngineConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        m.register_plugin_status_listener("t", Arc::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        m.register("p", Arc::new(Noop)).unwrap();
        m.update_plugin_status("p", PluginStatus::new(PluginState::NotReady));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        m.update_plugin_status("p", PluginStatus::new(PluginState::Ok));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(m.plugin_status()["p"].state, PluginState::Ok);
    }

    #[test]
    fn listener_may_call_back_into_manager() {
        let m = manager(EngineConfig::default());
        let weak = Arc::downgrade(&m);
        m.register_plugin_status_listener("reentrant", Arc::new(move |_| {
            if let Some(m) = weak.upgrade() {
                let _ = m.plugin_status();
                let _ = m.plugin_names();
            }
        }));
        m.register("p", Arc::new(Noop)).unwrap();
    }

    #[test]
    fn concurrent_updates_reach_listeners_in_order() {
        let m = manager(EngineConfig::default());
        let last_seen = Arc::new(Mutex::new(BTreeMap::new()));
        let seen = last_seen.clone();
        m.register_plugin_status_listener("slow", Arc::new(move |statuses: &BTreeMap<String, PluginStatus>| {
            std::thread::sleep(std::time::Duration::from_millis(1));
            *seen.lock().unwrap() = statuses.clone();
        }));

        std::thread::scope(|scope| {
            for i in 0..4 {
                let m = &m;
                scope.spawn(move || {
                    let name = format!("p{i}");
                    for round in 0..20 {
                        let state = if round % 2 == 0 { PluginState::NotReady } else { PluginState::Ok };
                        m.update_plugin_status(&name, PluginStatus::new(state));
                    }
                });
            }
        });

        let statuses = m.plugin_status();
        assert_eq!(statuses.len(), 4);
        assert!(statuses.values().all(|s| s.state == PluginState::Ok));
        assert_eq!(*last_seen.lock().unwrap(), statuses);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let m = manager(EngineConfig::default());
        m.register("p", Arc::new(Noop)).unwrap();
        assert!(matches!(
            m.register("p", Arc::new(Noop)),
            Err(PluginError::Duplicate(_))
        ));
    }

    #[test]
    fn bundle_listeners_receive_statuses() {
        let m = manager(EngineConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        m.register_bundle_listener("t", Arc::new(move |status: &BundleStatus| {
            s.lock().unwrap().push(status.name.clone());
        }));
        m.report_bundle_status(&BundleStatus::new("b1"));
        assert_eq!(*seen.lock().unwrap(), vec!["b1".to_string()]);
    }
}
