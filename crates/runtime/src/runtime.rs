//! Composition root.
//!
//! A [`Runtime`] owns the store, the plugin manager, the status consumer
//! and its published snapshot, the reload pipeline and its watcher, and the
//! query executor. Everything else in this crate is wired together here.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use warden_engine::plugins::bundle::BundlePlugin;
use warden_engine::plugins::discovery::DiscoveryPlugin;
use warden_engine::plugins::status::StatusPlugin;
use warden_engine::plugins::{
    BundleStatus, ManagerParams, PluginFactory, PluginManager, PluginStatus, BUNDLE_PLUGIN, DISCOVERY_PLUGIN, STATUS_PLUGIN,
};
use warden_engine::version::build_info;
use warden_engine::BuiltinRegistry;

use crate::config::Config;
use crate::decision::{console_enabled, ConsoleDecisionLogger, DecisionLogger};
use crate::error::{Result, RuntimeError};
use crate::introspect::{BundleInfo, Introspector, ModuleInfo, PolicyEntry, PolicyInfo, PolicyItem};
use crate::options::RuntimeOptions;
use crate::query::{FinalEvaluator, QueryExecutor, QueryOptions, QueryResult};
use crate::reload::{log_reload_observer, ReloadObserver, ReloadPipeline};
use crate::status::{self, RuntimeSnapshot, StatusAggregator, StatusSender};
use crate::store::new_store;
use crate::watch::{spawn_watcher, WatchHandle};

/// Name under which the runtime registers its engine listeners.
const LISTENER_NAME: &str = "runtime";

/// Readiness is re-checked at least this often while waiting.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub struct Runtime {
    config: Config,
    manager: Arc<PluginManager>,
    registry: Arc<BuiltinRegistry>,
    status: StatusSender,
    snapshot: watch::Receiver<Arc<RuntimeSnapshot>>,
    pipeline: Arc<ReloadPipeline>,
    executor: QueryExecutor,
    introspector: Introspector,
    observer: ReloadObserver,
    watcher: Mutex<Option<WatchHandle>>,
    shutdown: watch::Sender<bool>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    /// Build a runtime: local bundles are loaded and activated before this
    /// returns, remote plugins are registered but not started.
    #[instrument(skip_all, fields(component = "runtime", instance_id = %config.instance_id))]
    pub async fn new(config: Config, options: RuntimeOptions) -> Result<Arc<Self>> {
        let RuntimeOptions {
            plugins,
            builtins,
            decision_logger,
            store,
            reload_observer,
        } = options;

        let store = store.unwrap_or_else(|| new_store(config.store));

        let mut registry = BuiltinRegistry::with_defaults();
        for (decl, func) in builtins {
            if let Err(e) = registry.register(decl, func) {
                warn!(error = %e, "keeping first registration of builtin");
            }
        }
        let registry = Arc::new(registry);

        let manager = PluginManager::new(ManagerParams {
            id: config.instance_id.clone(),
            config: config.engine.clone(),
            store,
            builtins: registry.clone(),
            info: runtime_info(&config)?,
            error_limit: config.plugins_error_limit,
        });

        let aggregator = Arc::new(StatusAggregator::new(config.engine.discovery.is_some()));
        let (publisher, snapshot) = watch::channel(Arc::new(aggregator.snapshot()));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (status, consumer) = status::spawn(aggregator, publisher, shutdown_rx);
        register_listeners(&manager, &status);

        let wired = wire(&config, &manager, &status, plugins, reload_observer).await;
        let (pipeline, observer, watcher) = match wired {
            Ok(wired) => wired,
            Err(e) => {
                manager.unregister_plugin_status_listener(LISTENER_NAME);
                manager.unregister_bundle_listener(LISTENER_NAME);
                let _ = shutdown.send(true);
                return Err(e);
            }
        };

        let decision_logger = decision_logger.or_else(|| {
            console_enabled(config.engine.decision_logs.as_ref())
                .then(|| Arc::new(ConsoleDecisionLogger) as Arc<dyn DecisionLogger>)
        });
        let executor = QueryExecutor::new(manager.clone(), decision_logger);
        let introspector = Introspector::new(manager.clone());

        status.flush().await;
        info!(plugins = ?manager.plugin_names(), "runtime initialized");

        Ok(Arc::new(Self {
            config,
            manager,
            registry,
            status,
            snapshot,
            pipeline,
            executor,
            introspector,
            observer,
            watcher: Mutex::new(watcher),
            shutdown,
            consumer: Mutex::new(Some(consumer)),
        }))
    }

    // ── Lifecycle ─────────────────────────────────────────────

    #[instrument(skip_all, fields(component = "runtime", instance_id = %self.config.instance_id))]
    pub async fn start(&self) -> Result<()> {
        self.manager.start().await?;
        info!("runtime started");
        Ok(())
    }

    /// Stop the watcher, then every plugin, then the status consumer.
    #[instrument(skip_all, fields(component = "runtime", instance_id = %self.config.instance_id))]
    pub async fn stop(&self) {
        let watcher = self.watcher.lock().expect("watcher lock poisoned").take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }

        let grace = Duration::from_secs(self.config.graceful_shutdown_period_seconds);
        if tokio::time::timeout(grace, self.manager.stop()).await.is_err() {
            warn!(grace_secs = grace.as_secs(), "plugins did not stop within the graceful shutdown period");
        }

        self.status.flush().await;
        self.manager.unregister_plugin_status_listener(LISTENER_NAME);
        self.manager.unregister_bundle_listener(LISTENER_NAME);
        let _ = self.shutdown.send(true);
        let consumer = self.consumer.lock().expect("consumer lock poisoned").take();
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }
        info!("runtime stopped");
    }

    // ── Status ────────────────────────────────────────────────

    pub fn status(&self) -> Arc<RuntimeSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Wait until every gating subsystem is loaded.
    ///
    /// Checked on every snapshot change and every 10ms. Readiness wins over
    /// errors, and errors win over the deadline. A timeout too large to
    /// represent waits without a deadline.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(timeout);
        let mut rx = self.snapshot.clone();
        let mut tick = tokio::time::interval(READY_POLL_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut publisher_gone = false;

        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.ready {
                return Ok(());
            }
            let errors = snapshot.all_errors();
            if !errors.is_empty() {
                return Err(RuntimeError::BadRuntime(errors));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(RuntimeError::RuntimeLoading(timeout));
            }
            tokio::select! {
                changed = rx.changed(), if !publisher_gone => {
                    publisher_gone = changed.is_err();
                }
                _ = tick.tick() => {}
                _ = sleep_until(deadline) => {}
            }
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub async fn query(&self, query: &str, input: Option<&Value>, options: &QueryOptions) -> Result<QueryResult> {
        self.executor.query(query, input, options).await
    }

    pub async fn partial_query(
        &self,
        query: &str,
        input: Option<Value>,
        unknowns: &[String],
        options: &QueryOptions,
    ) -> Result<FinalEvaluator> {
        self.executor.partial_query(query, input, unknowns, options).await
    }

    /// Reload local bundles outside the watcher, reporting to the same
    /// observer. The snapshot reflects the outcome once this returns.
    pub async fn reload(&self) -> Result<()> {
        let started = std::time::Instant::now();
        let outcome = self.pipeline.reload().await;
        (self.observer)(started.elapsed(), outcome.as_ref().err());
        self.status.flush().await;
        outcome
    }

    // ── Introspection ─────────────────────────────────────────

    pub async fn list_bundles(&self) -> Result<Vec<BundleInfo>> {
        self.introspector.list_bundles().await
    }

    pub async fn get_bundle_by_id(&self, id: &str) -> Result<BundleInfo> {
        self.introspector.get_bundle_by_id(id).await
    }

    pub async fn get_policies(&self, bundle_id: &str) -> Result<Vec<PolicyItem>> {
        self.introspector.get_policies(bundle_id).await
    }

    pub async fn get_policy_list(
        &self,
        bundle_id: &str,
        filter: impl Fn(&str) -> bool,
    ) -> Result<Vec<PolicyEntry>> {
        self.introspector.get_policy_list(bundle_id, filter).await
    }

    pub async fn get_policy_root(&self) -> Result<Option<String>> {
        self.introspector.get_policy_root().await
    }

    pub async fn get_policy_root_for_path(&self, path: &str) -> Result<Option<String>> {
        self.introspector.get_policy_root_for_path(path).await
    }

    pub async fn get_module(&self, id: &str) -> Result<ModuleInfo> {
        self.introspector.get_module(id).await
    }

    pub async fn list_policies(&self) -> Result<Vec<PolicyInfo>> {
        self.introspector.list_policies().await
    }

    pub async fn get_policy(&self, id: &str) -> Result<PolicyInfo> {
        self.introspector.get_policy(id).await
    }

    /// Declarations of the custom builtins this runtime was built with.
    pub fn builtin_requirements(&self) -> Value {
        json!(self.registry.custom_declarations())
    }

    // ── Accessors ─────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }
}

/// Initial reload, plugin registration and the watcher: everything after
/// the status listeners are in place that can fail construction.
async fn wire(
    config: &Config,
    manager: &Arc<PluginManager>,
    status: &StatusSender,
    plugins: Vec<(String, Arc<dyn PluginFactory>)>,
    reload_observer: Option<ReloadObserver>,
) -> Result<(Arc<ReloadPipeline>, ReloadObserver, Option<WatchHandle>)> {
    let pipeline = Arc::new(ReloadPipeline::new(
        manager.clone(),
        status.clone(),
        config.local_bundles.clone(),
    ));
    if !pipeline.is_empty() {
        pipeline.reload().await?;
    }

    manager.register(DISCOVERY_PLUGIN, Arc::new(DiscoveryPlugin::new(manager)?))?;
    if !config.engine.bundles.is_empty() {
        let plugin = BundlePlugin::new(BUNDLE_PLUGIN, manager, &config.engine.bundles)?;
        manager.register(BUNDLE_PLUGIN, Arc::new(plugin))?;
    }
    if config.flags.enable_status_plugin || config.engine.status.is_some() {
        manager.register(STATUS_PLUGIN, Arc::new(StatusPlugin::new(manager)?))?;
    }
    for (name, factory) in plugins {
        let Some(raw) = config.engine.plugins.get(&name) else {
            debug!(plugin = %name, "no configuration for plugin, skipping");
            continue;
        };
        let validated = factory
            .validate(raw)
            .map_err(|e| RuntimeError::Config(format!("plugin {name}: {e}")))?;
        manager.register(&name, factory.create(manager, validated))?;
    }

    let observer = reload_observer.unwrap_or_else(log_reload_observer);
    let watcher = if config.local_bundles.watch && !pipeline.is_empty() {
        Some(spawn_watcher(pipeline.clone(), pipeline.watch_roots(), observer.clone())?)
    } else {
        None
    };
    Ok((pipeline, observer, watcher))
}

/// Sleep until `deadline`, or forever without one.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn register_listeners(manager: &PluginManager, status: &StatusSender) {
    let sender = status.clone();
    manager.register_plugin_status_listener(
        LISTENER_NAME,
        Arc::new(move |statuses: &BTreeMap<String, PluginStatus>| {
            for (name, plugin) in statuses {
                sender.subsystem(name, plugin.into());
            }
        }),
    );
    let sender = status.clone();
    manager.register_bundle_listener(
        LISTENER_NAME,
        Arc::new(move |bundle: &BundleStatus| sender.bundle(&bundle.name, bundle.into())),
    );
}

/// Runtime description handed to plugins: config, environment and version.
fn runtime_info(config: &Config) -> Result<Value> {
    let config = serde_json::to_value(config).map_err(|e| RuntimeError::Config(e.to_string()))?;
    let env: BTreeMap<String, String> = std::env::vars().collect();
    let build = build_info();
    Ok(json!({
        "config": config,
        "env": env,
        "version": build.version,
        "commit": build.commit,
    }))
}
