//! Construction-time extensions that cannot be expressed in [`Config`](crate::Config).

use std::sync::Arc;

use warden_engine::plugins::PluginFactory;
use warden_engine::{BuiltinDecl, BuiltinFn, Store};

use crate::decision::DecisionLogger;
use crate::reload::ReloadObserver;

#[derive(Default)]
pub struct RuntimeOptions {
    pub(crate) plugins: Vec<(String, Arc<dyn PluginFactory>)>,
    pub(crate) builtins: Vec<(BuiltinDecl, BuiltinFn)>,
    pub(crate) decision_logger: Option<Arc<dyn DecisionLogger>>,
    pub(crate) store: Option<Arc<dyn Store>>,
    pub(crate) reload_observer: Option<ReloadObserver>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin built from `engine.plugins.<name>` when that
    /// section is present.
    pub fn with_plugin(mut self, name: impl Into<String>, factory: Arc<dyn PluginFactory>) -> Self {
        self.plugins.push((name.into(), factory));
        self
    }

    /// Add a builtin. The first registration of a name wins.
    pub fn with_builtin(mut self, decl: BuiltinDecl, func: BuiltinFn) -> Self {
        self.builtins.push((decl, func));
        self
    }

    pub fn with_decision_logger(mut self, logger: Arc<dyn DecisionLogger>) -> Self {
        self.decision_logger = Some(logger);
        self
    }

    /// Use `store` instead of the one selected by `Config::store`.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_reload_observer(mut self, observer: ReloadObserver) -> Self {
        self.reload_observer = Some(observer);
        self
    }
}
