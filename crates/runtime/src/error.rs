//! Runtime error type.

use std::time::Duration;

use uuid::Uuid;
use warden_engine::ast::ParseError;
use warden_engine::builtins::RegistryError;
use warden_engine::bundle::BundleError;
use warden_engine::eval::QueryError;
use warden_engine::plugins::PluginError;
use warden_engine::storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The query string does not parse.
    #[error("invalid query {query:?} (decision {decision_id}): {source}")]
    BadQuery {
        decision_id: Uuid,
        query: String,
        #[source]
        source: ParseError,
    },

    /// The query parsed but failed to compile or evaluate.
    #[error("query {query:?} failed (decision {decision_id}): {source}")]
    QueryExecutionFailed {
        decision_id: Uuid,
        query: String,
        #[source]
        source: QueryError,
    },

    #[error("store {op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// A local bundle source could not be loaded.
    #[error("failed to load {path}: {source}")]
    Reload {
        path: String,
        #[source]
        source: BundleError,
    },

    #[error("runtime loading failed: {}", .0.join("; "))]
    BadRuntime(Vec<String>),

    #[error("runtime has not loaded within {0:?}")]
    RuntimeLoading(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("policy image error: {0}")]
    Image(String),

    #[error("filesystem watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error(transparent)]
    Builtin(#[from] RegistryError),

    #[error("{0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Stable, machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::BadQuery { .. } => "bad_query",
            RuntimeError::QueryExecutionFailed { .. } => "query_execution_failed",
            RuntimeError::Store { .. } => "store_error",
            RuntimeError::Bundle(_) | RuntimeError::Reload { .. } => "bundle_error",
            RuntimeError::BadRuntime(_) => "bad_runtime",
            RuntimeError::RuntimeLoading(_) => "runtime_loading",
            RuntimeError::Config(_) => "config_error",
            RuntimeError::Image(_) => "image_error",
            RuntimeError::Watch(_) => "watch_error",
            RuntimeError::Plugin(_) => "plugin_error",
            RuntimeError::Builtin(_) => "builtin_error",
            RuntimeError::NotFound(_) => "not_found",
            RuntimeError::Io(_) => "io_error",
        }
    }

    /// Decision id of a failed query, if any.
    pub fn decision_id(&self) -> Option<Uuid> {
        match self {
            RuntimeError::BadQuery { decision_id, .. }
            | RuntimeError::QueryExecutionFailed { decision_id, .. } => Some(*decision_id),
            _ => None,
        }
    }

    pub(crate) fn store(op: &'static str) -> impl FnOnce(StorageError) -> RuntimeError {
        move |source| RuntimeError::Store { op, source }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
