//! Policy runtime supervisor.
//!
//! Wraps the embedded engine with:
//! - status aggregation and readiness ([`status`])
//! - transactional reload of local bundles on filesystem change ([`reload`], [`watch`])
//! - one-shot and two-phase query evaluation ([`query`])
//! - read-only introspection of bundles and policies ([`introspect`])
//!
//! [`Runtime`] composes all of them.

pub mod config;
pub mod decision;
pub mod error;
pub mod image;
pub mod introspect;
pub mod options;
pub mod query;
pub mod reload;
pub mod runtime;
pub mod status;
pub mod store;
pub mod watch;

pub use config::{Config, LocalBundlesConfig, StoreKind};
pub use decision::{ConsoleDecisionLogger, DecisionEvent, DecisionLogger};
pub use error::{Result, RuntimeError};
pub use options::RuntimeOptions;
pub use query::{ExplainMode, Explanation, FinalEvaluator, QueryOptions, QueryResult};
pub use runtime::Runtime;
pub use status::{BundleSummary, RuntimeSnapshot, SubsystemSummary};

pub use warden_engine as engine;
