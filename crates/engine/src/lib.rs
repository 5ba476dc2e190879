//! Embedded policy engine.
//!
//! This crate provides:
//! - A compact Rego-style policy language (lexer, parser, AST)
//! - A compiler producing an immutable rule index
//! - A backtracking evaluator with tracing and metrics
//! - A transactional in-memory document and policy store
//! - Bundle loading, activation and building
//! - A plugin manager with remote bundle, discovery and status plugins

pub mod ast;
pub mod builtins;
pub mod bundle;
pub mod compile;
pub mod config;
pub mod eval;
pub mod metrics;
pub mod plugins;
pub mod storage;
pub mod version;

pub use builtins::{BuiltinContext, BuiltinDecl, BuiltinFn, BuiltinRegistry};
pub use compile::{Compiled, Compiler, CompileErrors};
pub use config::EngineConfig;
pub use eval::{EvalParams, PreparedQuery, ResultSet};
pub use storage::{Store, StoragePath, Transaction, TransactionParams};
