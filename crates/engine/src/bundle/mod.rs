//! Policy bundles: a manifest, a base data tree and policy modules.

mod activate;
mod build;
mod load;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ast::{Module, ParseError};
use crate::compile::CompileErrors;
use crate::storage::StorageError;

pub use activate::{activate, compile_store, deactivate, read_manifests, ActivateOptions};
pub use build::{build, build_to_file, BuildParams};
pub use load::{BundleLoader, VerificationConfig, SIGNATURES_FILE};

/// Name of the manifest file inside a bundle.
pub const MANIFEST_FILE: &str = ".manifest";

/// Storage path segment under which activated bundle manifests live.
pub const BUNDLES_ROOT: [&str; 2] = ["system", "bundles"];

// ── Error type ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("{path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileErrors),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("bundle verification failed: {0}")]
    Verification(String),

    #[error("detected overlapping roots in bundle manifests: {0}")]
    RootsOverlap(String),

    #[error("manifest roots {roots:?} do not permit '{path}'")]
    OutsideRoots { path: String, roots: Vec<String> },

    #[error("{0} is neither a directory nor a .tar.gz bundle")]
    Unsupported(String),
}

// ── Types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roots: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl Manifest {
    /// Declared roots, or the single empty root that owns everything.
    pub fn effective_roots(&self) -> Vec<String> {
        match &self.roots {
            Some(roots) if !roots.is_empty() => roots
                .iter()
                .map(|r| r.trim_matches('/').to_string())
                .collect(),
            _ => vec![String::new()],
        }
    }

    /// Names listed in `metadata.required_builtins`: either a flat list of
    /// names (or `{name}` objects), or lists grouped by arity such as
    /// `{"builtin1": [{"name": ..}], "builtinDyn": [..]}`.
    pub fn required_builtins(&self) -> Vec<String> {
        fn names(items: &[Value], out: &mut Vec<String>) {
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    Value::Object(obj) => {
                        if let Some(name) = obj.get("name").and_then(Value::as_str) {
                            out.push(name.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        let mut out = Vec::new();
        match self.metadata.get("required_builtins") {
            Some(Value::Array(items)) => names(items, &mut out),
            Some(Value::Object(groups)) => {
                for group in groups.values() {
                    if let Value::Array(items) = group {
                        names(items, &mut out);
                    }
                }
            }
            _ => {}
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct ModuleFile {
    /// Path relative to the bundle root, `/`-separated.
    pub path: String,
    /// Policy id the module is stored under.
    pub url: String,
    pub raw: Vec<u8>,
    pub parsed: Module,
}

#[derive(Debug, Clone)]
pub struct Bundle {
    pub manifest: Manifest,
    pub data: Value,
    pub modules: Vec<ModuleFile>,
}

impl Bundle {
    pub fn empty() -> Self {
        Self {
            manifest: Manifest::default(),
            data: Value::Object(Map::new()),
            modules: Vec::new(),
        }
    }
}

pub(crate) fn root_segments(root: &str) -> Vec<String> {
    root.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when `path` lies under one of `roots` (or contains one).
pub(crate) fn within_roots(path: &[String], roots: &[String]) -> bool {
    roots.iter().any(|root| {
        let segs = root_segments(root);
        path.starts_with(&segs) || segs.starts_with(path)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_defaults_to_empty_root() {
        let m: Manifest = serde_json::from_value(json!({"revision": "r1"})).unwrap();
        assert_eq!(m.effective_roots(), vec![String::new()]);
        let m: Manifest = serde_json::from_value(json!({"roots": ["/a/b/", "c"]})).unwrap();
        assert_eq!(m.effective_roots(), vec!["a/b".to_string(), "c".to_string()]);
    }

    #[test]
    fn required_builtins_accepts_names_and_objects() {
        let m: Manifest = serde_json::from_value(json!({
            "metadata": {"required_builtins": ["a.b", {"name": "c"}, 3]}
        }))
        .unwrap();
        assert_eq!(m.required_builtins(), vec!["a.b".to_string(), "c".to_string()]);

        let m: Manifest = serde_json::from_value(json!({
            "metadata": {"required_builtins": {
                "builtin1": [{"name": "ext.one", "decl": {}}],
                "builtinDyn": [{"name": "ext.dyn"}]
            }}
        }))
        .unwrap();
        assert_eq!(m.required_builtins(), vec!["ext.one".to_string(), "ext.dyn".to_string()]);
    }

    #[test]
    fn roots_permit_prefixes_both_ways() {
        let roots = vec!["app/policies".to_string()];
        assert!(within_roots(&["app".to_string()], &roots));
        assert!(within_roots(
            &["app".to_string(), "policies".to_string(), "x".to_string()],
            &roots
        ));
        assert!(!within_roots(&["other".to_string()], &roots));
        assert!(within_roots(&["anything".to_string()], &[String::new()]));
    }
}
