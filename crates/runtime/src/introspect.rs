//! Read-only views over activated bundles and stored policies.
//!
//! Policy ids handed out here are the store locations encoded as URL-safe
//! base64. Bundle ids are the bundle name when it is a UUID, otherwise a
//! short SHA-256 digest of the name.

use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use warden_engine::ast::{parse_module, Module};
use warden_engine::bundle::read_manifests;
use warden_engine::plugins::PluginManager;
use warden_engine::storage::StorageError;
use warden_engine::{Store, Transaction, TransactionParams};

use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BundleInfo {
    pub id: String,
    /// Root package of the bundle's first policy.
    pub name: String,
    pub path: String,
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyItem {
    pub id: String,
    pub name: String,
}

/// A stored policy with its package name, before id encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyEntry {
    pub package_name: String,
    pub location: String,
}

impl PolicyEntry {
    /// First segment of the package name.
    pub fn root(&self) -> &str {
        self.package_name.split('.').next().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub id: String,
    pub name: String,
    pub content: String,
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyInfo {
    pub id: String,
    pub raw: String,
    /// Package and rules of the compiled module, when it is compiled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    pub rules: Vec<String>,
}

pub fn encode_id(location: &str) -> String {
    URL_SAFE.encode(location.as_bytes())
}

/// Empty when `id` is not valid base64 or not UTF-8.
pub fn decode_id(id: &str) -> String {
    URL_SAFE
        .decode(id)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_default()
}

pub fn bundle_id(name: &str) -> String {
    if Uuid::parse_str(name).is_ok() {
        return name.to_string();
    }
    let digest = Sha256::digest(name.as_bytes());
    hex::encode(&digest[..8])
}

fn package_name(module: &Module) -> String {
    module.package.join(".")
}

/// Whether `location` lies inside the bundle directory `path`.
fn under(location: &str, path: &str) -> bool {
    let dir = path.trim_start_matches('/').trim_end_matches('/');
    if dir.is_empty() {
        return true;
    }
    location
        .trim_start_matches('/')
        .strip_prefix(dir)
        .is_some_and(|rest| rest.starts_with('/'))
}

pub struct Introspector {
    manager: Arc<PluginManager>,
}

impl Introspector {
    pub fn new(manager: Arc<PluginManager>) -> Self {
        Self { manager }
    }

    /// Run `f` inside a read transaction that is always aborted.
    async fn read<T>(&self, f: impl FnOnce(&dyn Store, &Transaction) -> Result<T>) -> Result<T> {
        let store = self.manager.store().clone();
        let txn = store
            .new_transaction(TransactionParams::READ)
            .await
            .map_err(RuntimeError::store("new_transaction"))?;
        let out = f(store.as_ref(), &txn);
        store.abort(txn);
        out
    }

    pub async fn list_bundles(&self) -> Result<Vec<BundleInfo>> {
        self.read(|store, txn| {
            let manifests = read_manifests(store, txn)?;
            let mut bundles = Vec::with_capacity(manifests.len());
            for (name, manifest) in manifests {
                let path = name.trim_start_matches("./").to_string();
                bundles.push(BundleInfo {
                    id: bundle_id(&name),
                    name: root_for_path(store, txn, &path)?.unwrap_or_default(),
                    path,
                    revision: manifest.revision,
                });
            }
            Ok(bundles)
        })
        .await
    }

    pub async fn get_bundle_by_id(&self, id: &str) -> Result<BundleInfo> {
        self.list_bundles()
            .await?
            .into_iter()
            .find(|b| b.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("bundle for policy id not found [{id}]")))
    }

    /// Policies of a bundle, sorted by package name.
    pub async fn get_policies(&self, bundle_id: &str) -> Result<Vec<PolicyItem>> {
        let mut items: Vec<PolicyItem> = self
            .get_policy_list(bundle_id, |_| true)
            .await?
            .into_iter()
            .map(|p| PolicyItem {
                id: encode_id(&p.location),
                name: p.package_name,
            })
            .collect();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    /// Policies stored under the bundle's path whose package passes `filter`.
    pub async fn get_policy_list(
        &self,
        bundle_id: &str,
        filter: impl Fn(&str) -> bool,
    ) -> Result<Vec<PolicyEntry>> {
        let bundle = self.get_bundle_by_id(bundle_id).await?;
        self.read(|store, txn| {
            let mut entries = Vec::new();
            for location in store.list_policies(txn).map_err(RuntimeError::store("list_policies"))? {
                if !under(&location, &bundle.path) {
                    continue;
                }
                let module = load_module(store, txn, &location)?;
                let package_name = package_name(&module);
                if !filter(&package_name) {
                    continue;
                }
                entries.push(PolicyEntry {
                    package_name,
                    location,
                });
            }
            Ok(entries)
        })
        .await
    }

    /// Root package of the first stored policy that has one.
    pub async fn get_policy_root(&self) -> Result<Option<String>> {
        self.read(|store, txn| root_for_path(store, txn, "")).await
    }

    pub async fn get_policy_root_for_path(&self, path: &str) -> Result<Option<String>> {
        self.read(|store, txn| root_for_path(store, txn, path)).await
    }

    /// Module behind an encoded policy id.
    pub async fn get_module(&self, id: &str) -> Result<ModuleInfo> {
        let location = decode_id(id);
        self.read(|store, txn| {
            let raw = match store.get_policy(txn, &location) {
                Ok(raw) => raw,
                Err(StorageError::PolicyNotFound(_)) => {
                    return Err(RuntimeError::NotFound(format!("policy not found [{location}]")))
                }
                Err(e) => return Err(RuntimeError::store("get_policy")(e)),
            };
            let content = String::from_utf8_lossy(&raw).to_string();
            let module = parse_module(&location, &content).map_err(warden_engine::bundle::BundleError::from)?;
            Ok(ModuleInfo {
                id: encode_id(&location),
                name: package_name(&module),
                content,
                rules: module.rules.iter().map(|r| r.head.name.clone()).collect(),
            })
        })
        .await
    }

    /// Every stored policy with its raw source and compiled shape.
    pub async fn list_policies(&self) -> Result<Vec<PolicyInfo>> {
        let compiled = self.manager.compiler();
        self.read(|store, txn| {
            let ids = store.list_policies(txn).map_err(RuntimeError::store("list_policies"))?;
            let mut policies = Vec::with_capacity(ids.len());
            for id in ids {
                let raw = store.get_policy(txn, &id).map_err(RuntimeError::store("get_policy"))?;
                let module = compiled.modules().get(&id);
                policies.push(PolicyInfo {
                    raw: String::from_utf8_lossy(&raw).to_string(),
                    package: module.map(Module::package_ref),
                    rules: module.map(Module::rule_names).unwrap_or_default(),
                    id,
                });
            }
            Ok(policies)
        })
        .await
    }

    /// A stored policy by its store location.
    pub async fn get_policy(&self, id: &str) -> Result<PolicyInfo> {
        self.list_policies()
            .await?
            .into_iter()
            .find(|p| p.id == id)
            .ok_or_else(|| RuntimeError::NotFound(format!("policy not found [{id}]")))
    }
}

fn load_module(store: &dyn Store, txn: &Transaction, location: &str) -> Result<Module> {
    let raw = store.get_policy(txn, location).map_err(RuntimeError::store("get_policy"))?;
    let module = parse_module(location, &String::from_utf8_lossy(&raw))
        .map_err(warden_engine::bundle::BundleError::from)?;
    Ok(module)
}

fn root_for_path(store: &dyn Store, txn: &Transaction, path: &str) -> Result<Option<String>> {
    for location in store.list_policies(txn).map_err(RuntimeError::store("list_policies"))? {
        if !under(&location, path) {
            continue;
        }
        let module = load_module(store, txn, &location)?;
        let entry = PolicyEntry {
            package_name: package_name(&module),
            location,
        };
        if !entry.root().is_empty() {
            return Ok(Some(entry.root().to_string()));
        }
    }
    Ok(None)
}
