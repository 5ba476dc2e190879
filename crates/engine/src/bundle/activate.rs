use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use super::{root_segments, Bundle, BundleError, Manifest, BUNDLES_ROOT};
use crate::ast::{parse_module, Module};
use crate::compile::{Compiled, Compiler};
use crate::eval::value::data_at;
use crate::storage::{make_dir, PatchOp, StorageError, StoragePath, Store, Transaction};

pub struct ActivateOptions<'a> {
    pub store: &'a dyn Store,
    pub compiler: &'a Compiler,
    pub bundles: &'a BTreeMap<String, Bundle>,
    /// Modules compiled alongside the store's policies but never written.
    pub extra_modules: &'a BTreeMap<String, Module>,
    /// Reject rules that share a path with base data.
    pub path_conflicts_check: bool,
}

fn manifest_path(name: &str) -> StoragePath {
    let mut path = StoragePath::root();
    for seg in BUNDLES_ROOT {
        path = path.child(seg);
    }
    path.child(name)
}

/// Manifests of every activated bundle, keyed by bundle name.
pub fn read_manifests(store: &dyn Store, txn: &Transaction) -> Result<BTreeMap<String, Manifest>, BundleError> {
    let root = StoragePath::new(BUNDLES_ROOT.iter().map(|s| s.to_string()).collect());
    let entries = match store.read(txn, &root) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(StorageError::NotFound(_)) => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };
    let mut manifests = BTreeMap::new();
    for (name, entry) in entries {
        let Some(raw) = entry.get("manifest") else {
            continue;
        };
        let manifest: Manifest = serde_json::from_value(raw.clone()).map_err(|source| BundleError::Json {
            path: manifest_path(&name).to_string(),
            source,
        })?;
        manifests.insert(name, manifest);
    }
    Ok(manifests)
}

/// Replace the named bundles' content in the store and recompile every
/// stored policy. The caller owns the transaction and commits or aborts it.
pub fn activate(opts: &ActivateOptions<'_>, txn: &mut Transaction) -> Result<Arc<Compiled>, BundleError> {
    let store = opts.store;
    let existing = read_manifests(store, txn)?;

    // Roots of incoming bundles plus bundles that stay active.
    let mut owners: Vec<(String, String)> = Vec::new();
    for (name, manifest) in &existing {
        if !opts.bundles.contains_key(name) {
            for root in manifest.effective_roots() {
                owners.push((name.clone(), root));
            }
        }
    }
    for (name, bundle) in opts.bundles {
        for root in bundle.manifest.effective_roots() {
            owners.push((name.clone(), root));
        }
    }
    check_overlap(&owners)?;

    for (name, bundle) in opts.bundles {
        let mut roots: BTreeSet<String> = bundle.manifest.effective_roots().into_iter().collect();
        if let Some(old) = existing.get(name) {
            roots.extend(old.effective_roots());
        }
        erase_roots(store, txn, &roots)?;
        delete_bundle_policies(store, txn, name)?;
    }

    for (name, bundle) in opts.bundles {
        write_data(store, txn, bundle)?;

        let path = manifest_path(name);
        make_dir(store, txn, &path)?;
        let manifest = serde_json::to_value(&bundle.manifest).map_err(|source| BundleError::Json {
            path: path.to_string(),
            source,
        })?;
        store.write(txn, PatchOp::Add, &path.child("manifest"), manifest)?;

        for module in &bundle.modules {
            store.upsert_policy(txn, &module.url, &module.raw)?;
        }
        info!(
            bundle = %name,
            revision = %bundle.manifest.revision,
            modules = bundle.modules.len(),
            "activated bundle"
        );
    }

    compile_store(store, txn, opts.compiler, opts.extra_modules, opts.path_conflicts_check)
}

/// Remove the named bundles' data, policies and manifests.
pub fn deactivate(store: &dyn Store, txn: &mut Transaction, names: &BTreeSet<String>) -> Result<(), BundleError> {
    let existing = read_manifests(store, txn)?;
    for name in names {
        if let Some(manifest) = existing.get(name) {
            let roots: BTreeSet<String> = manifest.effective_roots().into_iter().collect();
            erase_roots(store, txn, &roots)?;
        }
        delete_bundle_policies(store, txn, name)?;
        match store.write(txn, PatchOp::Remove, &manifest_path(name), Value::Null) {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        debug!(bundle = %name, "deactivated bundle");
    }
    Ok(())
}

/// Parse every stored policy, add `extra`, and compile the lot.
pub fn compile_store(
    store: &dyn Store,
    txn: &Transaction,
    compiler: &Compiler,
    extra: &BTreeMap<String, Module>,
    path_conflicts_check: bool,
) -> Result<Arc<Compiled>, BundleError> {
    let mut modules = BTreeMap::new();
    for id in store.list_policies(txn)? {
        let raw = store.get_policy(txn, &id)?;
        let module = parse_module(&id, &String::from_utf8_lossy(&raw))?;
        modules.insert(id, module);
    }
    for (id, module) in extra {
        modules.insert(id.clone(), module.clone());
    }

    let compiled = if path_conflicts_check {
        let data = store.read(txn, &StoragePath::root())?;
        compiler.clone().with_path_conflicts_check(data).compile(modules)?
    } else {
        compiler.compile(modules)?
    };
    Ok(compiled)
}

fn check_overlap(owners: &[(String, String)]) -> Result<(), BundleError> {
    for (i, (a_name, a_root)) in owners.iter().enumerate() {
        let a = root_segments(a_root);
        for (b_name, b_root) in &owners[i + 1..] {
            if a_name == b_name {
                continue;
            }
            let b = root_segments(b_root);
            if a.starts_with(&b) || b.starts_with(&a) {
                return Err(BundleError::RootsOverlap(format!(
                    "root {a_root:?} of bundle {a_name} overlaps root {b_root:?} of bundle {b_name}"
                )));
            }
        }
    }
    Ok(())
}

fn erase_roots(store: &dyn Store, txn: &mut Transaction, roots: &BTreeSet<String>) -> Result<(), BundleError> {
    for root in roots {
        let path = StoragePath::from_root(root);
        if path.is_root() {
            // The empty root owns everything except the system tree.
            if let Value::Object(map) = store.read(txn, &path)? {
                for key in map.keys().filter(|k| k.as_str() != "system") {
                    store.write(txn, PatchOp::Remove, &path.child(key.clone()), Value::Null)?;
                }
            }
            continue;
        }
        match store.write(txn, PatchOp::Remove, &path, Value::Null) {
            Ok(()) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn delete_bundle_policies(store: &dyn Store, txn: &mut Transaction, name: &str) -> Result<(), BundleError> {
    let prefix = format!("{}/", name.trim_end_matches('/'));
    for id in store.list_policies(txn)? {
        if id.starts_with(&prefix) {
            store.delete_policy(txn, &id)?;
        }
    }
    Ok(())
}

fn write_data(store: &dyn Store, txn: &mut Transaction, bundle: &Bundle) -> Result<(), BundleError> {
    for root in bundle.manifest.effective_roots() {
        let segments = root_segments(&root);
        let Some(value) = data_at(&bundle.data, &segments) else {
            continue;
        };
        let path = StoragePath::new(segments);
        if path.is_root() {
            if let Value::Object(map) = value {
                for (key, v) in map.iter().filter(|(k, _)| k.as_str() != "system") {
                    store.write(txn, PatchOp::Add, &path.child(key.clone()), v.clone())?;
                }
            }
            continue;
        }
        if let Some(parent) = path.parent() {
            make_dir(store, txn, &parent)?;
        }
        store.write(txn, PatchOp::Add, &path, value.clone())?;
    }
    Ok(())
}
