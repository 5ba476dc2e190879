//! Transactional reload of local bundle sources.
//!
//! A reload reads every configured source from disk outside any
//! transaction, then replaces the stored bundles in one write transaction:
//! data, then policies (recompiled), then version metadata, then commit.
//! The new compilation is published only after the commit succeeds.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use warden_engine::bundle::{activate, deactivate, ActivateOptions, Bundle, BundleLoader};
use warden_engine::plugins::PluginManager;
use warden_engine::storage::{make_dir, non_empty, PatchOp};
use warden_engine::version::build_info;
use warden_engine::{Compiled, Store, StoragePath, Transaction, TransactionParams};

use crate::config::LocalBundlesConfig;
use crate::error::{Result, RuntimeError};
use crate::image::resolve_policy_image;
use crate::status::{BundleState, StatusSender};

/// Where build and bundle revision metadata is written.
pub const VERSION_PATH: [&str; 2] = ["system", "version"];

/// Called after every watch-triggered reload with its duration and outcome.
pub type ReloadObserver = Arc<dyn Fn(Duration, Option<&RuntimeError>) + Send + Sync>;

pub fn log_reload_observer() -> ReloadObserver {
    Arc::new(|elapsed, err| match err {
        Some(e) => warn!(duration_ms = elapsed.as_millis() as u64, error = %e, "processed file watch event"),
        None => debug!(duration_ms = elapsed.as_millis() as u64, "processed file watch event"),
    })
}

/// Root of the bundle that owns a stored policy id.
///
/// Ids look like `<bundle path>/<dir>/<file>.rego`, so the root defaults to
/// everything but the last three segments. Content-addressed image blobs
/// live under `.../sha256/<hex>`; there the root ends right after the
/// digest segment.
pub fn detect_bundle_root(policy_id: &str) -> String {
    let segments: Vec<&str> = policy_id.split('/').collect();
    let root_len = match segments.iter().position(|s| *s == "sha256") {
        Some(i) => (i + 2).min(segments.len()),
        None => segments.len().saturating_sub(3),
    };
    segments[..root_len].join("/")
}

pub struct ReloadPipeline {
    manager: Arc<PluginManager>,
    status: StatusSender,
    config: LocalBundlesConfig,
    loader: BundleLoader,
    /// State of every source as of the last successful reload.
    active: Mutex<BTreeMap<String, BundleState>>,
    /// Source name of the policy image tarball currently activated.
    active_image: Mutex<Option<String>>,
}

/// Bundles read from disk, keyed by source name.
struct Loaded {
    bundles: BTreeMap<String, Bundle>,
    image: Option<String>,
}

impl ReloadPipeline {
    pub fn new(manager: Arc<PluginManager>, status: StatusSender, config: LocalBundlesConfig) -> Self {
        let loader = BundleLoader::new()
            .with_skip_verification(config.skip_verification)
            .with_verification(config.verification.clone())
            .with_ignore(config.ignore.clone());
        Self {
            manager,
            status,
            config,
            loader,
            active: Mutex::new(BTreeMap::new()),
            active_image: Mutex::new(None),
        }
    }

    pub fn image_mode(&self) -> bool {
        self.config.local_policy_image.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_empty()
    }

    /// Filesystem locations a watcher should observe.
    pub fn watch_roots(&self) -> Vec<PathBuf> {
        let mut roots = self.config.paths.clone();
        if self.image_mode() {
            roots.push(crate::image::layout_dir(&self.config.file_store_root()));
        }
        roots
    }

    /// Tarball of the configured policy image.
    ///
    /// An image that cannot be resolved while another one is active fails
    /// the reload. Before any image was activated it is skipped.
    fn resolve_image(&self) -> Result<Option<PathBuf>> {
        let Some(reference) = &self.config.local_policy_image else {
            return Ok(None);
        };
        match resolve_policy_image(&self.config.file_store_root(), reference) {
            Ok(path) => Ok(Some(path)),
            Err(e) => {
                let active = self.active_image.lock().expect("image lock poisoned").clone();
                match active {
                    Some(name) => {
                        self.report_failure(&name, e.to_string());
                        Err(e)
                    }
                    None => {
                        warn!(image = %reference, error = %e, "could not resolve local policy image");
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Record a load failure against `name`, keeping its last good revision
    /// and activation time.
    fn report_failure(&self, name: &str, message: String) {
        let mut state = self
            .active
            .lock()
            .expect("bundle state lock poisoned")
            .get(name)
            .cloned()
            .unwrap_or_default();
        state.errors = vec![format!("bundle error: {message}")];
        state.message = message;
        self.status.bundle(name, state);
    }

    fn load_sources(&self) -> Result<Loaded> {
        let image = self.resolve_image()?;
        let mut bundles = BTreeMap::new();
        for path in self.config.paths.iter().chain(image.iter()) {
            let name = path.to_string_lossy().to_string();
            info!(path = %name, "loading local bundle");
            match self.loader.load(path) {
                Ok(bundle) => {
                    bundles.insert(name, bundle);
                }
                Err(source) => {
                    self.report_failure(&name, source.to_string());
                    return Err(RuntimeError::Reload { path: name, source });
                }
            }
        }
        Ok(Loaded {
            bundles,
            image: image.map(|p| p.to_string_lossy().to_string()),
        })
    }

    /// Read every source from disk. The first failure is reported against
    /// its source and aborts the load.
    pub fn load(&self) -> Result<BTreeMap<String, Bundle>> {
        self.load_sources().map(|loaded| loaded.bundles)
    }

    /// Load all sources and swap them into the store.
    pub async fn reload(&self) -> Result<()> {
        let Loaded { bundles, image } = self.load_sources()?;
        let store = self.manager.store().clone();

        let mut txn = store
            .new_transaction(TransactionParams::WRITE)
            .await
            .map_err(RuntimeError::store("new_transaction"))?;
        let compiled = match self.apply(store.as_ref(), &mut txn, &bundles) {
            Ok(compiled) => compiled,
            Err(e) => {
                store.abort(txn);
                return Err(e);
            }
        };
        store.commit(txn).map_err(RuntimeError::store("commit"))?;
        self.manager.set_compiler(compiled);

        let now = Utc::now();
        let mut states = BTreeMap::new();
        for (name, bundle) in &bundles {
            let state = BundleState {
                revision: bundle.manifest.revision.clone(),
                errors: Vec::new(),
                message: "local bundle loaded".to_string(),
                last_activation: Some(now),
                last_download: Some(now),
            };
            self.status.bundle(name, state.clone());
            states.insert(name.clone(), state);
        }
        *self.active.lock().expect("bundle state lock poisoned") = states;
        if image.is_some() {
            *self.active_image.lock().expect("image lock poisoned") = image;
        }
        info!(bundles = bundles.len(), "local bundles reloaded");
        Ok(())
    }

    fn apply(
        &self,
        store: &dyn Store,
        txn: &mut Transaction,
        bundles: &BTreeMap<String, Bundle>,
    ) -> Result<Arc<Compiled>> {
        if self.image_mode() {
            self.deactivate_image(store, txn)?;
        }
        insert_and_compile(&self.manager, store, txn, bundles)
    }

    /// Drop the bundle owning the first stored policy; a new image blob
    /// lands under a different digest path.
    fn deactivate_image(&self, store: &dyn Store, txn: &mut Transaction) -> Result<()> {
        let policies = store.list_policies(txn).map_err(RuntimeError::store("list_policies"))?;
        let Some(first) = policies.first() else {
            return Ok(());
        };
        let root = detect_bundle_root(first);
        debug!(root = %root, "deactivating policy image bundle");
        deactivate(store, txn, &BTreeSet::from([root]))?;
        Ok(())
    }
}

/// Activate `bundles` and write the version metadata last.
pub(crate) fn insert_and_compile(
    manager: &PluginManager,
    store: &dyn Store,
    txn: &mut Transaction,
    bundles: &BTreeMap<String, Bundle>,
) -> Result<Arc<Compiled>> {
    let path_conflicts_check = non_empty(store, txn).map_err(RuntimeError::store("read"))?;
    let compiler = manager.new_compiler();
    let extra = BTreeMap::new();
    let opts = ActivateOptions {
        store,
        compiler: &compiler,
        bundles,
        extra_modules: &extra,
        path_conflicts_check,
    };
    let compiled = activate(&opts, txn)?;

    let revisions: BTreeMap<String, String> = bundles
        .iter()
        .map(|(name, b)| (name.clone(), b.manifest.revision.clone()))
        .collect();
    write_version(store, txn, &revisions)?;
    Ok(compiled)
}

fn write_version(store: &dyn Store, txn: &mut Transaction, revisions: &BTreeMap<String, String>) -> Result<()> {
    let path = StoragePath::new(VERSION_PATH.iter().map(|s| s.to_string()).collect());
    if let Some(parent) = path.parent() {
        make_dir(store, txn, &parent).map_err(RuntimeError::store("write"))?;
    }
    let info = build_info();
    let value: Value = json!({
        "version": info.version,
        "build_commit": info.commit,
        "build_timestamp": info.timestamp,
        "build_hostname": info.hostname,
        "active_revisions": revisions,
    });
    store
        .write(txn, PatchOp::Add, &path, value)
        .map_err(RuntimeError::store("write"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_layout_roots_three_segments_up() {
        assert_eq!(detect_bundle_root("/srv/policies/rbac/policy.rego"), "/srv");
        assert_eq!(detect_bundle_root("bundle/pkg/a/policy.rego"), "bundle");
    }

    #[test]
    fn content_addressed_layout_roots_at_digest() {
        assert_eq!(
            detect_bundle_root("/home/u/.policy/policies-root/blobs/sha256/abc123/rbac/policy.rego"),
            "/home/u/.policy/policies-root/blobs/sha256/abc123"
        );
        assert_eq!(
            detect_bundle_root("/x/blobs/sha256/abc/policy.rego"),
            "/x/blobs/sha256/abc"
        );
    }

    #[test]
    fn short_ids_clamp_to_empty_root() {
        assert_eq!(detect_bundle_root("a/b"), "");
        assert_eq!(detect_bundle_root("sha256"), "sha256");
    }
}
