//! End-to-end engine flow: load a bundle from disk, activate it into a
//! store, and evaluate queries against the resulting compilation.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use warden_engine::ast::parse_query;
use warden_engine::bundle::{activate, build, ActivateOptions, BuildParams, BundleLoader};
use warden_engine::storage::{InMemStore, StoragePath};
use warden_engine::{BuiltinRegistry, Compiler, EvalParams, PreparedQuery, Store, TransactionParams};

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn rbac_bundle(dir: &Path) {
    write(
        dir,
        "rbac/policy.rego",
        r#"package rbac

default allow = false

allow {
    some role
    input.user == data.rbac.bindings[role][_]
    role == "admin"
}

roles[r] {
    some r
    data.rbac.bindings[r][_] == input.user
}
"#,
    );
    write(
        dir,
        "rbac/data.json",
        r#"{"bindings": {"admin": ["alice"], "viewer": ["bob", "alice"]}}"#,
    );
}

async fn activate_dir(store: &InMemStore, name: &str, dir: &Path) -> Arc<warden_engine::Compiled> {
    let bundle = BundleLoader::new().load(dir).unwrap();
    let bundles = BTreeMap::from([(name.to_string(), bundle)]);
    let compiler = Compiler::new(Arc::new(BuiltinRegistry::with_defaults()));
    let extra = BTreeMap::new();
    let opts = ActivateOptions {
        store,
        compiler: &compiler,
        bundles: &bundles,
        extra_modules: &extra,
        path_conflicts_check: false,
    };
    let mut txn = store.new_transaction(TransactionParams::WRITE).await.unwrap();
    let compiled = activate(&opts, &mut txn).unwrap();
    store.commit(txn).unwrap();
    compiled
}

#[tokio::test]
async fn directory_bundle_answers_queries() {
    let src = tempfile::tempdir().unwrap();
    rbac_bundle(src.path());
    let store = InMemStore::new();
    let compiled = activate_dir(&store, "local", src.path()).await;

    let txn = store.new_transaction(TransactionParams::READ).await.unwrap();
    let data = store.read(&txn, &StoragePath::root()).unwrap();
    store.abort(txn);

    let prepared =
        PreparedQuery::new(compiled.clone(), parse_query("data.rbac.allow").unwrap(), Vec::new()).unwrap();

    let alice = json!({"user": "alice"});
    let mut params = EvalParams::new(&data);
    params.input = Some(&alice);
    let rs = prepared.eval(params).unwrap();
    assert_eq!(rs[0].expressions[0].value, json!(true));

    let bob = json!({"user": "bob"});
    let mut params = EvalParams::new(&data);
    params.input = Some(&bob);
    let rs = prepared.eval(params).unwrap();
    assert_eq!(rs[0].expressions[0].value, json!(false));

    let roles =
        PreparedQuery::new(compiled, parse_query("data.rbac.roles").unwrap(), Vec::new()).unwrap();
    let mut params = EvalParams::new(&data);
    params.input = Some(&alice);
    let rs = roles.eval(params).unwrap();
    assert_eq!(rs[0].expressions[0].value, json!(["admin", "viewer"]));
}

#[tokio::test]
async fn built_tarball_activates_like_its_source() {
    let src = tempfile::tempdir().unwrap();
    rbac_bundle(src.path());
    let out = tempfile::tempdir().unwrap();
    let tarball = out.path().join("rbac.tar.gz");
    let mut file = fs::File::create(&tarball).unwrap();
    build(
        &[src.path().to_path_buf()],
        &BuildParams::default(),
        &BuiltinRegistry::with_defaults(),
        &mut file,
    )
    .unwrap();
    drop(file);

    let from_dir = InMemStore::new();
    activate_dir(&from_dir, "b", src.path()).await;
    let from_tar = InMemStore::new();
    activate_dir(&from_tar, "b", &tarball).await;

    let a = from_dir.new_transaction(TransactionParams::READ).await.unwrap();
    let b = from_tar.new_transaction(TransactionParams::READ).await.unwrap();
    let path = StoragePath::parse("/rbac").unwrap();
    assert_eq!(from_dir.read(&a, &path).unwrap(), from_tar.read(&b, &path).unwrap());
    assert_eq!(from_dir.list_policies(&a).unwrap().len(), 1);
    assert_eq!(from_tar.list_policies(&b).unwrap().len(), 1);
}
