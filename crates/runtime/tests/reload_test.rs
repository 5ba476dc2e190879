//! Local bundle reloads: file watching, failure isolation, version
//! metadata consistency, verification and policy images.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use warden_runtime::engine::bundle::{build, BuildParams};
use warden_runtime::engine::BuiltinRegistry;
use warden_runtime::engine::bundle::VerificationConfig;
use warden_runtime::{Config, QueryOptions, Runtime, RuntimeError, RuntimeOptions};

const POLL_LIMIT: Duration = Duration::from_secs(10);
const POLL_STEP: Duration = Duration::from_millis(50);

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn local_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.local_bundles.paths = vec![dir.to_path_buf()];
    config
}

/// Value of the first expression of the first result, or `None` when
/// the query is undefined.
async fn eval(rt: &Runtime, query: &str) -> Option<Value> {
    let out = rt.query(query, None, &QueryOptions::default()).await.unwrap();
    out.result.first().map(|s| s.expressions[0].value.clone())
}

async fn eventually(rt: &Runtime, query: &str, expected: Option<Value>) {
    let deadline = tokio::time::Instant::now() + POLL_LIMIT;
    loop {
        let got = eval(rt, query).await;
        if got == expected {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{query}: expected {expected:?}, still {got:?}");
        }
        tokio::time::sleep(POLL_STEP).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_picks_up_edits_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "test/policy.rego", "package test\n\nallow = true\n");

    let mut config = local_config(dir.path());
    config.local_bundles.watch = true;
    let rt = Runtime::new(config, RuntimeOptions::default()).await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));

    write(dir.path(), "test/policy.rego", "package test\n\nallow = false\n");
    eventually(&rt, "data.test.allow", Some(json!(false))).await;

    fs::remove_file(dir.path().join("test/policy.rego")).unwrap();
    eventually(&rt, "data.test.allow", None).await;

    rt.stop().await;
}

#[tokio::test]
async fn failed_reload_keeps_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), ".manifest", r#"{"revision": "good"}"#);
    write(dir.path(), "test/policy.rego", "package test\n\nallow = true\n");
    let rt = Runtime::new(local_config(dir.path()), RuntimeOptions::default())
        .await
        .unwrap();

    write(dir.path(), ".manifest", r#"{"revision": "bad"}"#);
    write(dir.path(), "test/policy.rego", "package test\n\nallow = = false\n");
    let err = rt.reload().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Reload { .. }), "{err:?}");

    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));
    let revisions = eval(&rt, "data.system.version.active_revisions").await.unwrap();
    assert_eq!(revisions[dir.path().to_string_lossy().as_ref()], json!("good"));

    let snapshot = rt.status();
    let bundle = &snapshot.bundles[0];
    assert_eq!(bundle.revision, "good");
    assert!(bundle.last_activation.is_some());
    assert_eq!(bundle.errors.len(), 1, "{:?}", bundle.errors);
    assert!(bundle.errors[0].starts_with("bundle error: "));

    write(dir.path(), "test/policy.rego", "package test\n\nallow = false\n");
    rt.reload().await.unwrap();
    let snapshot = rt.status();
    assert_eq!(snapshot.bundles[0].revision, "bad");
    assert!(snapshot.bundles[0].errors.is_empty());
    rt.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn version_metadata_matches_manifests_under_concurrent_reads() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), ".manifest", r#"{"revision": "r0"}"#);
    write(dir.path(), "test/policy.rego", "package test\n\nallow = true\n");
    let rt = Runtime::new(local_config(dir.path()), RuntimeOptions::default())
        .await
        .unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let rt = rt.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let system = eval(&rt, "data.system").await.unwrap();
                let active = system["version"]["active_revisions"].as_object().unwrap().clone();
                for (name, revision) in active {
                    assert_eq!(system["bundles"][&name]["manifest"]["revision"], revision);
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for i in 1..=20 {
        write(dir.path(), ".manifest", &format!(r#"{{"revision": "r{i}"}}"#));
        rt.reload().await.unwrap();
    }
    for reader in readers {
        reader.await.unwrap();
    }

    let revisions = eval(&rt, "data.system.version.active_revisions").await.unwrap();
    assert_eq!(revisions[dir.path().to_string_lossy().as_ref()], json!("r20"));
    assert!(eval(&rt, "data.system.version.version").await.is_some());
    rt.stop().await;
}

// ── Verification ──────────────────────────────────────────────

fn signed_bundle(dir: &Path, policy: &str) {
    let digest = hex::encode(Sha256::digest(policy.as_bytes()));
    write(dir, "test/policy.rego", policy);
    write(
        dir,
        ".signatures.json",
        &json!({"files": [{"name": "test/policy.rego", "hash": digest, "algorithm": "SHA-256"}]}).to_string(),
    );
}

#[tokio::test]
async fn verified_bundle_loads() {
    let dir = tempfile::tempdir().unwrap();
    signed_bundle(dir.path(), "package test\n\nallow = true\n");

    let mut config = local_config(dir.path());
    config.local_bundles.verification = Some(VerificationConfig::default());
    let rt = Runtime::new(config, RuntimeOptions::default()).await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));
    rt.stop().await;
}

#[tokio::test]
async fn tampered_bundle_is_rejected_unless_verification_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    signed_bundle(dir.path(), "package test\n\nallow = false\n");
    write(dir.path(), "test/policy.rego", "package test\n\nallow = true\n");

    let mut config = local_config(dir.path());
    config.local_bundles.verification = Some(VerificationConfig::default());
    let err = Runtime::new(config.clone(), RuntimeOptions::default())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("digest mismatch"), "{err}");

    config.local_bundles.skip_verification = true;
    let rt = Runtime::new(config, RuntimeOptions::default()).await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));
    rt.stop().await;
}

// ── Policy images ─────────────────────────────────────────────

/// Build a bundle tarball from `policy` into the layout's blob store and
/// point `index.json` at it under `reference`.
fn publish_image(file_store_root: &Path, reference: &str, digest: &str, policy: &str) {
    let src = tempfile::tempdir().unwrap();
    write(src.path(), "test/policy.rego", policy);

    let layout = file_store_root.join("policies-root");
    let blob = layout.join("blobs").join("sha256").join(digest);
    fs::create_dir_all(blob.parent().unwrap()).unwrap();
    let mut out = fs::File::create(&blob).unwrap();
    build(
        &[src.path().to_path_buf()],
        &BuildParams::default(),
        &BuiltinRegistry::with_defaults(),
        &mut out,
    )
    .unwrap();

    let index = json!({"schemaVersion": 2, "manifests": [{
        "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
        "digest": format!("sha256:{digest}"),
        "annotations": {"org.opencontainers.image.ref.name": reference},
    }]});
    fs::write(layout.join("index.json"), index.to_string()).unwrap();
}

#[tokio::test]
async fn policy_image_is_loaded_and_replaced() {
    let store = tempfile::tempdir().unwrap();
    publish_image(store.path(), "ghcr.io/acme/policy:1", "aaaa", "package test\n\nallow = true\n");

    let mut config = Config::default();
    config.local_bundles.local_policy_image = Some("acme/policy:1".to_string());
    config.local_bundles.file_store_root = Some(store.path().to_path_buf());
    let rt = Runtime::new(config, RuntimeOptions::default()).await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));

    publish_image(store.path(), "ghcr.io/acme/policy:1", "bbbb", "package test\n\nallow = false\n");
    rt.reload().await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(false)));

    let policies = rt.list_policies().await.unwrap();
    assert_eq!(policies.len(), 1);
    assert!(policies[0].id.contains("/sha256/bbbb/"), "{}", policies[0].id);
    rt.stop().await;
}

#[tokio::test]
async fn unreadable_image_index_keeps_active_image() {
    let store = tempfile::tempdir().unwrap();
    publish_image(store.path(), "ghcr.io/acme/policy:1", "aaaa", "package test\n\nallow = true\n");

    let mut config = Config::default();
    config.local_bundles.local_policy_image = Some("acme/policy:1".to_string());
    config.local_bundles.file_store_root = Some(store.path().to_path_buf());
    let rt = Runtime::new(config, RuntimeOptions::default()).await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));

    let index = store.path().join("policies-root").join("index.json");
    fs::write(&index, r#"{"schemaVer"#).unwrap();
    let err = rt.reload().await.unwrap_err();
    assert_eq!(err.code(), "image_error");
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));

    let snapshot = rt.status();
    assert_eq!(snapshot.bundles.len(), 1);
    let bundle = &snapshot.bundles[0];
    assert!(bundle.id.contains("/sha256/aaaa"), "{}", bundle.id);
    assert!(bundle.last_activation.is_some());
    assert!(bundle.errors[0].starts_with("bundle error: "), "{:?}", bundle.errors);
    rt.stop().await;
}

#[tokio::test]
async fn missing_image_is_skipped_until_one_is_active() {
    let store = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.local_bundles.local_policy_image = Some("acme/policy:1".to_string());
    config.local_bundles.file_store_root = Some(store.path().to_path_buf());
    let rt = Runtime::new(config, RuntimeOptions::default()).await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, None);

    publish_image(store.path(), "ghcr.io/acme/policy:1", "aaaa", "package test\n\nallow = true\n");
    rt.reload().await.unwrap();
    assert_eq!(eval(&rt, "data.test.allow").await, Some(json!(true)));
    rt.stop().await;
}

#[tokio::test]
async fn tarball_bundle_loads_like_its_directory() {
    let src = tempfile::tempdir().unwrap();
    write(src.path(), "test/policy.rego", "package test\n\nallow = true\n");
    write(src.path(), "test/data.json", r#"{"limit": 3}"#);

    let out = tempfile::tempdir().unwrap();
    let tarball = out.path().join("bundle.tar.gz");
    let mut file = fs::File::create(&tarball).unwrap();
    build(
        &[src.path().to_path_buf()],
        &BuildParams::default(),
        &BuiltinRegistry::with_defaults(),
        &mut file,
    )
    .unwrap();
    drop(file);

    let from_dir = Runtime::new(local_config(src.path()), RuntimeOptions::default())
        .await
        .unwrap();
    let from_tar = Runtime::new(local_config(&tarball), RuntimeOptions::default())
        .await
        .unwrap();
    for query in ["data.test.allow", "data.test.limit"] {
        assert_eq!(eval(&from_dir, query).await, eval(&from_tar, query).await);
    }
    assert_eq!(eval(&from_tar, "data.test.limit").await, Some(json!(3)));

    let shared: Vec<Arc<Runtime>> = vec![from_dir, from_tar];
    for rt in shared {
        rt.stop().await;
    }
}
