//! Query execution, partial queries, decision logging and introspection
//! against a runtime with one local bundle.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use warden_runtime::engine::eval::{EvalError, QueryError};
use warden_runtime::introspect::{decode_id, encode_id};
use warden_runtime::{
    Config, DecisionEvent, DecisionLogger, ExplainMode, Explanation, QueryOptions, Runtime, RuntimeError,
    RuntimeOptions,
};

const RBAC: &str = r#"package acme.rbac

default allow = false

allow {
    input.user.role == "admin"
}

allow {
    input.user.name == data.acme.rbac.owners[_]
}
"#;

const LIMITS: &str = r#"package acme.limits

max_items = 10

tier = "gold" {
    input.vip
}

tier = "basic" {
    input.trial
}
"#;

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn fixture(dir: &Path) {
    write(dir, ".manifest", r#"{"revision": "v1"}"#);
    write(dir, "acme/rbac/policy.rego", RBAC);
    write(dir, "acme/rbac/data.json", r#"{"owners": ["carol"]}"#);
    write(dir, "acme/limits/policy.rego", LIMITS);
}

async fn runtime(dir: &Path, options: RuntimeOptions) -> Arc<Runtime> {
    fixture(dir);
    let mut config = Config::default();
    config.local_bundles.paths = vec![dir.to_path_buf()];
    Runtime::new(config, options).await.unwrap()
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DecisionEvent>>,
}

#[async_trait]
impl DecisionLogger for Recorder {
    async fn log(&self, event: DecisionEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ── One-shot queries ──────────────────────────────────────────

#[tokio::test]
async fn query_evaluates_against_loaded_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;

    let admin = json!({"user": {"name": "dave", "role": "admin"}});
    let out = rt
        .query("data.acme.rbac.allow", Some(&admin), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(out.result[0].expressions[0].value, json!(true));
    assert!(out.metrics.is_none());
    assert!(out.explanation.is_none());

    let owner = json!({"user": {"name": "carol"}});
    let out = rt
        .query("data.acme.rbac.allow", Some(&owner), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(out.result[0].expressions[0].value, json!(true));

    let out = rt
        .query("data.acme.rbac.allow", None, &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(out.result[0].expressions[0].value, json!(false));
    rt.stop().await;
}

#[tokio::test]
async fn every_query_gets_a_fresh_decision_id() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let opts = QueryOptions::default();
    let a = rt.query("data.acme.limits.max_items", None, &opts).await.unwrap();
    let b = rt.query("data.acme.limits.max_items", None, &opts).await.unwrap();
    assert_ne!(a.decision_id, b.decision_id);
    rt.stop().await;
}

#[tokio::test]
async fn unparsable_query_is_a_bad_query_with_decision_id() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let err = rt
        .query("data.acme.rbac.allow ==", None, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::BadQuery { .. }), "{err:?}");
    assert_eq!(err.code(), "bad_query");
    assert!(err.decision_id().is_some());
    rt.stop().await;
}

#[tokio::test]
async fn unsafe_builtins_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let err = rt
        .query(r#"x := http.send({"url": "http://localhost"})"#, None, &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::QueryExecutionFailed { .. }), "{err:?}");
    assert!(err.decision_id().is_some());
    rt.stop().await;
}

#[tokio::test]
async fn evaluation_failure_is_reported_apart_from_parse_failure() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;

    let gold = rt
        .query("data.acme.limits.tier", Some(&json!({"vip": true})), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(gold.result[0].expressions[0].value, json!("gold"));

    let both = json!({"vip": true, "trial": true});
    let err = rt
        .query("data.acme.limits.tier", Some(&both), &QueryOptions::default())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            RuntimeError::QueryExecutionFailed {
                source: QueryError::Eval(EvalError::Conflict(_)),
                ..
            }
        ),
        "{err:?}"
    );
    assert_eq!(err.code(), "query_execution_failed");
    assert!(err.decision_id().is_some());
    rt.stop().await;
}

#[tokio::test]
async fn metrics_and_explanations_are_attached_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let input = json!({"user": {"name": "eve"}});

    let opts = QueryOptions {
        include_metrics: true,
        ..QueryOptions::default()
    };
    let out = rt.query("data.acme.rbac.allow", Some(&input), &opts).await.unwrap();
    let metrics = out.metrics.unwrap();
    assert!(metrics.contains_key("timer_rego_query_parse_ns"));
    assert!(metrics.contains_key("timer_rego_query_eval_ns"));

    let opts = QueryOptions {
        explain: ExplainMode::Full,
        ..QueryOptions::default()
    };
    let out = rt.query("data.acme.rbac.allow", Some(&input), &opts).await.unwrap();
    match out.explanation {
        Some(Explanation::Events(events)) => assert!(!events.is_empty()),
        other => panic!("expected trace events, got {other:?}"),
    }

    let opts = QueryOptions {
        explain: ExplainMode::Full,
        pretty: true,
        ..QueryOptions::default()
    };
    let out = rt.query("data.acme.rbac.allow", Some(&input), &opts).await.unwrap();
    assert!(matches!(out.explanation, Some(Explanation::Pretty(ref lines)) if !lines.is_empty()));

    let opts = QueryOptions {
        explain: ExplainMode::from("sideways"),
        ..QueryOptions::default()
    };
    let out = rt.query("data.acme.rbac.allow", Some(&input), &opts).await.unwrap();
    assert!(out.explanation.is_none());
    rt.stop().await;
}

#[tokio::test]
async fn decisions_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Arc::new(Recorder::default());
    let rt = runtime(dir.path(), RuntimeOptions::new().with_decision_logger(recorder.clone())).await;

    let ok = rt
        .query("data.acme.limits.max_items", None, &QueryOptions::default())
        .await
        .unwrap();
    let err = rt
        .query("data.acme.limits.max_items ==", None, &QueryOptions::default())
        .await
        .unwrap_err();

    let events = recorder.events.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].decision_id, ok.decision_id);
    assert!(events[0].error.is_none());
    assert_eq!(Some(events[1].decision_id), err.decision_id());
    assert!(events[1].error.is_some());
    drop(events);
    rt.stop().await;
}

// ── Partial queries ───────────────────────────────────────────

#[tokio::test]
async fn partial_query_never_mutates_its_input() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let original = json!({"user": {"name": "dave", "role": "viewer"}});

    let evaluator = rt
        .partial_query(
            "data.acme.rbac.allow",
            Some(original.clone()),
            &["input.user.role".to_string()],
            &QueryOptions::default(),
        )
        .await
        .unwrap();

    let as_admin = evaluator
        .eval(Some(&json!({"user": {"role": "admin"}})))
        .await
        .unwrap();
    assert_eq!(as_admin.result[0].expressions[0].value, json!(true));
    assert_eq!(evaluator.input(), &original);

    let unchanged = evaluator.eval(None).await.unwrap();
    assert_eq!(unchanged.result[0].expressions[0].value, json!(false));

    let as_owner = evaluator
        .eval(Some(&json!({"user": {"name": "carol"}})))
        .await
        .unwrap();
    assert_eq!(as_owner.result[0].expressions[0].value, json!(true));
    assert_eq!(evaluator.input(), &original);

    assert_eq!(as_admin.decision_id, evaluator.decision_id());
    assert_eq!(as_owner.decision_id, evaluator.decision_id());
    rt.stop().await;
}

#[tokio::test]
async fn partial_query_rejects_bad_unknowns() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let err = rt
        .partial_query("data.acme.rbac.allow", None, &["[[".to_string()], &QueryOptions::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "bad_query");
    rt.stop().await;
}

#[tokio::test]
async fn unknowns_are_validated_but_do_not_change_results() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;

    let err = rt
        .partial_query("data.acme.rbac.allow", None, &["x.role".to_string()], &QueryOptions::default())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), "query_execution_failed");
    assert!(err.decision_id().is_some());

    let input = json!({"user": {"role": "admin"}});
    let with_unknowns = rt
        .partial_query(
            "data.acme.rbac.allow",
            Some(input.clone()),
            &["input.user".to_string()],
            &QueryOptions::default(),
        )
        .await
        .unwrap();
    let direct = rt
        .query("data.acme.rbac.allow", Some(&input), &QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(with_unknowns.eval(None).await.unwrap().result, direct.result);
    rt.stop().await;
}

// ── Introspection ─────────────────────────────────────────────

#[tokio::test]
async fn bundles_and_policies_are_listed() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let path = dir.path().to_string_lossy().to_string();

    let bundles = rt.list_bundles().await.unwrap();
    assert_eq!(bundles.len(), 1);
    let bundle = &bundles[0];
    assert_eq!(bundle.path, path);
    assert_eq!(bundle.name, "acme");
    assert_eq!(bundle.revision, "v1");
    assert_eq!(rt.get_bundle_by_id(&bundle.id).await.unwrap(), *bundle);

    let err = rt.get_bundle_by_id("missing").await.unwrap_err();
    assert_eq!(err.to_string(), "bundle for policy id not found [missing]");

    let policies = rt.get_policies(&bundle.id).await.unwrap();
    let names: Vec<&str> = policies.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["acme.limits", "acme.rbac"]);
    assert_eq!(decode_id(&policies[1].id), format!("{path}/acme/rbac/policy.rego"));

    let rbac_only = rt
        .get_policy_list(&bundle.id, |pkg| pkg.ends_with(".rbac"))
        .await
        .unwrap();
    assert_eq!(rbac_only.len(), 1);
    assert_eq!(rbac_only[0].root(), "acme");

    assert_eq!(rt.get_policy_root().await.unwrap().as_deref(), Some("acme"));
    assert_eq!(rt.get_policy_root_for_path("/nowhere").await.unwrap(), None);
    rt.stop().await;
}

#[tokio::test]
async fn modules_are_resolved_by_encoded_id() {
    let dir = tempfile::tempdir().unwrap();
    let rt = runtime(dir.path(), RuntimeOptions::default()).await;
    let location = format!("{}/acme/rbac/policy.rego", dir.path().to_string_lossy());

    let module = rt.get_module(&encode_id(&location)).await.unwrap();
    assert_eq!(module.name, "acme.rbac");
    assert_eq!(module.content, RBAC);
    assert_eq!(module.rules, vec!["allow", "allow", "allow"]);

    let err = rt.get_module(&encode_id("/no/such/policy.rego")).await.unwrap_err();
    assert_eq!(err.code(), "not_found");

    let policy = rt.get_policy(&location).await.unwrap();
    assert_eq!(policy.package.as_deref(), Some("data.acme.rbac"));
    assert_eq!(policy.rules, vec!["allow"]);
    assert_eq!(rt.list_policies().await.unwrap().len(), 2);
    rt.stop().await;
}
