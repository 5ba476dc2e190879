//! Query execution against the committed store and compiler.
//!
//! Every evaluation gets a decision id before anything else happens, runs
//! inside a read transaction that is always aborted, and optionally
//! carries metrics and an explanation built from the evaluation trace.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;
use warden_engine::ast::{parse_query, parse_ref, Body, Ref};
use warden_engine::eval::trace::{filter_fails, filter_notes, pretty, strip_locals, BufferTracer, TraceEvent};
use warden_engine::eval::QueryError;
use warden_engine::metrics::{Metrics, TIMER_PARTIAL_EVAL, TIMER_QUERY_COMPILE, TIMER_QUERY_PARSE};
use warden_engine::plugins::PluginManager;
use warden_engine::{BuiltinContext, EvalParams, PreparedQuery, ResultSet, StoragePath, TransactionParams};

use crate::decision::{DecisionEvent, DecisionLogger};
use crate::error::{Result, RuntimeError};

// ── Options ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplainMode {
    #[default]
    Off,
    Notes,
    Fails,
    Full,
    Debug,
    /// Any unrecognized mode; behaves like `Off`.
    #[serde(other)]
    Unknown,
}

impl ExplainMode {
    fn traces(self) -> bool {
        matches!(self, Self::Notes | Self::Fails | Self::Full | Self::Debug)
    }
}

impl From<&str> for ExplainMode {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "" | "off" => Self::Off,
            "notes" => Self::Notes,
            "fails" => Self::Fails,
            "full" => Self::Full,
            "debug" => Self::Debug,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ExplainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "off",
            Self::Notes => "notes",
            Self::Fails => "fails",
            Self::Full => "full",
            Self::Debug => "debug",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub explain: ExplainMode,
    /// Render the explanation as indented text instead of events.
    pub pretty: bool,
    pub include_metrics: bool,
    /// Metrics plus evaluation counters.
    pub include_instrumentation: bool,
}

// ── Results ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Explanation {
    Events(Vec<TraceEvent>),
    Pretty(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub decision_id: Uuid,
    pub result: ResultSet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<Explanation>,
}

fn explain(mode: ExplainMode, events: Vec<TraceEvent>, as_text: bool) -> Option<Explanation> {
    let events = match mode {
        ExplainMode::Notes => filter_notes(events),
        ExplainMode::Fails => filter_fails(events),
        ExplainMode::Full => strip_locals(events),
        ExplainMode::Debug => events,
        ExplainMode::Off | ExplainMode::Unknown => return None,
    };
    Some(if as_text {
        Explanation::Pretty(pretty(&events))
    } else {
        Explanation::Events(events)
    })
}

/// Merge `overlay` into `base`: objects merge key by key, anything else
/// is replaced by the overlay.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

// ── Executor ──────────────────────────────────────────────────

#[derive(Clone)]
pub struct QueryExecutor {
    manager: Arc<PluginManager>,
    logger: Option<Arc<dyn DecisionLogger>>,
}

impl QueryExecutor {
    pub fn new(manager: Arc<PluginManager>, logger: Option<Arc<dyn DecisionLogger>>) -> Self {
        Self { manager, logger }
    }

    /// Evaluate `query` once against the committed state.
    pub async fn query(&self, query: &str, input: Option<&Value>, options: &QueryOptions) -> Result<QueryResult> {
        let decision_id = Uuid::new_v4();
        let outcome = self.evaluate(decision_id, query, input, options).await;
        self.log_decision(decision_id, query, input, &outcome).await;
        outcome
    }

    async fn evaluate(
        &self,
        decision_id: Uuid,
        query: &str,
        input: Option<&Value>,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let mut metrics = Metrics::new();
        let body = parse(&mut metrics, decision_id, query)?;
        let prepared = self.prepare(&mut metrics, decision_id, query, body, Vec::new())?;
        self.run(&prepared, decision_id, query, input, options, metrics).await
    }

    /// Compile `query` once and return an evaluator for many final inputs.
    ///
    /// `unknowns` must parse as refs rooted at `input` or `data`, but they
    /// are only validated: no residual query is produced, and each final
    /// evaluation runs the full query against the merged input.
    pub async fn partial_query(
        &self,
        query: &str,
        input: Option<Value>,
        unknowns: &[String],
        options: &QueryOptions,
    ) -> Result<FinalEvaluator> {
        let decision_id = Uuid::new_v4();
        let started = Instant::now();
        let mut metrics = Metrics::new();
        let body = parse(&mut metrics, decision_id, query)?;
        let unknowns = unknowns
            .iter()
            .map(|u| parse_ref(u))
            .collect::<std::result::Result<Vec<Ref>, _>>()
            .map_err(|source| RuntimeError::BadQuery {
                decision_id,
                query: query.to_string(),
                source,
            })?;
        let prepared = self.prepare(&mut metrics, decision_id, query, body, unknowns)?;
        metrics.record(TIMER_PARTIAL_EVAL, started.elapsed());
        debug!(decision_id = %decision_id, query, "partial query prepared");

        Ok(FinalEvaluator {
            executor: self.clone(),
            decision_id,
            query: query.to_string(),
            prepared,
            input: input.unwrap_or(Value::Null),
            options: *options,
            metrics,
        })
    }

    fn prepare(
        &self,
        metrics: &mut Metrics,
        decision_id: Uuid,
        query: &str,
        body: Body,
        unknowns: Vec<Ref>,
    ) -> Result<PreparedQuery> {
        let compiled = self.manager.compiler();
        metrics
            .time(TIMER_QUERY_COMPILE, || PreparedQuery::new(compiled, body, unknowns))
            .map_err(|e| RuntimeError::QueryExecutionFailed {
                decision_id,
                query: query.to_string(),
                source: QueryError::Compile(e),
            })
    }

    async fn run(
        &self,
        prepared: &PreparedQuery,
        decision_id: Uuid,
        query: &str,
        input: Option<&Value>,
        options: &QueryOptions,
        mut metrics: Metrics,
    ) -> Result<QueryResult> {
        let store = self.manager.store().clone();
        let txn = store
            .new_transaction(TransactionParams::READ)
            .await
            .map_err(RuntimeError::store("new_transaction"))?;
        let data = match store.read(&txn, &StoragePath::root()) {
            Ok(data) => data,
            Err(e) => {
                store.abort(txn);
                return Err(RuntimeError::store("read")(e));
            }
        };

        let mut tracer = options.explain.traces().then(BufferTracer::new);
        let mut params = EvalParams::new(&data);
        params.input = input;
        params.context = BuiltinContext {
            decision_id: Some(decision_id.to_string()),
            now: Utc::now(),
        };
        params.tracer = tracer.as_mut();
        params.metrics = Some(&mut metrics);
        params.instrument = options.include_instrumentation;
        let outcome = prepared.eval(params);
        store.abort(txn);

        let result = outcome.map_err(|e| {
            warn!(decision_id = %decision_id, query, error = %e, "error evaluating query");
            RuntimeError::QueryExecutionFailed {
                decision_id,
                query: query.to_string(),
                source: QueryError::Eval(e),
            }
        })?;
        debug!(decision_id = %decision_id, query, results = result.len(), "query evaluated");

        let metrics = (options.include_metrics || options.include_instrumentation)
            .then(|| metrics.to_map(options.include_instrumentation));
        let explanation = tracer.and_then(|t| explain(options.explain, t.into_events(), options.pretty));
        Ok(QueryResult {
            decision_id,
            result,
            metrics,
            explanation,
        })
    }

    async fn log_decision(&self, decision_id: Uuid, query: &str, input: Option<&Value>, outcome: &Result<QueryResult>) {
        let Some(logger) = &self.logger else {
            return;
        };
        let (result, error) = match outcome {
            Ok(r) => (serde_json::to_value(&r.result).ok(), None),
            Err(e) => (None, Some(e.to_string())),
        };
        logger
            .log(DecisionEvent {
                decision_id,
                query: query.to_string(),
                input: input.cloned(),
                result,
                error,
                timestamp: Utc::now(),
            })
            .await;
    }
}

fn parse(metrics: &mut Metrics, decision_id: Uuid, query: &str) -> Result<Body> {
    metrics
        .time(TIMER_QUERY_PARSE, || parse_query(query))
        .map_err(|source| RuntimeError::BadQuery {
            decision_id,
            query: query.to_string(),
            source,
        })
}

/// Second phase of a partial query. Each call merges its final input over
/// a copy of the original input and evaluates independently.
pub struct FinalEvaluator {
    executor: QueryExecutor,
    decision_id: Uuid,
    query: String,
    prepared: PreparedQuery,
    input: Value,
    options: QueryOptions,
    metrics: Metrics,
}

impl FinalEvaluator {
    pub fn decision_id(&self) -> Uuid {
        self.decision_id
    }

    /// The input every evaluation starts from.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub async fn eval(&self, final_input: Option<&Value>) -> Result<QueryResult> {
        let mut input = self.input.clone();
        if let Some(overlay) = final_input {
            deep_merge(&mut input, overlay);
        }
        let input = (!input.is_null()).then_some(input);
        let outcome = self
            .executor
            .run(
                &self.prepared,
                self.decision_id,
                &self.query,
                input.as_ref(),
                &self.options,
                self.metrics.clone(),
            )
            .await;
        self.executor
            .log_decision(self.decision_id, &self.query, input.as_ref(), &outcome)
            .await;
        outcome
    }
}
