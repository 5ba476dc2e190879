//! Top-down evaluator.
//!
//! Evaluation is backtracking search written in continuation-passing style:
//! every step receives a continuation that is invoked once per solution.
//! Continuations return `Ok(false)` to stop the enumeration early.
//!
//! References into `data` resolve virtual documents: when a rule lives at
//! the referenced path it is evaluated (once per query, memoized), and
//! iterating a package merges base documents with rule values.

pub mod trace;
pub mod value;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::ast::{Body, Expr, Literal, Location, Ref, RuleKind, Term};
use crate::builtins::{BuiltinContext, BuiltinError};
use crate::compile::{CompileError, CompileErrors, Compiled, RuleSet};
use crate::metrics::{self, Metrics};
use trace::{BufferTracer, TraceEvent, TraceOp};
use value::{arith, canonical_set, compare, data_at, lookup, object_key, truthy, values_equal};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error("{0}: complete rules must not produce multiple outputs")]
    Conflict(String),

    #[error("{0}: object keys must be unique")]
    ObjectConflict(String),

    #[error("{0}: rule recursion detected")]
    Recursion(String),

    #[error(transparent)]
    Builtin(#[from] BuiltinError),

    #[error("type error: {0}")]
    Type(String),

    #[error("divide by zero")]
    DivideByZero,
}

/// Failure of a prepared or ad-hoc query.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Compile(#[from] CompileErrors),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

type EvalResult<T> = Result<T, EvalError>;
type Env = BTreeMap<String, Value>;

// ── Results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpressionValue {
    pub value: Value,
    pub text: String,
    pub location: Location,
}

/// One way of satisfying a query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Solution {
    pub expressions: Vec<ExpressionValue>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub bindings: Map<String, Value>,
}

/// Empty when the query is undefined.
pub type ResultSet = Vec<Solution>;

/// Inputs to a single evaluation.
pub struct EvalParams<'a> {
    pub data: &'a Value,
    pub input: Option<&'a Value>,
    pub context: BuiltinContext,
    pub tracer: Option<&'a mut BufferTracer>,
    pub metrics: Option<&'a mut Metrics>,
    pub instrument: bool,
}

impl<'a> EvalParams<'a> {
    pub fn new(data: &'a Value) -> Self {
        Self {
            data,
            input: None,
            context: BuiltinContext::default(),
            tracer: None,
            metrics: None,
            instrument: false,
        }
    }
}

// ── Prepared queries ────────────────────────────────────────────────

/// A query compiled once against a fixed compilation, evaluable many times.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    compiled: Arc<Compiled>,
    original: Body,
    body: Body,
    unknowns: Vec<Ref>,
}

impl PreparedQuery {
    /// Compile `query`. `unknowns` are checked to be rooted at `input` or
    /// `data` and kept for callers; evaluation does not consult them.
    pub fn new(compiled: Arc<Compiled>, query: Body, unknowns: Vec<Ref>) -> Result<Self, CompileErrors> {
        let mut body = compiled.compile_query(&query)?;
        let bad: Vec<CompileError> = unknowns
            .iter()
            .filter(|u| u.head != "input" && u.head != "data")
            .map(|u| CompileError {
                module: "query".to_string(),
                message: format!("unknown {u} must be rooted at input or data"),
            })
            .collect();
        if !bad.is_empty() {
            return Err(CompileErrors(bad));
        }

        // Top-level terms are captured rather than tested, so `false` is a result.
        for (i, lit) in body.iter_mut().enumerate() {
            if lit.negated {
                continue;
            }
            if let Expr::Term(t) = &lit.expr {
                lit.expr = Expr::Unify(Term::Var(capture_var(i)), t.clone());
            }
        }

        Ok(Self {
            compiled,
            original: query,
            body,
            unknowns,
        })
    }

    pub fn compiled(&self) -> &Arc<Compiled> {
        &self.compiled
    }

    pub fn unknowns(&self) -> &[Ref] {
        &self.unknowns
    }

    pub fn text(&self) -> String {
        self.original
            .iter()
            .map(|l| l.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn eval(&self, params: EvalParams<'_>) -> Result<ResultSet, EvalError> {
        let start = Instant::now();
        let EvalParams {
            data,
            input,
            context,
            tracer,
            metrics,
            instrument,
        } = params;

        let mut evaluator = Evaluator {
            compiled: &self.compiled,
            data,
            input,
            context: &context,
            cache: HashMap::new(),
            in_progress: HashSet::new(),
            tracer,
            depth: 0,
            counters: if instrument { Some(BTreeMap::new()) } else { None },
        };

        let mut envs = Vec::new();
        evaluator.eval_body(&self.body, &Env::new(), &mut |_, env| {
            envs.push(env.clone());
            Ok(true)
        })?;
        let counters = evaluator.counters.take();

        let results = envs
            .into_iter()
            .map(|env| self.solution(&env))
            .collect();

        if let Some(m) = metrics {
            m.record(metrics::TIMER_QUERY_EVAL, start.elapsed());
            for (name, n) in counters.unwrap_or_default() {
                m.incr(name, n);
            }
        }
        Ok(results)
    }

    fn solution(&self, env: &Env) -> Solution {
        let expressions = self
            .original
            .iter()
            .enumerate()
            .map(|(i, lit)| ExpressionValue {
                value: env
                    .get(&capture_var(i))
                    .cloned()
                    .unwrap_or(Value::Bool(true)),
                text: lit.to_string(),
                location: lit.location,
            })
            .collect();
        let bindings = env
            .iter()
            .filter(|(k, _)| !k.starts_with('$'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Solution {
            expressions,
            bindings,
        }
    }
}

fn capture_var(i: usize) -> String {
    format!("$term{i}")
}

// ── Evaluator ───────────────────────────────────────────────────────

type Cont<'k, 'a> = dyn FnMut(&mut Evaluator<'a>, &Env) -> EvalResult<bool> + 'k;
type ValueCont<'k, 'a> = dyn FnMut(&mut Evaluator<'a>, Value, &Env) -> EvalResult<bool> + 'k;
type SeqCont<'k, 'a> = dyn FnMut(&mut Evaluator<'a>, Vec<Value>, &Env) -> EvalResult<bool> + 'k;

struct Evaluator<'a> {
    compiled: &'a Compiled,
    data: &'a Value,
    input: Option<&'a Value>,
    context: &'a BuiltinContext,
    cache: HashMap<Vec<String>, Option<Value>>,
    in_progress: HashSet<Vec<String>>,
    tracer: Option<&'a mut BufferTracer>,
    depth: usize,
    counters: Option<BTreeMap<&'static str, u64>>,
}

impl<'a> Evaluator<'a> {
    fn count(&mut self, name: &'static str) {
        if let Some(counters) = self.counters.as_mut() {
            *counters.entry(name).or_default() += 1;
        }
    }

    fn trace(&mut self, op: TraceOp, node: &dyn fmt::Display, location: Option<Location>, env: &Env) {
        let depth = self.depth;
        if let Some(tracer) = self.tracer.as_deref_mut() {
            tracer.push(TraceEvent {
                op,
                node: node.to_string(),
                location,
                message: None,
                depth,
                locals: env
                    .iter()
                    .filter(|(k, _)| !k.starts_with('$'))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }
    }

    fn note(&mut self, message: String, env: &Env) {
        let depth = self.depth;
        if let Some(tracer) = self.tracer.as_deref_mut() {
            tracer.push(TraceEvent {
                op: TraceOp::Note,
                node: format!("trace({message:?})"),
                location: None,
                message: Some(message),
                depth,
                locals: env
                    .iter()
                    .filter(|(k, _)| !k.starts_with('$'))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }
    }

    // ── Bodies and literals ─────────────────────────────────────────

    fn eval_body(&mut self, body: &[Literal], env: &Env, k: &mut Cont<'_, 'a>) -> EvalResult<bool> {
        match body.split_first() {
            None => k(self, env),
            Some((lit, rest)) => {
                self.eval_literal(lit, env, &mut |ev, env2| ev.eval_body(rest, env2, &mut *k))
            }
        }
    }

    fn eval_literal(&mut self, lit: &Literal, env: &Env, k: &mut Cont<'_, 'a>) -> EvalResult<bool> {
        self.trace(TraceOp::Eval, lit, Some(lit.location), env);

        if lit.negated {
            let mut found = false;
            self.eval_expr(&lit.expr, env, &mut |_, _| {
                found = true;
                Ok(false)
            })?;
            if found {
                self.trace(TraceOp::Fail, lit, Some(lit.location), env);
                return Ok(true);
            }
            return k(self, env);
        }

        let mut matches = 0usize;
        let cont = self.eval_expr(&lit.expr, env, &mut |ev, env2| {
            if matches > 0 {
                ev.trace(TraceOp::Redo, lit, Some(lit.location), env2);
            }
            matches += 1;
            k(ev, env2)
        })?;
        if matches == 0 {
            self.trace(TraceOp::Fail, lit, Some(lit.location), env);
        }
        Ok(cont)
    }

    fn eval_expr(&mut self, expr: &Expr, env: &Env, k: &mut Cont<'_, 'a>) -> EvalResult<bool> {
        match expr {
            Expr::Term(t) => self.eval_term(t, env, &mut |ev, v, e| {
                if truthy(&v) {
                    k(ev, e)
                } else {
                    Ok(true)
                }
            }),
            Expr::Unify(a, b) => self.unify(a, b, env, k),
            Expr::Assign(lhs, rhs) => {
                self.eval_term(rhs, env, &mut |ev, v, e| ev.bind_pattern(lhs, v, e, &mut *k))
            }
            Expr::Compare(op, a, b) => self.eval_term(a, env, &mut |ev, va, e1| {
                ev.eval_term(b, e1, &mut |ev2, vb, e2| {
                    if compare(*op, &va, &vb) {
                        k(ev2, e2)
                    } else {
                        Ok(true)
                    }
                })
            }),
            Expr::Member(needle, collection) => self.eval_term(collection, env, &mut |ev, coll, e| {
                for item in members(&coll) {
                    if !ev.bind_pattern(needle, item, e, &mut *k)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }),
            Expr::SomeDecl(_) => k(self, env),
            Expr::SomeIn {
                key,
                value,
                collection,
            } => self.eval_term(collection, env, &mut |ev, coll, e| {
                for (item_key, item) in entries(&coll) {
                    let keep_going = match key {
                        Some(key_pat) => ev.bind_pattern(key_pat, item_key, e, &mut |ev2, e2| {
                            ev2.bind_pattern(value, item.clone(), e2, &mut *k)
                        })?,
                        None => ev.bind_pattern(value, item, e, &mut *k)?,
                    };
                    if !keep_going {
                        return Ok(false);
                    }
                }
                Ok(true)
            }),
        }
    }

    // ── Unification ─────────────────────────────────────────────────

    fn unify(&mut self, a: &Term, b: &Term, env: &Env, k: &mut Cont<'_, 'a>) -> EvalResult<bool> {
        if has_unbound(a, env) {
            return self.eval_term(b, env, &mut |ev, v, e| ev.bind_pattern(a, v, e, &mut *k));
        }
        if has_unbound(b, env) {
            return self.eval_term(a, env, &mut |ev, v, e| ev.bind_pattern(b, v, e, &mut *k));
        }
        self.eval_term(a, env, &mut |ev, va, e1| {
            ev.eval_term(b, e1, &mut |ev2, vb, e2| {
                if values_equal(&va, &vb) {
                    k(ev2, e2)
                } else {
                    Ok(true)
                }
            })
        })
    }

    fn bind_pattern(&mut self, pat: &Term, value: Value, env: &Env, k: &mut Cont<'_, 'a>) -> EvalResult<bool> {
        match pat {
            Term::Var(name) => match env.get(name) {
                Some(bound) if values_equal(bound, &value) => k(self, env),
                Some(_) => Ok(true),
                None => {
                    let mut next = env.clone();
                    next.insert(name.clone(), value);
                    k(self, &next)
                }
            },
            Term::Array(items) => match value {
                Value::Array(values) if values.len() == items.len() => {
                    self.bind_seq(items, &values, env, k)
                }
                _ => Ok(true),
            },
            Term::Object(pairs) => {
                let Value::Object(map) = value else {
                    return Ok(true);
                };
                if map.len() != pairs.len() {
                    return Ok(true);
                }
                let mut patterns = Vec::with_capacity(pairs.len());
                let mut values = Vec::with_capacity(pairs.len());
                for (key_term, value_pat) in pairs {
                    let key = match key_term {
                        Term::Scalar(v) => object_key(v)?,
                        _ => return Ok(true),
                    };
                    match map.get(&key) {
                        Some(v) => {
                            patterns.push(value_pat.clone());
                            values.push(v.clone());
                        }
                        None => return Ok(true),
                    }
                }
                self.bind_seq(&patterns, &values, env, k)
            }
            other => self.eval_term(other, env, &mut |ev, v, e| {
                if values_equal(&v, &value) {
                    k(ev, e)
                } else {
                    Ok(true)
                }
            }),
        }
    }

    fn bind_seq(&mut self, patterns: &[Term], values: &[Value], env: &Env, k: &mut Cont<'_, 'a>) -> EvalResult<bool> {
        match (patterns.split_first(), values.split_first()) {
            (Some((p, prest)), Some((v, vrest))) => self.bind_pattern(p, v.clone(), env, &mut |ev, e| {
                ev.bind_seq(prest, vrest, e, &mut *k)
            }),
            _ => k(self, env),
        }
    }

    // ── Terms ───────────────────────────────────────────────────────

    fn eval_term(&mut self, term: &Term, env: &Env, k: &mut ValueCont<'_, 'a>) -> EvalResult<bool> {
        match term {
            Term::Scalar(v) => k(self, v.clone(), env),
            Term::Var(name) => match env.get(name) {
                Some(v) => k(self, v.clone(), env),
                None => Ok(true),
            },
            Term::Ref(r) => self.eval_ref(r, env, k),
            Term::Array(items) => {
                self.eval_seq(items, Vec::new(), env, &mut |ev, values, e| k(ev, Value::Array(values), e))
            }
            Term::Set(items) => self.eval_seq(items, Vec::new(), env, &mut |ev, values, e| {
                k(ev, Value::Array(canonical_set(values)), e)
            }),
            Term::Object(pairs) => {
                let flat: Vec<Term> = pairs
                    .iter()
                    .flat_map(|(key, val)| [key.clone(), val.clone()])
                    .collect();
                self.eval_seq(&flat, Vec::new(), env, &mut |ev, values, e| {
                    let mut map = Map::new();
                    for pair in values.chunks(2) {
                        map.insert(object_key(&pair[0])?, pair[1].clone());
                    }
                    k(ev, Value::Object(map), e)
                })
            }
            Term::Call(name, args) => self.eval_seq(args, Vec::new(), env, &mut |ev, values, e| {
                if name == "trace" {
                    let message = match values.first() {
                        Some(Value::String(s)) => s.clone(),
                        Some(other) => other.to_string(),
                        None => String::new(),
                    };
                    ev.note(message, e);
                    return k(ev, Value::Bool(true), e);
                }
                ev.count(metrics::COUNTER_BUILTIN_CALL);
                let compiled = ev.compiled;
                let Some(func) = compiled.builtins().get(name) else {
                    return Err(EvalError::Type(format!("undefined function {name}")));
                };
                match func(ev.context, &values)? {
                    Some(v) => k(ev, v, e),
                    None => Ok(true),
                }
            }),
            Term::Arith(op, a, b) => self.eval_term(a, env, &mut |ev, va, e1| {
                ev.eval_term(b, e1, &mut |ev2, vb, e2| {
                    let v = arith(*op, &va, &vb)?;
                    k(ev2, v, e2)
                })
            }),
            Term::ArrayCompr(head, body) => {
                let items = self.collect(head, body, env)?;
                k(self, Value::Array(items), env)
            }
            Term::SetCompr(head, body) => {
                let items = self.collect(head, body, env)?;
                k(self, Value::Array(canonical_set(items)), env)
            }
        }
    }

    fn collect(&mut self, head: &Term, body: &Body, env: &Env) -> EvalResult<Vec<Value>> {
        let mut out = Vec::new();
        self.eval_body(body, env, &mut |ev, e| {
            ev.eval_term(head, e, &mut |_, v, _| {
                out.push(v);
                Ok(true)
            })
        })?;
        Ok(out)
    }

    fn eval_seq(&mut self, terms: &[Term], acc: Vec<Value>, env: &Env, k: &mut SeqCont<'_, 'a>) -> EvalResult<bool> {
        match terms.split_first() {
            None => k(self, acc, env),
            Some((first, rest)) => self.eval_term(first, env, &mut |ev, v, e| {
                let mut next = acc.clone();
                next.push(v);
                ev.eval_seq(rest, next, e, &mut *k)
            }),
        }
    }

    // ── References ──────────────────────────────────────────────────

    fn eval_ref(&mut self, r: &Ref, env: &Env, k: &mut ValueCont<'_, 'a>) -> EvalResult<bool> {
        match r.head.as_str() {
            "input" => match self.input {
                Some(input) => self.walk_value(input, &r.path, env, k),
                None => Ok(true),
            },
            "data" => self.walk_data(Vec::new(), &r.path, env, k),
            local => match env.get(local) {
                Some(v) => {
                    let v = v.clone();
                    self.walk_value(&v, &r.path, env, k)
                }
                None => Ok(true),
            },
        }
    }

    fn walk_value(&mut self, cur: &Value, path: &[Term], env: &Env, k: &mut ValueCont<'_, 'a>) -> EvalResult<bool> {
        let Some((first, rest)) = path.split_first() else {
            return k(self, cur.clone(), env);
        };
        if let Term::Var(name) = first {
            if !env.contains_key(name) {
                for (key, item) in entries(cur) {
                    let mut next = env.clone();
                    next.insert(name.clone(), key);
                    if !self.walk_value(&item, rest, &next, k)? {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
        }
        self.eval_term(first, env, &mut |ev, key, e| match lookup(cur, &key) {
            Some(child) => ev.walk_value(child, rest, e, &mut *k),
            None => Ok(true),
        })
    }

    fn walk_data(&mut self, prefix: Vec<String>, path: &[Term], env: &Env, k: &mut ValueCont<'_, 'a>) -> EvalResult<bool> {
        let compiled = self.compiled;
        let data = self.data;

        if !prefix.is_empty() && compiled.rule_set(&prefix).is_some() {
            return match self.eval_rule(&prefix)? {
                Some(v) => self.walk_value(&v, path, env, k),
                None => Ok(true),
            };
        }
        if !compiled.has_rules_under(&prefix) {
            return match data_at(data, &prefix) {
                Some(base) => self.walk_value(base, path, env, k),
                None => Ok(true),
            };
        }

        let Some((first, rest)) = path.split_first() else {
            return match self.materialize(&prefix)? {
                Some(v) => k(self, v, env),
                None => Ok(true),
            };
        };

        if let Term::Var(name) = first {
            if !env.contains_key(name) {
                let mut keys = compiled.child_keys(&prefix);
                if let Some(Value::Object(map)) = data_at(data, &prefix) {
                    keys.extend(map.keys().cloned());
                }
                for key in keys {
                    let mut next = env.clone();
                    next.insert(name.clone(), Value::String(key.clone()));
                    let mut child = prefix.clone();
                    child.push(key);
                    if !self.walk_data(child, rest, &next, k)? {
                        return Ok(false);
                    }
                }
                return Ok(true);
            }
        }

        self.eval_term(first, env, &mut |ev, key, e| match key {
            Value::String(seg) => {
                let mut child = prefix.clone();
                child.push(seg);
                ev.walk_data(child, rest, e, &mut *k)
            }
            _ => Ok(true),
        })
    }

    /// Full value of the virtual document at `prefix`.
    fn materialize(&mut self, prefix: &[String]) -> EvalResult<Option<Value>> {
        let compiled = self.compiled;
        if compiled.rule_set(prefix).is_some() {
            return self.eval_rule(prefix);
        }
        let base = data_at(self.data, prefix).cloned();
        if !compiled.has_rules_under(prefix) {
            return Ok(base);
        }
        let mut doc = match base {
            Some(Value::Object(map)) => map,
            Some(other) => return Ok(Some(other)),
            None => Map::new(),
        };
        for key in compiled.child_keys(prefix) {
            let mut child = prefix.to_vec();
            child.push(key.clone());
            if let Some(v) = self.materialize(&child)? {
                doc.insert(key, v);
            }
        }
        Ok(Some(Value::Object(doc)))
    }

    // ── Rules ───────────────────────────────────────────────────────

    fn eval_rule(&mut self, path: &[String]) -> EvalResult<Option<Value>> {
        if let Some(cached) = self.cache.get(path) {
            let cached = cached.clone();
            self.count(metrics::COUNTER_VIRTUAL_CACHE_HIT);
            return Ok(cached);
        }
        self.count(metrics::COUNTER_VIRTUAL_CACHE_MISS);

        let compiled = self.compiled;
        let Some(rules) = compiled.rule_set(path) else {
            return Ok(None);
        };
        let name = rules.data_ref();
        if !self.in_progress.insert(path.to_vec()) {
            return Err(EvalError::Recursion(name));
        }

        let empty = Env::new();
        self.trace(TraceOp::Enter, &name, None, &empty);
        self.depth += 1;
        let result = self.eval_rule_set(rules);
        self.depth -= 1;
        self.in_progress.remove(path);
        let value = result?;
        self.trace(TraceOp::Exit, &name, None, &empty);

        self.cache.insert(path.to_vec(), value.clone());
        Ok(value)
    }

    fn eval_rule_set(&mut self, rules: &RuleSet) -> EvalResult<Option<Value>> {
        self.count(metrics::COUNTER_RULE_EVAL);
        let empty = Env::new();
        match rules.kind {
            RuleKind::Complete => {
                let mut values: Vec<Value> = Vec::new();
                for rule in &rules.rules {
                    self.eval_body(&rule.body, &empty, &mut |ev, env| match &rule.head.value {
                        Some(t) => ev.eval_term(t, env, &mut |_, v, _| {
                            if !values.iter().any(|x| values_equal(x, &v)) {
                                values.push(v);
                            }
                            Ok(true)
                        }),
                        None => {
                            if !values.iter().any(|x| x == &Value::Bool(true)) {
                                values.push(Value::Bool(true));
                            }
                            Ok(true)
                        }
                    })?;
                }
                if values.len() > 1 {
                    return Err(EvalError::Conflict(rules.data_ref()));
                }
                if let Some(v) = values.pop() {
                    return Ok(Some(v));
                }
                match &rules.default {
                    Some(t) => {
                        let mut out = None;
                        self.eval_term(t, &empty, &mut |_, v, _| {
                            out = Some(v);
                            Ok(false)
                        })?;
                        Ok(out)
                    }
                    None => Ok(None),
                }
            }
            RuleKind::PartialSet => {
                let mut items = Vec::new();
                for rule in &rules.rules {
                    let Some(key) = &rule.head.key else { continue };
                    self.eval_body(&rule.body, &empty, &mut |ev, env| {
                        ev.eval_term(key, env, &mut |_, v, _| {
                            items.push(v);
                            Ok(true)
                        })
                    })?;
                }
                Ok(Some(Value::Array(canonical_set(items))))
            }
            RuleKind::PartialObject => {
                let mut map = Map::new();
                let mut conflict = false;
                for rule in &rules.rules {
                    let (Some(key), Some(val)) = (&rule.head.key, &rule.head.value) else {
                        continue;
                    };
                    self.eval_body(&rule.body, &empty, &mut |ev, env| {
                        ev.eval_term(key, env, &mut |ev2, kv, e2| {
                            let key = object_key(&kv)?;
                            ev2.eval_term(val, e2, &mut |_, v, _| {
                                match map.get(&key) {
                                    Some(existing) if !values_equal(existing, &v) => conflict = true,
                                    Some(_) => {}
                                    None => {
                                        map.insert(key.clone(), v);
                                    }
                                }
                                Ok(true)
                            })
                        })
                    })?;
                }
                if conflict {
                    return Err(EvalError::ObjectConflict(rules.data_ref()));
                }
                Ok(Some(Value::Object(map)))
            }
        }
    }
}

fn has_unbound(term: &Term, env: &Env) -> bool {
    match term {
        Term::Var(name) => !env.contains_key(name),
        Term::Array(items) => items.iter().any(|t| has_unbound(t, env)),
        Term::Object(pairs) => pairs.iter().any(|(_, v)| has_unbound(v, env)),
        _ => false,
    }
}

/// Elements of a collection: array items or object values.
fn members(coll: &Value) -> Vec<Value> {
    match coll {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map.values().cloned().collect(),
        _ => Vec::new(),
    }
}

/// `(key, value)` pairs of a collection; array keys are indices.
fn entries(coll: &Value) -> Vec<(Value, Value)> {
    match coll {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::from(i), v.clone()))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (Value::String(k.clone()), v.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{parse_module, parse_query};
    use crate::builtins::BuiltinRegistry;
    use crate::compile::Compiler;
    use serde_json::json;

    fn compile(sources: &[(&str, &str)]) -> Arc<Compiled> {
        let modules = sources
            .iter()
            .map(|(id, src)| (id.to_string(), parse_module(id, src).unwrap()))
            .collect();
        Compiler::new(Arc::new(BuiltinRegistry::with_defaults()))
            .compile(modules)
            .unwrap()
    }

    fn run(compiled: &Arc<Compiled>, query: &str, data: &Value, input: Option<&Value>) -> ResultSet {
        let prepared = PreparedQuery::new(compiled.clone(), parse_query(query).unwrap(), Vec::new()).unwrap();
        let mut params = EvalParams::new(data);
        params.input = input;
        prepared.eval(params).unwrap()
    }

    const RBAC: &str = r#"
package rbac

default allow = false

allow {
    some role in data.roles[input.user]
    role == "admin"
}

allow {
    input.method == "GET"
    viewer
}

viewer {
    data.roles[input.user][_] == "viewer"
}
"#;

    #[test]
    fn complete_rule_with_default() {
        let compiled = compile(&[("rbac.rego", RBAC)]);
        let data = json!({"roles": {"alice": ["admin"], "bob": ["viewer"]}});

        let rs = run(&compiled, "data.rbac.allow", &data, Some(&json!({"user": "alice"})));
        assert_eq!(rs[0].expressions[0].value, json!(true));

        let rs = run(&compiled, "data.rbac.allow", &data, Some(&json!({"user": "bob", "method": "POST"})));
        assert_eq!(rs[0].expressions[0].value, json!(false));

        let rs = run(&compiled, "data.rbac.allow", &data, Some(&json!({"user": "bob", "method": "GET"})));
        assert_eq!(rs[0].expressions[0].value, json!(true));
    }

    #[test]
    fn undefined_results_are_empty() {
        let compiled = compile(&[("p.rego", "package p\nallow { input.x == 1 }\n")]);
        let rs = run(&compiled, "data.p.allow", &json!({}), Some(&json!({"x": 2})));
        assert!(rs.is_empty());
    }

    #[test]
    fn iteration_binds_variables() {
        let compiled = compile(&[]);
        let data = json!({"users": {"a": {"age": 30}, "b": {"age": 10}}});
        let rs = run(&compiled, "data.users[name].age > 18", &data, None);
        assert_eq!(rs.len(), 1);
        assert_eq!(rs[0].bindings.get("name"), Some(&json!("a")));
        assert_eq!(rs[0].expressions[0].value, json!(true));
    }

    #[test]
    fn partial_set_and_object_rules() {
        let compiled = compile(&[(
            "p.rego",
            r#"
package p

adults[name] { some name; data.users[name].age >= 18 }

ages[name] = age { age := data.users[name].age }
"#,
        )]);
        let data = json!({"users": {"a": {"age": 30}, "b": {"age": 10}, "c": {"age": 18}}});
        let rs = run(&compiled, "x = data.p.adults", &data, None);
        assert_eq!(rs[0].bindings["x"], json!(["a", "c"]));
        let rs = run(&compiled, "x = data.p.ages", &data, None);
        assert_eq!(rs[0].bindings["x"], json!({"a": 30, "b": 10, "c": 18}));
    }

    #[test]
    fn package_iteration_merges_base_and_virtual_documents() {
        let compiled = compile(&[("p.rego", "package app.rules\nallow = true\n")]);
        let data = json!({"app": {"config": {"mode": "strict"}}});
        let rs = run(&compiled, "x = data.app", &data, None);
        assert_eq!(
            rs[0].bindings["x"],
            json!({"config": {"mode": "strict"}, "rules": {"allow": true}})
        );
    }

    #[test]
    fn conflicting_complete_rule_is_an_error() {
        let compiled = compile(&[("p.rego", "package p\nv = 1 { true }\nv = 2 { true }\n")]);
        let prepared =
            PreparedQuery::new(compiled, parse_query("data.p.v").unwrap(), Vec::new()).unwrap();
        let data = json!({});
        let err = prepared.eval(EvalParams::new(&data)).unwrap_err();
        assert_eq!(err, EvalError::Conflict("data.p.v".to_string()));
    }

    #[test]
    fn negation_and_comprehensions() {
        let compiled = compile(&[(
            "p.rego",
            r#"
package p

names := [n | some u in input.users; n := u.name]
blocked { some u in input.users; u.blocked == true }
clean { not blocked }
"#,
        )]);
        let input = json!({"users": [{"name": "a"}, {"name": "b", "blocked": false}]});
        let rs = run(&compiled, "x = data.p.names; data.p.clean", &json!({}), Some(&input));
        assert_eq!(rs[0].bindings["x"], json!(["a", "b"]));
        assert_eq!(rs[0].expressions[1].value, json!(true));
    }

    #[test]
    fn builtins_and_arithmetic() {
        let compiled = compile(&[]);
        let rs = run(
            &compiled,
            r#"x := count([1, 2, 3]) * 2; startswith("policy", "pol")"#,
            &json!({}),
            None,
        );
        assert_eq!(rs[0].bindings["x"], json!(6));
    }

    #[test]
    fn trace_notes_and_counters() {
        let compiled = compile(&[(
            "p.rego",
            "package p\nallow { trace(\"checking\"); input.ok == true }\n",
        )]);
        let prepared =
            PreparedQuery::new(compiled, parse_query("data.p.allow").unwrap(), Vec::new()).unwrap();
        let data = json!({});
        let input = json!({"ok": true});
        let mut tracer = BufferTracer::new();
        let mut m = Metrics::new();
        let mut params = EvalParams::new(&data);
        params.input = Some(&input);
        params.tracer = Some(&mut tracer);
        params.metrics = Some(&mut m);
        params.instrument = true;
        prepared.eval(params).unwrap();

        let notes = trace::filter_notes(tracer.into_events());
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].message.as_deref(), Some("checking"));
        assert!(m.timer(metrics::TIMER_QUERY_EVAL).is_some());
        assert_eq!(m.counter(metrics::COUNTER_RULE_EVAL), Some(1));
    }

    #[test]
    fn unknowns_must_be_rooted() {
        let compiled = compile(&[]);
        let err = PreparedQuery::new(
            compiled,
            parse_query("true").unwrap(),
            vec![Ref::new("foo")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("must be rooted at input or data"));
    }
}
