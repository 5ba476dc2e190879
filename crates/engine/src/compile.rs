//! Compiler: turns parsed modules into an immutable rule index.
//!
//! Compilation resolves rule and import names into `data` references,
//! validates function calls against the builtin registry and groups rule
//! definitions by their full path.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::ast::{Body, Expr, Literal, Module, Ref, Rule, RuleKind, Term};
use crate::builtins::{BuiltinRegistry, UNSAFE_BUILTINS};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{module}: {message}")]
pub struct CompileError {
    /// Module id, or `query` for ad-hoc queries.
    pub module: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompileErrors(pub Vec<CompileError>);

impl fmt::Display for CompileErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len();
        write!(f, "{n} error{} occurred", if n == 1 { "" } else { "s" })?;
        for err in &self.0 {
            write!(f, "; {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CompileErrors {}

// ── Compiled output ─────────────────────────────────────────────────

/// All definitions of one rule path.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub path: Vec<String>,
    pub kind: RuleKind,
    pub rules: Vec<Rule>,
    pub default: Option<Term>,
}

impl RuleSet {
    pub fn data_ref(&self) -> String {
        format!("data.{}", self.path.join("."))
    }
}

/// Immutable result of a successful compilation.
#[derive(Debug)]
pub struct Compiled {
    modules: BTreeMap<String, Module>,
    rules: BTreeMap<Vec<String>, Arc<RuleSet>>,
    builtins: Arc<BuiltinRegistry>,
}

impl Compiled {
    pub fn empty(builtins: Arc<BuiltinRegistry>) -> Arc<Self> {
        Arc::new(Self {
            modules: BTreeMap::new(),
            rules: BTreeMap::new(),
            builtins,
        })
    }

    /// Parsed modules as supplied to the compiler, keyed by id.
    pub fn modules(&self) -> &BTreeMap<String, Module> {
        &self.modules
    }

    pub fn builtins(&self) -> &Arc<BuiltinRegistry> {
        &self.builtins
    }

    pub fn rule_set(&self, path: &[String]) -> Option<&Arc<RuleSet>> {
        self.rules.get(path)
    }

    pub fn rule_paths(&self) -> impl Iterator<Item = &Vec<String>> {
        self.rules.keys()
    }

    fn under<'a>(
        &'a self,
        prefix: &'a [String],
    ) -> impl Iterator<Item = &'a Vec<String>> + 'a {
        self.rules
            .range(prefix.to_vec()..)
            .map(|(k, _)| k)
            .take_while(move |k| k.starts_with(prefix))
    }

    /// True when some rule lives at or below `prefix`.
    pub fn has_rules_under(&self, prefix: &[String]) -> bool {
        self.under(prefix).next().is_some()
    }

    /// Next path segments of rules strictly below `prefix`.
    pub fn child_keys(&self, prefix: &[String]) -> BTreeSet<String> {
        self.under(prefix)
            .filter(|k| k.len() > prefix.len())
            .map(|k| k[prefix.len()].clone())
            .collect()
    }

    /// Resolve and validate an ad-hoc query against this compilation.
    pub fn compile_query(&self, body: &Body) -> Result<Body, CompileErrors> {
        let scope = Scope {
            module: "query",
            package: &[],
            rules: &HashSet::new(),
            imports: &HashMap::new(),
        };
        let mut errors = Vec::new();
        let mut locals = HashSet::new();
        let rewritten = rewrite_body(body, &scope, &mut locals, &self.builtins, &mut errors);

        let mut calls = Vec::new();
        for lit in body {
            collect_calls_expr(&lit.expr, &mut calls);
        }
        for name in calls {
            if UNSAFE_BUILTINS.contains(&name.as_str()) {
                errors.push(CompileError {
                    module: "query".to_string(),
                    message: format!("unsafe built-in function calls in expression: {name}"),
                });
            }
        }

        if errors.is_empty() {
            Ok(rewritten)
        } else {
            Err(CompileErrors(errors))
        }
    }
}

// ── Compiler ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Compiler {
    builtins: Arc<BuiltinRegistry>,
    error_limit: usize,
    path_conflicts: Option<Value>,
}

impl Compiler {
    pub fn new(builtins: Arc<BuiltinRegistry>) -> Self {
        Self {
            builtins,
            error_limit: 10,
            path_conflicts: None,
        }
    }

    /// Maximum number of errors reported; 0 means unlimited.
    pub fn with_error_limit(mut self, limit: usize) -> Self {
        self.error_limit = limit;
        self
    }

    /// Reject rules whose path is already occupied by base data.
    pub fn with_path_conflicts_check(mut self, data: Value) -> Self {
        self.path_conflicts = Some(data);
        self
    }

    pub fn compile(&self, modules: BTreeMap<String, Module>) -> Result<Arc<Compiled>, CompileErrors> {
        let mut errors = Vec::new();

        let mut package_rules: HashMap<Vec<String>, HashSet<String>> = HashMap::new();
        for module in modules.values() {
            let names = package_rules.entry(module.package.clone()).or_default();
            for rule in &module.rules {
                names.insert(rule.head.name.clone());
            }
        }

        let mut grouped: BTreeMap<Vec<String>, (Vec<Rule>, Vec<Rule>, String)> = BTreeMap::new();
        for (id, module) in &modules {
            let empty = HashSet::new();
            let rules = package_rules.get(&module.package).unwrap_or(&empty);
            let mut imports = HashMap::new();
            for import in &module.imports {
                if let Some(name) = import.name() {
                    imports.insert(name, import.path.clone());
                }
            }
            let scope = Scope {
                module: id,
                package: &module.package,
                rules,
                imports: &imports,
            };

            for rule in &module.rules {
                let rewritten = rewrite_rule(rule, &scope, &self.builtins, &mut errors);
                let mut path = module.package.clone();
                path.push(rule.head.name.clone());
                let entry = grouped
                    .entry(path)
                    .or_insert_with(|| (Vec::new(), Vec::new(), id.clone()));
                if rule.default {
                    entry.1.push(rewritten);
                } else {
                    entry.0.push(rewritten);
                }
            }
        }

        let mut rules = BTreeMap::new();
        for (path, (definitions, defaults, module_id)) in grouped {
            let dotted = format!("data.{}", path.join("."));
            let mut kind = definitions
                .first()
                .map(|r| r.head.kind)
                .unwrap_or(RuleKind::Complete);
            if definitions.iter().any(|r| r.head.kind != kind) {
                errors.push(CompileError {
                    module: module_id.clone(),
                    message: format!("conflicting rule types for {dotted}"),
                });
            }
            if defaults.len() > 1 {
                errors.push(CompileError {
                    module: module_id.clone(),
                    message: format!("multiple default rules {dotted} found"),
                });
            }
            if !defaults.is_empty() && kind != RuleKind::Complete {
                errors.push(CompileError {
                    module: module_id.clone(),
                    message: format!("default rule {dotted} must be a complete rule"),
                });
                kind = RuleKind::Complete;
            }
            let default = defaults.first().and_then(|r| r.head.value.clone());
            if let Some(value) = &default {
                if !is_ground(value) {
                    errors.push(CompileError {
                        module: module_id.clone(),
                        message: format!("default rule {dotted} value must be a constant"),
                    });
                }
            }
            if let Some(data) = &self.path_conflicts {
                if conflicts_with_data(data, &path) {
                    errors.push(CompileError {
                        module: module_id.clone(),
                        message: format!("conflicting rule {dotted} found in base document"),
                    });
                }
            }
            rules.insert(
                path.clone(),
                Arc::new(RuleSet {
                    path,
                    kind,
                    rules: definitions,
                    default,
                }),
            );
        }

        if !errors.is_empty() {
            if self.error_limit > 0 && errors.len() > self.error_limit {
                errors.truncate(self.error_limit);
                errors.push(CompileError {
                    module: "compiler".to_string(),
                    message: "error limit reached".to_string(),
                });
            }
            return Err(CompileErrors(errors));
        }

        Ok(Arc::new(Compiled {
            modules,
            rules,
            builtins: self.builtins.clone(),
        }))
    }
}

fn conflicts_with_data(data: &Value, path: &[String]) -> bool {
    let mut node = data;
    for seg in path {
        match node {
            Value::Object(map) => match map.get(seg) {
                Some(child) => node = child,
                None => return false,
            },
            _ => return true,
        }
    }
    true
}

fn is_ground(term: &Term) -> bool {
    match term {
        Term::Scalar(_) => true,
        Term::Array(items) | Term::Set(items) => items.iter().all(is_ground),
        Term::Object(pairs) => pairs.iter().all(|(k, v)| is_ground(k) && is_ground(v)),
        _ => false,
    }
}

// ── Name resolution ─────────────────────────────────────────────────

struct Scope<'a> {
    module: &'a str,
    package: &'a [String],
    rules: &'a HashSet<String>,
    imports: &'a HashMap<String, Ref>,
}

impl Scope<'_> {
    fn rule_ref(&self, name: &str, mut path: Vec<Term>) -> Ref {
        let mut full: Vec<Term> = self.package.iter().map(|s| Term::string(s.as_str())).collect();
        full.push(Term::string(name));
        full.append(&mut path);
        Ref {
            head: "data".to_string(),
            path: full,
        }
    }

    fn resolve(&self, name: &str, path: Vec<Term>, locals: &HashSet<String>) -> Option<Ref> {
        if locals.contains(name) || name.starts_with('$') || name == "input" || name == "data" {
            return None;
        }
        if self.rules.contains(name) {
            return Some(self.rule_ref(name, path));
        }
        if let Some(import) = self.imports.get(name) {
            let mut resolved = import.clone();
            resolved.path.extend(path);
            return Some(resolved);
        }
        None
    }
}

fn rewrite_rule(
    rule: &Rule,
    scope: &Scope<'_>,
    builtins: &BuiltinRegistry,
    errors: &mut Vec<CompileError>,
) -> Rule {
    let mut locals = HashSet::new();
    let body = rewrite_body(&rule.body, scope, &mut locals, builtins, errors);
    let mut head = rule.head.clone();
    head.key = head
        .key
        .as_ref()
        .map(|t| rewrite_term(t, scope, &locals, builtins, errors));
    head.value = head
        .value
        .as_ref()
        .map(|t| rewrite_term(t, scope, &locals, builtins, errors));
    Rule {
        default: rule.default,
        head,
        body,
        location: rule.location,
    }
}

fn rewrite_body(
    body: &Body,
    scope: &Scope<'_>,
    locals: &mut HashSet<String>,
    builtins: &BuiltinRegistry,
    errors: &mut Vec<CompileError>,
) -> Body {
    body.iter()
        .map(|lit| Literal {
            negated: lit.negated,
            expr: rewrite_expr(&lit.expr, scope, locals, builtins, errors),
            location: lit.location,
        })
        .collect()
}

fn rewrite_expr(
    expr: &Expr,
    scope: &Scope<'_>,
    locals: &mut HashSet<String>,
    builtins: &BuiltinRegistry,
    errors: &mut Vec<CompileError>,
) -> Expr {
    let rw = |t: &Term, locals: &HashSet<String>, errors: &mut Vec<CompileError>| {
        rewrite_term(t, scope, locals, builtins, errors)
    };
    match expr {
        Expr::SomeDecl(vars) => {
            locals.extend(vars.iter().cloned());
            expr.clone()
        }
        Expr::SomeIn {
            key,
            value,
            collection,
        } => {
            let collection = rw(collection, locals, errors);
            if let Some(k) = key {
                pattern_vars(k, locals);
            }
            pattern_vars(value, locals);
            Expr::SomeIn {
                key: key.clone(),
                value: value.clone(),
                collection,
            }
        }
        Expr::Assign(lhs, rhs) => {
            let rhs = rw(rhs, locals, errors);
            pattern_vars(lhs, locals);
            Expr::Assign(lhs.clone(), rhs)
        }
        Expr::Term(t) => Expr::Term(rw(t, locals, errors)),
        Expr::Unify(a, b) => Expr::Unify(rw(a, locals, errors), rw(b, locals, errors)),
        Expr::Compare(op, a, b) => Expr::Compare(*op, rw(a, locals, errors), rw(b, locals, errors)),
        Expr::Member(a, b) => Expr::Member(rw(a, locals, errors), rw(b, locals, errors)),
    }
}

fn pattern_vars(term: &Term, out: &mut HashSet<String>) {
    match term {
        Term::Var(v) => {
            out.insert(v.clone());
        }
        Term::Array(items) => items.iter().for_each(|t| pattern_vars(t, out)),
        Term::Object(pairs) => pairs.iter().for_each(|(_, v)| pattern_vars(v, out)),
        _ => {}
    }
}

fn rewrite_term(
    term: &Term,
    scope: &Scope<'_>,
    locals: &HashSet<String>,
    builtins: &BuiltinRegistry,
    errors: &mut Vec<CompileError>,
) -> Term {
    let rw = |t: &Term, errors: &mut Vec<CompileError>| rewrite_term(t, scope, locals, builtins, errors);
    match term {
        Term::Scalar(_) => term.clone(),
        Term::Var(name) => match scope.resolve(name, Vec::new(), locals) {
            Some(r) => Term::Ref(r),
            None => term.clone(),
        },
        Term::Ref(r) => {
            let path: Vec<Term> = r.path.iter().map(|t| rw(t, errors)).collect();
            match scope.resolve(&r.head, path.clone(), locals) {
                Some(resolved) => Term::Ref(resolved),
                None => Term::Ref(Ref {
                    head: r.head.clone(),
                    path,
                }),
            }
        }
        Term::Array(items) => Term::Array(items.iter().map(|t| rw(t, errors)).collect()),
        Term::Set(items) => Term::Set(items.iter().map(|t| rw(t, errors)).collect()),
        Term::Object(pairs) => Term::Object(
            pairs
                .iter()
                .map(|(k, v)| (rw(k, errors), rw(v, errors)))
                .collect(),
        ),
        Term::Call(name, args) => {
            check_call(name, args.len(), scope.module, builtins, errors);
            Term::Call(name.clone(), args.iter().map(|t| rw(t, errors)).collect())
        }
        Term::Arith(op, a, b) => Term::Arith(*op, Box::new(rw(a, errors)), Box::new(rw(b, errors))),
        Term::ArrayCompr(head, body) | Term::SetCompr(head, body) => {
            let mut inner = locals.clone();
            let body = rewrite_body(body, scope, &mut inner, builtins, errors);
            let head = Box::new(rewrite_term(head, scope, &inner, builtins, errors));
            if matches!(term, Term::ArrayCompr(..)) {
                Term::ArrayCompr(head, body)
            } else {
                Term::SetCompr(head, body)
            }
        }
    }
}

fn check_call(
    name: &str,
    arity: usize,
    module: &str,
    builtins: &BuiltinRegistry,
    errors: &mut Vec<CompileError>,
) {
    if name == "trace" {
        if arity != 1 {
            errors.push(CompileError {
                module: module.to_string(),
                message: "trace: expects 1 argument".to_string(),
            });
        }
        return;
    }
    let Some(decl) = builtins.decl(name) else {
        errors.push(CompileError {
            module: module.to_string(),
            message: format!("undefined function {name}"),
        });
        return;
    };
    let placeholder = decl.args.is_empty() && decl.result == "any";
    if !placeholder && decl.args.len() != arity {
        errors.push(CompileError {
            module: module.to_string(),
            message: format!(
                "{name}: arity mismatch, expected {} argument(s), got {arity}",
                decl.args.len()
            ),
        });
    }
}

fn collect_calls_term(term: &Term, out: &mut Vec<String>) {
    match term {
        Term::Call(name, args) => {
            out.push(name.clone());
            args.iter().for_each(|a| collect_calls_term(a, out));
        }
        Term::Ref(r) => r.path.iter().for_each(|t| collect_calls_term(t, out)),
        Term::Array(items) | Term::Set(items) => items.iter().for_each(|t| collect_calls_term(t, out)),
        Term::Object(pairs) => pairs.iter().for_each(|(k, v)| {
            collect_calls_term(k, out);
            collect_calls_term(v, out);
        }),
        Term::Arith(_, a, b) => {
            collect_calls_term(a, out);
            collect_calls_term(b, out);
        }
        Term::ArrayCompr(head, body) | Term::SetCompr(head, body) => {
            collect_calls_term(head, out);
            body.iter().for_each(|l| collect_calls_expr(&l.expr, out));
        }
        Term::Scalar(_) | Term::Var(_) => {}
    }
}

fn collect_calls_expr(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Term(t) => collect_calls_term(t, out),
        Expr::Unify(a, b) | Expr::Assign(a, b) | Expr::Compare(_, a, b) | Expr::Member(a, b) => {
            collect_calls_term(a, out);
            collect_calls_term(b, out);
        }
        Expr::SomeIn { collection, .. } => collect_calls_term(collection, out),
        Expr::SomeDecl(_) => {}
    }
}
