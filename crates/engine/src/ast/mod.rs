//! Policy language front end.
//!
//! The language is a compact Rego-style subset: a module declares a package,
//! optional imports and a list of rules. Rule bodies are conjunctions of
//! literals; variables are bound by unification and iteration.

pub mod lexer;
mod parser;

use std::fmt;

use serde::Serialize;
use serde_json::Value;

pub use parser::{parse_module, parse_query, parse_ref};

// ── Locations and errors ────────────────────────────────────────────

/// Position of a syntax node in its source text (1-based).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl Location {
    pub fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{file}:{line}:{col}: {message}")]
pub struct ParseError {
    pub file: String,
    pub line: usize,
    pub col: usize,
    pub message: String,
}

// ── Module structure ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Package path segments, without the leading `data`.
    pub package: Vec<String>,
    pub imports: Vec<Import>,
    pub rules: Vec<Rule>,
}

impl Module {
    /// The package as a data reference, e.g. `data.authz.users`.
    pub fn package_ref(&self) -> String {
        let mut out = String::from("data");
        for seg in &self.package {
            out.push('.');
            out.push_str(seg);
        }
        out
    }

    /// Distinct rule names in declaration order.
    pub fn rule_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for rule in &self.rules {
            if !names.contains(&rule.head.name) {
                names.push(rule.head.name.clone());
            }
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub path: Ref,
    pub alias: Option<String>,
}

impl Import {
    /// Name the import is visible under inside the module.
    pub fn name(&self) -> Option<String> {
        if let Some(alias) = &self.alias {
            return Some(alias.clone());
        }
        match self.path.path.last() {
            Some(Term::Scalar(Value::String(s))) => Some(s.clone()),
            Some(_) => None,
            None => Some(self.path.head.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RuleKind {
    Complete,
    PartialSet,
    PartialObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleHead {
    pub name: String,
    pub kind: RuleKind,
    /// Element of a partial set, or key of a partial object.
    pub key: Option<Term>,
    /// Value of a complete rule or a partial object entry. `None` means `true`.
    pub value: Option<Term>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub default: bool,
    pub head: RuleHead,
    pub body: Body,
    pub location: Location,
}

pub type Body = Vec<Literal>;

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub negated: bool,
    pub expr: Expr,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Term(Term),
    /// `a = b`
    Unify(Term, Term),
    /// `a := b`
    Assign(Term, Term),
    Compare(CmpOp, Term, Term),
    /// `x in coll`
    Member(Term, Term),
    /// `some x, y`
    SomeDecl(Vec<String>),
    /// `some v in coll` / `some k, v in coll`
    SomeIn {
        key: Option<Term>,
        value: Term,
        collection: Term,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ref {
    pub head: String,
    pub path: Vec<Term>,
}

impl Ref {
    pub fn new(head: impl Into<String>) -> Self {
        Self {
            head: head.into(),
            path: Vec::new(),
        }
    }

    /// Static string segments of the path, or `None` when any segment is not
    /// a string constant.
    pub fn static_path(&self) -> Option<Vec<String>> {
        self.path
            .iter()
            .map(|t| match t {
                Term::Scalar(Value::String(s)) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Scalar(Value),
    Var(String),
    Ref(Ref),
    Array(Vec<Term>),
    Object(Vec<(Term, Term)>),
    Set(Vec<Term>),
    Call(String, Vec<Term>),
    Arith(ArithOp, Box<Term>, Box<Term>),
    ArrayCompr(Box<Term>, Body),
    SetCompr(Box<Term>, Body),
}

impl Term {
    pub fn string(s: impl Into<String>) -> Self {
        Term::Scalar(Value::String(s.into()))
    }
}

// ── Display (used in traces and error messages) ─────────────────────

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn join<T: fmt::Display>(items: &[T], sep: &str) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}

fn body_text(body: &Body) -> String {
    join(body, "; ")
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Neq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Lte => "<=",
            CmpOp::Gt => ">",
            CmpOp::Gte => ">=",
        };
        f.write_str(s)
    }
}

impl fmt::Display for ArithOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.head)?;
        for seg in &self.path {
            match seg {
                Term::Scalar(Value::String(s)) if is_ident(s) => write!(f, ".{s}")?,
                other => write!(f, "[{other}]")?,
            }
        }
        Ok(())
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Scalar(v) => write!(f, "{v}"),
            Term::Var(name) if name.starts_with("$_") => f.write_str("_"),
            Term::Var(name) => f.write_str(name),
            Term::Ref(r) => write!(f, "{r}"),
            Term::Array(items) => write!(f, "[{}]", join(items, ", ")),
            Term::Set(items) if items.is_empty() => f.write_str("set()"),
            Term::Set(items) => write!(f, "{{{}}}", join(items, ", ")),
            Term::Object(pairs) => {
                let inner = pairs
                    .iter()
                    .map(|(k, v)| format!("{k}: {v}"))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{{{inner}}}")
            }
            Term::Call(name, args) => write!(f, "{name}({})", join(args, ", ")),
            Term::Arith(op, a, b) => write!(f, "{a} {op} {b}"),
            Term::ArrayCompr(head, body) => write!(f, "[{head} | {}]", body_text(body)),
            Term::SetCompr(head, body) => write!(f, "{{{head} | {}}}", body_text(body)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Term(t) => write!(f, "{t}"),
            Expr::Unify(a, b) => write!(f, "{a} = {b}"),
            Expr::Assign(a, b) => write!(f, "{a} := {b}"),
            Expr::Compare(op, a, b) => write!(f, "{a} {op} {b}"),
            Expr::Member(a, b) => write!(f, "{a} in {b}"),
            Expr::SomeDecl(vars) => write!(f, "some {}", vars.join(", ")),
            Expr::SomeIn {
                key,
                value,
                collection,
            } => match key {
                Some(k) => write!(f, "some {k}, {value} in {collection}"),
                None => write!(f, "some {value} in {collection}"),
            },
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            f.write_str("not ")?;
        }
        write!(f, "{}", self.expr)
    }
}

impl fmt::Display for RuleHead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match self.kind {
            RuleKind::PartialSet => {
                if let Some(k) = &self.key {
                    write!(f, "[{k}]")?;
                }
            }
            RuleKind::PartialObject => {
                if let Some(k) = &self.key {
                    write!(f, "[{k}]")?;
                }
                if let Some(v) = &self.value {
                    write!(f, " = {v}")?;
                }
            }
            RuleKind::Complete => {
                if let Some(v) = &self.value {
                    write!(f, " = {v}")?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.default {
            f.write_str("default ")?;
        }
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            write!(f, " {{ {} }}", body_text(&self.body))?;
        }
        Ok(())
    }
}
