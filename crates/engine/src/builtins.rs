//! Builtin function registry.
//!
//! Each runtime owns its own registry; nothing here is process-global.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Builtins that must never run inside ad-hoc queries.
pub const UNSAFE_BUILTINS: &[&str] = &["http.send"];

/// Evaluation context handed to every builtin call.
#[derive(Debug, Clone)]
pub struct BuiltinContext {
    pub decision_id: Option<String>,
    pub now: DateTime<Utc>,
}

impl Default for BuiltinContext {
    fn default() -> Self {
        Self {
            decision_id: None,
            now: Utc::now(),
        }
    }
}

/// Type signature of a builtin, serialized for capability reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltinDecl {
    pub name: String,
    pub args: Vec<String>,
    pub result: String,
}

impl BuiltinDecl {
    pub fn new(name: &str, args: &[&str], result: &str) -> Self {
        Self {
            name: name.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            result: result.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{name}: {message}")]
pub struct BuiltinError {
    pub name: String,
    pub message: String,
}

impl BuiltinError {
    pub fn new(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("builtin '{0}' is already registered")]
    DuplicateName(String),
}

/// `Ok(None)` means the call is undefined for these arguments.
pub type BuiltinFn =
    Arc<dyn Fn(&BuiltinContext, &[Value]) -> Result<Option<Value>, BuiltinError> + Send + Sync>;

#[derive(Clone)]
struct Builtin {
    decl: BuiltinDecl,
    func: BuiltinFn,
    custom: bool,
}

#[derive(Clone)]
pub struct BuiltinRegistry {
    builtins: HashMap<String, Builtin>,
}

impl fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.builtins.keys().collect();
        names.sort();
        f.debug_struct("BuiltinRegistry")
            .field("builtins", &names)
            .finish()
    }
}

impl BuiltinRegistry {
    /// An empty registry. Most callers want [`BuiltinRegistry::with_defaults`].
    pub fn new() -> Self {
        Self {
            builtins: HashMap::new(),
        }
    }

    /// Registry preloaded with the standard function library.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for (decl, func) in standard_library() {
            registry.builtins.insert(
                decl.name.clone(),
                Builtin {
                    decl,
                    func,
                    custom: false,
                },
            );
        }
        registry
    }

    /// Register a custom builtin. Names are unique; the first registration wins.
    pub fn register(&mut self, decl: BuiltinDecl, func: BuiltinFn) -> Result<(), RegistryError> {
        if self.builtins.contains_key(&decl.name) {
            return Err(RegistryError::DuplicateName(decl.name));
        }
        self.builtins.insert(
            decl.name.clone(),
            Builtin {
                decl,
                func,
                custom: true,
            },
        );
        Ok(())
    }

    /// Register a builtin that accepts any arguments and yields null.
    /// Used when compiling bundles that declare functions provided elsewhere.
    pub fn register_placeholder(&mut self, name: &str) -> bool {
        if self.builtins.contains_key(name) {
            return false;
        }
        let decl = BuiltinDecl::new(name, &[], "any");
        let func: BuiltinFn = Arc::new(|_, _| Ok(Some(Value::Null)));
        self.builtins.insert(
            name.to_string(),
            Builtin {
                decl,
                func,
                custom: true,
            },
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<BuiltinFn> {
        self.builtins.get(name).map(|b| b.func.clone())
    }

    pub fn decl(&self, name: &str) -> Option<&BuiltinDecl> {
        self.builtins.get(name).map(|b| &b.decl)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builtins.contains_key(name)
    }

    /// Declarations of custom builtins, sorted by name.
    pub fn custom_declarations(&self) -> Vec<BuiltinDecl> {
        let mut decls: Vec<BuiltinDecl> = self
            .builtins
            .values()
            .filter(|b| b.custom)
            .map(|b| b.decl.clone())
            .collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    pub fn len(&self) -> usize {
        self.builtins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.builtins.is_empty()
    }
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ── Standard library ────────────────────────────────────────────────

fn arg_str<'v>(name: &str, args: &'v [Value], i: usize) -> Result<&'v str, BuiltinError> {
    args.get(i)
        .and_then(Value::as_str)
        .ok_or_else(|| BuiltinError::new(name, format!("operand {} must be string", i + 1)))
}

fn arg_array<'v>(name: &str, args: &'v [Value], i: usize) -> Result<&'v Vec<Value>, BuiltinError> {
    args.get(i)
        .and_then(Value::as_array)
        .ok_or_else(|| BuiltinError::new(name, format!("operand {} must be array", i + 1)))
}

fn numbers(name: &str, items: &[Value]) -> Result<Vec<f64>, BuiltinError> {
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .ok_or_else(|| BuiltinError::new(name, "collection must contain only numbers"))
        })
        .collect()
}

/// Render an f64 result as an integer when it has no fractional part.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn simple<F>(f: F) -> BuiltinFn
where
    F: Fn(&[Value]) -> Result<Option<Value>, BuiltinError> + Send + Sync + 'static,
{
    Arc::new(move |_, args| f(args))
}

fn standard_library() -> Vec<(BuiltinDecl, BuiltinFn)> {
    vec![
        (
            BuiltinDecl::new("count", &["any"], "number"),
            simple(|args| {
                let n = match args.first() {
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    Some(Value::String(s)) => s.chars().count(),
                    _ => return Err(BuiltinError::new("count", "operand must be collection or string")),
                };
                Ok(Some(Value::from(n)))
            }),
        ),
        (
            BuiltinDecl::new("sum", &["array"], "number"),
            simple(|args| {
                let items = numbers("sum", arg_array("sum", args, 0)?)?;
                Ok(Some(number_value(items.iter().sum())))
            }),
        ),
        (
            BuiltinDecl::new("max", &["array"], "any"),
            simple(|args| {
                let items = numbers("max", arg_array("max", args, 0)?)?;
                Ok(items.into_iter().reduce(f64::max).map(number_value))
            }),
        ),
        (
            BuiltinDecl::new("min", &["array"], "any"),
            simple(|args| {
                let items = numbers("min", arg_array("min", args, 0)?)?;
                Ok(items.into_iter().reduce(f64::min).map(number_value))
            }),
        ),
        (
            BuiltinDecl::new("concat", &["string", "array"], "string"),
            simple(|args| {
                let delim = arg_str("concat", args, 0)?;
                let parts: Option<Vec<&str>> =
                    arg_array("concat", args, 1)?.iter().map(Value::as_str).collect();
                let parts =
                    parts.ok_or_else(|| BuiltinError::new("concat", "operand 2 must contain strings"))?;
                Ok(Some(Value::String(parts.join(delim))))
            }),
        ),
        (
            BuiltinDecl::new("startswith", &["string", "string"], "boolean"),
            simple(|args| {
                let (s, p) = (arg_str("startswith", args, 0)?, arg_str("startswith", args, 1)?);
                Ok(Some(Value::Bool(s.starts_with(p))))
            }),
        ),
        (
            BuiltinDecl::new("endswith", &["string", "string"], "boolean"),
            simple(|args| {
                let (s, p) = (arg_str("endswith", args, 0)?, arg_str("endswith", args, 1)?);
                Ok(Some(Value::Bool(s.ends_with(p))))
            }),
        ),
        (
            BuiltinDecl::new("contains", &["string", "string"], "boolean"),
            simple(|args| {
                let (s, p) = (arg_str("contains", args, 0)?, arg_str("contains", args, 1)?);
                Ok(Some(Value::Bool(s.contains(p))))
            }),
        ),
        (
            BuiltinDecl::new("lower", &["string"], "string"),
            simple(|args| Ok(Some(Value::String(arg_str("lower", args, 0)?.to_lowercase())))),
        ),
        (
            BuiltinDecl::new("upper", &["string"], "string"),
            simple(|args| Ok(Some(Value::String(arg_str("upper", args, 0)?.to_uppercase())))),
        ),
        (
            BuiltinDecl::new("trim_space", &["string"], "string"),
            simple(|args| Ok(Some(Value::String(arg_str("trim_space", args, 0)?.trim().to_string())))),
        ),
        (
            BuiltinDecl::new("split", &["string", "string"], "array"),
            simple(|args| {
                let (s, d) = (arg_str("split", args, 0)?, arg_str("split", args, 1)?);
                Ok(Some(Value::Array(
                    s.split(d).map(|p| Value::String(p.to_string())).collect(),
                )))
            }),
        ),
        (
            BuiltinDecl::new("to_number", &["any"], "number"),
            simple(|args| match args.first() {
                Some(Value::Number(n)) => Ok(Some(Value::Number(n.clone()))),
                Some(Value::Bool(b)) => Ok(Some(Value::from(u8::from(*b)))),
                Some(Value::Null) => Ok(Some(Value::from(0))),
                Some(Value::String(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map(|n| Some(number_value(n)))
                    .map_err(|_| BuiltinError::new("to_number", format!("invalid syntax: {s:?}"))),
                _ => Err(BuiltinError::new("to_number", "operand must be scalar")),
            }),
        ),
        type_check("is_string", Value::is_string),
        type_check("is_number", Value::is_number),
        type_check("is_boolean", Value::is_boolean),
        type_check("is_array", Value::is_array),
        type_check("is_object", Value::is_object),
        type_check("is_null", Value::is_null),
        (
            BuiltinDecl::new("object.get", &["object", "any", "any"], "any"),
            simple(|args| {
                let obj = args
                    .first()
                    .and_then(Value::as_object)
                    .ok_or_else(|| BuiltinError::new("object.get", "operand 1 must be object"))?;
                let default = args.get(2).cloned().unwrap_or(Value::Null);
                let found = args
                    .get(1)
                    .and_then(Value::as_str)
                    .and_then(|k| obj.get(k))
                    .cloned();
                Ok(Some(found.unwrap_or(default)))
            }),
        ),
        (
            BuiltinDecl::new("object.keys", &["object"], "array"),
            simple(|args| {
                let obj: &Map<String, Value> = args
                    .first()
                    .and_then(Value::as_object)
                    .ok_or_else(|| BuiltinError::new("object.keys", "operand 1 must be object"))?;
                Ok(Some(Value::Array(
                    obj.keys().map(|k| Value::String(k.clone())).collect(),
                )))
            }),
        ),
        (
            BuiltinDecl::new("array.concat", &["array", "array"], "array"),
            simple(|args| {
                let mut out = arg_array("array.concat", args, 0)?.clone();
                out.extend(arg_array("array.concat", args, 1)?.iter().cloned());
                Ok(Some(Value::Array(out)))
            }),
        ),
        (
            BuiltinDecl::new("json.marshal", &["any"], "string"),
            simple(|args| {
                let v = args.first().cloned().unwrap_or(Value::Null);
                serde_json::to_string(&v)
                    .map(|s| Some(Value::String(s)))
                    .map_err(|e| BuiltinError::new("json.marshal", e.to_string()))
            }),
        ),
        (
            BuiltinDecl::new("json.unmarshal", &["string"], "any"),
            simple(|args| {
                let s = arg_str("json.unmarshal", args, 0)?;
                serde_json::from_str::<Value>(s)
                    .map(Some)
                    .map_err(|e| BuiltinError::new("json.unmarshal", e.to_string()))
            }),
        ),
        (
            BuiltinDecl::new("time.now_ns", &[], "number"),
            Arc::new(|ctx, _| {
                let ns = ctx.now.timestamp_nanos_opt().unwrap_or_default();
                Ok(Some(Value::from(ns)))
            }),
        ),
    ]
}

fn type_check(name: &'static str, check: fn(&Value) -> bool) -> (BuiltinDecl, BuiltinFn) {
    (
        BuiltinDecl::new(name, &["any"], "boolean"),
        simple(move |args| Ok(Some(Value::Bool(args.first().is_some_and(check))))),
    )
}
