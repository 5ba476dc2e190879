//! Value semantics shared by the evaluator: equality, ordering, arithmetic.

use std::cmp::Ordering;

use serde_json::Value;

use super::EvalError;
use crate::ast::{ArithOp, CmpOp};
use crate::builtins::number_value;

pub fn truthy(v: &Value) -> bool {
    !matches!(v, Value::Bool(false))
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < booleans < numbers < strings <
/// arrays < objects.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(i), Some(j)) => i.cmp(&j),
                _ => {
                    let (fx, fy) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
                    fx.partial_cmp(&fy).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (i, j) in x.iter().zip(y.iter()) {
                let ord = cmp_values(i, j);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = ka.cmp(kb).then_with(|| cmp_values(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    cmp_values(a, b) == Ordering::Equal
}

pub fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    let same_type = type_rank(a) == type_rank(b);
    let ord = cmp_values(a, b);
    match op {
        CmpOp::Eq => ord == Ordering::Equal,
        CmpOp::Neq => ord != Ordering::Equal,
        CmpOp::Lt => same_type && ord == Ordering::Less,
        CmpOp::Lte => same_type && ord != Ordering::Greater,
        CmpOp::Gt => same_type && ord == Ordering::Greater,
        CmpOp::Gte => same_type && ord != Ordering::Less,
    }
}

/// Sort and deduplicate, producing the canonical form of a set.
pub fn canonical_set(mut items: Vec<Value>) -> Vec<Value> {
    items.sort_by(cmp_values);
    items.dedup_by(|a, b| values_equal(a, b));
    items
}

pub fn arith(op: ArithOp, a: &Value, b: &Value) -> Result<Value, EvalError> {
    let (Value::Number(x), Value::Number(y)) = (a, b) else {
        return Err(EvalError::Type(format!(
            "operator {op} expects numbers, got {a} and {b}"
        )));
    };
    if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
        let exact = match op {
            ArithOp::Add => i.checked_add(j),
            ArithOp::Sub => i.checked_sub(j),
            ArithOp::Mul => i.checked_mul(j),
            ArithOp::Rem if j == 0 => return Err(EvalError::DivideByZero),
            ArithOp::Rem => i.checked_rem(j),
            ArithOp::Div if j == 0 => return Err(EvalError::DivideByZero),
            ArithOp::Div if i.checked_rem(j) == Some(0) => i.checked_div(j),
            ArithOp::Div => None,
        };
        if let Some(n) = exact {
            return Ok(Value::from(n));
        }
    }
    let (fx, fy) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
    let n = match op {
        ArithOp::Add => fx + fy,
        ArithOp::Sub => fx - fy,
        ArithOp::Mul => fx * fy,
        ArithOp::Div | ArithOp::Rem if fy == 0.0 => return Err(EvalError::DivideByZero),
        ArithOp::Div => fx / fy,
        ArithOp::Rem => fx % fy,
    };
    Ok(number_value(n))
}

/// Index into an object by string key or into an array by integer position.
pub fn lookup<'v>(container: &'v Value, key: &Value) -> Option<&'v Value> {
    match (container, key) {
        (Value::Object(map), Value::String(k)) => map.get(k),
        (Value::Array(items), Value::Number(n)) => {
            let idx = n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))?;
            items.get(usize::try_from(idx).ok()?)
        }
        _ => None,
    }
}

/// Convert a value into an object key.
pub fn object_key(v: &Value) -> Result<String, EvalError> {
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Number(_) | Value::Bool(_) | Value::Null => Ok(v.to_string()),
        other => Err(EvalError::Type(format!("object key must be scalar, got {other}"))),
    }
}

pub fn data_at<'v>(data: &'v Value, path: &[String]) -> Option<&'v Value> {
    let mut node = data;
    for seg in path {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numbers_compare_across_representations() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(compare(CmpOp::Lt, &json!(1), &json!(1.5)));
        assert!(!compare(CmpOp::Lt, &json!(1), &json!("2")));
    }

    #[test]
    fn sets_are_sorted_and_unique() {
        let set = canonical_set(vec![json!("b"), json!(1), json!("a"), json!(1)]);
        assert_eq!(set, vec![json!(1), json!("a"), json!("b")]);
    }

    #[test]
    fn arithmetic_keeps_integers_exact() {
        assert_eq!(arith(ArithOp::Add, &json!(2), &json!(3)).unwrap(), json!(5));
        assert_eq!(arith(ArithOp::Div, &json!(7), &json!(2)).unwrap(), json!(3.5));
        assert_eq!(
            arith(ArithOp::Div, &json!(1), &json!(0)).unwrap_err(),
            EvalError::DivideByZero
        );
        assert!(arith(ArithOp::Add, &json!("a"), &json!(1)).is_err());
    }

    #[test]
    fn lookup_by_key_and_index() {
        let doc = json!({"a": [10, 20]});
        let arr = lookup(&doc, &json!("a")).unwrap();
        assert_eq!(lookup(arr, &json!(1)), Some(&json!(20)));
        assert_eq!(lookup(arr, &json!(5)), None);
        assert_eq!(data_at(&doc, &["a".to_string()]), Some(&json!([10, 20])));
    }
}
