//! Runtime values for the step evaluator.
//!
//! Aggregates use `Rc<RefCell<...>>` so assignment aliases the way Python
//! code expects (`state["work"]["items"].append(x)` mutates in place). Dict
//! keys are strings only, which is what keeps every reachable value one
//! conversion away from JSON state.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::Number;
use serde_json::Value as Json;

use crate::ast::Expr;
use crate::ast::Stmt;

#[derive(Debug, Clone)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Tuple(Rc<Vec<Value>>),
    Dict(Rc<RefCell<BTreeMap<String, Value>>>),
    Range {
        start: i64,
        stop: i64,
        step: i64,
    },
    Builtin(Builtin),
    Function(Rc<Function>),
    /// Method bound to its receiver; dispatched by receiver type + name at
    /// call time.
    BoundMethod {
        recv: Box<Value>,
        name: Rc<str>,
    },
    /// The injected document corpus (`context`).
    Corpus,
    /// One document handle (`context[i]`).
    Doc(usize),
    /// The injected `tool` object.
    Tool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Len,
    Range,
    Enumerate,
    Zip,
    Map,
    Filter,
    Sorted,
    Reversed,
    Min,
    Max,
    Sum,
    Abs,
    Round,
    Str,
    Int,
    Float,
    Bool,
    List,
    Dict,
    Tuple,
    Isinstance,
    Print,
}

impl Builtin {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Builtin::Len => "len",
            Builtin::Range => "range",
            Builtin::Enumerate => "enumerate",
            Builtin::Zip => "zip",
            Builtin::Map => "map",
            Builtin::Filter => "filter",
            Builtin::Sorted => "sorted",
            Builtin::Reversed => "reversed",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Abs => "abs",
            Builtin::Round => "round",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Bool => "bool",
            Builtin::List => "list",
            Builtin::Dict => "dict",
            Builtin::Tuple => "tuple",
            Builtin::Isinstance => "isinstance",
            Builtin::Print => "print",
        }
    }

    pub(crate) fn all() -> &'static [Builtin] {
        &[
            Builtin::Len,
            Builtin::Range,
            Builtin::Enumerate,
            Builtin::Zip,
            Builtin::Map,
            Builtin::Filter,
            Builtin::Sorted,
            Builtin::Reversed,
            Builtin::Min,
            Builtin::Max,
            Builtin::Sum,
            Builtin::Abs,
            Builtin::Round,
            Builtin::Str,
            Builtin::Int,
            Builtin::Float,
            Builtin::Bool,
            Builtin::List,
            Builtin::Dict,
            Builtin::Tuple,
            Builtin::Isinstance,
            Builtin::Print,
        ]
    }
}

/// User-defined function or lambda. Parameter defaults are evaluated at
/// definition time, as in Python.
#[derive(Debug)]
pub(crate) struct Function {
    pub name: Option<String>,
    pub params: Vec<(String, Option<Value>)>,
    pub body: FnBody,
}

#[derive(Debug, Clone)]
pub(crate) enum FnBody {
    Suite(Rc<Vec<Stmt>>),
    Expr(Rc<Expr>),
}

impl Value {
    pub(crate) fn str(text: impl Into<String>) -> Self {
        Value::Str(Rc::from(text.into().into_boxed_str()))
    }

    pub(crate) fn list(items: Vec<Value>) -> Self {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub(crate) fn dict(map: BTreeMap<String, Value>) -> Self {
        Value::Dict(Rc::new(RefCell::new(map)))
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Range { .. } => "range",
            Value::Builtin(_) => "builtin",
            Value::Function(_) => "function",
            Value::BoundMethod { .. } => "method",
            Value::Corpus => "corpus",
            Value::Doc(_) => "doc",
            Value::Tool => "tool",
        }
    }

    pub(crate) fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Tuple(items) => !items.is_empty(),
            Value::Dict(map) => !map.borrow().is_empty(),
            Value::Range { start, stop, step } => range_len(*start, *stop, *step) > 0,
            _ => true,
        }
    }

    /// Numeric view with Python's bool-as-int promotion.
    pub(crate) fn as_int(&self) -> Option<i64> {
        match self {
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub(crate) fn as_float(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

pub(crate) fn range_len(start: i64, stop: i64, step: i64) -> i64 {
    if step > 0 {
        ((stop - start).max(0) + step - 1) / step
    } else if step < 0 {
        ((start - stop).max(0) + (-step) - 1) / (-step)
    } else {
        0
    }
}

/// Structural equality, with numeric cross-type comparison like Python.
pub(crate) fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Tuple(x), Value::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| value_eq(a, b))
        }
        (Value::Dict(x), Value::Dict(y)) => {
            if Rc::ptr_eq(x, y) {
                return true;
            }
            let x = x.borrow();
            let y = y.borrow();
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| value_eq(v, other)))
        }
        (
            Value::Range {
                start: s1,
                stop: e1,
                step: st1,
            },
            Value::Range {
                start: s2,
                stop: e2,
                step: st2,
            },
        ) => s1 == s2 && e1 == e2 && st1 == st2,
        (Value::Doc(x), Value::Doc(y)) => x == y,
        _ => match (a.as_float(), b.as_float()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// Total-order comparison where defined; `None` means the pair is
/// incomparable (surfaced as a TypeError by the evaluator).
pub(crate) fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
        (Value::List(x), Value::List(y)) => {
            let x = x.borrow();
            let y = y.borrow();
            seq_cmp(&x, &y)
        }
        (Value::Tuple(x), Value::Tuple(y)) => seq_cmp(x, y),
        _ => {
            let (x, y) = (a.as_float()?, b.as_float()?);
            x.partial_cmp(&y)
        }
    }
}

fn seq_cmp(x: &[Value], y: &[Value]) -> Option<Ordering> {
    for (a, b) in x.iter().zip(y.iter()) {
        match value_cmp(a, b)? {
            Ordering::Equal => continue,
            other => return Some(other),
        }
    }
    Some(x.len().cmp(&y.len()))
}

/// Python-style repr, used by `print` on containers and by error messages.
pub(crate) fn repr(value: &Value) -> String {
    match value {
        Value::None => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Str(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('\'');
            for c in s.chars() {
                match c {
                    '\\' => out.push_str("\\\\"),
                    '\'' => out.push_str("\\'"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
            out.push('\'');
            out
        }
        Value::List(items) => {
            let items = items.borrow();
            let inner: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(repr).collect();
            if inner.len() == 1 {
                format!("({},)", inner[0])
            } else {
                format!("({})", inner.join(", "))
            }
        }
        Value::Dict(map) => {
            let map = map.borrow();
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", repr(&Value::str(k.clone())), repr(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
        Value::Range { start, stop, step } => {
            if *step == 1 {
                format!("range({start}, {stop})")
            } else {
                format!("range({start}, {stop}, {step})")
            }
        }
        Value::Builtin(b) => format!("<builtin {}>", b.name()),
        Value::Function(f) => match &f.name {
            Some(name) => format!("<function {name}>"),
            None => "<lambda>".to_string(),
        },
        Value::BoundMethod { name, .. } => format!("<method {name}>"),
        Value::Corpus => "<corpus>".to_string(),
        Value::Doc(index) => format!("<doc {index}>"),
        Value::Tool => "<tool>".to_string(),
    }
}

/// `str()` conversion: like repr except strings pass through unquoted.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        other => repr(other),
    }
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    // `{:?}` keeps the shortest round-trippable form and always shows a
    // decimal point for integral values, matching Python closely enough.
    format!("{f:?}")
}

/// Convert a runtime value to JSON. Fails (with the offending type's name)
/// for values outside the JSON model.
pub(crate) fn value_to_json(value: &Value) -> Result<Json, String> {
    match value {
        Value::None => Ok(Json::Null),
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Int(n) => Ok(Json::Number(Number::from(*n))),
        Value::Float(f) => Number::from_f64(*f)
            .map(Json::Number)
            .ok_or_else(|| "non-finite float".to_string()),
        Value::Str(s) => Ok(Json::String(s.to_string())),
        Value::List(items) => items.borrow().iter().map(value_to_json).collect(),
        Value::Tuple(items) => items.iter().map(value_to_json).collect(),
        Value::Dict(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.borrow().iter() {
                out.insert(k.clone(), value_to_json(v)?);
            }
            Ok(Json::Object(out))
        }
        other => Err(other.type_name().to_string()),
    }
}

pub(crate) fn json_to_value(json: &Json) -> Value {
    match json {
        Json::Null => Value::None,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::str(s.clone()),
        Json::Array(items) => Value::list(items.iter().map(json_to_value).collect()),
        Json::Object(map) => {
            let mut out = BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), json_to_value(v));
            }
            Value::dict(out)
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn json_round_trip() {
        let json: Json = serde_json::json!({
            "work": {"items": [1, 2.5, "x", true, null]},
            "notes": "hello",
        });
        let value = json_to_value(&json);
        let back = value_to_json(&value).unwrap();
        assert_eq!(json, back);
    }

    #[test]
    fn non_json_values_are_rejected() {
        assert!(value_to_json(&Value::Tool).is_err());
        assert!(value_to_json(&Value::Float(f64::NAN)).is_err());
        assert!(
            value_to_json(&Value::Range {
                start: 0,
                stop: 3,
                step: 1
            })
            .is_err()
        );
    }

    #[test]
    fn numeric_equality_crosses_types() {
        assert!(value_eq(&Value::Int(1), &Value::Float(1.0)));
        assert!(value_eq(&Value::Bool(true), &Value::Int(1)));
        assert!(!value_eq(&Value::Int(1), &Value::str("1")));
    }

    #[test]
    fn repr_matches_python_shapes() {
        assert_eq!(repr(&Value::str("a'b")), "'a\\'b'");
        assert_eq!(
            repr(&Value::list(vec![Value::Int(1), Value::str("x")])),
            "[1, 'x']"
        );
        assert_eq!(repr(&Value::Tuple(Rc::new(vec![Value::Int(1)]))), "(1,)");
        assert_eq!(stringify(&Value::Float(1.0)), "1.0");
    }

    #[test]
    fn range_lengths() {
        assert_eq!(range_len(0, 5, 1), 5);
        assert_eq!(range_len(5, 0, -1), 5);
        assert_eq!(range_len(0, 5, 2), 3);
        assert_eq!(range_len(5, 5, 1), 0);
    }
}
