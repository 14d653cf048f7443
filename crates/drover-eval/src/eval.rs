//! Expression tree evaluation against a JSON context.
//!
//! Values are [`serde_json::Value`]s throughout. Arithmetic stays in
//! integers while both operands are integers and widens to floats
//! otherwise. `+` concatenates when either operand is a string.

use serde_json::{Number, Value, json};

use crate::error::{EvalError, Result};
use crate::parser::{BinOp, Expr};

/// Evaluate a parsed expression against `ctx`.
///
/// `ctx` is expected to be a JSON object whose keys are the root
/// identifiers visible to the expression (`inputs`, `tasks`, ...).
pub fn eval(expr: &Expr, ctx: &Value) -> Result<Value> {
    match expr {
        Expr::Int(n) => Ok(json!(n)),
        Expr::Float(f) => Ok(json!(f)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),

        Expr::Ident(name) => match ctx.get(name) {
            Some(v) => Ok(v.clone()),
            None => Err(EvalError::UnknownIdentifier { name: name.clone() }),
        },

        // Member access on a missing key yields null rather than an
        // error: task snapshots accumulate as the job advances.
        Expr::Member(base, field) => {
            let base = eval(base, ctx)?;
            Ok(base.get(field).cloned().unwrap_or(Value::Null))
        }

        Expr::Index(base, index) => {
            let base = eval(base, ctx)?;
            let index = eval(index, ctx)?;
            match (&base, &index) {
                (Value::Array(items), _) => {
                    let i = as_int(&index)
                        .ok_or_else(|| EvalError::Eval("list index must be an integer".into()))?;
                    if i < 0 || i as usize >= items.len() {
                        return Err(EvalError::Eval(format!(
                            "index {i} out of bounds (len {})",
                            items.len()
                        )));
                    }
                    Ok(items[i as usize].clone())
                }
                (Value::Object(map), Value::String(key)) => {
                    Ok(map.get(key).cloned().unwrap_or(Value::Null))
                }
                _ => Err(EvalError::Eval(format!(
                    "cannot index {} with {}",
                    type_name(&base),
                    type_name(&index)
                ))),
            }
        }

        Expr::Call(name, args) => {
            let args = args.iter().map(|a| eval(a, ctx)).collect::<Result<Vec<_>>>()?;
            call(name, &args)
        }

        Expr::List(items) => {
            let items = items.iter().map(|i| eval(i, ctx)).collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(items))
        }

        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval(inner, ctx)?)?)),

        Expr::Neg(inner) => {
            let v = eval(inner, ctx)?;
            match &v {
                Value::Number(n) if n.is_i64() => Ok(json!(-n.as_i64().unwrap_or(0))),
                Value::Number(n) => Ok(json!(-n.as_f64().unwrap_or(0.0))),
                _ => Err(EvalError::Eval(format!("cannot negate {}", type_name(&v)))),
            }
        }

        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit the logical operators.
            match op {
                BinOp::And => {
                    return Ok(Value::Bool(
                        truthy(&eval(lhs, ctx)?)? && truthy(&eval(rhs, ctx)?)?,
                    ));
                }
                BinOp::Or => {
                    return Ok(Value::Bool(
                        truthy(&eval(lhs, ctx)?)? || truthy(&eval(rhs, ctx)?)?,
                    ));
                }
                _ => {}
            }
            let lhs = eval(lhs, ctx)?;
            let rhs = eval(rhs, ctx)?;
            binary(*op, &lhs, &rhs)
        }
    }
}

/// Interpret a value as a boolean for `if` conditions and logical
/// operators. Null is false, numbers are compared against zero, and
/// the strings `"true"`/`"false"` (any case) are accepted so that
/// string-typed inputs can gate tasks.
pub fn truthy(v: &Value) -> Result<bool> {
    match v {
        Value::Bool(b) => Ok(*b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" | "" => Ok(false),
            _ => Err(EvalError::Eval(format!("string `{s}` is not a boolean"))),
        },
        other => Err(EvalError::Eval(format!(
            "{} is not a boolean",
            type_name(other)
        ))),
    }
}

/// Render a value into its string form for template interpolation.
/// Strings render bare (no quotes); compound values render as JSON.
pub fn stringify(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

fn as_int(v: &Value) -> Option<i64> {
    v.as_i64()
}

fn as_float(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    use BinOp::*;
    match op {
        Eq => Ok(Value::Bool(loose_eq(lhs, rhs))),
        Ne => Ok(Value::Bool(!loose_eq(lhs, rhs))),
        Lt | Le | Gt | Ge => {
            let ord = compare(lhs, rhs)?;
            let result = match op {
                Lt => ord.is_lt(),
                Le => ord.is_le(),
                Gt => ord.is_gt(),
                _ => ord.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        Add => {
            // String concatenation wins if either side is a string.
            if lhs.is_string() || rhs.is_string() {
                return Ok(Value::String(format!(
                    "{}{}",
                    stringify(lhs),
                    stringify(rhs)
                )));
            }
            arith(op, lhs, rhs)
        }
        Sub | Mul | Div | Rem => arith(op, lhs, rhs),
        And | Or => unreachable!("logical operators short-circuit in eval()"),
    }
}

fn loose_eq(lhs: &Value, rhs: &Value) -> bool {
    // Numbers compare by value regardless of int/float representation.
    if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
        return a == b;
    }
    lhs == rhs
}

fn compare(lhs: &Value, rhs: &Value) -> Result<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) {
        return a
            .partial_cmp(&b)
            .ok_or_else(|| EvalError::Eval("numbers are not comparable".into()));
    }
    if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
        return Ok(a.cmp(b));
    }
    Err(EvalError::Eval(format!(
        "cannot compare {} with {}",
        type_name(lhs),
        type_name(rhs)
    )))
}

fn arith(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value> {
    use BinOp::*;
    if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
        return match op {
            Add => Ok(json!(a + b)),
            Sub => Ok(json!(a - b)),
            Mul => Ok(json!(a * b)),
            Div => {
                if b == 0 {
                    Err(EvalError::Eval("division by zero".into()))
                } else {
                    Ok(json!(a / b))
                }
            }
            Rem => {
                if b == 0 {
                    Err(EvalError::Eval("division by zero".into()))
                } else {
                    Ok(json!(a % b))
                }
            }
            _ => unreachable!(),
        };
    }
    let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs)) else {
        return Err(EvalError::Eval(format!(
            "cannot apply arithmetic to {} and {}",
            type_name(lhs),
            type_name(rhs)
        )));
    };
    let result = match op {
        Add => a + b,
        Sub => a - b,
        Mul => a * b,
        Div => a / b,
        Rem => a % b,
        _ => unreachable!(),
    };
    Number::from_f64(result)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Eval("arithmetic produced a non-finite number".into()))
}

// ---------------------------------------------------------------------------
// Helper functions (the whitelist)
// ---------------------------------------------------------------------------

fn call(name: &str, args: &[Value]) -> Result<Value> {
    match name {
        "len" => {
            let [v] = args else {
                return Err(bad_args(name, "exactly one argument"));
            };
            match v {
                Value::String(s) => Ok(json!(s.chars().count())),
                Value::Array(items) => Ok(json!(items.len())),
                Value::Object(map) => Ok(json!(map.len())),
                other => Err(EvalError::Eval(format!(
                    "len() is not defined for {}",
                    type_name(other)
                ))),
            }
        }
        "range" => {
            let (start, end) = match args {
                [end] => (0, req_int(name, end)?),
                [start, end] => (req_int(name, start)?, req_int(name, end)?),
                _ => return Err(bad_args(name, "one or two integer arguments")),
            };
            Ok(Value::Array((start..end).map(|n| json!(n)).collect()))
        }
        "coalesce" => Ok(args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null)),
        "upper" => Ok(Value::String(req_str(name, args)?.to_uppercase())),
        "lower" => Ok(Value::String(req_str(name, args)?.to_lowercase())),
        "trim" => Ok(Value::String(req_str(name, args)?.trim().to_string())),
        "join" => {
            let [Value::Array(items), Value::String(sep)] = args else {
                return Err(bad_args(name, "a list and a separator string"));
            };
            Ok(Value::String(
                items.iter().map(stringify).collect::<Vec<_>>().join(sep),
            ))
        }
        "split" => {
            let [Value::String(s), Value::String(sep)] = args else {
                return Err(bad_args(name, "a string and a separator string"));
            };
            Ok(Value::Array(
                s.split(sep.as_str()).map(|p| json!(p)).collect(),
            ))
        }
        "contains" => {
            let [haystack, needle] = args else {
                return Err(bad_args(name, "exactly two arguments"));
            };
            match haystack {
                Value::Array(items) => Ok(Value::Bool(items.iter().any(|i| loose_eq(i, needle)))),
                Value::String(s) => match needle {
                    Value::String(n) => Ok(Value::Bool(s.contains(n.as_str()))),
                    other => Err(EvalError::Eval(format!(
                        "contains() needle for a string must be a string, got {}",
                        type_name(other)
                    ))),
                },
                other => Err(EvalError::Eval(format!(
                    "contains() is not defined for {}",
                    type_name(other)
                ))),
            }
        }
        "string" => {
            let [v] = args else {
                return Err(bad_args(name, "exactly one argument"));
            };
            Ok(Value::String(stringify(v)))
        }
        "number" => {
            let [v] = args else {
                return Err(bad_args(name, "exactly one argument"));
            };
            match v {
                Value::Number(_) => Ok(v.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(|f| {
                        if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                            Some(json!(f as i64))
                        } else {
                            Number::from_f64(f).map(Value::Number)
                        }
                    })
                    .ok_or_else(|| EvalError::Eval(format!("`{s}` is not a number"))),
                other => Err(EvalError::Eval(format!(
                    "number() is not defined for {}",
                    type_name(other)
                ))),
            }
        }
        _ => Err(EvalError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

fn bad_args(name: &str, expected: &str) -> EvalError {
    EvalError::Eval(format!("{name}() expects {expected}"))
}

fn req_int(name: &str, v: &Value) -> Result<i64> {
    as_int(v).ok_or_else(|| bad_args(name, "integer arguments"))
}

fn req_str<'a>(name: &str, args: &'a [Value]) -> Result<&'a str> {
    match args {
        [Value::String(s)] => Ok(s),
        _ => Err(bad_args(name, "exactly one string argument")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn ctx() -> Value {
        json!({
            "inputs": {"name": "world", "count": "3"},
            "tasks": {"build": {"result": "ok", "state": "COMPLETED"}},
            "secrets": {"token": "hunter2"},
        })
    }

    fn run(src: &str) -> Value {
        eval(&parse(src).unwrap(), &ctx()).unwrap()
    }

    #[test]
    fn member_lookup() {
        assert_eq!(run("inputs.name"), json!("world"));
        assert_eq!(run("tasks.build.result"), json!("ok"));
        // Snapshots for tasks that have not run yet resolve to null.
        assert_eq!(run("tasks.build.missing"), Value::Null);
    }

    #[test]
    fn unknown_root_is_an_error() {
        let err = eval(&parse("nosuch.thing").unwrap(), &ctx()).unwrap_err();
        assert!(matches!(err, EvalError::UnknownIdentifier { .. }));
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run("1 + 2 * 3"), json!(7));
        assert_eq!(run("(1 + 2) * 3"), json!(9));
        assert_eq!(run("7 % 3"), json!(1));
        assert_eq!(run("1 + 0.5"), json!(1.5));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert!(eval(&parse("1 / 0").unwrap(), &ctx()).is_err());
    }

    #[test]
    fn string_concat() {
        assert_eq!(run("'hello ' + inputs.name"), json!("hello world"));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(run("1 < 2 && 2 <= 2"), json!(true));
        assert_eq!(run("'a' == 'b' || 3 > 2"), json!(true));
        assert_eq!(run("!(1 == 1)"), json!(false));
        assert_eq!(run("tasks.build.state == 'COMPLETED'"), json!(true));
    }

    #[test]
    fn helpers() {
        assert_eq!(run("len('abc')"), json!(3));
        assert_eq!(run("range(3)"), json!([0, 1, 2]));
        assert_eq!(run("range(1, 4)"), json!([1, 2, 3]));
        assert_eq!(run("coalesce(null, 'x')"), json!("x"));
        assert_eq!(run("upper('ab')"), json!("AB"));
        assert_eq!(run("join(['a','b'], '-')"), json!("a-b"));
        assert_eq!(run("split('a,b', ',')"), json!(["a", "b"]));
        assert_eq!(run("contains([1,2,3], 2)"), json!(true));
        assert_eq!(run("number(inputs.count) + 1"), json!(4));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let err = eval(&parse("exec('rm -rf /')").unwrap(), &ctx()).unwrap_err();
        assert!(matches!(err, EvalError::UnknownFunction { .. }));
    }

    #[test]
    fn list_literals_and_indexing() {
        assert_eq!(run("[1, 2, 3][1]"), json!(2));
        assert!(eval(&parse("[1][5]").unwrap(), &ctx()).is_err());
    }

    #[test]
    fn truthiness() {
        assert!(truthy(&json!(true)).unwrap());
        assert!(!truthy(&Value::Null).unwrap());
        assert!(truthy(&json!(1)).unwrap());
        assert!(!truthy(&json!("false")).unwrap());
        assert!(truthy(&json!("TRUE")).unwrap());
        assert!(truthy(&json!("not a bool")).is_err());
    }
}
