//! Sandboxed template evaluation for drover job definitions.
//!
//! Strings in task fields (`env` values, `if` conditions, `each.list`,
//! the job-level `output`) may embed expressions between `{{` and `}}`.
//! Expressions are evaluated against a JSON context of the shape
//! `{ inputs, env, tasks: {name -> {result, state}}, secrets }` built
//! from the owning job. The language is pure: no I/O, no side effects,
//! and only a small whitelist of helper functions.
//!
//! A template that consists of exactly one `{{ expr }}` evaluates to
//! the expression's typed value (so `each.list` can yield a real
//! list); any other template renders to a string with each embedded
//! expression interpolated.
//!
//! # Example
//!
//! ```
//! use serde_json::json;
//!
//! let ctx = json!({"inputs": {"name": "world"}});
//! let out = drover_eval::evaluate_to_string("hello {{ inputs.name }}", &ctx).unwrap();
//! assert_eq!(out, "hello world");
//! ```

mod error;
mod eval;
mod parser;

pub use error::{EvalError, Result};

use serde_json::Value;

/// Returns `true` if `s` contains at least one `{{ ... }}` expression.
pub fn is_template(s: &str) -> bool {
    s.contains("{{")
}

/// Validate template syntax without evaluating anything.
///
/// Used by input validation so a job with a malformed expression is
/// rejected at submission rather than mid-flight.
pub fn validate(template: &str) -> Result<()> {
    for segment in split(template)? {
        if let Segment::Expr(src) = segment {
            parser::parse(src)?;
        }
    }
    Ok(())
}

/// Evaluate a template to a typed JSON value.
///
/// A template that is exactly one expression (modulo surrounding
/// whitespace) returns the expression's value; mixed templates return
/// the interpolated string. A plain string with no `{{` returns
/// itself unchanged.
pub fn evaluate(template: &str, ctx: &Value) -> Result<Value> {
    let segments = split(template)?;

    // Single-expression template: preserve the value's type.
    if let [Segment::Expr(src)] = segments.as_slice() {
        return eval::eval(&parser::parse(src)?, ctx);
    }

    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Text(t) => out.push_str(t),
            Segment::Expr(src) => {
                let value = eval::eval(&parser::parse(src)?, ctx)?;
                out.push_str(&eval::stringify(&value));
            }
        }
    }
    Ok(Value::String(out))
}

/// Evaluate a template and render the result as a string.
pub fn evaluate_to_string(template: &str, ctx: &Value) -> Result<String> {
    Ok(eval::stringify(&evaluate(template, ctx)?))
}

/// Evaluate a template as a boolean condition.
///
/// An empty template is `true` (an absent `if` gate never blocks).
pub fn evaluate_bool(template: &str, ctx: &Value) -> Result<bool> {
    if template.trim().is_empty() {
        return Ok(true);
    }
    eval::truthy(&evaluate(template, ctx)?)
}

/// Evaluate a template that must produce a list (`each.list`).
pub fn evaluate_list(template: &str, ctx: &Value) -> Result<Vec<Value>> {
    match evaluate(template, ctx)? {
        Value::Array(items) => Ok(items),
        other => Err(EvalError::Eval(format!(
            "expected a list, got: {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Template splitting
// ---------------------------------------------------------------------------

enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// Split a template into literal text and `{{ ... }}` expression
/// segments. Pure text yields a single `Text` segment; a lone
/// expression with only surrounding whitespace yields a single `Expr`.
fn split(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;
    let mut offset = 0;

    while let Some(open) = rest.find("{{") {
        let Some(close) = rest[open + 2..].find("}}") else {
            return Err(EvalError::Parse {
                offset: offset + open,
                message: "unterminated `{{`".into(),
            });
        };
        if open > 0 {
            segments.push(Segment::Text(&rest[..open]));
        }
        segments.push(Segment::Expr(rest[open + 2..open + 2 + close].trim()));
        let consumed = open + 2 + close + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }

    // "  {{ x }}  " is still a single-expression template.
    if segments.len() > 1
        && segments.iter().filter(|s| matches!(s, Segment::Expr(_))).count() == 1
        && segments
            .iter()
            .all(|s| !matches!(s, Segment::Text(t) if !t.trim().is_empty()))
    {
        segments.retain(|s| matches!(s, Segment::Expr(_)));
    }

    Ok(segments)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
