//! Simplification of raw query objects before they are parsed.
//!
//! Saved queries and tree-node constraints coming back from the backend are
//! often wrapped in envelopes that carry no meaning: single-argument
//! combinations and `{constraint: X}` wrappers. They are removed here so the
//! parser only sees meaningful nodes.

use serde_json::Value;

/// Simplifies a raw query object.
///
/// - `{args: [x]}` collapses to `optimize(x)`.
/// - `{args: [x, y, ...]}` keeps its other fields with every argument optimized.
/// - `{constraint: x}` unwraps to `optimize(x)` when the envelope has no
///   `type`, or is a `patient` subselection. Subselections over any other
///   dimension are kept so the parser can reject them.
///
/// The function is idempotent: `optimize(optimize(x)) == optimize(x)`.
///
/// # Example
///
/// ```rust
/// use gb_constraint::optimize_constraint_object;
/// use serde_json::json;
///
/// let raw = json!({"constraint": {"type": "and", "args": [{"type": "true"}]}});
/// assert_eq!(optimize_constraint_object(&raw), json!({"type": "true"}));
/// ```
pub fn optimize_constraint_object(object: &Value) -> Value {
    if let Some(args) = object.get("args").and_then(Value::as_array) {
        return match args.len() {
            0 => object.clone(),
            1 => optimize_constraint_object(&args[0]),
            _ => {
                let mut optimized = object.clone();
                optimized["args"] = Value::Array(args.iter().map(optimize_constraint_object).collect());
                optimized
            }
        };
    }

    match object.get("constraint") {
        Some(inner) if is_transparent_envelope(object) && !inner.is_null() => {
            optimize_constraint_object(inner)
        }
        _ => object.clone(),
    }
}

fn is_transparent_envelope(object: &Value) -> bool {
    match object.get("type").and_then(Value::as_str) {
        None => true,
        Some("subselection") => object.get("dimension").and_then(Value::as_str) == Some("patient"),
        Some(_) => false,
    }
}
