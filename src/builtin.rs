//! Demonstration tools registered by the `mcp-host` binary.

use serde_json::{json, Value};

use crate::mcp::tools::{ToolCallResult, ToolDefinition};

/// Returns every built-in tool in registration order.
#[must_use]
pub fn tools() -> Vec<ToolDefinition> {
    vec![echo(), add()]
}

/// `echo`: returns `value` unchanged.
#[must_use]
pub fn echo() -> ToolDefinition {
    ToolDefinition::new(
        "echo",
        "Returns the given value unchanged",
        json!({
            "type": "object",
            "properties": {
                "value": { "type": "string", "description": "Text to echo back" }
            },
            "required": ["value"]
        }),
        |args| {
            let value = args.get("value").cloned().unwrap_or(Value::Null);
            ToolCallResult::structured(json!({ "value": value }))
        },
    )
    .with_output_schema(json!({
        "type": "object",
        "properties": { "value": { "type": "string" } },
        "required": ["value"]
    }))
}

/// `add`: sums two numbers.
#[must_use]
pub fn add() -> ToolDefinition {
    ToolDefinition::new(
        "add",
        "Adds two numbers",
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "number" },
                "b": { "type": "number" }
            },
            "required": ["a", "b"]
        }),
        |args| {
            let operands = (
                args.get("a").and_then(Value::as_f64),
                args.get("b").and_then(Value::as_f64),
            );
            match operands {
                (Some(a), Some(b)) => ToolCallResult::structured(json!({ "sum": a + b })),
                _ => ToolCallResult::error("Both 'a' and 'b' must be numbers"),
            }
        },
    )
    .with_output_schema(json!({
        "type": "object",
        "properties": { "sum": { "type": "number" } },
        "required": ["sum"]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_returns_value() {
        let result = echo().call(json!({"value": "x"})).unwrap();
        assert_eq!(result.structured_content, Some(json!({"value": "x"})));
        assert!(!result.is_error);
    }

    #[test]
    fn echo_requires_value() {
        assert!(echo().call(json!({})).is_err());
    }

    #[test]
    fn add_sums_operands() {
        let result = add().call(json!({"a": 2, "b": 3.5})).unwrap();
        assert_eq!(result.structured_content, Some(json!({"sum": 5.5})));
    }

    #[test]
    fn add_rejects_strings() {
        assert!(add().call(json!({"a": "2", "b": 3})).is_err());
    }

    #[test]
    fn builtins_in_order() {
        let names: Vec<_> = tools().into_iter().map(|t| t.name).collect();
        assert_eq!(names, ["echo", "add"]);
    }
}
