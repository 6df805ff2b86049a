//! Arithmetic tool.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::mcp::handler::{get_number_arg, get_string_arg, ToolHandler};
use crate::mcp::protocol::Tool;

/// Basic two-operand arithmetic.
pub struct CalculatorTool;

impl CalculatorTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CalculatorTool {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply `operation` to `a` and `b`, returning the value and its symbol.
fn evaluate(operation: &str, a: f64, b: f64) -> Result<(f64, &'static str)> {
    match operation {
        "add" => Ok((a + b, "+")),
        "subtract" => Ok((a - b, "-")),
        "multiply" => Ok((a * b, "*")),
        "divide" => {
            if b == 0.0 {
                return Err(Error::ToolExecutionFailed("division by zero".to_string()));
            }
            Ok((a / b, "/"))
        }
        other => Err(Error::InvalidToolArguments(format!(
            "unsupported operation: {}",
            other
        ))),
    }
}

#[async_trait]
impl ToolHandler for CalculatorTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "calculator".to_string(),
            description: "Perform basic mathematical calculations".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "operation": {
                        "type": "string",
                        "enum": ["add", "subtract", "multiply", "divide"],
                        "description": "The operation to perform"
                    },
                    "a": { "type": "number", "description": "First operand" },
                    "b": { "type": "number", "description": "Second operand" }
                },
                "required": ["operation", "a", "b"]
            }),
        }
    }

    async fn execute(&self, args: HashMap<String, Value>, _: CancellationToken) -> Result<Value> {
        let operation = get_string_arg(&args, "operation")?;
        let a = get_number_arg(&args, "a")?;
        let b = get_number_arg(&args, "b")?;

        let (result, symbol) = evaluate(&operation, a, b)?;
        Ok(json!({
            "result": result,
            "operation": format!("{:.2} {} {:.2}", a, symbol, b),
        }))
    }
}
