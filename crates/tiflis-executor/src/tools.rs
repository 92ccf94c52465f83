//! Tool set offered to the executor.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Tool error.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid input for {tool}: {reason}")]
    InvalidInput { tool: String, reason: String },
    #[error("Tool execution failed: {0}")]
    Failed(String),
}

/// Description of a tool, as presented to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool input.
    pub input_schema: Value,
}

/// A named callable the executor may invoke.
///
/// Implementations validate `input` against their own schema and return
/// the textual result handed back to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Schema and description of this tool.
    fn spec(&self) -> ToolSpec;

    /// Invoke the tool.
    async fn call(&self, input: Value) -> Result<String, ToolError>;
}

/// Supplies the tool set for an agent variant.
pub trait ToolProvider: Send + Sync {
    /// Tools available for the next turn.
    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

/// Provider for agents without tools.
#[derive(Debug, Default, Clone)]
pub struct NoTools;

impl ToolProvider for NoTools {
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        Vec::new()
    }
}

/// Provider backed by a fixed list.
#[derive(Clone, Default)]
pub struct StaticTools(pub Vec<Arc<dyn Tool>>);

impl ToolProvider for StaticTools {
    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: "Echo the `text` field".into(),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            }
        }

        async fn call(&self, input: Value) -> Result<String, ToolError> {
            input["text"]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| ToolError::InvalidInput {
                    tool: "echo".into(),
                    reason: "missing text".into(),
                })
        }
    }

    #[tokio::test]
    async fn test_static_tools() {
        let provider = StaticTools(vec![Arc::new(Echo)]);
        let tools = provider.tools();
        assert_eq!(tools[0].spec().name, "echo");
        assert_eq!(tools[0].call(serde_json::json!({"text": "hi"})).await.unwrap(), "hi");
        assert!(tools[0].call(serde_json::json!({})).await.is_err());
        assert!(NoTools.tools().is_empty());
    }
}
