//! Liveness tool.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;
use crate::mcp::handler::{success_result, ToolHandler};
use crate::mcp::protocol::{Tool, ToolResult};

/// Health check tool. Always answers `ok` while the session is serving.
pub struct HealthTool;

impl HealthTool {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HealthTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolHandler for HealthTool {
    fn definition(&self) -> Tool {
        Tool {
            name: "health".to_string(),
            description: "Check that the Doxie MCP server is up. Returns \"ok\".".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
        }
    }

    async fn execute(&self, _args: HashMap<String, Value>) -> Result<ToolResult> {
        Ok(success_result("ok"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::ContentBlock;

    #[tokio::test]
    async fn test_health_returns_ok() {
        let result = HealthTool::new().execute(HashMap::new()).await.unwrap();
        assert!(!result.is_error);
        let ContentBlock::Text { text } = &result.content[0];
        assert_eq!(text, "ok");
    }
}
