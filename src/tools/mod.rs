//! MCP tool implementations.
//!
//! - `health` - liveness check
//! - `search` - ephemeral in-memory document search (`search_docs`)

pub mod health;
pub mod search;

use crate::mcp::handler::ToolRegistry;

/// Register all tools with the registry.
pub fn register_all_tools(registry: &mut ToolRegistry) {
    registry.register(health::HealthTool::new());
    registry.register(search::SearchDocsTool::new());
}
