//! Protocol-level MCP methods backed by a [`ToolRegistry`].

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mcp::handler::ToolRegistry;
use crate::mcp::protocol::{
    methods, CallToolParams, InitializeParams, InitializeResult, ListToolsResult,
    LoggingCapability, ServerCapabilities, ServerInfo, ToolsCapability, MCP_VERSION,
};
use crate::mcp::registry::{handler_fn, HandlerRegistry};
use crate::mcp::schema::{AnyInput, InputValidator, Schema};

fn parse<T: serde::de::DeserializeOwned + Default>(params: Value) -> Result<T> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params).map_err(|e| Error::InvalidParams(e.to_string()))
}

/// Register `initialize`, `ping`, `tools/list`, `tools/call` and
/// `notifications/initialized`.
pub fn register_mcp_methods(
    registry: &mut HandlerRegistry,
    tools: Arc<ToolRegistry>,
    server_info: ServerInfo,
) -> Result<()> {
    registry.register(
        methods::INITIALIZE,
        Arc::new(Schema::new(json!({"type": "object"}))),
        handler_fn(move |params, ctx| {
            let server_info = server_info.clone();
            async move {
                let params: InitializeParams = parse(params)?;
                info!(
                    "Client {} {} initializing (protocol {})",
                    params.client_info.name,
                    params.client_info.version,
                    params.protocol_version.as_deref().unwrap_or("unspecified")
                );
                ctx.peer.set_client_info(params.client_info);

                let result = InitializeResult {
                    protocol_version: MCP_VERSION.to_string(),
                    capabilities: ServerCapabilities {
                        tools: Some(ToolsCapability { list_changed: false }),
                        logging: Some(LoggingCapability {}),
                    },
                    server_info,
                };
                Ok::<_, Error>(serde_json::to_value(result)?)
            }
        }),
    )?;

    registry.register(
        methods::PING,
        Arc::new(AnyInput),
        handler_fn(|_params, _ctx| async { Ok::<_, Error>(json!({})) }),
    )?;

    let list_tools = tools.clone();
    registry.register(
        methods::TOOLS_LIST,
        Arc::new(AnyInput),
        handler_fn(move |_params, _ctx| {
            let tools = list_tools.list_tools();
            async move { Ok::<_, Error>(serde_json::to_value(ListToolsResult { tools })?) }
        }),
    )?;

    let call_schema = Schema::new(json!({
        "type": "object",
        "properties": {
            "name": { "type": "string" },
            "arguments": { "type": "object" }
        },
        "required": ["name"]
    }));
    registry.register(
        methods::TOOLS_CALL,
        Arc::new(call_schema),
        handler_fn(move |params, _ctx| {
            let tools = tools.clone();
            async move {
                let params: CallToolParams = serde_json::from_value(params)
                    .map_err(|e| Error::InvalidParams(e.to_string()))?;
                let tool = tools
                    .get_tool(&params.name)
                    .ok_or_else(|| Error::InvalidParams(format!("Unknown tool: {}", params.name)))?;

                let arguments = Value::Object(params.arguments.clone().into_iter().collect());
                Schema::new(tool.definition().input_schema)
                    .validate(&arguments)
                    .map_err(|reason| Error::InvalidParams(reason.replacen("params", "arguments", 1)))?;

                debug!("Calling tool: {}", params.name);
                let result = tool.execute(params.arguments).await?;
                Ok::<_, Error>(serde_json::to_value(result)?)
            }
        }),
    )?;

    registry.register(
        methods::INITIALIZED,
        Arc::new(AnyInput),
        handler_fn(|_params, ctx| async move {
            info!("Client initialized (session {})", ctx.session_id);
            ctx.peer.mark_initialized();
            Ok::<_, Error>(Value::Null)
        }),
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::handler::{success_result, ToolHandler};
    use crate::mcp::protocol::{Tool, ToolResult};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct Shout;

    #[async_trait]
    impl ToolHandler for Shout {
        fn definition(&self) -> Tool {
            Tool {
                name: "shout".to_string(),
                description: "Upper-cases text".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"]
                }),
            }
        }

        async fn execute(&self, args: HashMap<String, Value>) -> Result<ToolResult> {
            let text = crate::mcp::handler::get_string_arg(&args, "text")?;
            Ok(success_result(text.to_uppercase()))
        }
    }

    fn registry() -> HandlerRegistry {
        let mut tools = ToolRegistry::new();
        tools.register(Shout);
        let mut registry = HandlerRegistry::new();
        register_mcp_methods(
            &mut registry,
            Arc::new(tools),
            ServerInfo {
                name: "doxie".to_string(),
                version: "test".to_string(),
            },
        )
        .unwrap();
        registry
    }

    #[test]
    fn test_registers_protocol_methods() {
        let registry = registry();
        assert_eq!(
            registry.methods(),
            vec![
                methods::INITIALIZE,
                methods::INITIALIZED,
                methods::PING,
                methods::TOOLS_CALL,
                methods::TOOLS_LIST
            ]
        );
    }

    #[test]
    fn test_registering_twice_fails() {
        let mut registry = registry();
        let err = register_mcp_methods(
            &mut registry,
            Arc::new(ToolRegistry::new()),
            ServerInfo {
                name: "doxie".to_string(),
                version: "test".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::DuplicateMethod(_)));
    }

    fn context() -> crate::mcp::session::RequestContext {
        use crate::mcp::dispatcher::Dispatcher;
        use crate::mcp::protocol::RequestId;
        use crate::mcp::session::{Session, SessionId, SessionOptions};
        use crate::mcp::transport::Connection;
        use crate::observe::MemorySink;

        let sink = Arc::new(MemorySink::new());
        let (connection, _inbound, _queue) = Connection::pair(SessionId::from("methods"), 4);
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(HandlerRegistry::new()), sink.clone()));
        let (_session, handle) =
            Session::new(connection, dispatcher, SessionOptions::default(), sink);
        handle.context_for(Some(RequestId::Number(1)))
    }

    #[tokio::test]
    async fn test_initialize_records_client() {
        let registry = registry();
        let ctx = context();
        let handler = &registry.get(methods::INITIALIZE).unwrap().handler;

        let result = handler
            .call(
                json!({
                    "protocolVersion": "2024-11-05",
                    "clientInfo": {"name": "inspector", "version": "0.9"}
                }),
                ctx.clone(),
            )
            .await
            .unwrap();

        assert_eq!(result["protocolVersion"], MCP_VERSION);
        assert_eq!(result["serverInfo"]["name"], "doxie");
        assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(ctx.peer.client_info().unwrap().name, "inspector");

        assert!(!ctx.peer.is_initialized());
        let initialized = &registry.get(methods::INITIALIZED).unwrap().handler;
        initialized.call(Value::Null, ctx.clone()).await.unwrap();
        assert!(ctx.peer.is_initialized());
    }

    #[tokio::test]
    async fn test_tools_call_unknown_tool_and_bad_arguments() {
        let registry = registry();
        let handler = &registry.get(methods::TOOLS_CALL).unwrap().handler;

        let unknown = handler
            .call(json!({"name": "whisper"}), context())
            .await
            .unwrap_err();
        assert!(matches!(unknown, Error::InvalidParams(_)));

        let bad = handler
            .call(json!({"name": "shout", "arguments": {"text": 3}}), context())
            .await
            .unwrap_err();
        match bad {
            Error::InvalidParams(reason) => assert!(reason.starts_with("arguments")),
            other => panic!("unexpected error: {:?}", other),
        }

        let ok = handler
            .call(json!({"name": "shout", "arguments": {"text": "hi"}}), context())
            .await
            .unwrap();
        assert_eq!(ok["content"][0]["text"], "HI");
        assert_eq!(ok["isError"], false);
    }

    #[test]
    fn test_tools_call_params_shape() {
        let registry = registry();
        let validator = &registry.get(methods::TOOLS_CALL).unwrap().validator;
        assert!(validator.validate(&json!({"name": "shout"})).is_ok());
        assert!(validator.validate(&json!({"arguments": {}})).is_err());
    }
}
