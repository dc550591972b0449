//! Model Context Protocol (MCP) implementation.
//!
//! This module carries the JSON-RPC plumbing of the server: the codec, the
//! transport trait and its stdio binding, sessions, the dispatcher and the
//! handler registry it dispatches into.
//!
//! # Architecture
//!
//! - `protocol` - Core MCP types and message definitions
//! - `codec` - JSON-RPC encode/decode, no framing
//! - `transport` - Transport trait and the stdio binding
//! - `session` - Per-connection lifecycle, correlation and cancellation
//! - `dispatcher` - Routes requests and notifications to handlers
//! - `registry` - Method name to handler table
//! - `schema` - Parameter validation
//! - `handler` - Tool handlers behind `tools/list` and `tools/call`
//! - `methods` - Protocol methods (`initialize`, `ping`, `tools/*`)
//! - `server` - Accept loop and graceful shutdown

pub mod codec;
pub mod dispatcher;
pub mod handler;
pub mod methods;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod server;
pub mod session;
pub mod transport;

pub use dispatcher::Dispatcher;
pub use handler::{ToolHandler, ToolRegistry};
pub use methods::register_mcp_methods;
pub use protocol::*;
pub use registry::{handler_fn, HandlerRegistry, MethodHandler};
pub use schema::{AnyInput, InputValidator, Schema};
pub use server::McpServer;
pub use session::{CloseReason, Peer, RequestContext, SessionHandle, SessionId, SessionState};
pub use transport::{StdioTransport, Transport};
