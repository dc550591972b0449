//! Doxie MCP Server
//!
//! The transport and dispatch core of the Doxie Model Context Protocol
//! server. JSON-RPC 2.0 messages arrive over stdio (one message per line) or
//! streaming HTTP with Server-Sent Events, are correlated per session, and
//! are dispatched to handlers registered by method name.
//!
//! # Architecture
//!
//! 1. **Codec** (`mcp::codec`) - JSON-RPC messages to and from bytes
//! 2. **Transports** (`mcp::transport`, `http`) - stdio lines and HTTP/SSE
//! 3. **Sessions** (`mcp::session`) - lifecycle, correlation, cancellation, drain
//! 4. **Dispatch** (`mcp::dispatcher`, `mcp::registry`) - method routing
//! 5. **Server** (`mcp::server`) - accept loop and graceful shutdown
//!
//! Around the core sit the `tools` layer (`health`, `search_docs`), the
//! `observe` event sinks and layered `config`.

pub mod config;
pub mod error;
pub mod http;
pub mod mcp;
pub mod observe;
pub mod tools;

pub use error::{Error, Result};

/// Server version reported in `initialize` and `/health`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
