//! MCP provider sessions: JSON-RPC protocol types, the per-provider
//! client, the aggregated tool registry, and the connection manager.

pub mod client;
pub mod manager;
pub mod protocol;
pub mod registry;

pub use client::{McpClient, ServerInfo};
pub use manager::McpManager;
pub use registry::{McpTool, ToolRegistry};
