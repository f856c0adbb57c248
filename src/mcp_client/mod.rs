//! MCP Client: JSON-RPC over stdio for MCP server processes.
//!
//! This module handles:
//! - Spawning MCP server child processes and watching them exit
//! - Line-delimited JSON-RPC 2.0 over process stdio
//! - Correlating responses to in-flight requests by id
//! - Server state and tool aggregation across all servers
//! - Tool call validation, dispatch and telemetry
//!
//! `McpLoader` is the entry point; the other modules are its building blocks.

pub mod client;
pub mod config;
pub mod correlator;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::{initialize_mcp, shutdown_mcp, McpLoader};
pub use config::LoaderOptions;
pub use errors::McpError;
pub use registry::ServerRegistry;
pub use telemetry::TelemetryBuffer;
pub use types::{
    ServerConfig, ServerState, ServerStatus, TelemetryEntry, TelemetryStats, ToolCall,
    ToolCallResult, ToolDefinition,
};
