//! MCP loader error types.

use thiserror::Error;

/// Errors that can occur during MCP loader operations.
///
/// Most of these never leave the loader: they are folded into
/// `ServerState::error` or a failed `ToolCallResult`. The `Display` text is
/// what ends up in those fields, so keep it readable.
#[derive(Debug, Error)]
pub enum McpError {
    /// The configured command could not be resolved on `PATH`.
    #[error("Command \"{command}\" not found in PATH. Please install it or check the configuration.")]
    CommandNotFound {
        command: String,
    },

    /// A server process failed to start.
    #[error("Failed to start: {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("{message}")]
    ServerError {
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No server with this id has been loaded.
    #[error("Server {id} not found")]
    ServerNotFound {
        id: String,
    },

    /// The server exists but is not accepting calls.
    #[error("Server {id} is not running (status: {status})")]
    ServerNotRunning {
        id: String,
        status: String,
    },

    /// Tool not advertised by the target server.
    #[error("unknown tool '{tool}' on server {server}")]
    UnknownTool {
        server: String,
        tool: String,
    },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// A request got no response before its deadline.
    #[error("request '{method}' to server {server} timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server process went away while a request was in flight.
    #[error("server {server} exited: {reason}")]
    ServerExited {
        server: String,
        reason: String,
    },

    /// Configuration error (bad options file, unknown server id).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },

    /// The persisted settings store could not be read or written.
    #[error("settings error: {reason}")]
    SettingsError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the connection itself is gone, as opposed
    /// to a single request failing.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            McpError::ServerExited { .. } | McpError::TransportError { .. }
        )
    }
}
