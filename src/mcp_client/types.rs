//! Shared types for the MCP loader.
//!
//! JSON-RPC message types, MCP protocol structures, and the server / tool /
//! telemetry records exposed to application callers.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Protocol Constants ─────────────────────────────────────────────────────

/// MCP protocol revision advertised during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC method names used by the loader.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object as sent by servers.
///
/// Every field is optional: servers in the wild send `{"error": {}}` too.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A message read from a server's stdout, classified by shape.
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// Numeric `id` and no `method`: the answer to one of our requests.
    Response {
        id: u64,
        result: Option<serde_json::Value>,
        error: Option<JsonRpcError>,
    },
    /// `method` and no `id`: one-way message from the server.
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
    /// `method` and `id`: the server asking *us* something. Not supported.
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    /// Valid JSON that matches none of the above.
    Unknown(serde_json::Value),
}

// ─── Server Configuration ───────────────────────────────────────────────────

fn default_enabled() -> bool {
    true
}

/// One MCP server entry from the persisted settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Stable identifier, unique across the configuration.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment, layered over the inherited process environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ─── Server State ───────────────────────────────────────────────────────────

/// Lifecycle status of a server.
///
/// `Idle -> Starting -> Running -> Stopped`, or `Starting -> Error`. An
/// explicit stop may also end a server that is still `Starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Idle,
    Starting,
    Running,
    Error,
    Stopped,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerStatus::Idle => "idle",
            ServerStatus::Starting => "starting",
            ServerStatus::Running => "running",
            ServerStatus::Error => "error",
            ServerStatus::Stopped => "stopped",
        }
    }

    /// Whether no further transition is possible in this generation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerStatus::Error | ServerStatus::Stopped)
    }

    /// Whether `self -> next` is an allowed lifecycle transition.
    pub fn can_transition_to(&self, next: ServerStatus) -> bool {
        matches!(
            (self, next),
            (ServerStatus::Idle, ServerStatus::Starting)
                | (ServerStatus::Starting, ServerStatus::Running)
                | (ServerStatus::Starting, ServerStatus::Error)
                | (ServerStatus::Starting, ServerStatus::Stopped)
                | (ServerStatus::Running, ServerStatus::Stopped)
        )
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of one server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerState {
    pub id: String,
    pub status: ServerStatus,
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl ServerState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: ServerStatus::Idle,
            tools: Vec::new(),
            error: None,
            pid: None,
            started_at: None,
        }
    }
}

// ─── Tools ──────────────────────────────────────────────────────────────────

/// A tool advertised by a server in its `tools/list` response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub server_id: String,
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Raw tool entry inside a `tools/list` result.
#[derive(Debug, Clone, Deserialize)]
pub struct ListedTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

impl ListedTool {
    pub fn into_definition(self, server_id: &str) -> ToolDefinition {
        ToolDefinition {
            server_id: server_id.to_string(),
            name: self.name,
            description: self.description.unwrap_or_default(),
            input_schema: self
                .input_schema
                .unwrap_or_else(|| serde_json::json!({})),
        }
    }
}

/// A request to invoke a tool on a specific server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub server_id: String,
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub arguments: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

/// Outcome of `execute_tool_call`. Failures are data, not errors.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolCallResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

// ─── Telemetry ──────────────────────────────────────────────────────────────

/// One recorded tool invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEntry {
    pub server_id: String,
    pub tool_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-server call counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerCallStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Aggregates over the telemetry buffer. Rates are percentages.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryStats {
    pub total_calls: usize,
    pub success_rate: f64,
    pub failure_rate: f64,
    pub average_duration_ms: f64,
    pub by_server: HashMap<String, ServerCallStats>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "tools/list", serde_json::json!({}));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(json.contains("\"params\":{}"));
    }

    #[test]
    fn test_notification_omits_missing_params() {
        let note = JsonRpcNotification::new(methods::INITIALIZED, None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("params"));
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_server_config_defaults() {
        let json = r#"{"id": "fs", "name": "Filesystem", "command": "npx"}"#;
        let cfg: ServerConfig = serde_json::from_str(json).unwrap();
        assert!(cfg.args.is_empty());
        assert!(cfg.env.is_empty());
        assert!(cfg.enabled);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ServerStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        assert_eq!(ServerStatus::Starting.to_string(), "starting");
    }

    #[test]
    fn test_status_transitions() {
        assert!(ServerStatus::Idle.can_transition_to(ServerStatus::Starting));
        assert!(ServerStatus::Starting.can_transition_to(ServerStatus::Running));
        assert!(ServerStatus::Starting.can_transition_to(ServerStatus::Error));
        assert!(ServerStatus::Running.can_transition_to(ServerStatus::Stopped));
        assert!(!ServerStatus::Running.can_transition_to(ServerStatus::Error));
        assert!(!ServerStatus::Running.can_transition_to(ServerStatus::Starting));
        assert!(!ServerStatus::Stopped.can_transition_to(ServerStatus::Starting));
        assert!(ServerStatus::Error.is_terminal());
    }

    #[test]
    fn test_listed_tool_defaults() {
        let json = r#"{"name": "read_file"}"#;
        let tool: ListedTool = serde_json::from_str(json).unwrap();
        let def = tool.into_definition("fs");
        assert_eq!(def.server_id, "fs");
        assert_eq!(def.description, "");
        assert_eq!(def.input_schema, serde_json::json!({}));
    }

    #[test]
    fn test_listed_tool_reads_camel_case_schema() {
        let json = r#"{"name": "t", "inputSchema": {"type": "object"}}"#;
        let tool: ListedTool = serde_json::from_str(json).unwrap();
        assert_eq!(
            tool.input_schema,
            Some(serde_json::json!({"type": "object"}))
        );
    }

    #[test]
    fn test_tool_call_arguments_default_to_empty_object() {
        let json = r#"{"serverId": "fs", "toolName": "list"}"#;
        let call: ToolCall = serde_json::from_str(json).unwrap();
        assert_eq!(call.arguments, serde_json::json!({}));
    }

    #[test]
    fn test_tool_call_result_omits_empty_fields() {
        let json = serde_json::to_string(&ToolCallResult::failed("boom")).unwrap();
        assert_eq!(json, r#"{"success":false,"error":"boom"}"#);
    }
}
