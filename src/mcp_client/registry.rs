//! Server registry: per-server lifecycle state, tools, and live connection.
//!
//! Provides:
//! - One entry per server id holding its `ServerState`, load generation and
//!   transport, so all per-server bookkeeping is created and dropped together
//! - Generation-guarded transitions, so a stale process or a superseded load
//!   task can never overwrite a newer generation
//! - Tool lookup and argument validation against advertised input schemas

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{ServerState, ServerStatus, ToolDefinition};

// ─── ServerEntry ─────────────────────────────────────────────────────────────

/// Bookkeeping for one server id.
pub struct ServerEntry {
    pub state: ServerState,
    /// Which spawn this entry belongs to; bumped on every (re)load.
    pub generation: u64,
    /// Present while a process is registered in the active-process table.
    pub transport: Option<Arc<StdioTransport>>,
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Registry of every server the loader has tried to load, in load order.
#[derive(Default)]
pub struct ServerRegistry {
    entries: HashMap<String, ServerEntry>,
    order: Vec<String>,
    next_generation: u64,
}

impl ServerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation for `id` in `Starting`.
    ///
    /// Any previous entry is replaced; its transport (if still registered) is
    /// returned so the caller can close it.
    pub fn begin_load(&mut self, id: &str) -> (u64, Option<Arc<StdioTransport>>) {
        self.next_generation += 1;
        let generation = self.next_generation;

        let mut state = ServerState::new(id);
        state.status = ServerStatus::Starting;

        let previous = self.entries.insert(
            id.to_string(),
            ServerEntry {
                state,
                generation,
                transport: None,
            },
        );
        if previous.is_none() {
            self.order.push(id.to_string());
        }

        (generation, previous.and_then(|e| e.transport))
    }

    fn current_mut(&mut self, id: &str, generation: u64) -> Option<&mut ServerEntry> {
        self.entries
            .get_mut(id)
            .filter(|entry| entry.generation == generation)
    }

    /// Register a spawned process for a generation that is still starting.
    ///
    /// Returns `false` if the generation was superseded or stopped meanwhile;
    /// the caller then owns the transport and must close it.
    pub fn attach(
        &mut self,
        id: &str,
        generation: u64,
        transport: Arc<StdioTransport>,
        pid: Option<u32>,
        started_at: DateTime<Utc>,
    ) -> bool {
        match self.current_mut(id, generation) {
            Some(entry) if entry.state.status == ServerStatus::Starting => {
                entry.transport = Some(transport);
                entry.state.pid = pid;
                entry.state.started_at = Some(started_at);
                true
            }
            _ => false,
        }
    }

    /// `Starting -> Running` with the discovered tools.
    pub fn mark_running(&mut self, id: &str, generation: u64, tools: Vec<ToolDefinition>) -> bool {
        match self.current_mut(id, generation) {
            Some(entry) if entry.state.status == ServerStatus::Starting => {
                set_status(&mut entry.state, ServerStatus::Running);
                entry.state.tools = tools;
                true
            }
            _ => false,
        }
    }

    /// `Starting -> Error`. Unregisters the transport and hands it back.
    pub fn mark_failed(
        &mut self,
        id: &str,
        generation: u64,
        message: &str,
    ) -> Option<Arc<StdioTransport>> {
        let entry = self.current_mut(id, generation)?;
        if entry.state.status != ServerStatus::Starting {
            return None;
        }
        set_status(&mut entry.state, ServerStatus::Error);
        entry.state.error = Some(message.to_string());
        entry.state.tools.clear();
        entry.transport.take()
    }

    /// The process of `generation` exited on its own.
    ///
    /// Unregisters the transport (at most once per generation) and moves a
    /// running server to `Stopped`. A server still starting is left for its
    /// load task, which sees the rejected handshake and records the error.
    pub fn handle_exit(&mut self, id: &str, generation: u64) -> Option<Arc<StdioTransport>> {
        let entry = self.current_mut(id, generation)?;
        if entry.state.status == ServerStatus::Running {
            set_status(&mut entry.state, ServerStatus::Stopped);
            entry.state.tools.clear();
        }
        entry.transport.take()
    }

    /// Explicit stop: unregister the transport and mark the server `Stopped`.
    ///
    /// A server that already failed keeps its `Error` status and message.
    pub fn stop(&mut self, id: &str) -> Option<Arc<StdioTransport>> {
        let entry = self.entries.get_mut(id)?;
        if !entry.state.status.is_terminal() {
            set_status(&mut entry.state, ServerStatus::Stopped);
        }
        entry.state.tools.clear();
        entry.transport.take()
    }

    /// Forget every server; returns all transports that were registered.
    pub fn clear(&mut self) -> Vec<Arc<StdioTransport>> {
        self.order.clear();
        self.entries
            .drain()
            .filter_map(|(_, entry)| entry.transport)
            .collect()
    }

    /// Transport for a tool call, checking the server exists and is running.
    pub fn transport_for_call(&self, id: &str) -> Result<Arc<StdioTransport>, McpError> {
        let entry = self.entries.get(id).ok_or(McpError::ServerNotFound {
            id: id.to_string(),
        })?;

        if entry.state.status != ServerStatus::Running {
            return Err(McpError::ServerNotRunning {
                id: id.to_string(),
                status: entry.state.status.to_string(),
            });
        }

        entry.transport.clone().ok_or(McpError::ServerNotRunning {
            id: id.to_string(),
            status: "no process".to_string(),
        })
    }

    /// Look up a tool advertised by a server.
    pub fn get_tool(&self, id: &str, tool_name: &str) -> Option<&ToolDefinition> {
        self.entries
            .get(id)?
            .state
            .tools
            .iter()
            .find(|t| t.name == tool_name)
    }

    /// Snapshot of one server's state.
    pub fn state(&self, id: &str) -> Option<ServerState> {
        self.entries.get(id).map(|e| e.state.clone())
    }

    /// Snapshot of every server's state, in load order.
    pub fn all_states(&self) -> Vec<ServerState> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.state.clone())
            .collect()
    }

    /// Tools of every running server, in load order.
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.state.status == ServerStatus::Running)
            .flat_map(|e| e.state.tools.iter().cloned())
            .collect()
    }

    /// Number of servers currently `Running`.
    pub fn running_count(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.state.status == ServerStatus::Running)
            .count()
    }

    /// Number of processes registered in the active-process table.
    pub fn process_count(&self) -> usize {
        self.entries.values().filter(|e| e.transport.is_some()).count()
    }

    /// Current generation of a server, if known.
    pub fn generation(&self, id: &str) -> Option<u64> {
        self.entries.get(id).map(|e| e.generation)
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert a state directly, bypassing the load path.
    #[cfg(test)]
    pub fn insert_state(&mut self, state: ServerState) {
        self.next_generation += 1;
        if !self.entries.contains_key(&state.id) {
            self.order.push(state.id.clone());
        }
        self.entries.insert(
            state.id.clone(),
            ServerEntry {
                state,
                generation: self.next_generation,
                transport: None,
            },
        );
    }
}

/// Apply a status change, logging any transition outside the lifecycle.
fn set_status(state: &mut ServerState, next: ServerStatus) {
    if !state.status.can_transition_to(next) {
        tracing::warn!(
            server = %state.id,
            from = %state.status,
            to = %next,
            "unexpected server status transition"
        );
    }
    state.status = next;
}

// ─── Argument Validation ─────────────────────────────────────────────────────

/// Validate tool arguments against the tool's advertised `inputSchema`.
///
/// This is a basic structural check: arguments are an object, required
/// fields are present, and top-level properties have the declared JSON type.
/// Full JSON Schema validation is deferred to the server itself.
pub fn validate_arguments(tool: &ToolDefinition, arguments: &serde_json::Value) -> Result<(), McpError> {
    let invalid = |reason: String| McpError::InvalidArguments {
        tool: tool.name.clone(),
        reason,
    };

    let Some(args_obj) = arguments.as_object() else {
        return Err(invalid("arguments must be a JSON object".to_string()));
    };

    let schema = &tool.input_schema;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field_name in required.iter().filter_map(|f| f.as_str()) {
            if !args_obj.contains_key(field_name) {
                return Err(invalid(format!("missing required field: '{field_name}'")));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, value) in args_obj {
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
            else {
                continue;
            };
            if !matches_json_type(expected, value) {
                return Err(invalid(format!(
                    "field '{name}' should be of type {expected}"
                )));
            }
        }
    }

    Ok(())
}

/// Check a value against a schema `type`, which may be a string or an array
/// of strings. Unknown type names are accepted.
fn matches_json_type(expected: &serde_json::Value, value: &serde_json::Value) -> bool {
    match expected {
        serde_json::Value::String(name) => matches_type_name(name, value),
        serde_json::Value::Array(names) => names
            .iter()
            .filter_map(|n| n.as_str())
            .any(|n| matches_type_name(n, value)),
        _ => true,
    }
}

fn matches_type_name(name: &str, value: &serde_json::Value) -> bool {
    match name {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, schema: serde_json::Value) -> ToolDefinition {
        ToolDefinition {
            server_id: "fs".into(),
            name: name.into(),
            description: String::new(),
            input_schema: schema,
        }
    }

    fn running_state(id: &str, tools: Vec<ToolDefinition>) -> ServerState {
        let mut state = ServerState::new(id);
        state.status = ServerStatus::Running;
        state.tools = tools;
        state
    }

    #[test]
    fn test_begin_load_starts_in_starting() {
        let mut reg = ServerRegistry::new();
        let (generation, previous) = reg.begin_load("fs");
        assert!(previous.is_none());
        assert_eq!(reg.generation("fs"), Some(generation));
        assert_eq!(reg.state("fs").unwrap().status, ServerStatus::Starting);
        assert_eq!(reg.process_count(), 0);
    }

    #[test]
    fn test_generations_increase() {
        let mut reg = ServerRegistry::new();
        let (g1, _) = reg.begin_load("fs");
        let (g2, _) = reg.begin_load("fs");
        assert!(g2 > g1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.all_states().len(), 1);
    }

    #[test]
    fn test_mark_running_sets_tools() {
        let mut reg = ServerRegistry::new();
        let (g, _) = reg.begin_load("fs");
        assert!(reg.mark_running("fs", g, vec![tool("read", serde_json::json!({}))]));
        let state = reg.state("fs").unwrap();
        assert_eq!(state.status, ServerStatus::Running);
        assert_eq!(state.tools.len(), 1);
        assert_eq!(reg.running_count(), 1);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut reg = ServerRegistry::new();
        let (old, _) = reg.begin_load("fs");
        let (_new, _) = reg.begin_load("fs");
        assert!(!reg.mark_running("fs", old, vec![]));
        assert!(reg.mark_failed("fs", old, "late").is_none());
        assert_eq!(reg.state("fs").unwrap().status, ServerStatus::Starting);
        assert!(reg.state("fs").unwrap().error.is_none());
    }

    #[test]
    fn test_mark_failed_records_error() {
        let mut reg = ServerRegistry::new();
        let (g, _) = reg.begin_load("fs");
        reg.mark_failed("fs", g, "boom");
        let state = reg.state("fs").unwrap();
        assert_eq!(state.status, ServerStatus::Error);
        assert_eq!(state.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_running_cannot_become_error() {
        let mut reg = ServerRegistry::new();
        let (g, _) = reg.begin_load("fs");
        reg.mark_running("fs", g, vec![]);
        reg.mark_failed("fs", g, "too late");
        assert_eq!(reg.state("fs").unwrap().status, ServerStatus::Running);
    }

    #[test]
    fn test_exit_moves_running_to_stopped_and_clears_tools() {
        let mut reg = ServerRegistry::new();
        let (g, _) = reg.begin_load("fs");
        reg.mark_running("fs", g, vec![tool("read", serde_json::json!({}))]);
        reg.handle_exit("fs", g);
        let state = reg.state("fs").unwrap();
        assert_eq!(state.status, ServerStatus::Stopped);
        assert!(state.tools.is_empty());
        assert!(reg.all_tools().is_empty());
    }

    #[test]
    fn test_stop_keeps_error_status() {
        let mut reg = ServerRegistry::new();
        let (g, _) = reg.begin_load("fs");
        reg.mark_failed("fs", g, "boom");
        reg.stop("fs");
        assert_eq!(reg.state("fs").unwrap().status, ServerStatus::Error);
    }

    #[test]
    fn test_all_tools_only_from_running() {
        let mut reg = ServerRegistry::new();
        reg.insert_state(running_state("a", vec![tool("t1", serde_json::json!({}))]));
        let mut starting = ServerState::new("b");
        starting.status = ServerStatus::Starting;
        reg.insert_state(starting);
        let tools = reg.all_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "t1");
    }

    #[test]
    fn test_all_states_preserve_load_order() {
        let mut reg = ServerRegistry::new();
        for id in ["zeta", "alpha", "mid"] {
            reg.begin_load(id);
        }
        let ids: Vec<String> = reg.all_states().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_transport_for_call_unknown() {
        let reg = ServerRegistry::new();
        let err = reg.transport_for_call("nope").err().unwrap();
        assert!(matches!(err, McpError::ServerNotFound { .. }));
    }

    #[test]
    fn test_transport_for_call_not_running() {
        let mut reg = ServerRegistry::new();
        reg.begin_load("fs");
        let err = reg.transport_for_call("fs").err().unwrap();
        assert!(err.to_string().contains("status: starting"));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut reg = ServerRegistry::new();
        reg.begin_load("a");
        reg.begin_load("b");
        assert!(reg.clear().is_empty());
        assert!(reg.is_empty());
        assert!(reg.all_states().is_empty());
    }

    #[test]
    fn test_get_tool() {
        let mut reg = ServerRegistry::new();
        reg.insert_state(running_state("fs", vec![tool("read", serde_json::json!({}))]));
        assert!(reg.get_tool("fs", "read").is_some());
        assert!(reg.get_tool("fs", "write").is_none());
        assert!(reg.get_tool("other", "read").is_none());
    }

    #[test]
    fn test_validate_arguments_valid() {
        let t = tool(
            "write",
            serde_json::json!({
                "type": "object",
                "properties": {"path": {"type": "string"}, "append": {"type": "boolean"}},
                "required": ["path"]
            }),
        );
        assert!(validate_arguments(&t, &serde_json::json!({"path": "/tmp/x", "append": true})).is_ok());
    }

    #[test]
    fn test_validate_arguments_missing_required() {
        let t = tool("write", serde_json::json!({"required": ["path"]}));
        let err = validate_arguments(&t, &serde_json::json!({})).unwrap_err();
        assert!(err.to_string().contains("missing required field: 'path'"));
    }

    #[test]
    fn test_validate_arguments_wrong_type() {
        let t = tool(
            "read",
            serde_json::json!({"properties": {"limit": {"type": "integer"}}}),
        );
        let err = validate_arguments(&t, &serde_json::json!({"limit": "ten"})).unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
    }

    #[test]
    fn test_validate_arguments_union_type() {
        let t = tool(
            "read",
            serde_json::json!({"properties": {"limit": {"type": ["integer", "null"]}}}),
        );
        assert!(validate_arguments(&t, &serde_json::json!({"limit": null})).is_ok());
    }

    #[test]
    fn test_validate_arguments_not_object() {
        let t = tool("read", serde_json::json!({}));
        assert!(validate_arguments(&t, &serde_json::json!([1, 2])).is_err());
    }

    #[test]
    fn test_validate_arguments_empty_schema_accepts_anything() {
        let t = tool("read", serde_json::json!({}));
        assert!(validate_arguments(&t, &serde_json::json!({"anything": [1]})).is_ok());
    }
}
