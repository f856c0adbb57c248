//! Server process lifecycle management.
//!
//! Handles resolving, spawning, supervising and handshaking MCP server child
//! processes. Each server runs as a separate OS process communicating via
//! JSON-RPC over stdio.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::oneshot;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{methods, ListedTool, ServerConfig, ToolDefinition, PROTOCOL_VERSION};

/// Longest stderr line forwarded to the log before truncation.
const MAX_STDERR_LINE: usize = 2000;

// ─── Command Resolution ──────────────────────────────────────────────────────

/// Resolve `command` the way the OS would when spawning it.
///
/// Absolute and relative paths are checked directly; bare names are searched
/// on `PATH` (honouring `PATHEXT` on Windows).
pub fn resolve_command(command: &str) -> Option<PathBuf> {
    which::which(command).ok()
}

/// Check if a command can be found before we try to spawn it.
pub fn command_exists(command: &str) -> bool {
    resolve_command(command).is_some()
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// A freshly spawned server: its transport plus the process handle the
/// supervisor task takes ownership of.
pub struct SpawnedServer {
    pub transport: StdioTransport,
    pub child: Child,
    pub kill_rx: oneshot::Receiver<()>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// Spawn the process for `config` with piped stdio and wire its transport.
///
/// The command must already be validated with [`command_exists`]; a failure
/// here is an OS-level spawn failure (permissions, bad binary format, ...).
pub fn spawn_server(config: &ServerConfig, generation: u64) -> Result<SpawnedServer, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    // Layered over the inherited environment
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: config.id.clone(),
        reason: e.to_string(),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
        name: config.id.clone(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
        name: config.id.clone(),
        reason: "failed to capture stdout".into(),
    })?;
    if let Some(stderr) = child.stderr.take() {
        forward_stderr(config.id.clone(), stderr);
    }

    let (kill_tx, kill_rx) = oneshot::channel();
    let transport = StdioTransport::new(
        &config.id,
        generation,
        Box::new(stdin),
        stdout,
        Some(kill_tx),
    );

    Ok(SpawnedServer {
        transport,
        pid: child.id(),
        child,
        kill_rx,
        started_at: Utc::now(),
    })
}

/// Forward a server's stderr to the log, one line at a time.
fn forward_stderr(server_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(mut line)) => {
                    if line.len() > MAX_STDERR_LINE {
                        let mut cut = MAX_STDERR_LINE;
                        while !line.is_char_boundary(cut) {
                            cut -= 1;
                        }
                        line.truncate(cut);
                        line.push_str("...(truncated)");
                    }
                    tracing::warn!(server = %server_id, stderr = %line, "server stderr");
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server_id, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    });
}

// ─── Supervision ─────────────────────────────────────────────────────────────

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own.
    Exited(Option<i32>),
    /// We killed it (stop, failed handshake, or the transport was dropped).
    Killed,
    /// `wait()` itself failed.
    Unknown(String),
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match self {
            ProcessExit::Exited(Some(code)) => format!("process exited with code {code}"),
            ProcessExit::Exited(None) => "process terminated by signal".to_string(),
            ProcessExit::Killed => "process was stopped".to_string(),
            ProcessExit::Unknown(reason) => format!("process wait failed: {reason}"),
        }
    }
}

fn exit_from_status(status: std::io::Result<ExitStatus>) -> ProcessExit {
    match status {
        Ok(status) => ProcessExit::Exited(status.code()),
        Err(e) => ProcessExit::Unknown(e.to_string()),
    }
}

/// Wait until the child exits or the kill switch fires, whichever is first.
///
/// A dropped kill switch counts as a kill request.
pub async fn watch_exit(mut child: Child, kill_rx: oneshot::Receiver<()>) -> ProcessExit {
    tokio::select! {
        status = child.wait() => exit_from_status(status),
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill failed (process already gone?)");
            }
            let _ = child.wait().await;
            ProcessExit::Killed
        }
    }
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Client identity sent in `initialize`.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// Perform the MCP initialization handshake and list the server's tools.
///
/// `initialize` -> `notifications/initialized` -> `tools/list`.
pub async fn initialize(
    transport: &StdioTransport,
    client: &ClientInfo,
    init_timeout: Duration,
    request_timeout: Duration,
) -> Result<Vec<ToolDefinition>, McpError> {
    let server_id = transport.server_id().to_string();

    let init_params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": client.name,
            "version": client.version,
        },
    });
    let init_result = transport
        .request(methods::INITIALIZE, init_params, init_timeout)
        .await?;

    if let Some(info) = init_result.get("serverInfo") {
        tracing::debug!(server = %server_id, server_info = %info, "server identified");
    }

    // Best-effort: older servers ignore unknown notifications anyway
    if let Err(e) = transport.notify(methods::INITIALIZED, None).await {
        tracing::debug!(server = %server_id, error = %e, "initialized notification failed");
    }

    let list_result = transport
        .request(methods::TOOLS_LIST, serde_json::json!({}), request_timeout)
        .await?;

    Ok(parse_tool_list(&server_id, &list_result))
}

/// Extract tool definitions from a `tools/list` result.
///
/// Entries without a usable `name` are skipped; a missing `tools` array
/// means the server has no tools.
pub fn parse_tool_list(server_id: &str, result: &serde_json::Value) -> Vec<ToolDefinition> {
    let Some(entries) = result.get("tools").and_then(|t| t.as_array()) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<ListedTool>(entry.clone()) {
            Ok(tool) => Some(tool.into_definition(server_id)),
            Err(e) => {
                tracing::warn!(
                    server = %server_id,
                    error = %e,
                    "skipping malformed tool definition"
                );
                None
            }
        })
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists_missing() {
        assert!(!command_exists("definitely-not-a-real-command-7f3a9c"));
    }

    #[test]
    fn test_command_exists_missing_absolute_path() {
        assert!(!command_exists("/nonexistent/dir/mcp-server"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_exists_found() {
        assert!(command_exists("sh"));
    }

    #[test]
    fn test_parse_tool_list() {
        let result = serde_json::json!({
            "tools": [
                {"name": "read_file", "description": "Read a file", "inputSchema": {"type": "object"}},
                {"name": "list_dir"},
                {"description": "no name, skipped"}
            ]
        });
        let tools = parse_tool_list("fs", &result);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].server_id, "fs");
        assert_eq!(tools[0].name, "read_file");
        assert_eq!(tools[0].input_schema, serde_json::json!({"type": "object"}));
        assert_eq!(tools[1].description, "");
    }

    #[test]
    fn test_parse_tool_list_without_tools() {
        assert!(parse_tool_list("fs", &serde_json::json!({})).is_empty());
        assert!(parse_tool_list("fs", &serde_json::Value::Null).is_empty());
    }

    #[test]
    fn test_process_exit_describe() {
        assert_eq!(
            ProcessExit::Exited(Some(1)).describe(),
            "process exited with code 1"
        );
        assert_eq!(ProcessExit::Killed.describe(), "process was stopped");
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_binary() {
        let config = ServerConfig {
            id: "ghost".into(),
            name: "Ghost".into(),
            command: "/nonexistent/dir/mcp-server".into(),
            args: vec![],
            env: Default::default(),
            enabled: true,
        };
        let err = spawn_server(&config, 1).err().unwrap();
        assert!(err.to_string().starts_with("Failed to start:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_exit_reports_exit_code() {
        let child = Command::new("sh")
            .args(["-c", "exit 3"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let (_kill_tx, kill_rx) = oneshot::channel();
        assert_eq!(watch_exit(child, kill_rx).await, ProcessExit::Exited(Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_watch_exit_kill_switch() {
        let child = Command::new("sh")
            .args(["-c", "sleep 30"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let (kill_tx, kill_rx) = oneshot::channel();
        kill_tx.send(()).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), watch_exit(child, kill_rx))
            .await
            .unwrap();
        assert_eq!(exit, ProcessExit::Killed);
    }
}
