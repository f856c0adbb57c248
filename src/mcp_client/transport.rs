//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Framing raw stdout chunks into newline-delimited JSON messages
//! - Writing JSON-RPC requests and notifications to stdin
//! - A reader task per connection that feeds the correlator
//!
//! The transport is written against `AsyncRead`/`AsyncWrite` rather than the
//! child's pipes directly so it can be exercised over in-memory streams.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::correlator::{next_request_id, PendingRequests};
use super::errors::McpError;
use super::types::{IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest};

/// Size of a single stdout read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Boxed stdin writer so tests can swap the child pipe for an in-memory stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Framing ─────────────────────────────────────────────────────────────────

/// Accumulates stdout bytes and yields complete lines.
///
/// Everything up to the last `\n` is emitted; the trailing fragment stays
/// buffered until a later chunk completes it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Blank lines are skipped and a trailing `\r` is dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let Some(last_newline) = self.buf.iter().rposition(|&b| b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.buf.drain(..=last_newline).collect();
        complete
            .split(|&b| b == b'\n')
            .filter_map(|raw| {
                let line = String::from_utf8_lossy(raw);
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    None
                } else {
                    Some(line.to_string())
                }
            })
            .collect()
    }

    /// Bytes still waiting for a newline.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Parse and classify one line of server output.
pub fn parse_message(server: &str, line: &str) -> Result<IncomingMessage, McpError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| McpError::TransportError {
            server: server.to_string(),
            reason: format!("malformed JSON: {e}"),
        })?;

    let Some(obj) = value.as_object() else {
        return Ok(IncomingMessage::Unknown(value));
    };

    let id = obj.get("id").filter(|v| !v.is_null());

    if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
        return Ok(match id {
            Some(id) => IncomingMessage::ServerRequest {
                id: id.clone(),
                method: method.to_string(),
            },
            None => IncomingMessage::Notification {
                method: method.to_string(),
                params: obj.get("params").cloned(),
            },
        });
    }

    if let Some(id) = id.and_then(|v| v.as_u64()) {
        let error = match obj.get("error") {
            None | Some(serde_json::Value::Null) => None,
            // A non-object error still means failure; keep the generic message.
            Some(raw) => Some(serde_json::from_value::<JsonRpcError>(raw.clone()).unwrap_or_default()),
        };
        return Ok(IncomingMessage::Response {
            id,
            result: obj.get("result").cloned(),
            error,
        });
    }

    Ok(IncomingMessage::Unknown(value))
}

// ─── Writing ─────────────────────────────────────────────────────────────────

/// Serialize `message` as one JSON line and write it to `writer`.
pub async fn write_message<W, T>(writer: &mut W, server: &str, message: &T) -> Result<(), McpError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to serialize message: {e}"),
    })?;
    json.push('\n');

    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| McpError::TransportError {
            server: server.to_string(),
            reason: format!("failed to write to stdin: {e}"),
        })?;
    writer.flush().await.map_err(|e| McpError::TransportError {
        server: server.to_string(),
        reason: format!("failed to flush stdin: {e}"),
    })?;

    Ok(())
}

// ─── Reader Loop ─────────────────────────────────────────────────────────────

/// Spawn the task that drains a server's stdout into the correlator.
///
/// A line that fails to parse is logged and skipped. The task ends on EOF
/// or a read error; process exit handling lives in the lifecycle module.
pub fn spawn_reader_loop<R>(
    server_id: String,
    mut stdout: R,
    pending: Arc<PendingRequests>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut framer = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let n = match stdout.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "stdout read failed");
                    break;
                }
            };

            for line in framer.push(&chunk[..n]) {
                match parse_message(&server_id, &line) {
                    Ok(message) => pending.route(message).await,
                    Err(e) => {
                        tracing::error!(
                            server = %server_id,
                            line = %line,
                            error = %e,
                            "failed to parse server message"
                        );
                    }
                }
            }
        }

        if !framer.pending().is_empty() {
            tracing::debug!(
                server = %server_id,
                bytes = framer.pending().len(),
                "discarding incomplete trailing line"
            );
        }
        tracing::debug!(server = %server_id, "stdout reader ended");
    })
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// One generation of a server connection: stdin writer, pending requests,
/// and the kill switch for the owning process.
///
/// The stdout buffer lives in the reader task, so dropping this together
/// with the task tears down all per-server bookkeeping at once.
pub struct StdioTransport {
    server_id: String,
    generation: u64,
    writer: Mutex<BoxedWriter>,
    pending: Arc<PendingRequests>,
    kill_switch: Mutex<Option<oneshot::Sender<()>>>,
    reader: JoinHandle<()>,
}

impl StdioTransport {
    /// Wire a transport over arbitrary streams and start its reader task.
    pub fn new<R>(
        server_id: &str,
        generation: u64,
        writer: BoxedWriter,
        reader: R,
        kill_switch: Option<oneshot::Sender<()>>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending = Arc::new(PendingRequests::new(server_id));
        let reader = spawn_reader_loop(server_id.to_string(), reader, Arc::clone(&pending));
        Self {
            server_id: server_id.to_string(),
            generation,
            writer: Mutex::new(writer),
            pending,
            kill_switch: Mutex::new(kill_switch),
            reader,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.len().await
    }

    /// Send a JSON-RPC request and wait for the response with the same id.
    ///
    /// Fails with `Timeout` when no response arrives within `timeout`, and
    /// with `ServerExited` when the connection is closed while waiting.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let id = next_request_id();
        let rx = self.pending.register(id).await?;
        let req = JsonRpcRequest::new(id, method, params);

        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_message(&mut **writer, &self.server_id, &req).await {
                self.pending.forget(id).await;
                return Err(e);
            }
        }

        tracing::trace!(server = %self.server_id, id, method, "request sent");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(McpError::ServerExited {
                server: self.server_id.clone(),
                reason: "connection closed before response".into(),
            }),
            Err(_) => {
                self.pending.forget(id).await;
                Err(McpError::Timeout {
                    server: self.server_id.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let mut writer = self.writer.lock().await;
        write_message(&mut **writer, &self.server_id, &notification).await
    }

    /// Reject everything in flight, stop reading, and signal the process to die.
    ///
    /// Idempotent: the kill switch fires at most once.
    pub async fn close(&self, reason: &str) {
        let rejected = self.pending.reject_all(reason).await;
        if rejected > 0 {
            tracing::warn!(
                server = %self.server_id,
                rejected,
                reason,
                "rejected in-flight requests"
            );
        }
        self.reader.abort();
        if let Some(kill) = self.kill_switch.lock().await.take() {
            let _ = kill.send(());
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
