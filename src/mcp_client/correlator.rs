//! Request correlation: matches responses to waiting callers by id.
//!
//! Ids come from one process-wide counter so they never collide across
//! servers, while the pending map itself is per connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{oneshot, Mutex};

use super::errors::McpError;
use super::types::{IncomingMessage, JsonRpcError};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// What a waiting caller eventually receives.
pub type ResponseResult = Result<serde_json::Value, McpError>;

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Fallback when a server sends an error object without a usable message.
const GENERIC_FAILURE: &str = "MCP request failed";

/// Turn the `result` / `error` pair of a response into a caller outcome.
///
/// A present `error` always wins. A missing `result` resolves to `null`.
pub fn extract_result(
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
) -> ResponseResult {
    if let Some(err) = error {
        let message = err
            .message
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| GENERIC_FAILURE.to_string());
        return Err(McpError::ServerError {
            code: err.code,
            message,
            data: err.data,
        });
    }
    Ok(result.unwrap_or(serde_json::Value::Null))
}

// ─── PendingRequests ─────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingInner {
    waiters: HashMap<u64, oneshot::Sender<ResponseResult>>,
    /// Set once the connection is gone; later registrations fail fast.
    closed: Option<String>,
}

/// In-flight requests of a single server connection.
pub struct PendingRequests {
    server_id: String,
    inner: Mutex<PendingInner>,
}

impl PendingRequests {
    pub fn new(server_id: &str) -> Self {
        Self {
            server_id: server_id.to_string(),
            inner: Mutex::new(PendingInner::default()),
        }
    }

    /// Track a request id and hand back the receiver its response lands on.
    pub async fn register(&self, id: u64) -> Result<oneshot::Receiver<ResponseResult>, McpError> {
        let mut inner = self.inner.lock().await;
        if let Some(reason) = &inner.closed {
            return Err(McpError::ServerExited {
                server: self.server_id.clone(),
                reason: reason.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Drop a pending entry without resolving it (write failure, timeout).
    pub async fn forget(&self, id: u64) -> bool {
        self.inner.lock().await.waiters.remove(&id).is_some()
    }

    /// Deliver a response. Returns `false` if nobody was waiting for `id`.
    pub async fn resolve(
        &self,
        id: u64,
        result: Option<serde_json::Value>,
        error: Option<JsonRpcError>,
    ) -> bool {
        let waiter = self.inner.lock().await.waiters.remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have timed out in the meantime; that's fine.
                let _ = tx.send(extract_result(result, error));
                true
            }
            None => false,
        }
    }

    /// Fail every in-flight request and refuse new ones.
    pub async fn reject_all(&self, reason: &str) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().await;
            inner.closed.get_or_insert_with(|| reason.to_string());
            inner.waiters.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(McpError::ServerExited {
                server: self.server_id.clone(),
                reason: reason.to_string(),
            }));
        }
        count
    }

    /// Number of requests still waiting for a response.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Route one parsed message from the server.
    pub async fn route(&self, message: IncomingMessage) {
        match message {
            IncomingMessage::Response { id, result, error } => {
                if !self.resolve(id, result, error).await {
                    tracing::debug!(
                        server = %self.server_id,
                        id,
                        "dropping response for unknown request id"
                    );
                }
            }
            IncomingMessage::Notification { method, params } => {
                tracing::info!(
                    server = %self.server_id,
                    method = %method,
                    params = ?params,
                    "server notification"
                );
            }
            IncomingMessage::ServerRequest { id, method } => {
                tracing::warn!(
                    server = %self.server_id,
                    id = %id,
                    method = %method,
                    "ignoring server-initiated request"
                );
            }
            IncomingMessage::Unknown(value) => {
                tracing::debug!(
                    server = %self.server_id,
                    message = %value,
                    "ignoring unrecognized message"
                );
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
