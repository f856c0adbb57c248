//! Minimal MCP server over stdio, used to exercise the loader end to end.
//!
//! Tools:
//! - `echo` : returns its `text` argument as text content
//! - `fail` : answers with a JSON-RPC error
//! - `sleep`: waits `ms` milliseconds, then answers (responses can overtake it)
//! - `crash`: exits the process without answering
//!
//! Behaviour switches, read from the environment:
//! - `MCP_ECHO_NOISE=1`    : write a non-JSON line and a notification before every response
//! - `MCP_ECHO_FAIL_INIT=1`: reject `initialize`
//! - `MCP_ECHO_SILENT=1`   : read requests but never answer

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

type Stdout = Arc<Mutex<tokio::io::Stdout>>;

fn flag(name: &str) -> bool {
    matches!(std::env::var(name).as_deref(), Ok("1") | Ok("true"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    let noise = flag("MCP_ECHO_NOISE");
    let fail_init = flag("MCP_ECHO_FAIL_INIT");
    let silent = flag("MCP_ECHO_SILENT");
    tracing::info!(noise, fail_init, silent, "echo server started");

    let stdout: Stdout = Arc::new(Mutex::new(tokio::io::stdout()));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed request");
                continue;
            }
        };

        // Notifications carry no id and get no answer
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        if silent {
            continue;
        }

        let method = message.get("method").and_then(Value::as_str).unwrap_or_default().to_string();
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let stdout = Arc::clone(&stdout);

        // Each request is answered from its own task so slow calls don't
        // block fast ones.
        tokio::spawn(async move {
            let reply = handle(&method, &params, fail_init).await;
            let response = match reply {
                Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Err((code, message)) => {
                    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                }
            };
            if let Err(e) = send(&stdout, &response, noise).await {
                tracing::error!(error = %e, "failed to write response");
            }
        });
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

async fn send(stdout: &Stdout, response: &Value, noise: bool) -> std::io::Result<()> {
    let mut out = stdout.lock().await;
    if noise {
        out.write_all(b"this is not json\n").await?;
        let progress = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}});
        out.write_all(format!("{progress}\n").as_bytes()).await?;
    }
    out.write_all(format!("{response}\n").as_bytes()).await?;
    out.flush().await
}

async fn handle(method: &str, params: &Value, fail_init: bool) -> Result<Value, (i64, String)> {
    match method {
        "initialize" if fail_init => Err((-32603, "initialization refused".into())),
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION")},
        })),
        "tools/list" => Ok(json!({"tools": tool_list()})),
        "tools/call" => call_tool(params).await,
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

fn tool_list() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Echo the given text",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"],
            },
        },
        {
            "name": "fail",
            "description": "Always fails",
            "inputSchema": {"type": "object"},
        },
        {
            "name": "sleep",
            "description": "Answer after a delay",
            "inputSchema": {
                "type": "object",
                "properties": {"ms": {"type": "integer"}},
                "required": ["ms"],
            },
        },
        {
            "name": "crash",
            "description": "Exit without answering",
            "inputSchema": {"type": "object"},
        },
    ])
}

async fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    match name {
        "echo" => {
            let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
            Ok(json!({"content": [{"type": "text", "text": text}]}))
        }
        "fail" => Err((-32000, "tool failed on purpose".into())),
        "sleep" => {
            let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"content": [{"type": "text", "text": format!("slept {ms}ms")}]}))
        }
        "crash" => {
            tracing::error!("crashing on request");
            std::process::exit(7);
        }
        other => Err((-32602, format!("unknown tool: {other}"))),
    }
}
