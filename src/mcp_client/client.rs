//! MCP Loader: high-level interface for server loading and tool execution.
//!
//! Orchestrates server lifecycle, the server registry, tool call dispatch and
//! telemetry. This is the API the application's composition root owns.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use tokio::process::Child;
use tokio::sync::{oneshot, Mutex};

use super::config::LoaderOptions;
use super::errors::McpError;
use super::lifecycle::{self, SpawnedServer};
use super::registry::{validate_arguments, ServerRegistry};
use super::telemetry::TelemetryBuffer;
use super::transport::StdioTransport;
use super::types::{
    methods, ServerConfig, ServerState, TelemetryEntry, TelemetryStats, ToolCall, ToolCallResult,
    ToolDefinition,
};
use crate::settings::SettingsStore;

// ─── McpLoader ───────────────────────────────────────────────────────────────

/// Loads MCP servers, tracks their state, and routes tool calls to them.
///
/// Cloning is cheap and every clone shares the same servers and telemetry.
#[derive(Clone)]
pub struct McpLoader {
    /// Server configurations, in settings order.
    configs: Arc<Vec<ServerConfig>>,
    options: Arc<LoaderOptions>,
    registry: Arc<Mutex<ServerRegistry>>,
    telemetry: Arc<Mutex<TelemetryBuffer>>,
}

impl McpLoader {
    /// Create a loader for the given server configurations.
    pub fn new(configs: Vec<ServerConfig>, options: LoaderOptions) -> Self {
        let mut seen = std::collections::HashSet::new();
        for config in &configs {
            if !seen.insert(config.id.as_str()) {
                tracing::warn!(server = %config.id, "duplicate server id in configuration");
            }
        }

        let telemetry = TelemetryBuffer::new(options.telemetry_max_size);
        Self {
            configs: Arc::new(configs),
            options: Arc::new(options),
            registry: Arc::new(Mutex::new(ServerRegistry::new())),
            telemetry: Arc::new(Mutex::new(telemetry)),
        }
    }

    /// Create a loader from the server list in a settings store.
    pub fn from_settings(store: &dyn SettingsStore, options: LoaderOptions) -> Result<Self, McpError> {
        let configs = store.load_servers()?;
        Ok(Self::new(configs, options))
    }

    /// Configured servers, enabled or not.
    pub fn configs(&self) -> &[ServerConfig] {
        &self.configs
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Load every enabled server concurrently and wait for all of them.
    ///
    /// A server failing (or even panicking) never affects the others; its
    /// outcome is visible through `server_state`.
    pub async fn load_all(&self) {
        let enabled: Vec<ServerConfig> = self.configs.iter().filter(|c| c.enabled).cloned().collect();
        let skipped = self.configs.len() - enabled.len();
        tracing::info!(enabled = enabled.len(), skipped, "loading MCP servers");

        let mut handles = Vec::with_capacity(enabled.len());
        for config in enabled {
            let loader = self.clone();
            let id = config.id.clone();
            handles.push((id, tokio::spawn(async move { loader.load_server(&config).await })));
        }

        for (id, handle) in handles {
            if let Err(e) = handle.await {
                tracing::error!(server = %id, error = %e, "MCP server load task failed");
                let mut registry = self.registry.lock().await;
                if let Some(generation) = registry.generation(&id) {
                    let reason = format!("load task failed: {e}");
                    if let Some(transport) = registry.mark_failed(&id, generation, &reason) {
                        drop(registry);
                        transport.close(&reason).await;
                    }
                }
            }
        }

        let registry = self.registry.lock().await;
        tracing::info!(
            running = registry.running_count(),
            total = registry.len(),
            tools = registry.all_tools().len(),
            "MCP servers loaded"
        );
    }

    /// Load one server: validate, spawn, handshake, list tools.
    ///
    /// Never fails; the outcome is recorded in the server's state. Loading
    /// an id that is already loaded replaces it with a fresh generation.
    pub async fn load_server(&self, config: &ServerConfig) {
        tracing::info!(server = %config.id, name = %config.name, "loading MCP server");

        let (generation, previous) = self.registry.lock().await.begin_load(&config.id);
        if let Some(previous) = previous {
            previous.close("superseded by reload").await;
        }

        let Some(resolved) = lifecycle::resolve_command(&config.command) else {
            let err = McpError::CommandNotFound {
                command: config.command.clone(),
            };
            tracing::error!(server = %config.id, error = %err, "MCP server command not found");
            self.fail(&config.id, generation, &err).await;
            return;
        };

        tracing::debug!(
            server = %config.id,
            command = %config.command,
            resolved = %resolved.display(),
            "command validated, spawning"
        );

        let SpawnedServer {
            transport,
            child,
            kill_rx,
            pid,
            started_at,
        } = match lifecycle::spawn_server(config, generation) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(server = %config.id, error = %e, "MCP server spawn failed");
                self.fail(&config.id, generation, &e).await;
                return;
            }
        };

        let transport = Arc::new(transport);
        self.supervise(&config.id, generation, child, kill_rx, Arc::clone(&transport));

        let attached = self.registry.lock().await.attach(
            &config.id,
            generation,
            Arc::clone(&transport),
            pid,
            started_at,
        );
        if !attached {
            tracing::info!(server = %config.id, "load superseded before handshake");
            transport.close("load superseded").await;
            return;
        }

        let handshake = lifecycle::initialize(
            &transport,
            &self.options.client_info(),
            self.options.init_timeout(),
            self.options.request_timeout(),
        )
        .await;

        match handshake {
            Ok(tools) => {
                let tool_count = tools.len();
                let applied = self.registry.lock().await.mark_running(&config.id, generation, tools);
                if applied {
                    tracing::info!(
                        server = %config.id,
                        pid = ?pid,
                        tools = tool_count,
                        "MCP server started"
                    );
                } else {
                    tracing::info!(server = %config.id, "MCP server stopped during handshake");
                }
            }
            Err(e) => {
                let err = McpError::InitFailed {
                    name: config.id.clone(),
                    reason: e.to_string(),
                };
                tracing::error!(server = %config.id, error = %e, "MCP server handshake failed");
                self.fail(&config.id, generation, &err).await;
            }
        }
    }

    /// Record a failed load and tear down whatever it registered.
    async fn fail(&self, id: &str, generation: u64, err: &McpError) {
        let message = err.to_string();
        let detached = self.registry.lock().await.mark_failed(id, generation, &message);
        if let Some(transport) = detached {
            transport.close(&message).await;
        }
    }

    /// Own the child process until it exits or is killed, then unregister it.
    fn supervise(
        &self,
        id: &str,
        generation: u64,
        child: Child,
        kill_rx: oneshot::Receiver<()>,
        transport: Arc<StdioTransport>,
    ) {
        let registry = Arc::clone(&self.registry);
        let id = id.to_string();
        tokio::spawn(async move {
            let exit = lifecycle::watch_exit(child, kill_rx).await;
            let reason = exit.describe();
            tracing::info!(server = %id, generation, exit = %reason, "MCP server process ended");

            // Only this generation's entry is touched; a newer one is left alone.
            let _ = registry.lock().await.handle_exit(&id, generation);
            transport.close(&reason).await;
        });
    }

    /// Stop a server and reload it from its configuration as a new generation.
    pub async fn restart_server(&self, id: &str) -> Result<ServerState, McpError> {
        let config = self
            .configs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("no configuration for server '{id}'"),
            })?;

        self.stop_server(id).await;
        self.load_server(&config).await;

        self.server_state(id)
            .await
            .ok_or_else(|| McpError::ServerNotFound { id: id.to_string() })
    }

    /// Stop one server. Its in-flight requests fail; its tools disappear.
    pub async fn stop_server(&self, id: &str) {
        let detached = self.registry.lock().await.stop(id);
        if let Some(transport) = detached {
            let in_flight = transport.pending_count().await;
            tracing::info!(
                server = %id,
                generation = transport.generation(),
                in_flight,
                "stopping MCP server"
            );
            transport.close("server stopped").await;
        }
    }

    /// Stop every server and forget all server state.
    pub async fn stop_all(&self) {
        let transports = self.registry.lock().await.clear();
        tracing::info!(count = transports.len(), "stopping all MCP servers");
        join_all(transports.iter().map(|transport| {
            tracing::debug!(server = %transport.server_id(), "stopping MCP server");
            transport.close("loader shutting down")
        }))
        .await;
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool call on its server.
    ///
    /// Never fails: every problem comes back as `success: false`. Checks, in
    /// order, that the server exists, is running, advertises the tool, and
    /// that the arguments fit the tool's schema. Only calls that pass these
    /// checks are sent and recorded in telemetry.
    pub async fn execute_tool_call(&self, call: ToolCall) -> ToolCallResult {
        let (transport, tool) = {
            let registry = self.registry.lock().await;
            let transport = match registry.transport_for_call(&call.server_id) {
                Ok(transport) => transport,
                Err(e) => return ToolCallResult::failed(e.to_string()),
            };
            let Some(tool) = registry.get_tool(&call.server_id, &call.tool_name).cloned() else {
                let err = McpError::UnknownTool {
                    server: call.server_id.clone(),
                    tool: call.tool_name.clone(),
                };
                return ToolCallResult::failed(err.to_string());
            };
            (transport, tool)
        };

        if let Err(e) = validate_arguments(&tool, &call.arguments) {
            return ToolCallResult::failed(e.to_string());
        }

        let params = serde_json::json!({
            "name": call.tool_name,
            "arguments": call.arguments,
        });

        let start_time = Utc::now();
        let started = Instant::now();
        let outcome = transport
            .request(methods::TOOLS_CALL, params, self.options.request_timeout())
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = outcome.as_ref().err().map(|e| e.to_string());
        tracing::debug!(
            server = %call.server_id,
            tool = %call.tool_name,
            duration_ms,
            success = error.is_none(),
            "tool call finished"
        );

        self.telemetry.lock().await.record(TelemetryEntry {
            server_id: call.server_id.clone(),
            tool_name: call.tool_name.clone(),
            start_time,
            end_time: Utc::now(),
            duration_ms,
            success: error.is_none(),
            error: error.clone(),
        });

        match outcome {
            Ok(data) => ToolCallResult::ok(data),
            Err(e) => {
                if e.is_connection_lost() {
                    tracing::warn!(
                        server = %call.server_id,
                        tool = %call.tool_name,
                        error = %e,
                        "server connection lost during tool call"
                    );
                } else {
                    tracing::debug!(
                        server = %call.server_id,
                        tool = %call.tool_name,
                        error = %e,
                        "tool call failed"
                    );
                }
                ToolCallResult::failed(e.to_string())
            }
        }
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// State of one server, if it has been loaded.
    pub async fn server_state(&self, id: &str) -> Option<ServerState> {
        self.registry.lock().await.state(id)
    }

    /// State of every loaded server, in load order.
    pub async fn all_servers(&self) -> Vec<ServerState> {
        self.registry.lock().await.all_states()
    }

    /// Tools of every running server.
    pub async fn all_tools(&self) -> Vec<ToolDefinition> {
        self.registry.lock().await.all_tools()
    }

    /// Number of servers currently running.
    pub async fn running_server_count(&self) -> usize {
        self.registry.lock().await.running_count()
    }

    /// Number of processes registered in the active-process table.
    pub async fn process_count(&self) -> usize {
        self.registry.lock().await.process_count()
    }

    /// Copy of the telemetry history, oldest first.
    pub async fn telemetry(&self) -> Vec<TelemetryEntry> {
        self.telemetry.lock().await.entries()
    }

    /// Aggregate statistics over the telemetry history.
    pub async fn telemetry_stats(&self) -> TelemetryStats {
        self.telemetry.lock().await.stats()
    }

    /// Put a server state in place without spawning anything.
    #[cfg(test)]
    pub(crate) async fn insert_state_for_test(&self, state: ServerState) {
        self.registry.lock().await.insert_state(state);
    }
}

// ─── Application Entry Points ────────────────────────────────────────────────

/// Build a loader from the settings store and load every enabled server.
///
/// Never fails: if the settings can't be read the application continues
/// with an empty loader and no MCP functionality.
pub async fn initialize_mcp(store: &dyn SettingsStore, options: LoaderOptions) -> McpLoader {
    tracing::info!("initializing MCP servers");
    let loader = match McpLoader::from_settings(store, options.clone()) {
        Ok(loader) => loader,
        Err(e) => {
            tracing::error!(error = %e, "failed to read MCP settings");
            tracing::error!("continuing without MCP servers");
            McpLoader::new(Vec::new(), options)
        }
    };
    loader.load_all().await;
    tracing::info!("MCP servers initialized");
    loader
}

/// Stop every server owned by `loader`.
pub async fn shutdown_mcp(loader: &McpLoader) {
    loader.stop_all().await;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
