//! Persisted MCP server settings.
//!
//! The loader reads its server list through `SettingsStore`; the default
//! implementation keeps it under the `mcp_servers` key of a JSON settings
//! file, leaving any other keys in that file untouched. `McpSettings` adds
//! the edit operations (upsert, delete, enable, disable) on top of a store.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::ServerConfig;

/// File name of the settings file inside the data directory.
pub const SETTINGS_FILE_NAME: &str = "mcp_settings.json";

const SETTINGS_VERSION: u32 = 1;

/// Source of the persisted server list.
pub trait SettingsStore: Send + Sync {
    /// The saved servers, or an empty list when nothing is saved yet.
    fn load_servers(&self) -> Result<Vec<ServerConfig>, McpError>;

    /// Replace the saved server list.
    fn save_servers(&self, servers: &[ServerConfig]) -> Result<(), McpError>;
}

// ─── JSON File Store ─────────────────────────────────────────────────────────

/// On-disk layout. Unknown keys are carried through a save unchanged.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedSettings {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    mcp_servers: Vec<ServerConfig>,
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

/// `SettingsStore` backed by a JSON file, written atomically.
#[derive(Debug, Clone)]
pub struct JsonFileSettingsStore {
    path: PathBuf,
}

impl JsonFileSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `{data_dir}/mcp_settings.json`.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(SETTINGS_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<PersistedSettings, McpError> {
        if !self.path.exists() {
            return Ok(PersistedSettings::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|e| McpError::SettingsError {
            reason: format!("failed to read {}: {e}", self.path.display()),
        })?;
        if content.trim().is_empty() {
            return Ok(PersistedSettings::default());
        }

        serde_json::from_str(&content).map_err(|e| McpError::SettingsError {
            reason: format!("failed to parse {}: {e}", self.path.display()),
        })
    }

    fn write(&self, settings: &PersistedSettings) -> Result<(), McpError> {
        let content = serde_json::to_string_pretty(settings).map_err(|e| McpError::SettingsError {
            reason: format!("failed to serialize settings: {e}"),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| McpError::SettingsError {
                reason: format!("failed to create {}: {e}", parent.display()),
            })?;
        }

        // Write to temp file, then rename for atomicity
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content).map_err(|e| McpError::SettingsError {
            reason: format!("failed to write {}: {e}", tmp_path.display()),
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| McpError::SettingsError {
            reason: format!("failed to replace {}: {e}", self.path.display()),
        })?;
        Ok(())
    }
}

impl SettingsStore for JsonFileSettingsStore {
    fn load_servers(&self) -> Result<Vec<ServerConfig>, McpError> {
        let settings = self.read()?;
        tracing::debug!(
            count = settings.mcp_servers.len(),
            path = %self.path.display(),
            "loaded MCP server settings"
        );
        Ok(settings.mcp_servers)
    }

    fn save_servers(&self, servers: &[ServerConfig]) -> Result<(), McpError> {
        let mut settings = self.read()?;
        settings.version = SETTINGS_VERSION;
        settings.mcp_servers = servers.to_vec();
        self.write(&settings)?;
        tracing::info!(
            count = servers.len(),
            path = %self.path.display(),
            "saved MCP server settings"
        );
        Ok(())
    }
}

// ─── In-Memory Store ─────────────────────────────────────────────────────────

/// `SettingsStore` kept in memory, for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemorySettingsStore {
    servers: Mutex<Vec<ServerConfig>>,
}

impl InMemorySettingsStore {
    pub fn new(servers: Vec<ServerConfig>) -> Self {
        Self {
            servers: Mutex::new(servers),
        }
    }
}

impl SettingsStore for InMemorySettingsStore {
    fn load_servers(&self) -> Result<Vec<ServerConfig>, McpError> {
        self.servers
            .lock()
            .map(|servers| servers.clone())
            .map_err(|e| McpError::SettingsError {
                reason: e.to_string(),
            })
    }

    fn save_servers(&self, servers: &[ServerConfig]) -> Result<(), McpError> {
        let mut guard = self.servers.lock().map_err(|e| McpError::SettingsError {
            reason: e.to_string(),
        })?;
        *guard = servers.to_vec();
        Ok(())
    }
}

// ─── Edit Operations ─────────────────────────────────────────────────────────

/// Read-modify-write helpers over a `SettingsStore`.
///
/// Changes only affect the saved list; a running loader picks them up on
/// its next construction.
pub struct McpSettings<S: SettingsStore> {
    store: S,
}

impl<S: SettingsStore> McpSettings<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn servers(&self) -> Result<Vec<ServerConfig>, McpError> {
        self.store.load_servers()
    }

    /// Replace a server with the same id, or append it.
    pub fn update_server(&self, config: ServerConfig) -> Result<(), McpError> {
        let mut servers = self.store.load_servers()?;
        match servers.iter_mut().find(|s| s.id == config.id) {
            Some(existing) => {
                tracing::info!(server = %config.id, "updating MCP server settings");
                *existing = config;
            }
            None => {
                tracing::info!(server = %config.id, "adding MCP server settings");
                servers.push(config);
            }
        }
        self.store.save_servers(&servers)
    }

    /// Remove a server. Returns whether it existed.
    pub fn delete_server(&self, id: &str) -> Result<bool, McpError> {
        let mut servers = self.store.load_servers()?;
        let before = servers.len();
        servers.retain(|s| s.id != id);
        if servers.len() == before {
            return Ok(false);
        }
        self.store.save_servers(&servers)?;
        tracing::info!(server = %id, "deleted MCP server settings");
        Ok(true)
    }

    /// Enable one server. Returns whether it exists.
    pub fn enable_server(&self, id: &str) -> Result<bool, McpError> {
        self.set_enabled(id, true)
    }

    /// Disable one server. Returns whether it exists.
    pub fn disable_server(&self, id: &str) -> Result<bool, McpError> {
        self.set_enabled(id, false)
    }

    /// Disable every server. Returns how many were enabled before.
    pub fn disable_all(&self) -> Result<usize, McpError> {
        let mut servers = self.store.load_servers()?;
        let mut changed = 0;
        for server in servers.iter_mut().filter(|s| s.enabled) {
            server.enabled = false;
            changed += 1;
        }
        if changed > 0 {
            self.store.save_servers(&servers)?;
        }
        tracing::info!(count = changed, "disabled all MCP servers");
        Ok(changed)
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool, McpError> {
        let mut servers = self.store.load_servers()?;
        let Some(server) = servers.iter_mut().find(|s| s.id == id) else {
            tracing::warn!(server = %id, "no MCP server settings to update");
            return Ok(false);
        };
        if server.enabled != enabled {
            server.enabled = enabled;
            self.store.save_servers(&servers)?;
        }
        tracing::info!(server = %id, enabled, "MCP server enabled flag set");
        Ok(true)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
