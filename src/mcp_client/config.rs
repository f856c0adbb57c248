//! Loader options: timeouts, telemetry size and client identity.
//!
//! Read from an optional `mcp_loader.yaml`; every field has a default, so a
//! missing file or an empty document yields the stock configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::McpError;
use super::lifecycle::ClientInfo;
use super::telemetry::DEFAULT_TELEMETRY_SIZE;

/// Environment variable that points at an explicit options file.
pub const OPTIONS_PATH_ENV: &str = "MCP_LOADER_CONFIG";

/// Default timeout for a single request (ms).
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default timeout for the `initialize` call.
///
/// Servers that pull in large runtimes at startup can take a while.
const DEFAULT_INIT_TIMEOUT_MS: u64 = 30_000;

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_init_timeout_ms() -> u64 {
    DEFAULT_INIT_TIMEOUT_MS
}
fn default_telemetry_max_size() -> usize {
    DEFAULT_TELEMETRY_SIZE
}
fn default_client_name() -> String {
    env!("CARGO_PKG_NAME").to_string()
}
fn default_client_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Runtime tunables for `McpLoader`.
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderOptions {
    /// Deadline for every request after the handshake, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for the `initialize` request, in milliseconds.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    /// Number of telemetry entries kept.
    #[serde(default = "default_telemetry_max_size")]
    pub telemetry_max_size: usize,
    /// `clientInfo.name` sent in `initialize`.
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// `clientInfo.version` sent in `initialize`.
    #[serde(default = "default_client_version")]
    pub client_version: String,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            init_timeout_ms: default_init_timeout_ms(),
            telemetry_max_size: default_telemetry_max_size(),
            client_name: default_client_name(),
            client_version: default_client_version(),
        }
    }
}

impl LoaderOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }

    /// Check values that would make the loader unusable.
    pub fn validate(&self) -> Result<(), McpError> {
        if self.request_timeout_ms == 0 || self.init_timeout_ms == 0 {
            return Err(McpError::ConfigError {
                reason: "timeouts must be greater than zero".into(),
            });
        }
        if self.telemetry_max_size == 0 {
            return Err(McpError::ConfigError {
                reason: "telemetry_max_size must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Load options from a file, or defaults if it doesn't exist or is invalid.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match load_options(path) {
            Ok(options) => {
                tracing::info!(path = %path.display(), "loaded loader options");
                options
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to load loader options, using defaults");
                Self::default()
            }
        }
    }
}

/// Where the options file lives: `$MCP_LOADER_CONFIG`, else `{data_dir}/mcp_loader.yaml`.
pub fn options_path(data_dir: &Path) -> PathBuf {
    match std::env::var(OPTIONS_PATH_ENV) {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => data_dir.join("mcp_loader.yaml"),
    }
}

/// Read, parse and validate an options file.
pub fn load_options(path: &Path) -> Result<LoaderOptions, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    // An empty YAML document parses as null
    let options: LoaderOptions = if raw.trim().is_empty() {
        LoaderOptions::default()
    } else {
        serde_yaml::from_str(&raw).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse options: {e}"),
        })?
    };

    options.validate()?;
    Ok(options)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let opts = LoaderOptions::default();
        assert_eq!(opts.request_timeout(), Duration::from_secs(30));
        assert_eq!(opts.telemetry_max_size, 1000);
        assert_eq!(opts.client_name, "mcp-loader");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp_loader.yaml");
        std::fs::write(&path, "request_timeout_ms: 5000\nclient_name: surf\n").unwrap();

        let opts = load_options(&path).unwrap();
        assert_eq!(opts.request_timeout_ms, 5000);
        assert_eq!(opts.client_name, "surf");
        assert_eq!(opts.init_timeout_ms, DEFAULT_INIT_TIMEOUT_MS);
        assert_eq!(opts.telemetry_max_size, DEFAULT_TELEMETRY_SIZE);
    }

    #[test]
    fn test_empty_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp_loader.yaml");
        std::fs::write(&path, "").unwrap();
        let opts = load_options(&path).unwrap();
        assert_eq!(opts.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp_loader.yaml");
        std::fs::write(&path, "request_timeout_ms: 0\n").unwrap();
        let err = load_options(&path).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let opts = LoaderOptions::load_or_default(Path::new("/nonexistent/mcp_loader.yaml"));
        assert_eq!(opts.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_load_or_default_invalid_yaml() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mcp_loader.yaml");
        std::fs::write(&path, "request_timeout_ms: [not, a, number]\n").unwrap();
        let opts = LoaderOptions::load_or_default(&path);
        assert_eq!(opts.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }

    #[test]
    fn test_client_info() {
        let opts = LoaderOptions {
            client_name: "surf".into(),
            client_version: "1.0.0".into(),
            ..LoaderOptions::default()
        };
        let info = opts.client_info();
        assert_eq!(info.name, "surf");
        assert_eq!(info.version, "1.0.0");
    }
}
