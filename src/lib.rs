pub mod mcp_client;
pub mod settings;

use std::path::{Path, PathBuf};

use mcp_client::config::{options_path, LoaderOptions};
use mcp_client::{initialize_mcp, shutdown_mcp};
use settings::JsonFileSettingsStore;

/// Environment variable that switches the stderr log to JSON lines.
pub const LOG_JSON_ENV: &str = "MCP_LOADER_LOG_JSON";

/// Return the platform-standard data directory for the loader.
///
/// - macOS: `~/Library/Application Support/mcp-loader/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-loader\`
/// - Linux: `$XDG_DATA_HOME/mcp-loader/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-loader/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-loader");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-loader")
}

/// Initialize the tracing subscriber.
///
/// Logs go to stderr and, when the data directory is writable, to a
/// line-flushed `mcp-loader.log` rotated on every start (last 3 kept).
pub fn init_tracing(log_dir: &Path) {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::MakeWriterExt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcp_loader=info,warn"));
    let json = std::env::var_os(LOG_JSON_ENV).is_some();

    let log_path = log_dir.join("mcp-loader.log");
    let log_file = std::fs::create_dir_all(log_dir).and_then(|_| {
        rotate_log_file(&log_path, 3);
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
    });

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let file_error = match log_file {
        Ok(file) => {
            let writer = FlushingWriter::new(file).and(std::io::stderr);
            if json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_writer(writer).init();
            }
            None
        }
        Err(e) => {
            if json {
                builder.json().with_writer(std::io::stderr).init();
            } else {
                builder.with_writer(std::io::stderr).init();
            }
            Some(e)
        }
    };

    if let Some(e) = file_error {
        tracing::warn!(error = %e, path = %log_path.display(), "log file unavailable, logging to stderr only");
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== mcp-loader starting ==="
    );
}

/// Rotate log files: `mcp-loader.log` → `.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Keeps each log line on disk even if the process is killed.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Run the loader until Ctrl-C, then stop every server.
pub async fn run() -> anyhow::Result<()> {
    let dir = data_dir();
    init_tracing(&dir);

    let options = LoaderOptions::load_or_default(&options_path(&dir));
    let store = JsonFileSettingsStore::in_data_dir(&dir);
    tracing::info!(settings = %store.path().display(), "reading MCP server settings");

    let loader = initialize_mcp(&store, options).await;

    for state in loader.all_servers().await {
        match &state.error {
            Some(error) => tracing::warn!(
                server = %state.id,
                status = %state.status,
                error = %error,
                "MCP server not available"
            ),
            None => tracing::info!(
                server = %state.id,
                status = %state.status,
                pid = ?state.pid,
                tools = state.tools.len(),
                "MCP server status"
            ),
        }
    }
    tracing::info!(
        running_servers = loader.running_server_count().await,
        total_tools = loader.all_tools().await.len(),
        "MCP loader ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    shutdown_mcp(&loader).await;

    let stats = loader.telemetry_stats().await;
    tracing::info!(
        total_calls = stats.total_calls,
        success_rate = stats.success_rate,
        "=== mcp-loader stopped ==="
    );
    Ok(())
}
