pub mod mcp_client;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

pub use mcp_client::{McpClient, McpError, McpServersConfig};

use mcp_client::MapSecrets;

/// Return the platform-standard data directory for mcphub.
///
/// - macOS: `~/Library/Application Support/mcphub/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcphub\`
/// - Linux: `$XDG_DATA_HOME/mcphub/` (fallback `~/.local/share/mcphub/`)
///
/// Falls back to `~/.mcphub/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcphub");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcphub")
}

/// Working directories handed to tool servers through config placeholders.
///
/// `data` is the filesystem server's root; `memory` holds the memory
/// server's knowledge-graph file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDirs {
    pub data: PathBuf,
    pub memory: PathBuf,
}

impl DataDirs {
    /// Layout under `root`: `root/data` and `root/memory_data`.
    pub fn under(root: &Path) -> Self {
        Self {
            data: root.join("data"),
            memory: root.join("memory_data"),
        }
    }

    pub fn memory_file(&self) -> PathBuf {
        self.memory.join("memory.json")
    }

    /// Create both directories if they are missing.
    pub fn provision(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data)?;
        std::fs::create_dir_all(&self.memory)?;
        tracing::debug!(
            data = %self.data.display(),
            memory = %self.memory.display(),
            "data directories ready"
        );
        Ok(())
    }

    /// Placeholder values: `MCPHUB_DATA_DIR`, `MCPHUB_MEMORY_DIR` and
    /// `MCPHUB_MEMORY_FILE`.
    pub fn secrets(&self) -> MapSecrets {
        MapSecrets::new()
            .with("MCPHUB_DATA_DIR", self.data.display().to_string())
            .with("MCPHUB_MEMORY_DIR", self.memory.display().to_string())
            .with("MCPHUB_MEMORY_FILE", self.memory_file().display().to_string())
    }
}

/// Where log output goes.
#[derive(Debug, Clone, Default)]
pub enum LogTarget {
    /// Human-readable lines on stderr. Stdout stays free for command output.
    #[default]
    Stderr,
    /// A rotated log file (`hub.log` → `.1` → `.2` → `.3`).
    File(PathBuf),
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter (`mcphub=info,warn`). With a
/// file target, existing logs are rotated first and every line is flushed
/// as it is written.
pub fn init_tracing(target: &LogTarget, json: bool) -> std::io::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mcphub=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false);

    match target {
        LogTarget::Stderr => {
            let builder = builder.with_writer(std::io::stderr);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
        LogTarget::File(path) => {
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(path, 3);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            let builder = builder
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
        }
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir().display(),
        pid = std::process::id(),
        "=== mcphub starting ==="
    );
    Ok(())
}

/// Shift `path` to `path.1`, `.1` to `.2` and so on, dropping `.{keep}`.
fn rotate_log_file(path: &Path, keep: u32) {
    let numbered = |n: u32| PathBuf::from(format!("{}.{n}", path.display()));

    let _ = std::fs::remove_file(numbered(keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered(n), numbered(n + 1));
    }
    if path.exists() {
        let _ = std::fs::rename(path, numbered(1));
    }
}

/// Log sink that flushes each record, so a killed hub keeps its last lines.
#[derive(Clone)]
struct FlushingWriter(Arc<Mutex<std::fs::File>>);

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut file = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(buf)?;
        file.flush()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
