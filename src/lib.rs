//! LocalRelay: an OpenAI-compatible relay in front of local model runtimes.
//!
//! - `inference`: runtime clients (Ollama, vLLM, any OpenAI-compatible server)
//! - `cache`: resident model instances with LRU eviction and pinning
//! - `tools`: tool registry, directive parsing and invocation
//! - `pipeline`: request orchestration, tool round-trips, SSE framing

pub mod cache;
pub mod inference;
pub mod pipeline;
pub mod tools;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Log file name inside the log directory.
pub const LOG_FILE_NAME: &str = "relay.log";

/// Rotated log files kept next to the current one.
const LOG_KEEP: u32 = 3;

/// Platform-standard data directory for LocalRelay.
///
/// Falls back to `~/.localrelay/` when the platform directory is unknown.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("localrelay");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".localrelay")
}

/// Install the global tracing subscriber.
///
/// With a `log_dir`, logs go to a freshly rotated `relay.log` there (flushed
/// line by line); otherwise, or if the file cannot be opened, to stderr.
/// `RUST_LOG` overrides the default filter. Returns the log file in use.
pub fn init_tracing(log_dir: Option<&Path>, json: bool) -> Option<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_file = log_dir.and_then(|dir| match open_log_file(dir) {
        Ok(file) => Some(file),
        Err(e) => {
            eprintln!("localrelay: cannot open log file in {}: {e}", dir.display());
            None
        }
    });

    let (writer, log_path) = match log_file {
        Some((file, path)) => (BoxMakeWriter::new(FlushingWriter::new(file)), Some(path)),
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("localrelay=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);
    // A second init (tests, embedding hosts) keeps the first subscriber.
    let _ = if json {
        builder.json().with_writer(writer).try_init()
    } else {
        builder.with_writer(writer).try_init()
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.as_deref().map(|p| p.display().to_string()).unwrap_or_else(|| "stderr".into()),
        pid = std::process::id(),
        "=== LocalRelay starting ==="
    );
    log_path
}

fn open_log_file(dir: &Path) -> std::io::Result<(std::fs::File, PathBuf)> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(LOG_FILE_NAME);
    rotate_log_file(&path, LOG_KEEP);
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    Ok((file, path))
}

/// Rotate log files: `relay.log` → `relay.log.1` → `.2` → … → `.{keep}`.
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

/// Wraps a log file and flushes after every write so lines survive a crash.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
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
