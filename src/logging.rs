//! Logging setup.
//!
//! Two sinks: stderr (the console, always on) and an optional file. The file
//! sink attaches only once the filesystems holding it are mounted, and must
//! detach before a re-exec and before shutdown unmounts everything, so the
//! file layer writes through a swappable handle rather than owning the file.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Arc, OnceLock, RwLock},
};

use tracing::info;
use tracing_subscriber::{
    EnvFilter, fmt, fmt::writer::MakeWriter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Writer target whose destination file can be swapped at runtime. While no
/// file is attached, writes are discarded.
#[derive(Clone, Default)]
struct FileSink {
    inner: Arc<RwLock<Option<File>>>,
}

/// One write handle against the sink's current file.
struct FileSinkWriter {
    inner: Arc<RwLock<Option<File>>>,
}

impl Write for FileSinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.read() {
            Ok(guard) => match guard.as_ref() {
                Some(mut file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.read() {
            Ok(guard) => match guard.as_ref() {
                Some(mut file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FileSinkWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

static SINK: OnceLock<FileSink> = OnceLock::new();

fn sink() -> &'static FileSink {
    SINK.get_or_init(FileSink::default)
}

/// Installs the global subscriber: a stderr layer filtered by `RUST_LOG`
/// (default `info`) and the initially empty file layer. Call once, early.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stderr_layer = fmt::layer().with_writer(io::stderr);
    let file_layer = fmt::layer().with_ansi(false).with_writer(sink().clone());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
}

/// Attaches (or re-targets) the file sink. The file is opened for append,
/// created if missing.
pub fn attach_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    if let Ok(mut guard) = sink().inner.write() {
        *guard = Some(file);
    }
    info!("file logging attached at {}", path.display());
    Ok(())
}

/// Re-opens the file sink at `path` only when one is currently attached.
/// Reload uses this so a daemon that never attached a file (early boot,
/// tests) does not suddenly start writing one.
pub fn refresh_file(path: &Path) -> io::Result<()> {
    let attached = sink()
        .inner
        .read()
        .map(|guard| guard.is_some())
        .unwrap_or(false);
    if attached {
        attach_file(path)?;
    }
    Ok(())
}

/// Flushes and drops the file sink. Subsequent records go to stderr only.
pub fn detach_file() {
    if let Ok(mut guard) = sink().inner.write() {
        if let Some(mut file) = guard.take() {
            let _ = file.flush();
        }
    }
}
