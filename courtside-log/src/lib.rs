//! Observability substrate: structured log ring with subscriber fan-out, a
//! size-rotated log file, and console output.
//!
//! Three sinks hang off one `tracing` registry. The in-memory ring holds the
//! most recent entries and publishes each append to subscribed consumers;
//! this is the data source for the SSE tail endpoint served elsewhere.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("failed to install global subscriber: {0}")]
    InstallFailed(String),
}

/// Number of entries the in-memory ring retains.
pub const RING_CAPACITY: usize = 1000;
/// Size at which the log file rotates.
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
/// Rotated backups kept beside the live file.
pub const BACKUP_COUNT: u32 = 5;

/// One structured entry as exposed to tail consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

/// Bounded, thread-safe ring of recent log entries with fan-out.
///
/// Subscribers receive every entry appended after they subscribe; a
/// subscriber whose channel has been closed is dropped on the next append.
#[derive(Default)]
pub struct LogRing {
    entries: Mutex<VecDeque<LogEntry>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<LogEntry>>>,
}

impl LogRing {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn append(&self, entry: LogEntry) {
        {
            let mut entries = self.entries.lock().unwrap();
            if entries.len() == RING_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(entry.clone()).is_ok());
    }

    /// The most recent `count` entries, oldest first.
    pub fn recent(&self, count: usize) -> Vec<LogEntry> {
        let entries = self.entries.lock().unwrap();
        let skip = entries.len().saturating_sub(count);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<LogEntry> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

// ---------------------------
// ring layer

struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// A `tracing` layer that captures events into a [LogRing].
pub struct RingLayer {
    ring: Arc<LogRing>,
}

impl RingLayer {
    pub fn new(ring: Arc<LogRing>) -> Self {
        RingLayer { ring }
    }
}

impl<S> Layer<S> for RingLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        let meta = event.metadata();
        self.ring.append(LogEntry {
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.message,
        });
    }
}

// ---------------------------
// rotating file writer

struct RotateState {
    path: PathBuf,
    file: File,
    written: u64,
    max_size: u64,
    backups: u32,
}

impl RotateState {
    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for n in (1..self.backups).rev() {
            let from = backup_path(&self.path, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(&self.path, n + 1))?;
            }
        }
        if self.path.exists() {
            std::fs::rename(&self.path, backup_path(&self.path, 1))?;
        }
        self.file = open_log_file(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

fn backup_path(path: &Path, n: u32) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Size-rotating writer for the file layer. Cheap to clone; all clones share
/// the rotation state.
#[derive(Clone)]
pub struct RotatingWriter {
    state: Arc<Mutex<RotateState>>,
}

impl RotatingWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_limits(path, MAX_LOG_SIZE, BACKUP_COUNT)
    }

    pub fn with_limits(path: impl Into<PathBuf>, max_size: u64, backups: u32) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = open_log_file(&path)?;
        let written = file.metadata()?.len();
        Ok(RotatingWriter {
            state: Arc::new(Mutex::new(RotateState {
                path,
                file,
                written,
                max_size,
                backups,
            })),
        })
    }
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.written + buf.len() as u64 > state.max_size && state.written > 0 {
            state.rotate()?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().file.flush()
    }
}

impl<'a> fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

// ---------------------------
// initialization

struct Guard {}

impl Drop for Guard {
    fn drop(&mut self) {}
}

/// Start logging to console, rotating file and in-memory ring.
///
/// The file and console sinks are optional; the ring is always installed so
/// the tail surface works even in console-less deployments.
pub fn initiate_logging<P: AsRef<Path>>(
    path: Option<P>,
    ring: Arc<LogRing>,
    disable_console: bool,
) -> Result<impl Drop> {
    let file_layer = match &path {
        Some(path) => {
            let writer = RotatingWriter::create(path.as_ref())?;
            Some(
                fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true),
            )
        }
        None => None,
    };

    let console_layer = if disable_console {
        None
    } else {
        Some(fmt::layer().with_ansi(!cfg!(windows)).with_target(true))
    };

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(RingLayer::new(ring))
        .with(tracing_subscriber::filter::EnvFilter::from_default_env());
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| Error::InstallFailed(e.to_string()))?;

    if let Some(path) = &path {
        tracing::debug!("logging to file {}", path.as_ref().display());
    }

    Ok(Guard {})
}
