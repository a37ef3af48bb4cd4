//! Structured logging setup.
//!
//! Adapted from the teacher's `log.rs`: a [`Logger`] wraps a
//! `tracing_subscriber` reload handle so the active filter can be changed at
//! runtime (e.g. from a future admin endpoint) without restarting the
//! process. Unlike the teacher, this daemon has no syslog target — the
//! control plane runs under whatever supervisor starts it, which is
//! expected to capture stdout/stderr itself, plus an optional file target.

use std::fs::OpenOptions;
use std::io;
use std::sync::{Arc, Mutex, RwLock};

use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::config::{LogTarget, LoggingConfig};

//----------- Logger -------------------------------------------------------------

/// A handle onto the process-global logging subscriber, letting both the
/// active filter and the output target be swapped out after startup.
pub struct Logger {
    reload_handle: reload::Handle<EnvFilter, Registry>,
    writer: Arc<DynamicWriter>,
}

impl Logger {
    /// Install the global tracing subscriber with a permissive startup
    /// filter (`info`) writing to stderr. Call [`Logger::apply`] once the
    /// configuration file has been parsed to switch to its requested level
    /// and target.
    pub fn launch() -> Self {
        let startup_filter = EnvFilter::new("info");
        let (filter, reload_handle) = reload::Layer::new(startup_filter);

        let writer = Arc::new(DynamicWriter::new(TargetWriter::Stderr));
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(supports_color())
            .with_writer(writer.clone());

        Registry::default().with(filter).with(fmt_layer).init();

        Self { reload_handle, writer }
    }

    /// Reconfigure the active filter and output target from a loaded
    /// [`LoggingConfig`].
    pub fn apply(&self, config: &LoggingConfig) -> Result<(), LogConfigError> {
        let directive = config.filter.clone().unwrap_or_else(|| {
            let level: LevelFilter = config.level.into();
            level.to_string()
        });
        let new_filter = EnvFilter::try_new(&directive)
            .map_err(|err| LogConfigError::InvalidFilter(directive.clone(), err))?;
        self.reload_handle
            .reload(new_filter)
            .map_err(LogConfigError::Reload)?;

        let target = open_target(&config.target).map_err(LogConfigError::Target)?;
        self.writer.swap(target);
        Ok(())
    }
}

/// Resolve a [`LoggingConfig`] target into an object implementing
/// `MakeWriter`, opening the backing file (if any) up front so a
/// misconfigured path fails at startup rather than on the first log line.
fn open_target(target: &LogTarget) -> io::Result<TargetWriter> {
    match target {
        LogTarget::Stdout => Ok(TargetWriter::Stdout),
        LogTarget::Stderr => Ok(TargetWriter::Stderr),
        LogTarget::File { path } => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Ok(TargetWriter::File(Arc::new(Mutex::new(file))))
        }
    }
}

#[derive(Clone)]
enum TargetWriter {
    Stdout,
    Stderr,
    File(Arc<Mutex<std::fs::File>>),
}

impl io::Write for TargetWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stdout => io::stdout().write(buf),
            Self::Stderr => io::stderr().write(buf),
            Self::File(file) => file.lock().unwrap().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stdout => io::stdout().flush(),
            Self::Stderr => io::stderr().flush(),
            Self::File(file) => file.lock().unwrap().flush(),
        }
    }
}

/// A `MakeWriter` whose backing target can be replaced after the subscriber
/// has already been installed, since [`Logger::launch`] runs before the
/// configuration file is loaded. Each call hands out an owned clone of the
/// current target rather than a borrow, so swapping it never races with an
/// in-flight write.
struct DynamicWriter(RwLock<TargetWriter>);

impl DynamicWriter {
    fn new(initial: TargetWriter) -> Self {
        Self(RwLock::new(initial))
    }

    fn swap(&self, target: TargetWriter) {
        *self.0.write().unwrap() = target;
    }
}

impl<'a> MakeWriter<'a> for DynamicWriter {
    type Writer = TargetWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.0.read().unwrap().clone()
    }
}

fn supports_color() -> bool {
    supports_color::on(supports_color::Stream::Stderr).is_some()
}

//----------- LogConfigError -----------------------------------------------------

#[derive(Debug)]
pub enum LogConfigError {
    InvalidFilter(String, tracing_subscriber::filter::ParseError),
    Reload(reload::Error),
    Target(io::Error),
}

impl std::fmt::Display for LogConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFilter(directive, err) => {
                write!(f, "invalid log filter '{directive}': {err}")
            }
            Self::Reload(err) => write!(f, "failed to apply log filter: {err}"),
            Self::Target(err) => write!(f, "failed to open log target: {err}"),
        }
    }
}

impl std::error::Error for LogConfigError {}
