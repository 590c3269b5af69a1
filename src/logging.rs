//! Async log sink with per-day file rotation.
//!
//! Producers push records onto a queue; one background thread drains it
//! and appends `[LEVEL] HH:MM:SS => <msg>` lines to `YYYY-M-D-log.txt`
//! in the sink's directory. The file is opened in append mode per write,
//! so rotation is just the date changing between writes.
//!
//! The sink doubles as a `tracing_subscriber` writer, so `tracing::info!`
//! and `tracing::error!` land in the same file as direct [`AsyncLogger`]
//! calls.

use chrono::{Datelike, Local, Timelike};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing_subscriber::fmt::MakeWriter;

/// Record severity. Only two levels exist on the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    fn tag(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Error => "ERROR",
        }
    }
}

enum Msg {
    Record(LogLevel, String),
    Flush(mpsc::SyncSender<()>),
}

/// Handle to the async log sink. Cheap to clone; all clones feed the
/// same writer thread.
#[derive(Clone)]
pub struct AsyncLogger {
    tx: mpsc::Sender<Msg>,
    min_level: LogLevel,
}

impl std::fmt::Debug for AsyncLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLogger").field("min_level", &self.min_level).finish()
    }
}

impl AsyncLogger {
    /// Sink writing into the process working directory.
    pub fn new() -> Self {
        Self::with_dir(".")
    }

    /// Sink writing daily files under `dir`.
    pub fn with_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("log-writer".into())
            .spawn(move || writer_loop(dir, rx))
            .expect("spawn log writer thread");
        Self { tx, min_level: LogLevel::Info }
    }

    /// Drop records below `level`.
    pub fn with_min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    pub fn info(&self, msg: impl Into<String>) {
        self.log(LogLevel::Info, msg);
    }

    pub fn error(&self, msg: impl Into<String>) {
        self.log(LogLevel::Error, msg);
    }

    pub fn log(&self, level: LogLevel, msg: impl Into<String>) {
        if level < self.min_level {
            return;
        }
        // Send fails only when the writer thread is gone; nothing to do then.
        let _ = self.tx.send(Msg::Record(level, msg.into()));
    }

    /// Block until every record queued so far has hit the file.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::sync_channel(0);
        if self.tx.send(Msg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Install this sink as the global `tracing` writer.
    ///
    /// ERROR events map to [`LogLevel::Error`], everything else to
    /// [`LogLevel::Info`]. Returns quietly if a subscriber is already set
    /// (tests install their own).
    pub fn install_tracing(&self) {
        let _ = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .without_time()
            .with_level(false)
            .with_target(false)
            .try_init();
    }
}

impl Default for AsyncLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn writer_loop(dir: PathBuf, rx: mpsc::Receiver<Msg>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Msg::Record(level, text) => write_record(&dir, level, &text),
            Msg::Flush(ack) => drop(ack),
        }
    }
}

fn write_record(dir: &Path, level: LogLevel, text: &str) {
    let now = Local::now();
    let name = format!("{}-{}-{}-log.txt", now.year(), now.month(), now.day());
    let path = dir.join(name);
    let file = OpenOptions::new().create(true).append(true).open(&path);
    let mut file = match file {
        Ok(f) => f,
        Err(e) => {
            // Losing the log sink is fatal for the process.
            eprintln!("log file {} open error: {e}", path.display());
            std::process::exit(1);
        }
    };
    let line = format!(
        "[{}] {:02}:{:02}:{:02} => {}\n",
        level.tag(),
        now.hour(),
        now.minute(),
        now.second(),
        text.trim_end_matches('\n'),
    );
    if let Err(e) = file.write_all(line.as_bytes()) {
        eprintln!("log file {} write error: {e}", path.display());
    }
}

/// Writer handed to `tracing_subscriber`; one per event, tagged with the
/// event's severity.
pub struct EventWriter {
    logger: AsyncLogger,
    level: LogLevel,
}

impl std::io::Write for EventWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let trimmed = text.trim_end();
        if !trimmed.is_empty() {
            self.logger.log(self.level, trimmed.to_string());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for AsyncLogger {
    type Writer = EventWriter;

    fn make_writer(&'a self) -> Self::Writer {
        EventWriter { logger: self.clone(), level: LogLevel::Info }
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        let level = if *meta.level() == tracing::Level::ERROR {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        EventWriter { logger: self.clone(), level }
    }
}
