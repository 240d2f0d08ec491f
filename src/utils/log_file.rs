//! File logging layer.
//!
//! Appends one line per event to `<data_dir>/logs/collabshare.log`:
//!
//! ```text
//! [2026-03-01T14:02:11.532+01:00] WARN collabshare::core::transfer: event = "export_checksum_mismatch", export_id = ...
//! ```
//!
//! Stderr output is handled by `tracing_subscriber::fmt`; this layer keeps a
//! full history across runs.

use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub struct FileLogLayer {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl FileLogLayer {
    /// Append to `path`, creating parent directories as needed.
    pub fn new(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file: File = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::from_writer(file))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            writer: Mutex::new(Box::new(writer)),
        }
    }
}

/// Collects structured fields in order; the free-form message is kept
/// apart and appended after them.
#[derive(Default)]
struct MessageVisitor {
    fields: String,
    message: String,
}

impl MessageVisitor {
    fn push(&mut self, field: &Field, value: std::fmt::Arguments<'_>) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push_str(", ");
        }
        let _ = write!(self.fields, "{} = {}", field.name(), value);
    }

    fn finish(self) -> String {
        match (self.fields.is_empty(), self.message.is_empty()) {
            (true, _) => self.message,
            (false, true) => self.fields,
            (false, false) => format!("{} {}", self.fields, self.message),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.push(field, format_args!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.push(field, format_args!("{value}"));
        } else {
            self.push(field, format_args!("{value:?}"));
        }
    }
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARN",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        Level::TRACE => "TRACE",
    }
}

impl<S: Subscriber> Layer<S> for FileLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let body = visitor.finish();

        let target = meta.target();
        let message = if body.is_empty() {
            target.to_string()
        } else {
            format!("{}: {}", target, body)
        };

        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z");
        let line = format!("[{}] {} {}\n", timestamp, level_str(*meta.level()), message);

        if let Ok(mut writer) = self.writer.lock() {
            let _ = writer.write_all(line.as_bytes());
            let _ = writer.flush();
        }
    }
}
