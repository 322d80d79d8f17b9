//! Ingest progress reporting.
//!
//! Progress goes to **stderr** so stdout stays parseable when `--json` is
//! used. The batch processor emits events; the CLI picks a reporter.

use std::io::Write;
use std::path::Path;

/// A single progress event for a batch run.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// Walking the ingest root. Total unknown.
    Discovering { root: String },
    /// `n` of `total` files finished (any outcome).
    Processing {
        root: String,
        n: u64,
        total: u64,
        file: String,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

impl IngestProgressEvent {
    /// One human-readable line, with the finished file shown relative to
    /// the root: "ingest ./docs  processing  12 / 1,204 files  acts/gst.pdf".
    pub fn human_line(&self) -> String {
        match self {
            IngestProgressEvent::Discovering { root } => format!("ingest {}  discovering...", root),
            IngestProgressEvent::Processing {
                root,
                n,
                total,
                file,
            } => {
                let shown = Path::new(file)
                    .strip_prefix(root)
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|_| file.clone());
                format!(
                    "ingest {}  processing  {} / {} files  {}",
                    root,
                    format_number(*n),
                    format_number(*total),
                    shown
                )
            }
        }
    }
}

pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{}", event.human_line());
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "root": root,
                "phase": "discovering"
            }),
            IngestProgressEvent::Processing {
                root,
                n,
                total,
                file,
            } => serde_json::json!({
                "event": "progress",
                "root": root,
                "phase": "processing",
                "n": n,
                "total": total,
                "file": file
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
