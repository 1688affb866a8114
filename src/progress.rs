//! Download and ingest progress reporting.
//!
//! Progress goes to **stderr** so the command reports on stdout stay
//! parseable. The mirror emits mapping and transfer events; the ingest
//! pipeline emits one event per stored document.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Walking the remote tree; counts grow as folders are listed.
    Mapping { folders: u64, files: u64 },
    /// Starting transfer `n` of `total`.
    Transfer { n: u64, total: u64, path: String },
    /// Byte progress of the current transfer, when the size is known.
    TransferPercent { path: String, percent: u8 },
    /// `n` of `total` documents stored.
    Ingesting { n: u64, total: u64 },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly lines: "download  12 / 340  Reports/q3.docx".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = human_line(&event);
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&json_value(&event)) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn human_line(event: &ProgressEvent) -> String {
    match event {
        ProgressEvent::Mapping { folders, files } => format!(
            "mapping  {} folders, {} files\n",
            format_number(*folders),
            format_number(*files)
        ),
        ProgressEvent::Transfer { n, total, path } => format!(
            "download  {} / {}  {}\n",
            format_number(*n),
            format_number(*total),
            path
        ),
        ProgressEvent::TransferPercent { path, percent } => {
            format!("download  {}  {}%\n", path, percent)
        }
        ProgressEvent::Ingesting { n, total } => format!(
            "ingest  {} / {} documents\n",
            format_number(*n),
            format_number(*total)
        ),
    }
}

fn json_value(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Mapping { folders, files } => serde_json::json!({
            "event": "progress",
            "phase": "mapping",
            "folders": folders,
            "files": files
        }),
        ProgressEvent::Transfer { n, total, path } => serde_json::json!({
            "event": "progress",
            "phase": "transfer",
            "n": n,
            "total": total,
            "path": path
        }),
        ProgressEvent::TransferPercent { path, percent } => serde_json::json!({
            "event": "progress",
            "phase": "transfer",
            "path": path,
            "percent": percent
        }),
        ProgressEvent::Ingesting { n, total } => serde_json::json!({
            "event": "progress",
            "phase": "ingesting",
            "n": n,
            "total": total
        }),
    }
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// `--progress` values.
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
