//! Extraction and generation progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! The human reporter rewrites a single line with `\r` while a generation is
//! streaming and terminates it once the stream is done.

use serde::Serialize;
use std::io::Write;

/// Snapshot of a streaming generation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerationProgress {
    /// 0..=99 while streaming, 100 once the backend signalled completion.
    pub percent: u8,
    /// Estimated tokens so far (whitespace-delimited words, see `generate`).
    pub tokens: u64,
    /// Tokens per second since the request started.
    pub rate: f64,
    /// Seconds left at the current rate to reach the token budget.
    pub eta_secs: u64,
    pub done: bool,
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Walking the extraction root (no total yet).
    Discovering { root: String },
    /// n files read out of total.
    Extracting { n: u64, total: u64 },
    /// Corpus file written.
    Written {
        path: String,
        records: u64,
        skipped: u64,
    },
    Generating(GenerationProgress),
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { root } => {
                format!("extract {}  discovering...\n", root)
            }
            ProgressEvent::Extracting { n, total } => {
                format!(
                    "extract  {} / {} files\n",
                    format_number(*n),
                    format_number(*total)
                )
            }
            ProgressEvent::Written {
                path,
                records,
                skipped,
            } => format!(
                "extract  wrote {} ({} records, {} skipped)\n",
                path,
                format_number(*records),
                format_number(*skipped)
            ),
            ProgressEvent::Generating(p) if p.done => {
                format!("\r[generate] 100% | tokens={} | done\n", p.tokens)
            }
            ProgressEvent::Generating(p) => format!(
                "\r[generate] {:3}% | tokens={} | {:.1} t/s | ETA {}s",
                p.percent, p.tokens, p.rate, p.eta_secs
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { root } => serde_json::json!({
                "event": "progress",
                "phase": "discovering",
                "root": root
            }),
            ProgressEvent::Extracting { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "extracting",
                "n": n,
                "total": total
            }),
            ProgressEvent::Written {
                path,
                records,
                skipped,
            } => serde_json::json!({
                "event": "progress",
                "phase": "written",
                "path": path,
                "records": records,
                "skipped": skipped
            }),
            ProgressEvent::Generating(p) => serde_json::json!({
                "event": "progress",
                "phase": "generating",
                "percent": p.percent,
                "tokens": p.tokens,
                "rate": p.rate,
                "eta_secs": p.eta_secs,
                "done": p.done
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
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
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
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

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "unknown progress mode '{}': expected off, human, or json",
                other
            )),
        }
    }
}
