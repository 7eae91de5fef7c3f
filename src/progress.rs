//! Enrichment progress reporting.
//!
//! Reports observable progress during `onto enrich` so users see how many
//! segments a pass has, how far the workers are, and when the merge runs.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::{Arc, Mutex};

/// A single progress event for an enrichment run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Pass `pass` split the content into `total_segments` segments.
    Segmenting { pass: usize, total_segments: usize },
    /// Segment `segment` (0-based) of `total` finished, successfully or not.
    ProcessingSegment {
        pass: usize,
        segment: usize,
        total: usize,
    },
    /// All workers of the pass are done; the merge call is starting.
    Merging { pass: usize },
}

/// Reports enrichment progress. Called concurrently from segment workers.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "pass 1  segment  12 / 1,024".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Segmenting {
                pass,
                total_segments,
            } => format!(
                "pass {}  segmenting  {} segments\n",
                pass,
                format_number(*total_segments as u64)
            ),
            ProgressEvent::ProcessingSegment {
                pass,
                segment,
                total,
            } => format!(
                "pass {}  segment  {} / {}\n",
                pass,
                format_number(*segment as u64 + 1),
                format_number(*total as u64)
            ),
            ProgressEvent::Merging { pass } => format!("pass {}  merging...\n", pass),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Segmenting {
                pass,
                total_segments,
            } => serde_json::json!({
                "event": "progress",
                "pass": pass,
                "phase": "segmenting",
                "total": total_segments
            }),
            ProgressEvent::ProcessingSegment {
                pass,
                segment,
                total,
            } => serde_json::json!({
                "event": "progress",
                "pass": pass,
                "phase": "processing_segment",
                "n": segment + 1,
                "total": total
            }),
            ProgressEvent::Merging { pass } => serde_json::json!({
                "event": "progress",
                "pass": pass,
                "phase": "merging"
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Keeps every event in memory, for tests and embedding callers.
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl ProgressReporter for RecordingProgress {
    fn report(&self, event: ProgressEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
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
                "invalid progress mode '{}': expected off, human or json",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn recording_keeps_order() {
        let rec = RecordingProgress::default();
        rec.report(ProgressEvent::Segmenting {
            pass: 1,
            total_segments: 2,
        });
        rec.report(ProgressEvent::Merging { pass: 1 });
        assert_eq!(rec.events().len(), 2);
        assert_eq!(rec.events()[1], ProgressEvent::Merging { pass: 1 });
    }

    #[test]
    fn parses_modes() {
        assert_eq!("json".parse::<ProgressMode>(), Ok(ProgressMode::Json));
        assert!("loud".parse::<ProgressMode>().is_err());
    }
}
