//! Terminal rendering of pipeline events and result fields.

use std::fmt::Write as _;

use serde_json::{Map, Value};

use lumen_core::pipeline::PipelineEvent;
use lumen_core::sink::ResultDisplay;
use lumen_core::stage::{StageEvent, StreamKind, Transcript};

/// Fields shown first, in this order, when a prediction is presented.
const PREDICTION_SUMMARY: &[&str] = &[
    "prediction-score",
    "std-err-estimate",
    "error-proba-mean",
    "error-proba-std-dev",
    "error-proba-variance",
];

/// Prints prediction results to stdout.
#[derive(Debug, Default)]
pub struct TerminalDisplay;

impl ResultDisplay for TerminalDisplay {
    fn present(&self, fields: &Map<String, Value>) {
        print!("{}", render_prediction(fields));
    }
}

/// One line per event, or `None` for events not worth printing.
pub fn render_event(event: &PipelineEvent) -> Option<String> {
    match event {
        PipelineEvent::StateChanged(state) => Some(format!("==> {state}")),
        PipelineEvent::Stage { stage, event } => match event {
            StageEvent::Spawned { pid } => Some(format!("[{stage}] worker started (pid {pid})")),
            StageEvent::Log(chunk) => {
                let marker = match chunk.stream {
                    StreamKind::Stdout => '|',
                    StreamKind::Stderr => '!',
                };
                Some(format!("[{stage}] {marker} {}", chunk.text))
            }
            StageEvent::Handoff(_) => Some(format!("[{stage}] result received")),
            StageEvent::Exited(exit) => Some(format!("[{stage}] worker finished ({exit})")),
        },
    }
}

pub fn render_prediction(fields: &Map<String, Value>) -> String {
    let mut out = String::from("\nPrediction:\n");
    for key in PREDICTION_SUMMARY {
        if let Some(value) = fields.get(*key) {
            let _ = writeln!(out, "  {key}: {}", scalar(value));
        }
    }
    out
}

/// Render every field, sorted by key, one per line.
pub fn render_fields(fields: &Map<String, Value>) -> String {
    let width = fields.keys().map(String::len).max().unwrap_or(0);
    let mut out = String::new();
    let mut keys: Vec<&String> = fields.keys().collect();
    keys.sort();
    for key in keys {
        let _ = writeln!(out, "  {key:<width$}  {}", scalar(&fields[key]));
    }
    out
}

/// The last `limit` lines of a transcript, for error reports.
pub fn transcript_tail(transcript: &Transcript, limit: usize) -> String {
    let chunks = transcript.chunks();
    let skip = chunks.len().saturating_sub(limit);
    let mut out = String::new();
    for chunk in &chunks[skip..] {
        let _ = writeln!(out, "  {}", chunk.text);
    }
    out
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => format!("[{} items]", items.len()),
        Value::Object(map) => format!("{{{} keys}}", map.len()),
        other => other.to_string(),
    }
}
