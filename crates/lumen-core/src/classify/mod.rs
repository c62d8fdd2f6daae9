//! Per-stream classification of worker output into handoff vs. log text.
//!
//! Bytes go in, in whatever chunks the pipe delivers them; classified
//! lines come out. Each classifier accepts at most one handoff payload.

pub mod decoder;
pub mod handoff;

use std::io;
use std::pin::Pin;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use decoder::Utf8Decoder;
pub use handoff::{CollectionHandoff, HandoffPayload, PredictionHandoff, TrainingHandoff};

use crate::launch::StageKind;

const READ_BUFFER: usize = 8 * 1024;

/// Whether a stage must, may, or must not produce a handoff payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandoffPolicy {
    #[default]
    Required,
    Optional,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierState {
    AwaitingHandoff,
    StreamingLog,
}

/// One classified line.
#[derive(Debug, Clone, PartialEq)]
pub enum Classified {
    Handoff(HandoffPayload),
    Log(String),
}

/// Line classifier for one output stream of one stage run.
#[derive(Debug)]
pub struct OutputClassifier {
    stage: StageKind,
    state: ClassifierState,
    decoder: Utf8Decoder,
    line: String,
}

impl OutputClassifier {
    pub fn new(stage: StageKind, policy: HandoffPolicy) -> Self {
        let state = match policy {
            HandoffPolicy::Disabled => ClassifierState::StreamingLog,
            HandoffPolicy::Required | HandoffPolicy::Optional => ClassifierState::AwaitingHandoff,
        };
        Self {
            stage,
            state,
            decoder: Utf8Decoder::new(),
            line: String::new(),
        }
    }

    /// A classifier that never looks for a payload (stderr).
    pub fn log_only(stage: StageKind) -> Self {
        Self::new(stage, HandoffPolicy::Disabled)
    }

    pub fn state(&self) -> ClassifierState {
        self.state
    }

    /// Feed a chunk of raw bytes; returns every line it completed.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Classified> {
        let text = self.decoder.decode(bytes);
        let mut out = Vec::new();
        self.push_text(&text, &mut out);
        out
    }

    /// End of stream: flush the decoder and any unterminated final line.
    pub fn finish(&mut self) -> Vec<Classified> {
        let tail = self.decoder.finish();
        let mut out = Vec::new();
        self.push_text(&tail, &mut out);
        if !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            out.push(self.classify_line(line));
        }
        out
    }

    fn push_text(&mut self, text: &str, out: &mut Vec<Classified>) {
        let mut rest = text;
        while let Some(pos) = rest.find('\n') {
            self.line.push_str(&rest[..pos]);
            let line = std::mem::take(&mut self.line);
            out.push(self.classify_line(line));
            rest = &rest[pos + 1..];
        }
        self.line.push_str(rest);
    }

    fn classify_line(&mut self, mut line: String) -> Classified {
        if line.ends_with('\r') {
            line.pop();
        }
        if self.state == ClassifierState::AwaitingHandoff {
            if let Some(payload) = HandoffPayload::parse(self.stage, &line) {
                self.state = ClassifierState::StreamingLog;
                return Classified::Handoff(payload);
            }
        }
        Classified::Log(line)
    }
}

/// Classify everything read from `reader` until EOF.
pub fn classify_reader<R>(
    mut reader: R,
    mut classifier: OutputClassifier,
) -> Pin<Box<dyn Stream<Item = io::Result<Classified>> + Send>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for item in classifier.feed(&buf[..n]) {
                        yield Ok(item);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
        for item in classifier.finish() {
            yield Ok(item);
        }
    })
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    fn logs(items: &[Classified]) -> Vec<&str> {
        items
            .iter()
            .filter_map(|c| match c {
                Classified::Log(s) => Some(s.as_str()),
                Classified::Handoff(_) => None,
            })
            .collect()
    }

    fn handoffs(items: &[Classified]) -> usize {
        items
            .iter()
            .filter(|c| matches!(c, Classified::Handoff(_)))
            .count()
    }

    fn run(classifier: &mut OutputClassifier, input: &[u8], chunk: usize) -> Vec<Classified> {
        let mut out = Vec::new();
        for piece in input.chunks(chunk.max(1)) {
            out.extend(classifier.feed(piece));
        }
        out.extend(classifier.finish());
        out
    }

    #[test]
    fn loading_line_then_handoff() {
        let mut classifier = OutputClassifier::new(StageKind::Collection, HandoffPolicy::Required);
        let input = b"Loading...\n{\"sampleDirectory\":\"/d\",\"modelIdentifier\":\"m1\"}\n";
        let out = run(&mut classifier, input, input.len());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], Classified::Log("Loading...".into()));
        assert_eq!(
            out[1],
            Classified::Handoff(HandoffPayload::Collection(CollectionHandoff {
                sample_directory: "/d".into(),
                model_identifier: "m1".into(),
            }))
        );
        assert_eq!(classifier.state(), ClassifierState::StreamingLog);
    }

    #[test]
    fn at_most_one_handoff_per_classifier() {
        let line = "{\"data_dir\":\"/d\",\"model_id\":\"m1\"}\n";
        let input = format!("{line}{line}{line}");
        let mut classifier = OutputClassifier::new(StageKind::Collection, HandoffPolicy::Required);
        let out = run(&mut classifier, input.as_bytes(), 7);
        assert_eq!(handoffs(&out), 1);
        assert_eq!(logs(&out).len(), 2);
        assert!(matches!(out[0], Classified::Handoff(_)));
    }

    #[test]
    fn malformed_then_fixed_first_success_wins() {
        let input = b"{\"data_dir\": \"/bad\"\n{\"data_dir\":\"/good\",\"model_id\":7}\n{\"data_dir\":\"/late\",\"model_id\":8}\n";
        let mut classifier = OutputClassifier::new(StageKind::Collection, HandoffPolicy::Required);
        let out = run(&mut classifier, input, 5);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Classified::Log("{\"data_dir\": \"/bad\"".into()));
        let Classified::Handoff(HandoffPayload::Collection(c)) = &out[1] else {
            panic!("second line should be the handoff");
        };
        assert_eq!(c.sample_directory, "/good");
        assert_eq!(c.model_identifier, "7");
        assert!(matches!(out[2], Classified::Log(_)));
    }

    #[test]
    fn chunk_size_does_not_change_output() {
        let input = "start ✓\r\n{\"data_dir\":\"/δ\",\"model_id\":\"m\"}\n\nπ done"
            .as_bytes()
            .to_vec();
        let mut reference = OutputClassifier::new(StageKind::Collection, HandoffPolicy::Required);
        let expected = run(&mut reference, &input, input.len());
        for chunk in 1..input.len() {
            let mut classifier =
                OutputClassifier::new(StageKind::Collection, HandoffPolicy::Required);
            assert_eq!(run(&mut classifier, &input, chunk), expected, "chunk {chunk}");
        }
        // Trailing \r stripped, blank line kept, unterminated tail flushed.
        assert_eq!(logs(&expected), vec!["start ✓", "", "π done"]);
    }

    #[test]
    fn disabled_policy_never_parses() {
        let mut classifier = OutputClassifier::log_only(StageKind::Collection);
        assert_eq!(classifier.state(), ClassifierState::StreamingLog);
        let out = run(&mut classifier, b"{\"data_dir\":\"/d\",\"model_id\":\"m\"}\n", 64);
        assert_eq!(handoffs(&out), 0);
        assert_eq!(logs(&out).len(), 1);
    }

    #[test]
    fn invalid_bytes_degrade_to_replacement() {
        let mut classifier = OutputClassifier::new(StageKind::Training, HandoffPolicy::Required);
        let out = run(&mut classifier, b"bad \xFF byte\n", 3);
        assert_eq!(out, vec![Classified::Log("bad \u{FFFD} byte".into())]);
    }

    #[tokio::test]
    async fn reader_stream_yields_all_lines() {
        let input: &[u8] = b"one\n{\"data_dir\":\"/d\",\"model_id\":\"m\"}\ntwo";
        let classifier = OutputClassifier::new(StageKind::Collection, HandoffPolicy::Required);
        let items: Vec<Classified> = classify_reader(input, classifier)
            .map(|item| item.expect("in-memory reads do not fail"))
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(handoffs(&items), 1);
        assert_eq!(logs(&items), vec!["one", "two"]);
    }
}
