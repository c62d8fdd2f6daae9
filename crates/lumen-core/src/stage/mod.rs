//! Stage runner: one worker process from spawn to outcome.
//!
//! The runner spawns the worker, classifies stdout and stderr concurrently
//! with the exit wait, and emits every classified line live to an optional
//! observer before folding them into the [`StageOutcome`].

use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{Classified, HandoffPayload, HandoffPolicy, OutputClassifier, classify_reader};
use crate::error::StageError;
use crate::launch::{LaunchSpec, StageKind, StageParams, WorkerLaunchDescriptor};
use crate::process::{ProcessHandle, WorkerExit, signal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        })
    }
}

/// One decoded line of worker output, terminator removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub stream: StreamKind,
    pub text: String,
}

impl LogChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: StreamKind::Stderr,
            text: text.into(),
        }
    }
}

/// Ordered, append-only worker log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    chunks: Vec<LogChunk>,
}

impl Transcript {
    pub fn push(&mut self, chunk: LogChunk) {
        self.chunks.push(chunk);
    }

    pub fn chunks(&self) -> &[LogChunk] {
        &self.chunks
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Lines from one stream, in order.
    pub fn lines(&self, stream: StreamKind) -> impl Iterator<Item = &str> {
        self.chunks
            .iter()
            .filter(move |c| c.stream == stream)
            .map(|c| c.text.as_str())
    }

    /// All lines joined with `\n`.
    pub fn render(&self) -> String {
        self.chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Live notifications from a running stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Spawned { pid: u32 },
    Log(LogChunk),
    Handoff(HandoffPayload),
    Exited(WorkerExit),
}

/// Per-stage execution limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageConfig {
    /// Wall-clock limit for the worker; `None` means unlimited.
    pub timeout: Option<Duration>,
    /// Time between SIGTERM and SIGKILL when terminating.
    pub terminate_grace: Duration,
    /// Treat a non-zero exit as a stage failure.
    pub fail_on_nonzero_exit: bool,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            terminate_grace: Duration::from_secs(5),
            fail_on_nonzero_exit: false,
        }
    }
}

/// What a completed stage produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub stage: StageKind,
    pub handoff: Option<HandoffPayload>,
    pub transcript: Transcript,
    pub exit: WorkerExit,
}

enum Interrupt {
    Cancelled,
    TimedOut(Duration),
}

enum Ended {
    Exited(WorkerExit),
    Interrupted(Interrupt, Option<WorkerExit>),
}

/// Drives one stage end to end.
#[derive(Debug, Clone)]
pub struct StageRunner {
    stage: StageKind,
    spec: LaunchSpec,
    config: StageConfig,
    policy: HandoffPolicy,
}

impl StageRunner {
    pub fn new(
        descriptor: &WorkerLaunchDescriptor,
        params: &StageParams,
        config: StageConfig,
    ) -> Self {
        Self {
            stage: params.kind(),
            spec: LaunchSpec::build(descriptor, params),
            config,
            policy: HandoffPolicy::Required,
        }
    }

    pub fn with_handoff_policy(mut self, policy: HandoffPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run the worker to completion.
    ///
    /// Events are sent to `observer` as they happen. Cancelling `cancel`
    /// terminates the worker's process tree and yields
    /// [`StageError::Cancelled`].
    pub async fn run(
        self,
        observer: Option<UnboundedSender<StageEvent>>,
        cancel: CancellationToken,
    ) -> Result<StageOutcome, StageError> {
        let stage = self.stage;
        let emit = |event: StageEvent| {
            if let Some(tx) = &observer {
                let _ = tx.send(event);
            }
        };

        if cancel.is_cancelled() {
            return Err(StageError::Cancelled {
                stage,
                transcript: Transcript::default(),
            });
        }

        let mut handle =
            ProcessHandle::spawn(&self.spec).map_err(|source| StageError::Spawn { stage, source })?;
        let pid = handle.pid();
        info!(%stage, pid, "stage started");
        emit(StageEvent::Spawned { pid });

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<(StreamKind, Classified)>();
        // Cancelled once both streams reached EOF.
        let output_done = CancellationToken::new();
        // Cancelled to abandon streams still held open by escaped processes.
        let stop_reading = CancellationToken::new();

        let drain_stdout = drain(
            handle.take_stdout(),
            OutputClassifier::new(stage, self.policy),
            StreamKind::Stdout,
            line_tx.clone(),
            stop_reading.clone(),
        );
        let drain_stderr = drain(
            handle.take_stderr(),
            OutputClassifier::log_only(stage),
            StreamKind::Stderr,
            line_tx,
            stop_reading.clone(),
        );

        let collect = async {
            let mut transcript = Transcript::default();
            let mut handoff = None;
            while let Some((stream, item)) = line_rx.recv().await {
                match item {
                    Classified::Log(text) => {
                        let chunk = LogChunk { stream, text };
                        emit(StageEvent::Log(chunk.clone()));
                        transcript.push(chunk);
                    }
                    Classified::Handoff(payload) => {
                        debug!(%stage, pid, "handoff payload received");
                        emit(StageEvent::Handoff(payload.clone()));
                        handoff = Some(payload);
                    }
                }
            }
            output_done.cancel();
            (transcript, handoff)
        };

        let grace = self.config.terminate_grace;
        let limit = self.config.timeout;
        let supervise = async {
            let deadline = deadline(limit);
            tokio::pin!(deadline);
            let timeout = limit.unwrap_or_default();

            let (interrupt, exited) = tokio::select! {
                result = handle.wait() => {
                    let exit = match result {
                        Ok(exit) => exit,
                        Err(e) => return Err(e),
                    };
                    // The stage is over only once its output is closed; a
                    // descendant may still hold the pipes.
                    tokio::select! {
                        _ = output_done.cancelled() => return Ok(Ended::Exited(exit)),
                        _ = cancel.cancelled() => (Interrupt::Cancelled, Some(exit)),
                        _ = &mut deadline => (Interrupt::TimedOut(timeout), Some(exit)),
                    }
                }
                _ = cancel.cancelled() => (Interrupt::Cancelled, None),
                _ = &mut deadline => (Interrupt::TimedOut(timeout), None),
            };

            let exit = match exited {
                Some(exit) => {
                    terminate_orphans(stage, pid, grace, &output_done).await;
                    Some(exit)
                }
                None => {
                    if let Err(e) = handle.terminate(grace).await {
                        warn!(%stage, pid, error = %e, "failed to terminate worker");
                    }
                    handle.try_exit().ok().flatten()
                }
            };

            if tokio::time::timeout(grace, output_done.cancelled())
                .await
                .is_err()
            {
                warn!(%stage, pid, "worker output still open after termination, abandoning it");
                stop_reading.cancel();
            }
            Ok::<_, std::io::Error>(Ended::Interrupted(interrupt, exit))
        };

        let ((), (), (transcript, handoff), ended) =
            tokio::join!(drain_stdout, drain_stderr, collect, supervise);

        let ended = ended.map_err(|source| StageError::Wait { stage, source })?;

        let exit = match ended {
            Ended::Exited(exit) => exit,
            Ended::Interrupted(interrupt, exit) => {
                if let Some(exit) = exit {
                    emit(StageEvent::Exited(exit));
                }
                return Err(match interrupt {
                    Interrupt::Cancelled => {
                        info!(%stage, pid, "stage cancelled");
                        StageError::Cancelled { stage, transcript }
                    }
                    Interrupt::TimedOut(timeout) => {
                        warn!(%stage, pid, ?timeout, "stage timed out");
                        StageError::TimedOut {
                            stage,
                            timeout,
                            transcript,
                        }
                    }
                });
            }
        };

        emit(StageEvent::Exited(exit));
        info!(%stage, pid, %exit, lines = transcript.len(), "stage finished");

        if !exit.success() {
            if self.config.fail_on_nonzero_exit {
                return Err(StageError::NonZeroExit {
                    stage,
                    exit,
                    transcript,
                });
            }
            warn!(%stage, pid, %exit, "worker exited unsuccessfully");
        }

        if handoff.is_none() && self.policy == HandoffPolicy::Required {
            return Err(StageError::MissingHandoff {
                stage,
                transcript,
                exit,
            });
        }

        Ok(StageOutcome {
            stage,
            handoff,
            transcript,
            exit,
        })
    }
}

async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM what is left of an exited worker's process group, then SIGKILL
/// if its output is still open after `grace`.
async fn terminate_orphans(
    stage: StageKind,
    pid: u32,
    grace: Duration,
    output_done: &CancellationToken,
) {
    if let Err(e) = signal::terminate_group(pid) {
        debug!(%stage, pid, error = %e, "no process group left to signal");
        return;
    }
    if tokio::time::timeout(grace, output_done.cancelled())
        .await
        .is_err()
    {
        warn!(%stage, pid, "orphaned worker processes ignored SIGTERM, sending SIGKILL");
        if let Err(e) = signal::kill_group(pid) {
            debug!(%stage, pid, error = %e, "group SIGKILL failed");
        }
    }
}

async fn drain<R>(
    reader: Option<R>,
    classifier: OutputClassifier,
    stream: StreamKind,
    tx: UnboundedSender<(StreamKind, Classified)>,
    stop: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(reader) = reader else { return };
    let mut items = classify_reader(reader, classifier);
    loop {
        let item = tokio::select! {
            item = items.next() => item,
            _ = stop.cancelled() => break,
        };
        match item {
            Some(Ok(item)) => {
                if tx.send((stream, item)).is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!(%stream, error = %e, "error reading worker output");
                break;
            }
            None => break,
        }
    }
}
