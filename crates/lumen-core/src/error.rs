//! Error taxonomy shared by the stage runner and the pipeline controller.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::launch::StageKind;
use crate::pipeline::PipelineState;
use crate::process::WorkerExit;
use crate::stage::Transcript;

/// Errors raised while starting a worker process.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The executable (or the working directory) does not exist.
    #[error("worker executable not found: {executable}")]
    NotFound {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The OS refused to start the process.
    #[error("failed to spawn {executable}: {source}")]
    Os {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a stage (and therefore its pipeline) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    Spawn,
    MissingHandoff,
    NonZeroExit,
    Cancelled,
    TimedOut,
    Io,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::Spawn => "spawn failed",
            FailureReason::MissingHandoff => "missing handoff",
            FailureReason::NonZeroExit => "non-zero exit",
            FailureReason::Cancelled => "cancelled",
            FailureReason::TimedOut => "timed out",
            FailureReason::Io => "i/o error",
        };
        f.write_str(s)
    }
}

/// A stage that did not produce a usable outcome.
///
/// Every variant that ran a worker carries the transcript collected up to
/// the failure so callers can show the worker's own diagnostics.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("{stage} stage failed to start: {source}")]
    Spawn {
        stage: StageKind,
        #[source]
        source: SpawnError,
    },

    #[error("{stage} stage exited ({exit}) without emitting a handoff payload")]
    MissingHandoff {
        stage: StageKind,
        transcript: Transcript,
        exit: WorkerExit,
    },

    #[error("{stage} stage exited unsuccessfully ({exit})")]
    NonZeroExit {
        stage: StageKind,
        exit: WorkerExit,
        transcript: Transcript,
    },

    #[error("{stage} stage was cancelled")]
    Cancelled {
        stage: StageKind,
        transcript: Transcript,
    },

    #[error("{stage} stage timed out after {timeout:?}")]
    TimedOut {
        stage: StageKind,
        timeout: Duration,
        transcript: Transcript,
    },

    #[error("failed waiting on {stage} worker: {source}")]
    Wait {
        stage: StageKind,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    pub fn stage(&self) -> StageKind {
        match self {
            StageError::Spawn { stage, .. }
            | StageError::MissingHandoff { stage, .. }
            | StageError::NonZeroExit { stage, .. }
            | StageError::Cancelled { stage, .. }
            | StageError::TimedOut { stage, .. }
            | StageError::Wait { stage, .. } => *stage,
        }
    }

    /// The worker log collected before the failure, if a worker ran.
    pub fn transcript(&self) -> Option<&Transcript> {
        match self {
            StageError::MissingHandoff { transcript, .. }
            | StageError::NonZeroExit { transcript, .. }
            | StageError::Cancelled { transcript, .. }
            | StageError::TimedOut { transcript, .. } => Some(transcript),
            StageError::Spawn { .. } | StageError::Wait { .. } => None,
        }
    }

    /// Exit status of the worker, when it is known.
    pub fn exit(&self) -> Option<WorkerExit> {
        match self {
            StageError::MissingHandoff { exit, .. } | StageError::NonZeroExit { exit, .. } => {
                Some(*exit)
            }
            _ => None,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            StageError::Spawn { .. } => FailureReason::Spawn,
            StageError::MissingHandoff { .. } => FailureReason::MissingHandoff,
            StageError::NonZeroExit { .. } => FailureReason::NonZeroExit,
            StageError::Cancelled { .. } => FailureReason::Cancelled,
            StageError::TimedOut { .. } => FailureReason::TimedOut,
            StageError::Wait { .. } => FailureReason::Io,
        }
    }
}

/// A result sink rejected an upsert.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("result sink {sink} failed: {message}")]
pub struct StorageError {
    pub sink: String,
    pub message: String,
}

impl StorageError {
    pub fn new(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sink: sink.into(),
            message: message.into(),
        }
    }
}

/// Errors surfaced by the pipeline controller.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage is already active; the new request was rejected.
    #[error("a pipeline stage is already running (state: {state})")]
    AlreadyRunning { state: PipelineState },

    /// There is no active stage to cancel.
    #[error("no active pipeline stage (state: {state})")]
    NotActive { state: PipelineState },

    #[error(transparent)]
    Stage(#[from] StageError),

    /// The run task panicked or was aborted.
    #[error("pipeline task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_error_has_no_transcript() {
        let err = StageError::Spawn {
            stage: StageKind::Training,
            source: SpawnError::NotFound {
                executable: PathBuf::from("/missing/python3"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            },
        };
        assert!(err.transcript().is_none());
        assert_eq!(err.reason(), FailureReason::Spawn);
        assert_eq!(err.stage(), StageKind::Training);
        assert!(err.to_string().starts_with("training stage failed to start"));
    }

    #[test]
    fn cancelled_keeps_transcript() {
        let mut transcript = Transcript::default();
        transcript.push(crate::stage::LogChunk::stdout("50% complete."));
        let err = StageError::Cancelled {
            stage: StageKind::Collection,
            transcript,
        };
        assert_eq!(err.transcript().map(Transcript::len), Some(1));
        assert_eq!(err.reason(), FailureReason::Cancelled);
    }
}
