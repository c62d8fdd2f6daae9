//! Core of the lumen job orchestration pipeline.
//!
//! Launches worker processes, classifies their streamed output into a
//! structured handoff payload and log text, chains collection into
//! training, runs standalone predictions, and hands results to a sink.

pub mod classify;
pub mod error;
pub mod launch;
pub mod pipeline;
pub mod process;
pub mod sink;
pub mod stage;

pub use error::{FailureReason, PipelineError, SpawnError, StageError, StorageError};
pub use launch::{StageKind, WorkerLaunchDescriptor};
pub use pipeline::{PipelineController, PipelineEvent, PipelineHandle, PipelineState};
