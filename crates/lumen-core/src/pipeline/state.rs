//! Controller state machine.

use std::fmt;

use crate::error::FailureReason;

/// Where the controller's single pipeline slot currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Idle,
    Collecting,
    Training,
    Predicting,
    Complete,
    Failed(FailureReason),
}

impl PipelineState {
    /// Check whether moving from `self` to `to` is allowed.
    ///
    /// Valid transitions:
    /// - Idle/Complete/Failed -> Collecting, Predicting (a new run)
    /// - Collecting -> Training, Failed
    /// - Training -> Complete, Failed
    /// - Predicting -> Complete, Failed
    pub fn can_transition(self, to: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, to),
            (Idle | Complete | Failed(_), Collecting | Predicting)
                | (Collecting, Training)
                | (Collecting | Training | Predicting, Failed(_))
                | (Training | Predicting, Complete)
        )
    }

    /// A stage is running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PipelineState::Collecting | PipelineState::Training | PipelineState::Predicting
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::Collecting => f.write_str("collecting"),
            PipelineState::Training => f.write_str("training"),
            PipelineState::Predicting => f.write_str("predicting"),
            PipelineState::Complete => f.write_str("complete"),
            PipelineState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}
