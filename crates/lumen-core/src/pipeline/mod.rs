//! Pipeline controller: sequences collection -> training, runs standalone
//! predictions, and owns the single-active-stage slot.
//!
//! Each run executes on its own tokio task. The controller's shared state
//! holds only the current [`PipelineState`] and a non-owning view of the
//! active stage (its run id, pid and cancellation token); the
//! [`PipelineRun`] itself lives on the run task.

pub mod run;
pub mod state;

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::classify::HandoffPayload;
use crate::error::{FailureReason, PipelineError, StageError, StorageError};
use crate::launch::{StageKind, StageParams, TrainingArgs, WorkerLaunchDescriptor};
use crate::process::census::WorkerCensus;
use crate::sink::{ResultDisplay, ResultSink};
use crate::stage::{StageConfig, StageEvent, StageOutcome, StageRunner};

pub use run::{PipelineRun, PredictionParams, SENSITIVE_FIELDS, TrainingParams};
pub use state::PipelineState;

/// Notifications delivered on a run's [`PipelineHandle`].
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged(PipelineState),
    Stage { stage: StageKind, event: StageEvent },
}

/// Final report of a successful run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run: PipelineRun,
    /// Set when the run completed but the sink rejected its fields.
    pub storage_error: Option<StorageError>,
}

/// What [`PipelineController::shutdown`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The stage that was cancelled, if one was active.
    pub cancelled_stage: Option<StageKind>,
    /// Workers found by the census and terminated.
    pub orphan_pids: BTreeSet<u32>,
}

/// A started run.
#[derive(Debug)]
pub struct PipelineHandle {
    pub run_id: Uuid,
    /// Closes once the run task has finished.
    pub events: UnboundedReceiver<PipelineEvent>,
    task: JoinHandle<Result<PipelineReport, PipelineError>>,
}

impl PipelineHandle {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<PipelineReport, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?
    }
}

struct ActiveRun {
    run_id: Uuid,
    stage: StageKind,
    pid: Option<u32>,
    cancel: CancellationToken,
    events: UnboundedSender<PipelineEvent>,
}

struct Shared {
    state: PipelineState,
    active: Option<ActiveRun>,
}

/// Coordinates worker stages. Cheap to clone; clones share one slot.
#[derive(Clone)]
pub struct PipelineController {
    shared: Arc<Mutex<Shared>>,
    descriptor: Arc<WorkerLaunchDescriptor>,
    sink: Arc<dyn ResultSink>,
    display: Arc<dyn ResultDisplay>,
    config: StageConfig,
}

impl std::fmt::Debug for PipelineController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineController")
            .field("state", &self.state())
            .field("descriptor", &self.descriptor)
            .field("sink", &self.sink.name())
            .finish()
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PipelineController {
    pub fn new(
        descriptor: WorkerLaunchDescriptor,
        sink: Arc<dyn ResultSink>,
        display: Arc<dyn ResultDisplay>,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: PipelineState::Idle,
                active: None,
            })),
            descriptor: Arc::new(descriptor),
            sink,
            display,
            config: StageConfig::default(),
        }
    }

    pub fn with_stage_config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> PipelineState {
        lock(&self.shared).state
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// PID of the active stage's worker, once it has spawned.
    pub fn active_pid(&self) -> Option<u32> {
        lock(&self.shared).active.as_ref().and_then(|a| a.pid)
    }

    /// Start collection followed by training. Returns immediately.
    pub fn start_training(&self, params: TrainingParams) -> Result<PipelineHandle, PipelineError> {
        let run = PipelineRun::new(
            params.form_id,
            vec![StageKind::Collection, StageKind::Training],
            params.initial_fields,
        );
        let first = StageParams::Collection(params.collection);
        self.launch(run, PipelineState::Collecting, StageKind::Collection, move |ctx, run| {
            ctx.training(run, first)
        })
    }

    /// Start a standalone prediction. Returns immediately.
    pub fn start_prediction(
        &self,
        params: PredictionParams,
    ) -> Result<PipelineHandle, PipelineError> {
        let run = PipelineRun::new(
            params.form_id.clone(),
            vec![StageKind::Prediction],
            params.seed_fields(),
        );
        let stage_params = StageParams::Prediction(params.args());
        self.launch(run, PipelineState::Predicting, StageKind::Prediction, move |ctx, run| {
            ctx.prediction(run, stage_params)
        })
    }

    fn launch<F, Fut>(
        &self,
        mut run: PipelineRun,
        first_state: PipelineState,
        first_stage: StageKind,
        body: F,
    ) -> Result<PipelineHandle, PipelineError>
    where
        F: FnOnce(RunContext, PipelineRun) -> Fut,
        Fut: std::future::Future<Output = Result<PipelineReport, PipelineError>> + Send + 'static,
    {
        let run_id = run.run_id;
        let cancel = CancellationToken::new();
        let (events, rx) = mpsc::unbounded_channel();

        {
            let mut shared = lock(&self.shared);
            if !shared.state.can_transition(first_state) {
                return Err(PipelineError::AlreadyRunning {
                    state: shared.state,
                });
            }
            shared.state = first_state;
            shared.active = Some(ActiveRun {
                run_id,
                stage: first_stage,
                pid: None,
                cancel: cancel.clone(),
                events: events.clone(),
            });
            let _ = events.send(PipelineEvent::StateChanged(first_state));
        }
        info!(%run_id, form_id = %run.form_id, state = %first_state, "pipeline run started");
        run.current_stage = Some(first_stage);

        let ctx = RunContext {
            shared: self.shared.clone(),
            descriptor: self.descriptor.clone(),
            sink: self.sink.clone(),
            display: self.display.clone(),
            config: self.config.clone(),
            run_id,
            cancel,
            events,
        };
        let task = tokio::spawn(body(ctx, run));

        Ok(PipelineHandle {
            run_id,
            events: rx,
            task,
        })
    }

    /// Cancel the active stage and kill its process tree.
    ///
    /// The controller moves to `Failed(Cancelled)` immediately and accepts a
    /// new run; the worker's death is confirmed by the run task.
    pub fn cancel_active(&self) -> Result<StageKind, PipelineError> {
        let mut shared = lock(&self.shared);
        let state = shared.state;
        if !state.is_active() {
            return Err(PipelineError::NotActive { state });
        }
        let Some(active) = shared.active.take() else {
            return Err(PipelineError::NotActive { state });
        };
        active.cancel.cancel();
        let failed = PipelineState::Failed(FailureReason::Cancelled);
        shared.state = failed;
        let _ = active.events.send(PipelineEvent::StateChanged(failed));
        info!(
            run_id = %active.run_id,
            stage = %active.stage,
            pid = ?active.pid,
            "pipeline cancellation requested"
        );
        Ok(active.stage)
    }

    /// Stop whatever is running: the active stage if there is one, otherwise
    /// every live worker the census can find.
    pub async fn shutdown(&self, census: &WorkerCensus, grace: Duration) -> ShutdownReport {
        if let Ok(stage) = self.cancel_active() {
            return ShutdownReport {
                cancelled_stage: Some(stage),
                orphan_pids: BTreeSet::new(),
            };
        }

        let orphan_pids = census.list_worker_pids();
        if !orphan_pids.is_empty() {
            info!(count = orphan_pids.len(), "terminating orphaned workers");
            let targets: Vec<_> = orphan_pids
                .iter()
                .map(|&pid| census.cancel_target(pid))
                .collect();
            futures::future::join_all(targets.iter().map(|t| t.terminate(grace))).await;
        }
        ShutdownReport {
            cancelled_stage: None,
            orphan_pids,
        }
    }
}

/// Everything a run task needs; detached from the controller handle.
struct RunContext {
    shared: Arc<Mutex<Shared>>,
    descriptor: Arc<WorkerLaunchDescriptor>,
    sink: Arc<dyn ResultSink>,
    display: Arc<dyn ResultDisplay>,
    config: StageConfig,
    run_id: Uuid,
    cancel: CancellationToken,
    events: UnboundedSender<PipelineEvent>,
}

impl RunContext {
    async fn training(
        self,
        mut run: PipelineRun,
        collection: StageParams,
    ) -> Result<PipelineReport, PipelineError> {
        let outcome = self
            .run_stage(collection)
            .await
            .map_err(|e| self.fail(e))?;
        let collected = match outcome.handoff {
            Some(HandoffPayload::Collection(collected)) => collected,
            _ => {
                return Err(self.fail(StageError::MissingHandoff {
                    stage: StageKind::Collection,
                    transcript: outcome.transcript,
                    exit: outcome.exit,
                }));
            }
        };
        run.merge(collected.fields());

        if !self.advance(PipelineState::Training, Some(StageKind::Training)) {
            return Err(self.superseded(StageKind::Collection));
        }
        run.current_stage = Some(StageKind::Training);

        let training = StageParams::Training(TrainingArgs {
            sample_directory: collected.sample_directory,
        });
        let outcome = self.run_stage(training).await.map_err(|e| self.fail(e))?;
        let trained = match outcome.handoff {
            Some(payload @ HandoffPayload::Training(_)) => payload,
            _ => {
                return Err(self.fail(StageError::MissingHandoff {
                    stage: StageKind::Training,
                    transcript: outcome.transcript,
                    exit: outcome.exit,
                }));
            }
        };
        run.merge(trained.into_fields());

        if !self.advance(PipelineState::Complete, None) {
            return Err(self.superseded(StageKind::Training));
        }

        let storage_error = self.persist(&run).await;
        Ok(PipelineReport { run, storage_error })
    }

    async fn prediction(
        self,
        mut run: PipelineRun,
        params: StageParams,
    ) -> Result<PipelineReport, PipelineError> {
        let outcome = self.run_stage(params).await.map_err(|e| self.fail(e))?;
        let predicted = match outcome.handoff {
            Some(payload @ HandoffPayload::Prediction(_)) => payload,
            _ => {
                return Err(self.fail(StageError::MissingHandoff {
                    stage: StageKind::Prediction,
                    transcript: outcome.transcript,
                    exit: outcome.exit,
                }));
            }
        };
        run.merge(predicted.into_fields());

        if !self.advance(PipelineState::Complete, None) {
            return Err(self.superseded(StageKind::Prediction));
        }

        self.display.present(&run.persistable_fields());
        let storage_error = self.persist(&run).await;
        Ok(PipelineReport { run, storage_error })
    }

    /// Run one stage, forwarding its events and recording its pid.
    ///
    /// Returns only after every stage event has been forwarded, so a
    /// following state change is always delivered after them.
    async fn run_stage(&self, params: StageParams) -> Result<StageOutcome, StageError> {
        let stage = params.kind();
        let runner = StageRunner::new(&self.descriptor, &params, self.config.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let forward = async {
            while let Some(event) = rx.recv().await {
                if let StageEvent::Spawned { pid } = event {
                    if let Some(active) = lock(&self.shared)
                        .active
                        .as_mut()
                        .filter(|a| a.run_id == self.run_id)
                    {
                        active.pid = Some(pid);
                    }
                }
                let _ = self.events.send(PipelineEvent::Stage { stage, event });
            }
        };

        let (result, ()) = tokio::join!(runner.run(Some(tx), self.cancel.clone()), forward);
        result
    }

    /// Move this run to `next` unless a newer run or a cancellation has
    /// taken the slot. Returns whether the transition happened.
    fn advance(&self, next: PipelineState, next_stage: Option<StageKind>) -> bool {
        let mut shared = lock(&self.shared);
        let owns_slot = shared
            .active
            .as_ref()
            .is_some_and(|a| a.run_id == self.run_id);
        if !owns_slot || !shared.state.can_transition(next) {
            return false;
        }

        let from = shared.state;
        shared.state = next;
        match next_stage {
            Some(stage) => {
                if let Some(active) = shared.active.as_mut() {
                    active.stage = stage;
                    active.pid = None;
                }
            }
            None => shared.active = None,
        }
        let _ = self.events.send(PipelineEvent::StateChanged(next));
        info!(run_id = %self.run_id, %from, to = %next, "pipeline state changed");
        true
    }

    fn fail(&self, err: StageError) -> PipelineError {
        let reason = err.reason();
        if reason != FailureReason::Cancelled {
            warn!(run_id = %self.run_id, stage = %err.stage(), error = %err, "pipeline stage failed");
        }
        self.advance(PipelineState::Failed(reason), None);
        PipelineError::Stage(err)
    }

    /// The slot was taken away between stages (cancellation).
    fn superseded(&self, stage: StageKind) -> PipelineError {
        PipelineError::Stage(StageError::Cancelled {
            stage,
            transcript: Default::default(),
        })
    }

    async fn persist(&self, run: &PipelineRun) -> Option<StorageError> {
        let fields: Map<String, Value> = run.persistable_fields();
        match self.sink.upsert(&run.form_id, &fields).await {
            Ok(()) => {
                info!(
                    run_id = %self.run_id,
                    form_id = %run.form_id,
                    sink = self.sink.name(),
                    fields = fields.len(),
                    "results stored"
                );
                None
            }
            Err(e) => {
                warn!(run_id = %self.run_id, form_id = %run.form_id, error = %e, "failed to store results");
                Some(e)
            }
        }
    }
}
