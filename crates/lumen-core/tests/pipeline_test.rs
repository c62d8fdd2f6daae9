//! Pipeline controller tests with `/bin/sh` workers and in-memory sinks.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use lumen_core::error::{FailureReason, PipelineError, StageError, StorageError};
use lumen_core::launch::{CollectionArgs, StageKind, WorkerLaunchDescriptor};
use lumen_core::pipeline::{
    PipelineController, PipelineEvent, PipelineHandle, PipelineState, PredictionParams,
    TrainingParams,
};
use lumen_core::process::census::WorkerCensus;
use lumen_core::sink::{MemorySink, NoopDisplay, ResultDisplay, ResultSink};
use lumen_core::stage::{StageConfig, StageEvent};

// ===========================================================================
// Test harness
// ===========================================================================

const COLLECT_OK: &str = r#"echo "Loading..."
echo '{"sampleDirectory":"/data/run42","modelIdentifier":"m42"}'
echo "100% complete.""#;

const TRAIN_OK: &str = r#"printf '%s\n' "$@" > "$(dirname "$0")/training-args"
echo "Begin Model Training"
echo
echo '{"samples":"/data/run42/samples.npy","model":"/data/run42/model.pkl","cross-validation-accuracy":0.9,"cross-validation-folds":10}'"#;

struct Workers {
    dir: tempfile::TempDir,
}

impl Workers {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, stage: StageKind, body: &str) {
        std::fs::write(
            self.path().join(stage.script_name()),
            format!("#!/bin/sh\n{body}\n"),
        )
        .expect("write worker script");
    }

    fn descriptor(&self) -> WorkerLaunchDescriptor {
        WorkerLaunchDescriptor::new("/bin/sh", self.path())
    }
}

#[derive(Default)]
struct RecordingDisplay {
    shown: Mutex<Vec<Map<String, Value>>>,
}

impl ResultDisplay for RecordingDisplay {
    fn present(&self, fields: &Map<String, Value>) {
        self.shown.lock().unwrap().push(fields.clone());
    }
}

struct FailingSink;

#[async_trait]
impl ResultSink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    async fn upsert(&self, _key: &str, _fields: &Map<String, Value>) -> Result<(), StorageError> {
        Err(StorageError::new("failing", "connection refused"))
    }
}

fn controller(workers: &Workers, sink: Arc<dyn ResultSink>) -> PipelineController {
    PipelineController::new(workers.descriptor(), sink, Arc::new(NoopDisplay)).with_stage_config(
        StageConfig {
            terminate_grace: Duration::from_secs(2),
            ..StageConfig::default()
        },
    )
}

fn training_params(form_id: &str, data_dir: &Path) -> TrainingParams {
    let Value::Object(initial_fields) = json!({
        "host": "cnc-01",
        "user": "ubuntu",
        "password": "hunter2",
        "su-password": ""
    }) else {
        unreachable!()
    };
    TrainingParams {
        form_id: form_id.to_string(),
        collection: CollectionArgs {
            host: "cnc-01".into(),
            user: "ubuntu".into(),
            password: "hunter2".into(),
            su_password: String::new(),
            data_dir: data_dir.to_path_buf(),
            min_duty: 10,
            max_duty: 12,
            samples: 4,
            tty: "/dev/null".into(),
        },
        initial_fields,
    }
}

fn prediction_params(form_id: &str, data_dir: PathBuf) -> PredictionParams {
    PredictionParams {
        form_id: form_id.to_string(),
        model_id: "m7".into(),
        sample_id: "s3".into(),
        operator_id: "op1".into(),
        data_dir,
        initial_fields: Map::new(),
    }
}

async fn finish(handle: PipelineHandle) -> Result<lumen_core::pipeline::PipelineReport, PipelineError> {
    tokio::time::timeout(Duration::from_secs(20), handle.wait())
        .await
        .expect("pipeline did not finish in time")
}

/// Wait until the given stage reports its worker spawned.
async fn wait_for_spawn(handle: &mut PipelineHandle, stage: StageKind) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match handle.events.recv().await {
                Some(PipelineEvent::Stage {
                    stage: s,
                    event: StageEvent::Spawned { .. },
                }) if s == stage => return,
                Some(_) => continue,
                None => panic!("event channel closed before {stage} spawned"),
            }
        }
    })
    .await
    .expect("timed out waiting for spawn");
}

// ===========================================================================
// Training pipeline
// ===========================================================================

#[tokio::test]
async fn collection_handoff_starts_training_with_sample_directory() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, COLLECT_OK);
    workers.write(StageKind::Training, TRAIN_OK);
    let sink = Arc::new(MemorySink::new());
    let ctl = controller(&workers, sink.clone());

    let mut handle = ctl
        .start_training(training_params("form-1", workers.path()))
        .unwrap();
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    let report = finish(handle).await.unwrap();

    let args = std::fs::read_to_string(workers.path().join("training-args")).unwrap();
    assert_eq!(args, "-d\n/data/run42\n");

    assert_eq!(ctl.state(), PipelineState::Complete);
    assert!(report.storage_error.is_none());
    assert_eq!(report.run.form_id, "form-1");

    let stored = sink.get("form-1").expect("result stored");
    assert_eq!(stored["samples-dir"], json!("/data/run42"));
    assert_eq!(stored["model-id"], json!("m42"));
    assert_eq!(stored["model"], json!("/data/run42/model.pkl"));
    assert_eq!(stored["cross-validation-folds"], json!(10));
    assert_eq!(stored["host"], json!("cnc-01"));
    assert!(!stored.contains_key("password"));
    assert!(!stored.contains_key("su-password"));
    assert_eq!(sink.upsert_count(), 1);

    let states: Vec<PipelineState> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged(s) => Some(*s),
            PipelineEvent::Stage { .. } => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            PipelineState::Collecting,
            PipelineState::Training,
            PipelineState::Complete
        ]
    );

    // Every collection event arrives before the switch to Training.
    let training_at = events
        .iter()
        .position(|e| *e == PipelineEvent::StateChanged(PipelineState::Training))
        .unwrap();
    assert!(events[training_at..].iter().all(|e| !matches!(
        e,
        PipelineEvent::Stage {
            stage: StageKind::Collection,
            ..
        }
    )));
    assert!(events[..training_at].iter().any(|e| matches!(
        e,
        PipelineEvent::Stage {
            stage: StageKind::Collection,
            event: StageEvent::Handoff(_)
        }
    )));
}

#[tokio::test]
async fn missing_collection_handoff_never_starts_training() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, "echo 'Data array collection error: no data found.'");
    workers.write(
        StageKind::Training,
        "touch \"$(dirname \"$0\")/training-ran\"\necho '{\"samples\":1,\"model\":\"m\"}'",
    );
    let sink = Arc::new(MemorySink::new());
    let ctl = controller(&workers, sink.clone());

    let handle = ctl
        .start_training(training_params("form-2", workers.path()))
        .unwrap();
    let err = finish(handle).await.unwrap_err();

    match err {
        PipelineError::Stage(StageError::MissingHandoff { stage, transcript, .. }) => {
            assert_eq!(stage, StageKind::Collection);
            assert_eq!(transcript.render(), "Data array collection error: no data found.");
        }
        other => panic!("expected MissingHandoff, got {other:?}"),
    }
    assert_eq!(
        ctl.state(),
        PipelineState::Failed(FailureReason::MissingHandoff)
    );
    assert!(!workers.path().join("training-ran").exists());
    assert!(sink.is_empty());
}

#[tokio::test]
async fn training_failure_persists_nothing() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, COLLECT_OK);
    workers.write(StageKind::Training, "echo 'Error computing cross_val_score.' >&2\nexit 1");
    let sink = Arc::new(MemorySink::new());
    let ctl = controller(&workers, sink.clone());

    let handle = ctl
        .start_training(training_params("form-3", workers.path()))
        .unwrap();
    let err = finish(handle).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Stage(StageError::MissingHandoff {
            stage: StageKind::Training,
            ..
        })
    ));
    assert_eq!(sink.upsert_count(), 0);
}

#[tokio::test]
async fn spawn_error_fails_pipeline() {
    let workers = Workers::new();
    let desc = WorkerLaunchDescriptor::new("/nonexistent/python3", workers.path());
    let sink = Arc::new(MemorySink::new());
    let ctl = PipelineController::new(desc, sink.clone(), Arc::new(NoopDisplay));

    let handle = ctl
        .start_training(training_params("form-4", workers.path()))
        .unwrap();
    let err = finish(handle).await.unwrap_err();
    assert!(matches!(err, PipelineError::Stage(StageError::Spawn { .. })));
    assert_eq!(ctl.state(), PipelineState::Failed(FailureReason::Spawn));
    assert!(sink.is_empty());
}

// ===========================================================================
// Cancellation and the single-active slot
// ===========================================================================

#[tokio::test]
async fn cancel_during_training_fails_without_persisting() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, COLLECT_OK);
    workers.write(StageKind::Training, "echo 'Begin Model Training'\nsleep 30");
    let sink = Arc::new(MemorySink::new());
    let ctl = controller(&workers, sink.clone());

    let mut handle = ctl
        .start_training(training_params("form-5", workers.path()))
        .unwrap();
    wait_for_spawn(&mut handle, StageKind::Training).await;
    assert_eq!(ctl.state(), PipelineState::Training);

    let cancelled = ctl.cancel_active().unwrap();
    assert_eq!(cancelled, StageKind::Training);
    assert_eq!(ctl.state(), PipelineState::Failed(FailureReason::Cancelled));
    assert!(!ctl.is_active());

    let err = finish(handle).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Stage(StageError::Cancelled {
            stage: StageKind::Training,
            ..
        })
    ));
    // The stale run task did not overwrite the state.
    assert_eq!(ctl.state(), PipelineState::Failed(FailureReason::Cancelled));
    assert_eq!(sink.upsert_count(), 0);
}

#[tokio::test]
async fn cancel_without_active_stage_is_rejected() {
    let workers = Workers::new();
    let ctl = controller(&workers, Arc::new(MemorySink::new()));
    let err = ctl.cancel_active().unwrap_err();
    assert!(matches!(
        err,
        PipelineError::NotActive {
            state: PipelineState::Idle
        }
    ));
}

#[tokio::test]
async fn start_while_collecting_is_rejected() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, "echo 'Begin Data Collection'\nsleep 30");
    workers.write(StageKind::Prediction, "echo '{\"prediction-score\":1.0}'");
    let ctl = controller(&workers, Arc::new(MemorySink::new()));

    let mut handle = ctl
        .start_training(training_params("form-6", workers.path()))
        .unwrap();
    wait_for_spawn(&mut handle, StageKind::Collection).await;
    let pid = ctl.active_pid().expect("pid recorded once spawned");

    let again = ctl.start_training(training_params("form-7", workers.path()));
    assert!(matches!(
        again,
        Err(PipelineError::AlreadyRunning {
            state: PipelineState::Collecting
        })
    ));
    let predict = ctl.start_prediction(prediction_params("form-8", workers.path().to_path_buf()));
    assert!(matches!(predict, Err(PipelineError::AlreadyRunning { .. })));

    // The active stage is untouched.
    assert_eq!(ctl.state(), PipelineState::Collecting);
    assert_eq!(ctl.active_pid(), Some(pid));

    ctl.cancel_active().unwrap();
    let _ = finish(handle).await;
}

#[tokio::test]
async fn new_run_may_start_after_cancel() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, "sleep 30");
    workers.write(
        StageKind::Prediction,
        "echo '{\"prediction-score\":0.5}'",
    );
    let sink = Arc::new(MemorySink::new());
    let ctl = controller(&workers, sink.clone());

    let mut first = ctl
        .start_training(training_params("form-9", workers.path()))
        .unwrap();
    wait_for_spawn(&mut first, StageKind::Collection).await;
    ctl.cancel_active().unwrap();

    let second = ctl
        .start_prediction(prediction_params("form-10", workers.path().to_path_buf()))
        .unwrap();
    assert_ne!(first.run_id, second.run_id);

    let _ = finish(first).await;
    let report = finish(second).await.unwrap();
    assert_eq!(report.run.form_id, "form-10");
    assert_eq!(ctl.state(), PipelineState::Complete);
    assert_eq!(sink.len(), 1);
}

#[tokio::test]
async fn shutdown_cancels_active_stage() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, "sleep 30");
    let ctl = controller(&workers, Arc::new(MemorySink::new()));

    let mut handle = ctl
        .start_training(training_params("form-11", workers.path()))
        .unwrap();
    wait_for_spawn(&mut handle, StageKind::Collection).await;

    let census = WorkerCensus::from_script_dir(workers.path());
    let report = ctl.shutdown(&census, Duration::from_secs(2)).await;
    assert_eq!(report.cancelled_stage, Some(StageKind::Collection));
    assert!(report.orphan_pids.is_empty());

    let err = finish(handle).await.unwrap_err();
    assert!(matches!(err, PipelineError::Stage(StageError::Cancelled { .. })));
}

// ===========================================================================
// Persistence and display
// ===========================================================================

#[tokio::test]
async fn identical_runs_leave_one_sink_entry() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, COLLECT_OK);
    workers.write(StageKind::Training, TRAIN_OK);
    let sink = Arc::new(MemorySink::new());
    let ctl = controller(&workers, sink.clone());

    let first = finish(
        ctl.start_training(training_params("form-12", workers.path()))
            .unwrap(),
    )
    .await
    .unwrap();
    let second = finish(
        ctl.start_training(training_params("form-12", workers.path()))
            .unwrap(),
    )
    .await
    .unwrap();

    assert_eq!(first.run.persistable_fields(), second.run.persistable_fields());
    assert_eq!(sink.len(), 1);
    assert_eq!(sink.upsert_count(), 2);
    assert_eq!(
        sink.get("form-12"),
        Some(second.run.persistable_fields())
    );
}

#[tokio::test]
async fn prediction_goes_to_display_and_sink() {
    let workers = Workers::new();
    workers.write(
        StageKind::Prediction,
        r#"printf '%s\n' "$QT_QPA_PLATFORM" "$@" > "$(dirname "$0")/prediction-args"
echo "Loading model..."
echo
echo '{"sample-model-id":"s3","knn-model-id":"m7","operator-id":"op1","host-name":"cnc-01","date":1700001000,"prediction-score":0.87,"error-proba-bins":12}'"#,
    );
    let sink = Arc::new(MemorySink::new());
    let display = Arc::new(RecordingDisplay::default());
    let ctl = PipelineController::new(workers.descriptor(), sink.clone(), display.clone());

    let data_dir = workers.path().join("data");
    let handle = ctl
        .start_prediction(prediction_params("form-13", data_dir.clone()))
        .unwrap();
    let report = finish(handle).await.unwrap();
    assert!(report.storage_error.is_none());

    let args = std::fs::read_to_string(workers.path().join("prediction-args")).unwrap();
    assert_eq!(
        args,
        format!("offscreen\nm7\ns3\nop1\n-d\n{}\n", data_dir.display())
    );

    let shown = display.shown.lock().unwrap().clone();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0]["prediction-score"], json!(0.87));
    assert_eq!(shown[0]["knn-model-id"], json!("m7"));

    let stored = sink.get("form-13").expect("prediction stored");
    assert_eq!(stored, shown[0]);
    assert_eq!(stored["error-proba-bins"], json!(12));
    assert_eq!(ctl.state(), PipelineState::Complete);
}

#[tokio::test]
async fn storage_failure_is_reported_and_state_stays_complete() {
    let workers = Workers::new();
    workers.write(StageKind::Collection, COLLECT_OK);
    workers.write(StageKind::Training, TRAIN_OK);
    let ctl = controller(&workers, Arc::new(FailingSink));

    let report = finish(
        ctl.start_training(training_params("form-14", workers.path()))
            .unwrap(),
    )
    .await
    .unwrap();

    let err = report.storage_error.expect("storage error reported");
    assert_eq!(err.sink, "failing");
    assert_eq!(ctl.state(), PipelineState::Complete);
}
