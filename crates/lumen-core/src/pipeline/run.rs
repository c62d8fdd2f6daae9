//! The data carried through one pipeline run.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::launch::{CollectionArgs, PredictionArgs, StageKind};

/// Keys never handed to a result sink.
pub const SENSITIVE_FIELDS: &[&str] = &["password", "su-password", "rcmd-password"];

/// Accumulated state of one run, owned by the run task.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub form_id: String,
    pub stage_sequence: Vec<StageKind>,
    pub fields: Map<String, Value>,
    pub current_stage: Option<StageKind>,
    pub started_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(
        form_id: impl Into<String>,
        stage_sequence: Vec<StageKind>,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            form_id: form_id.into(),
            stage_sequence,
            fields,
            current_stage: None,
            started_at: Utc::now(),
        }
    }

    /// Merge `fields` over the accumulated ones; later stages win.
    pub fn merge(&mut self, fields: Map<String, Value>) {
        self.fields.extend(fields);
    }

    /// The accumulated fields with [`SENSITIVE_FIELDS`] removed.
    pub fn persistable_fields(&self) -> Map<String, Value> {
        let mut fields = self.fields.clone();
        for key in SENSITIVE_FIELDS {
            fields.remove(*key);
        }
        fields
    }
}

/// Request for a collection -> training run.
#[derive(Debug, Clone)]
pub struct TrainingParams {
    pub form_id: String,
    pub collection: CollectionArgs,
    /// Form fields stored alongside the stage results.
    pub initial_fields: Map<String, Value>,
}

/// Request for a standalone prediction run.
#[derive(Debug, Clone)]
pub struct PredictionParams {
    pub form_id: String,
    pub model_id: String,
    pub sample_id: String,
    pub operator_id: String,
    pub data_dir: PathBuf,
    pub initial_fields: Map<String, Value>,
}

impl PredictionParams {
    pub(crate) fn args(&self) -> PredictionArgs {
        PredictionArgs {
            model_id: self.model_id.clone(),
            sample_id: self.sample_id.clone(),
            operator_id: self.operator_id.clone(),
            data_dir: self.data_dir.clone(),
        }
    }

    /// Initial fields plus the identifiers the prediction was asked for.
    pub(crate) fn seed_fields(&self) -> Map<String, Value> {
        let mut fields = self.initial_fields.clone();
        fields.insert(
            "sample-model-id".to_owned(),
            Value::String(self.sample_id.clone()),
        );
        fields.insert(
            "knn-model-id".to_owned(),
            Value::String(self.model_id.clone()),
        );
        fields.insert(
            "operator-id".to_owned(),
            Value::String(self.operator_id.clone()),
        );
        fields
    }
}
