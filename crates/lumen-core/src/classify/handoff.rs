//! Structured handoff payloads emitted once per stage on stdout.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::launch::StageKind;

/// Identifiers are printed as strings by some workers and as bare numbers
/// by others.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

fn opt_id_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "expected string or number, found {other}"
        ))),
    }
}

/// Collection result: where the samples went and the model they belong to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionHandoff {
    #[serde(
        rename = "data_dir",
        alias = "sampleDirectory",
        alias = "sample-directory"
    )]
    pub sample_directory: String,
    #[serde(
        rename = "model_id",
        alias = "modelIdentifier",
        alias = "model-id",
        deserialize_with = "id_string"
    )]
    pub model_identifier: String,
}

impl CollectionHandoff {
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            "samples-dir".to_owned(),
            Value::String(self.sample_directory.clone()),
        );
        fields.insert(
            "model-id".to_owned(),
            Value::String(self.model_identifier.clone()),
        );
        fields
    }
}

/// Training result: the model file and its cross-validation summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TrainingHandoff {
    /// Sample file reference or sample count.
    #[serde(alias = "sampleCount")]
    pub samples: Value,
    #[serde(alias = "modelBlob")]
    pub model: Value,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "validationAccuracy")]
    pub cross_validation_accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "validationError")]
    pub cross_validation_error: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "neighborCount")]
    pub cross_validation_neighbors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "foldCount")]
    pub cross_validation_folds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "standardErrorEstimate")]
    pub standard_error_estimate: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Prediction result: scores, error statistics and chart locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PredictionHandoff {
    #[serde(alias = "predictionScore")]
    pub prediction_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "hostName")]
    pub host_name: Option<String>,
    /// Epoch seconds.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "timestamp")]
    pub date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "errorMean")]
    pub error_proba_mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "errorStdDev")]
    pub error_proba_std_dev: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "errorStdErrMean")]
    pub error_proba_std_err_mean: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "errorVariance")]
    pub error_proba_variance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "errorBins")]
    pub error_proba_bins: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "stdErrEstimate")]
    pub std_err_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "predictDistribution")]
    pub predict_proba: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proba_dist_chart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_variance_chart: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_id_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub sample_model_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_id_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub knn_model_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_id_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub operator_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PredictionHandoff {
    /// Spread a `chartArtifactPaths` pair over the two chart fields.
    fn split_chart_paths(mut self) -> Self {
        let Some(Value::Array(paths)) = self.extra.get("chartArtifactPaths") else {
            return self;
        };
        let mut paths = paths.iter().map(|p| p.as_str().map(str::to_owned));
        let dist = paths.next().flatten();
        let mean_variance = paths.next().flatten();
        if dist.is_none() && mean_variance.is_none() {
            return self;
        }
        self.extra.remove("chartArtifactPaths");
        self.proba_dist_chart = self.proba_dist_chart.or(dist);
        self.mean_variance_chart = self.mean_variance_chart.or(mean_variance);
        self
    }
}

/// The one structured record a stage hands to the next step.
#[derive(Debug, Clone, PartialEq)]
pub enum HandoffPayload {
    Collection(CollectionHandoff),
    Training(TrainingHandoff),
    Prediction(PredictionHandoff),
}

impl HandoffPayload {
    /// Try to read `line` as the payload of `stage`.
    ///
    /// Lines that do not look like a JSON object are plain log text and are
    /// rejected silently; object-looking lines that fail to parse are
    /// logged at debug.
    pub fn parse(stage: StageKind, line: &str) -> Option<Self> {
        let candidate = line.trim();
        if !candidate.starts_with('{') {
            return None;
        }
        let parsed = match stage {
            StageKind::Collection => serde_json::from_str(candidate).map(Self::Collection),
            StageKind::Training => serde_json::from_str(candidate).map(Self::Training),
            StageKind::Prediction => serde_json::from_str(candidate)
                .map(|p: PredictionHandoff| Self::Prediction(p.split_chart_paths())),
            StageKind::DependencyCheck => return None,
        };
        match parsed {
            Ok(payload) => Some(payload),
            Err(e) => {
                debug!(%stage, error = %e, "discarding malformed handoff candidate");
                None
            }
        }
    }

    /// Flatten the payload into result fields keyed the way they are stored.
    pub fn into_fields(self) -> Map<String, Value> {
        let value = match self {
            HandoffPayload::Collection(c) => return c.fields(),
            HandoffPayload::Training(t) => serde_json::to_value(t),
            HandoffPayload::Prediction(p) => serde_json::to_value(p),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}
