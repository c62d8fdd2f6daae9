//! Row types for the `results` table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// The persisted result of one pipeline run.
///
/// Rows are keyed by form and [`entry_key`](crate::queries::results::entry_key),
/// so each trained model and each scored sample keeps its own row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StoredResult {
    pub form_id: String,
    pub entry_key: String,
    pub fields: Json<serde_json::Map<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    /// Moves only when an upsert changes `fields`.
    pub updated_at: DateTime<Utc>,
}

impl StoredResult {
    /// Borrow the stored field map.
    pub fn fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields.0
    }
}
