//! PostgreSQL-backed result sink.

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::debug;

use lumen_db::queries::results;

use super::ResultSink;
use crate::error::StorageError;

/// Stores results in the `results` table, one row per form and model.
#[derive(Debug, Clone)]
pub struct PgResultSink {
    pool: PgPool,
}

impl PgResultSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResultSink for PgResultSink {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn upsert(&self, key: &str, fields: &Map<String, Value>) -> Result<(), StorageError> {
        let row = results::upsert_result(&self.pool, key, fields)
            .await
            .map_err(|e| StorageError::new(self.name(), format!("{e:#}")))?;
        debug!(form_id = %row.form_id, updated_at = %row.updated_at, "result row upserted");
        Ok(())
    }
}
