//! Database query functions for the `results` table.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::types::Json;

use crate::models::StoredResult;

/// Fields that identify a run's row within its form, in priority order.
const ENTRY_KEY_FIELDS: &[&str] = &["model-id", "sample-model-id"];

/// The row key of `fields` within a form: the trained model's id, else the
/// scored sample's id, else empty.
pub fn entry_key(fields: &Map<String, Value>) -> String {
    ENTRY_KEY_FIELDS
        .iter()
        .find_map(|name| match fields.get(*name)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}

/// Insert or replace the result for `fields`' entry under `form_id`.
///
/// Re-submitting identical fields leaves the row untouched, including
/// `updated_at`.
pub async fn upsert_result(
    pool: &PgPool,
    form_id: &str,
    fields: &Map<String, Value>,
) -> Result<StoredResult> {
    let key = entry_key(fields);
    let row = sqlx::query_as::<_, StoredResult>(
        "INSERT INTO results (form_id, entry_key, fields) \
         VALUES ($1, $2, $3) \
         ON CONFLICT (form_id, entry_key) DO UPDATE \
         SET fields = EXCLUDED.fields, \
             updated_at = CASE \
                 WHEN results.fields IS DISTINCT FROM EXCLUDED.fields THEN now() \
                 ELSE results.updated_at \
             END \
         RETURNING *",
    )
    .bind(form_id)
    .bind(&key)
    .bind(Json(fields))
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to upsert result for form {form_id} entry {key:?}"))?;

    Ok(row)
}

/// Fetch one entry of a form.
pub async fn get_result(
    pool: &PgPool,
    form_id: &str,
    entry_key: &str,
) -> Result<Option<StoredResult>> {
    let row = sqlx::query_as::<_, StoredResult>(
        "SELECT * FROM results WHERE form_id = $1 AND entry_key = $2",
    )
    .bind(form_id)
    .bind(entry_key)
    .fetch_optional(pool)
    .await
    .context("failed to fetch result")?;

    Ok(row)
}

/// Every entry of a form, most recently updated first.
pub async fn form_results(pool: &PgPool, form_id: &str) -> Result<Vec<StoredResult>> {
    let rows = sqlx::query_as::<_, StoredResult>(
        "SELECT * FROM results WHERE form_id = $1 ORDER BY updated_at DESC",
    )
    .bind(form_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to fetch results for form {form_id}"))?;

    Ok(rows)
}

/// List all stored results, most recently updated first.
pub async fn list_results(pool: &PgPool) -> Result<Vec<StoredResult>> {
    let rows = sqlx::query_as::<_, StoredResult>("SELECT * FROM results ORDER BY updated_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list results")?;

    Ok(rows)
}

/// Count stored results.
pub async fn count_results(pool: &PgPool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM results")
        .fetch_one(pool)
        .await
        .context("failed to count results")?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn model_id_keys_training_runs() {
        let fields = map(json!({"model-id": "m42", "sample-model-id": "s1"}));
        assert_eq!(entry_key(&fields), "m42");
    }

    #[test]
    fn prediction_runs_key_on_numeric_sample_id() {
        let fields = map(json!({"sample-model-id": 1700000500, "prediction-score": 0.8}));
        assert_eq!(entry_key(&fields), "1700000500");
    }

    #[test]
    fn runs_without_identifiers_share_the_empty_key() {
        assert_eq!(entry_key(&map(json!({"model-id": null}))), "");
        assert_eq!(entry_key(&Map::new()), "");
    }
}
