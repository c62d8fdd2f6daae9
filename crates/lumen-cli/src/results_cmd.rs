//! `lumen show` and `lumen results`: inspect stored results.

use std::fmt::Write as _;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use lumen_db::models::StoredResult;
use lumen_db::queries::results as result_db;

use crate::display;

pub async fn run_show(pool: &PgPool, form_id: &str) -> Result<()> {
    let entries = result_db::form_results(pool, form_id).await?;
    if entries.is_empty() {
        bail!("no stored result for form {form_id}");
    }
    let rendered: Vec<String> = entries.iter().map(render_result).collect();
    print!("{}", rendered.join("\n"));
    Ok(())
}

pub async fn run_results(pool: &PgPool) -> Result<()> {
    let results = result_db::list_results(pool).await?;
    if results.is_empty() {
        println!("No stored results.");
        return Ok(());
    }
    print!("{}", render_listing(&results));
    Ok(())
}

fn render_result(result: &StoredResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Form: {}", result.form_id);
    if !result.entry_key.is_empty() {
        let _ = writeln!(out, "Entry: {}", result.entry_key);
    }
    let _ = writeln!(out, "Created: {}", timestamp(&result.created_at));
    let _ = writeln!(out, "Updated: {}", timestamp(&result.updated_at));
    let _ = writeln!(out, "Fields:");
    out.push_str(&display::render_fields(result.fields()));
    out
}

fn render_listing(results: &[StoredResult]) -> String {
    let form_w = results
        .iter()
        .map(|r| r.form_id.len())
        .chain(["FORM".len()])
        .max()
        .unwrap_or(0);
    let entry_w = results
        .iter()
        .map(|r| r.entry_key.len())
        .chain(["ENTRY".len()])
        .max()
        .unwrap_or(0);
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<form_w$}  {:<entry_w$}  {:<23}  FIELDS",
        "FORM", "ENTRY", "UPDATED"
    );
    for result in results {
        let _ = writeln!(
            out,
            "{:<form_w$}  {:<entry_w$}  {:<23}  {}",
            result.form_id,
            result.entry_key,
            timestamp(&result.updated_at),
            result.fields().len()
        );
    }
    out
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use sqlx::types::Json;

    fn stored(form_id: &str, fields: serde_json::Value) -> StoredResult {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap();
        let fields = fields.as_object().cloned().unwrap();
        StoredResult {
            form_id: form_id.to_string(),
            entry_key: result_db::entry_key(&fields),
            fields: Json(fields),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn result_rendering_includes_timestamps_and_fields() {
        let out = render_result(&stored("form-7", json!({"model-id": "m42"})));
        assert!(out.starts_with("Form: form-7\nEntry: m42\n"));
        assert!(out.contains("Updated: 2024-06-01 12:30:00 UTC"));
        assert!(out.contains("model-id"));
        assert!(out.contains("m42"));
    }

    #[test]
    fn listing_has_header_and_one_row_per_result() {
        let out = render_listing(&[
            stored("a-very-long-form-id", json!({"x": 1, "y": 2})),
            stored("b", json!({})),
        ]);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("FORM"));
        assert!(lines[0].contains("ENTRY"));
        assert!(lines[1].starts_with("a-very-long-form-id"));
        assert!(lines[1].ends_with('2'));
        assert!(lines[2].ends_with('0'));
    }

    #[tokio::test]
    async fn show_reads_an_upserted_result() {
        let Some(db) = lumen_test_utils::TestDb::create().await else {
            return;
        };
        let pool = &db.pool;

        let fields = json!({"prediction-score": 0.9}).as_object().cloned().unwrap();
        result_db::upsert_result(pool, "form-db", &fields).await.unwrap();

        run_show(pool, "form-db").await.unwrap();
        let missing = run_show(pool, "absent").await.unwrap_err();
        assert!(missing.to_string().contains("no stored result for form absent"));

        db.drop_db().await;
    }
}
