//! `PgResultSink` against a throwaway PostgreSQL database.

use serde_json::{Value, json};

use lumen_core::sink::{PgResultSink, ResultSink};
use lumen_db::queries::results;
use lumen_test_utils::TestDb;

#[tokio::test]
async fn pg_sink_upsert_is_idempotent() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pool = &db.pool;
    let sink = PgResultSink::new(pool.clone());

    let Value::Object(fields) = json!({
        "samples-dir": "/data/run42",
        "model-id": "m42",
        "cross-validation-accuracy": 0.91
    }) else {
        unreachable!()
    };

    sink.upsert("form-1", &fields).await.expect("first upsert");
    let first = results::get_result(pool, "form-1", "m42")
        .await
        .unwrap()
        .expect("row exists");

    sink.upsert("form-1", &fields).await.expect("repeat upsert");
    let second = results::get_result(pool, "form-1", "m42")
        .await
        .unwrap()
        .expect("row exists");

    assert_eq!(results::count_results(pool).await.unwrap(), 1);
    assert_eq!(second.fields(), &fields);
    assert_eq!(first.updated_at, second.updated_at);

    db.drop_db().await;
}

#[tokio::test]
async fn pg_sink_reports_storage_error_on_closed_pool() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pool = &db.pool;
    let sink = PgResultSink::new(pool.clone());
    pool.close().await;

    let err = sink
        .upsert("form-1", &serde_json::Map::new())
        .await
        .expect_err("closed pool must fail");
    assert_eq!(err.sink, "postgres");
    assert!(err.message.contains("form-1"));

    db.drop_db().await;
}
