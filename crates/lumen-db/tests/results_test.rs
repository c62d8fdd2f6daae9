//! Integration tests for the `results` query module.

use serde_json::{Map, Value, json};

use lumen_db::queries::results;
use lumen_test_utils::TestDb;

fn fields(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

#[tokio::test]
async fn same_model_replaces_and_new_model_adds_a_row() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pool = &db.pool;

    let first = fields(json!({"model-id": "m42", "samples": 120}));
    let row = results::upsert_result(pool, "form-1", &first)
        .await
        .expect("insert should succeed");
    assert_eq!(row.form_id, "form-1");
    assert_eq!(row.entry_key, "m42");
    assert_eq!(row.fields(), &first);

    let retrained = fields(json!({"model-id": "m42", "samples": 240}));
    results::upsert_result(pool, "form-1", &retrained)
        .await
        .expect("replace should succeed");
    let stored = results::get_result(pool, "form-1", "m42")
        .await
        .expect("get should succeed")
        .expect("row should exist");
    assert_eq!(stored.fields(), &retrained);
    assert_eq!(results::count_results(pool).await.expect("count"), 1);

    let next_model = fields(json!({"model-id": "m43", "samples": 60}));
    results::upsert_result(pool, "form-1", &next_model)
        .await
        .expect("second model should insert");
    let form = results::form_results(pool, "form-1").await.expect("form results");
    let keys: Vec<&str> = form.iter().map(|r| r.entry_key.as_str()).collect();
    assert_eq!(keys, ["m43", "m42"]);

    db.drop_db().await;
}

#[tokio::test]
async fn identical_upsert_leaves_row_untouched() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pool = &db.pool;

    let map = fields(json!({"model-id": "m42", "cross-validation-accuracy": 0.91}));
    let first = results::upsert_result(pool, "form-7", &map)
        .await
        .expect("insert");
    let again = results::upsert_result(pool, "form-7", &map)
        .await
        .expect("repeat upsert");

    assert_eq!(first, again);
    assert_eq!(results::count_results(pool).await.expect("count"), 1);

    db.drop_db().await;
}

#[tokio::test]
async fn list_puts_most_recently_updated_first() {
    let Some(db) = TestDb::create().await else {
        return;
    };
    let pool = &db.pool;

    for id in ["a", "b", "c"] {
        results::upsert_result(pool, id, &fields(json!({"form": id})))
            .await
            .expect("insert");
    }
    results::upsert_result(pool, "a", &fields(json!({"form": "a", "rerun": true})))
        .await
        .expect("update");

    let listed = results::list_results(pool).await.expect("list");
    let order: Vec<&str> = listed.iter().map(|r| r.form_id.as_str()).collect();
    assert_eq!(order, ["a", "c", "b"]);
    assert_eq!(results::count_results(pool).await.expect("count"), 3);

    db.drop_db().await;
}
