//! Direct Write Tests
//!
//! Writes made through `rw_store` outside any dispatch are logged as system
//! events whose payload describes the change; the engine synthesises the
//! matching reduction, so the log remains the single source of truth.

mod common;

use folddb::{Columns, Error, Model, ModelRegistry, Reduction, Version, DIRECT_WRITE_EVENT};
use serde_json::json;

fn docs_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register(Model::new("docs", Columns::new(["body", "tag"])))
        .unwrap();
    registry
}

#[tokio::test]
async fn rw_writes_synthesize_logged_events() {
    let (_dir, db) = common::open_db("direct.db", docs_registry()).await;

    let event = db
        .rw_store("docs")
        .set(json!({"id": "a", "body": "text"}))
        .await
        .unwrap();
    assert_eq!(event.event_type, DIRECT_WRITE_EVENT);
    assert_eq!(event.v, Version::from_raw(1));
    assert_eq!(
        event.result.as_ref().unwrap()["docs"]["set"][0]["id"],
        "a"
    );

    // The write landed and the event is in the log with its payload.
    let doc = db.store("docs").get("a").await.unwrap().unwrap();
    assert_eq!(doc["body"], "text");
    let stored = db.queue_get(event.v).await.unwrap().unwrap();
    assert_eq!(stored.data["model"], "docs");
    assert_eq!(stored.data["set"][0]["body"], "text");

    // Update and remove flow through the same event path.
    db.rw_store("docs")
        .update(json!({"id": "a", "body": "new"}))
        .await
        .unwrap();
    assert_eq!(
        db.store("docs").get("a").await.unwrap().unwrap()["body"],
        "new"
    );

    db.rw_store("docs").remove("a").await.unwrap();
    assert!(db.store("docs").get("a").await.unwrap().is_none());

    // Three writes, three versions, all applied.
    assert_eq!(db.version().await.unwrap(), Version::from_raw(3));
    assert_eq!(db.max_version().await.unwrap(), Version::from_raw(3));

    db.shutdown().await;
}

#[tokio::test]
async fn insert_collisions_fail_the_apply_phase() {
    let (_dir, db) = common::open_db("collision.db", docs_registry()).await;

    db.rw_store("docs")
        .insert(json!({"id": "a", "body": "first"}))
        .await
        .unwrap();

    let err = db
        .rw_store("docs")
        .insert(json!({"id": "a", "body": "second"}))
        .await
        .unwrap_err();
    let Error::EventFailed(event) = err else {
        panic!("expected an event failure");
    };
    assert!(event.error.as_ref().unwrap().contains_key("_apply_docs"));

    // The collision rolled back without touching the original row, and the
    // failed event still consumed its version.
    assert_eq!(
        db.store("docs").get("a").await.unwrap().unwrap()["body"],
        "first"
    );
    assert_eq!(db.version().await.unwrap(), Version::from_raw(2));

    db.shutdown().await;
}

#[tokio::test]
async fn unknown_models_are_rejected_before_enqueue() {
    let (_dir, db) = common::open_db("unknown_model.db", docs_registry()).await;

    let err = db
        .rw_store("nope")
        .set(json!({"id": "x"}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownModel(_)));
    assert_eq!(db.max_version().await.unwrap(), Version::NONE);

    db.shutdown().await;
}

#[tokio::test]
async fn batched_reductions_apply_in_fixed_order() {
    let (_dir, db) = common::open_db("batched.db", docs_registry()).await;

    db.rw_store("docs")
        .set(json!({"id": "stale", "body": "old"}))
        .await
        .unwrap();

    // One logged event carrying a removal and two upserts.
    let reduction = Reduction::new()
        .remove("stale")
        .upsert(json!({"id": "a", "body": "x", "tag": "t"}))
        .upsert(json!({"id": "b", "body": "y"}));
    db.rw_store("docs").apply(reduction).await.unwrap();

    assert!(db.store("docs").get("stale").await.unwrap().is_none());
    let all = db.store("docs").search(None).await.unwrap();
    let ids: Vec<&str> = all.iter().map(|d| d["id"].as_str().unwrap()).collect();
    assert_eq!(ids, ["a", "b"]);

    // Equality search against the committed state.
    let tagged = db
        .store("docs")
        .search_one(Some(json!({"tag": "t"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tagged["id"], "a");

    db.shutdown().await;
}
