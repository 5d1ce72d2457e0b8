//! Pipeline Fan-Out Tests
//!
//! Exercises the full preprocess → reduce → apply → derive pipeline with
//! handlers that dispatch child events from every phase, plus the contract
//! that `result` contains exactly the models whose reducer produced a
//! reduction.

mod common;

use folddb::{ChildSpec, Columns, Model, ModelRegistry, Preprocessed, Reduction};
use serde_json::{json, Value as JsonValue};

/// A model whose three handlers each fan out on `hi` and on their own
/// phase name: the preprocessor dispatches `pre-<type>`, the reducer
/// dispatches `red-<type>` and also returns `events: [red-out-<type>]`, and
/// the deriver dispatches `der-<type>`. The reducer additionally writes a
/// row keyed by every event type it sees, so tests can observe visitation.
fn fanout_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            Model::new("foo", Columns::new(["via"]))
                .with_preprocessor(|ctx| {
                    Box::pin(async move {
                        let t = ctx.event.event_type.clone();
                        if t == "hi" || t == "pre" {
                            ctx.dispatch(format!("pre-{t}"), JsonValue::Null);
                        }
                        Ok(Preprocessed::Keep)
                    })
                })
                .with_reducer(|ctx| {
                    Box::pin(async move {
                        let t = ctx.event.event_type.clone();
                        let mut reduction = Reduction::new().upsert(json!({"id": t}));
                        if t == "hi" || t == "red" {
                            ctx.dispatch(format!("red-{t}"), JsonValue::Null);
                            reduction = reduction
                                .emit(ChildSpec::new(format!("red-out-{t}"), JsonValue::Null));
                        }
                        Ok(Some(reduction))
                    })
                })
                .with_deriver(|ctx| {
                    Box::pin(async move {
                        let t = ctx.event.event_type.clone();
                        if t == "hi" || t == "der" {
                            ctx.dispatch(format!("der-{t}"), JsonValue::Null);
                        }
                        Ok(())
                    })
                }),
        )
        .unwrap();
    // A model whose reducer never produces anything: it must not appear in
    // any event's result map.
    registry
        .register(
            Model::new("quiet", Columns::default())
                .with_reducer(|_ctx| Box::pin(async move { Ok(None) })),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn all_three_phases_fan_out() {
    let (_dir, db) = common::open_db("fanout.db", fanout_registry()).await;

    // `hi` triggers every phase: four children in dispatch order.
    let event = db.dispatch("hi", JsonValue::Null).await.unwrap();
    let kinds: Vec<&str> = event.events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, ["pre-hi", "red-hi", "red-out-hi", "der-hi"]);
    for id in ["pre-hi", "red-hi", "red-out-hi", "der-hi"] {
        assert!(
            db.store("foo").get(id).await.unwrap().is_some(),
            "expected row '{id}'"
        );
    }

    // `pre` only triggers the preprocessor.
    let event = db.dispatch("pre", JsonValue::Null).await.unwrap();
    assert_eq!(event.events.len(), 1);
    assert!(db.store("foo").get("pre-pre").await.unwrap().is_some());

    // `red` produces both the dispatched and the returned child.
    let event = db.dispatch("red", JsonValue::Null).await.unwrap();
    assert_eq!(event.events.len(), 2);
    assert!(db.store("foo").get("red-red").await.unwrap().is_some());
    assert!(db.store("foo").get("red-out-red").await.unwrap().is_some());

    // `der` only triggers the deriver.
    let event = db.dispatch("der", JsonValue::Null).await.unwrap();
    assert_eq!(event.events.len(), 1);
    assert!(db.store("foo").get("der-der").await.unwrap().is_some());

    db.shutdown().await;
}

#[tokio::test]
async fn result_contains_exactly_the_reducing_models() {
    let (_dir, db) = common::open_db("result_keys.db", fanout_registry()).await;

    let event = db.dispatch("lone", JsonValue::Null).await.unwrap();
    let result = event.result.expect("handled event has a result");
    assert_eq!(result.len(), 1);
    assert!(result.contains_key("foo"));
    assert!(!result.contains_key("quiet"), "no-op reducer contributes no key");

    // The reduction output round-trips through the result map.
    assert_eq!(result["foo"]["set"][0]["id"], "lone");

    db.shutdown().await;
}

#[tokio::test]
async fn children_carry_their_own_results() {
    let (_dir, db) = common::open_db("child_results.db", fanout_registry()).await;

    let event = db.dispatch("hi", JsonValue::Null).await.unwrap();
    for child in &event.events {
        let result = child.result.as_ref().expect("child has a result");
        assert_eq!(
            result["foo"]["set"][0]["id"], child.event_type,
            "child reduction keyed by its own type"
        );
        assert_eq!(child.v, event.v, "children inherit the root version");
    }

    db.shutdown().await;
}

#[tokio::test]
async fn result_listener_fires_once_per_root() {
    let (_dir, db) = common::open_db("listener.db", fanout_registry()).await;
    let mut results = db.subscribe_results();

    let event = db.dispatch("hi", JsonValue::Null).await.unwrap();

    let emitted = results.recv().await.unwrap();
    assert_eq!(emitted.v, event.v);
    assert_eq!(emitted.events.len(), 4, "children do not fire the listener");
    assert!(matches!(
        results.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    db.shutdown().await;
}
