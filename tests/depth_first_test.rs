//! Depth-First Ordering Tests
//!
//! The effective processing order for handlers is the pre-order traversal
//! of the dispatch tree: each child runs all phases before the next sibling
//! of its parent. A deriver that accumulates `event.type` into a row field
//! observes exactly that order. Also covers the recursion guard for a
//! deriver that dispatches its own type forever.

mod common;

use folddb::{Columns, Error, Model, ModelRegistry, Version};
use serde_json::{json, Value as JsonValue};

/// The reducer dispatches `4` when it sees `3`; the deriver dispatches
/// `1, 3` on `hi`, `2` on `1`, `5` on `3`, and appends every event type it
/// sees to the `all` field of row `hi`.
fn depth_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            Model::new("foo", Columns::new(["all"]))
                .with_reducer(|ctx| {
                    Box::pin(async move {
                        if ctx.event.event_type == "3" {
                            ctx.dispatch("4", JsonValue::Null);
                        }
                        Ok(None)
                    })
                })
                .with_deriver(|ctx| {
                    Box::pin(async move {
                        let t = ctx.event.event_type.clone();
                        match t.as_str() {
                            "hi" => {
                                ctx.dispatch("1", JsonValue::Null);
                                ctx.dispatch("3", JsonValue::Null);
                            }
                            "1" => ctx.dispatch("2", JsonValue::Null),
                            "3" => ctx.dispatch("5", JsonValue::Null),
                            _ => {}
                        }
                        let seen = ctx
                            .get("hi")?
                            .and_then(|row| {
                                row.get("all").and_then(|v| v.as_str().map(String::from))
                            })
                            .unwrap_or_default();
                        ctx.rw
                            .set(&ctx.model, &json!({"id": "hi", "all": format!("{seen}{t}")}))?;
                        Ok(())
                    })
                }),
        )
        .unwrap();
    registry
}

/// A deriver that dispatches its own type on every visit.
fn runaway_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            Model::new("foo", Columns::default()).with_deriver(|ctx| {
                Box::pin(async move {
                    if ctx.event.event_type == "hi" {
                        ctx.dispatch("hi", JsonValue::Null);
                    }
                    Ok(())
                })
            }),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn dispatch_tree_is_visited_pre_order() {
    let (_dir, db) = common::open_db("depth.db", depth_registry()).await;
    let mut results = db.subscribe_results();

    let event = db.dispatch("hi", JsonValue::Null).await.unwrap();

    // Only the two root-level children appear at the top; the rest nest.
    assert_eq!(event.events.len(), 2);
    assert_eq!(event.events[0].event_type, "1");
    assert_eq!(event.events[0].events.len(), 1);
    assert_eq!(event.events[0].events[0].event_type, "2");
    assert_eq!(event.events[1].event_type, "3");
    let grandchildren: Vec<&str> = event.events[1]
        .events
        .iter()
        .map(|e| e.event_type.as_str())
        .collect();
    assert_eq!(grandchildren, ["4", "5"]);

    // The deriver observed the pre-order traversal.
    let row = db.store("foo").get("hi").await.unwrap().unwrap();
    assert_eq!(row["all"], "hi12345");

    // The result listener fired exactly once, for the root.
    let emitted = results.recv().await.unwrap();
    assert_eq!(emitted.v, event.v);
    assert!(matches!(
        results.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Empty)
    ));

    db.shutdown().await;
}

#[tokio::test]
async fn infinite_recursion_is_guarded() {
    let (_dir, db) = common::open_db("runaway.db", runaway_registry()).await;

    let err = db.dispatch("hi", JsonValue::Null).await.unwrap_err();
    let Error::EventFailed(event) = err else {
        panic!("expected an event failure, got: {err}");
    };

    let handle = event
        .error
        .as_ref()
        .unwrap()
        .get("_handle")
        .and_then(|v| v.as_str())
        .expect("_handle error value");

    // The handle string is the type-path of the runaway chain plus a
    // message containing "deep": `.hi.hi.…:dispatch recursion too deep`.
    assert!(handle.starts_with(".hi.hi"), "handle: {handle}");
    let (path, message) = handle.split_once(':').expect("path-qualified message");
    assert!(path.split('.').skip(1).all(|segment| segment == "hi"));
    assert!(message.contains("deep"), "message: {message}");

    // The failed event still consumed its version.
    assert_eq!(db.version().await.unwrap(), Version::from_raw(1));

    db.shutdown().await;
}
