//! Replay Tests
//!
//! Requeueing an event row re-runs the pipeline with its previous child
//! subtree dropped: children are re-derived, never preserved. Replaying a
//! handled event therefore reproduces the same result and the same
//! children.

mod common;

use folddb::{Columns, Event, Model, ModelRegistry, Version};
use serde_json::Value as JsonValue;

/// The deriver dispatches `ho` whenever it sees `hi`.
fn replay_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    registry
        .register(
            Model::new("foo", Columns::default()).with_deriver(|ctx| {
                Box::pin(async move {
                    if ctx.event.event_type == "hi" {
                        ctx.dispatch("ho", JsonValue::Null);
                    }
                    Ok(())
                })
            }),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn replay_clears_preseeded_subevents() {
    let (_dir, db) = common::open_db("replay_seed.db", replay_registry()).await;

    // Seed the queue at v=5 with a stale child that must not survive.
    let mut seeded = Event::new(Version::from_raw(5), "hi", JsonValue::Null, 1_000);
    seeded.events.push(Event::new(
        Version::from_raw(5),
        "deleteme",
        JsonValue::Null,
        1_000,
    ));
    db.queue_set(seeded).await.unwrap();

    let event = db.handled_version(Version::from_raw(5)).await.unwrap();
    let kinds: Vec<&str> = event.events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, ["ho"], "the pre-seeded child was re-derived away");

    // The written-back row agrees.
    let stored = db.queue_get(Version::from_raw(5)).await.unwrap().unwrap();
    assert_eq!(stored.events.len(), 1);
    assert_eq!(stored.events[0].event_type, "ho");
    assert!(stored.is_handled());

    db.shutdown().await;
}

#[tokio::test]
async fn replaying_a_handled_event_is_deterministic() {
    let (_dir, db) = common::open_db("replay_idem.db", replay_registry()).await;

    let first = db.dispatch("hi", JsonValue::Null).await.unwrap();
    assert_eq!(first.events.len(), 1);

    // Requeue the handled row verbatim; the engine clears its terminal
    // state and re-runs the pipeline.
    db.queue_set(first.clone()).await.unwrap();
    let second = db.handled_version(first.v).await.unwrap();

    assert_eq!(second, first, "replay reproduces the identical event");

    db.shutdown().await;
}

#[tokio::test]
async fn handled_version_resolves_for_future_versions() {
    let (_dir, db) = common::open_db("future_version.db", replay_registry()).await;

    // Wait on v=2 before anything is enqueued.
    let waiter = {
        let db = db.clone();
        tokio::spawn(async move { db.handled_version(Version::from_raw(2)).await })
    };

    db.dispatch("one", JsonValue::Null).await.unwrap();
    db.dispatch("two", JsonValue::Null).await.unwrap();

    let event = waiter.await.unwrap().unwrap();
    assert_eq!(event.v, Version::from_raw(2));
    assert_eq!(event.event_type, "two");

    db.shutdown().await;
}
